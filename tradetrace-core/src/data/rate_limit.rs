//! Rolling-window call ceiling for the upstream API.
//!
//! The window holds the instant of every attempted call in the last 60 seconds.
//! A new call is admitted only while fewer than `limit` calls remain in the
//! window; otherwise the caller sleeps until the oldest one ages out. The check
//! and the record happen under one lock, so parallel callers sharing a limiter
//! can never push the window past its ceiling.

use super::clock::Clock;
use super::error::MarketDataError;
use crate::config::PlanTier;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Length of the rolling window.
pub const RATE_WINDOW: Duration = Duration::from_secs(60);

/// Sliding record of call instants.
#[derive(Debug, Clone)]
pub struct RateLimitWindow {
    calls: VecDeque<Instant>,
    limit: u32,
    window: Duration,
}

impl RateLimitWindow {
    pub fn new(limit: u32, window: Duration) -> Self {
        Self {
            calls: VecDeque::with_capacity(limit as usize),
            limit,
            window,
        }
    }

    pub fn limit(&self) -> u32 {
        self.limit
    }

    /// Drop calls that are `window` or more in the past.
    fn prune(&mut self, now: Instant) {
        while let Some(&oldest) = self.calls.front() {
            if now.saturating_duration_since(oldest) >= self.window {
                self.calls.pop_front();
            } else {
                break;
            }
        }
    }

    /// Record a call at `now` if the ceiling allows it; otherwise return how
    /// long until a slot frees up.
    pub fn try_record(&mut self, now: Instant) -> Result<(), Duration> {
        self.prune(now);
        if (self.calls.len() as u32) < self.limit {
            self.calls.push_back(now);
            Ok(())
        } else {
            Err(self.resets_in(now))
        }
    }

    pub fn calls_in_window(&mut self, now: Instant) -> u32 {
        self.prune(now);
        self.calls.len() as u32
    }

    /// Time until the oldest call in the window ages out.
    pub fn resets_in(&self, now: Instant) -> Duration {
        self.calls
            .front()
            .map(|&oldest| (oldest + self.window).saturating_duration_since(now))
            .unwrap_or(Duration::ZERO)
    }
}

/// Rate limit status as reported to callers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RateLimitInfo {
    pub plan_tier: PlanTier,
    pub calls_per_minute: u32,
    pub calls_in_window: u32,
    pub remaining: u32,
    pub resets_in_secs: f64,
    pub resets_at: DateTime<Utc>,
}

/// Thread-safe owner of a `RateLimitWindow`.
#[derive(Debug)]
pub struct RateLimiter {
    window: Mutex<RateLimitWindow>,
    clock: Arc<dyn Clock>,
    max_wait: Duration,
}

impl RateLimiter {
    pub fn new(calls_per_minute: u32, max_wait: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            window: Mutex::new(RateLimitWindow::new(calls_per_minute, RATE_WINDOW)),
            clock,
            max_wait,
        }
    }

    fn lock_window(&self) -> MutexGuard<'_, RateLimitWindow> {
        self.window.lock().unwrap_or_else(|poisoned| {
            warn!("rate limit window mutex was poisoned, recovering");
            poisoned.into_inner()
        })
    }

    /// Block until a call slot is free and record the call.
    ///
    /// Returns the total time spent waiting. Fails without recording if the
    /// cumulative wait would exceed the configured maximum.
    pub fn acquire(&self) -> Result<Duration, MarketDataError> {
        let mut waited = Duration::ZERO;
        loop {
            let wait = {
                let mut window = self.lock_window();
                match window.try_record(self.clock.now()) {
                    Ok(()) => {
                        debug!(waited_ms = waited.as_millis() as u64, "rate limiter: slot acquired");
                        return Ok(waited);
                    }
                    Err(wait) => wait,
                }
            };

            if waited + wait > self.max_wait {
                return Err(MarketDataError::RateLimitExceeded {
                    wait: waited + wait,
                    max_wait: self.max_wait,
                });
            }

            warn!(
                wait_ms = wait.as_millis() as u64,
                "rate limit ceiling reached, waiting for the window to roll"
            );
            self.clock.sleep(wait);
            waited += wait;
        }
    }

    pub fn info(&self, plan_tier: PlanTier) -> RateLimitInfo {
        let now = self.clock.now();
        let mut window = self.lock_window();
        let calls_in_window = window.calls_in_window(now);
        let limit = window.limit();
        let resets_in = window.resets_in(now);
        RateLimitInfo {
            plan_tier,
            calls_per_minute: limit,
            calls_in_window,
            remaining: limit.saturating_sub(calls_in_window),
            resets_in_secs: resets_in.as_secs_f64(),
            resets_at: self.clock.utc_now()
                + chrono::Duration::from_std(resets_in).unwrap_or(chrono::Duration::zero()),
        }
    }
}
