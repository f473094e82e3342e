//! Bounded exponential backoff, applied uniformly to every client call.

use super::clock::Clock;
use super::error::{MarketDataError, RetryClass};
use crate::config::RetryConfig;
use std::time::Duration;
use tracing::warn;

/// Ceiling on any single backoff delay.
pub const MAX_RETRY_DELAY: Duration = Duration::from_secs(300);

#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub multiplier: f64,
}

impl RetryPolicy {
    pub fn from_config(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            base_delay: Duration::from_millis(config.base_delay_ms),
            multiplier: config.multiplier,
        }
    }

    /// Delay before retry number `retry` (1-based): `base * multiplier^(retry-1)`,
    /// saturating at [`MAX_RETRY_DELAY`].
    pub fn delay_for(&self, retry: u32) -> Duration {
        if self.base_delay.is_zero() {
            return Duration::ZERO;
        }
        let exp = i32::try_from(retry.saturating_sub(1)).unwrap_or(i32::MAX);
        let secs = self.base_delay.as_secs_f64() * self.multiplier.powi(exp);
        Duration::try_from_secs_f64(secs).map_or(MAX_RETRY_DELAY, |d| d.min(MAX_RETRY_DELAY))
    }

    /// Run `op` until it succeeds, fails permanently, or attempts run out.
    ///
    /// `op` receives the 1-based attempt number. A throttled response with a
    /// `Retry-After` longer than the backoff delay waits for the header value.
    pub fn run<T>(
        &self,
        clock: &dyn Clock,
        mut op: impl FnMut(u32) -> Result<T, MarketDataError>,
    ) -> Result<T, MarketDataError> {
        let mut attempt = 1;
        loop {
            match op(attempt) {
                Ok(value) => return Ok(value),
                Err(e) if e.retry_class() == RetryClass::Retry && attempt < self.max_attempts => {
                    let mut delay = self.delay_for(attempt);
                    if let MarketDataError::Throttled {
                        retry_after_secs, ..
                    } = &e
                    {
                        delay = delay.max(Duration::from_secs(*retry_after_secs));
                    }
                    warn!(
                        attempt,
                        max_attempts = self.max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "retrying after transient failure"
                    );
                    clock.sleep(delay);
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&RetryConfig::default())
    }
}
