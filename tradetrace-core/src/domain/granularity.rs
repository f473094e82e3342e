//! Time resolution of fetched data.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Bars in a regular 09:30–16:00 session at minute resolution.
pub const REGULAR_SESSION_MINUTES: usize = 390;

/// Bars in a regular 09:30–16:00 session at second resolution.
pub const REGULAR_SESSION_SECONDS: usize = 23_400;

/// Resolution of a price series: minute bars, second bars, or raw ticks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Granularity {
    Minute,
    Second,
    Tick,
}

impl Granularity {
    pub const ALL: [Granularity; 3] = [Granularity::Minute, Granularity::Second, Granularity::Tick];

    pub fn as_str(&self) -> &'static str {
        match self {
            Granularity::Minute => "minute",
            Granularity::Second => "second",
            Granularity::Tick => "tick",
        }
    }

    /// Length of one bar. Ticks have no fixed unit.
    pub fn unit(&self) -> Option<Duration> {
        match self {
            Granularity::Minute => Some(Duration::minutes(1)),
            Granularity::Second => Some(Duration::seconds(1)),
            Granularity::Tick => None,
        }
    }

    /// Expected bar count for a regular session (unbounded for ticks).
    pub fn session_bar_count(&self) -> Option<usize> {
        match self {
            Granularity::Minute => Some(REGULAR_SESSION_MINUTES),
            Granularity::Second => Some(REGULAR_SESSION_SECONDS),
            Granularity::Tick => None,
        }
    }

    /// Number of whole units in the half-open window `[start, end)`.
    pub fn expected_bars(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> Option<usize> {
        let unit = self.unit()?.num_milliseconds();
        let span = (end - start).num_milliseconds();
        if span <= 0 {
            return Some(0);
        }
        Some((span / unit) as usize)
    }

    pub fn is_bar(&self) -> bool {
        !matches!(self, Granularity::Tick)
    }
}

impl fmt::Display for Granularity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Granularity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "minute" | "min" | "1m" => Ok(Granularity::Minute),
            "second" | "sec" | "1s" => Ok(Granularity::Second),
            "tick" | "trade" | "trades" => Ok(Granularity::Tick),
            other => Err(format!(
                "unknown granularity '{other}' (expected minute, second or tick)"
            )),
        }
    }
}
