//! Trade windows: the only fields of a stored trade the market data core reads.

use super::session::exchange_to_utc;
use chrono::{DateTime, Duration, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum TradeWindowError {
    #[error("invalid timestamp '{0}': expected ISO-8601")]
    InvalidTimestamp(String),

    #[error("exit {exit} precedes entry {entry}")]
    ExitBeforeEntry {
        entry: DateTime<Utc>,
        exit: DateTime<Utc>,
    },

    #[error("empty symbol")]
    EmptySymbol,
}

/// Symbol plus entry/exit instants of a completed trade.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TradeWindow {
    pub symbol: String,
    pub entry: DateTime<Utc>,
    pub exit: DateTime<Utc>,
}

impl TradeWindow {
    pub fn new(
        symbol: &str,
        entry: DateTime<Utc>,
        exit: DateTime<Utc>,
    ) -> Result<Self, TradeWindowError> {
        let symbol = symbol.trim();
        if symbol.is_empty() {
            return Err(TradeWindowError::EmptySymbol);
        }
        if exit < entry {
            return Err(TradeWindowError::ExitBeforeEntry { entry, exit });
        }
        Ok(Self {
            symbol: symbol.to_ascii_uppercase(),
            entry,
            exit,
        })
    }

    /// Build a window from the trade store's ISO-8601 strings.
    ///
    /// Strings without an offset are UTC.
    pub fn parse(symbol: &str, entry: &str, exit: &str) -> Result<Self, TradeWindowError> {
        Self::new(symbol, parse_utc(entry)?, parse_utc(exit)?)
    }

    /// `[entry - pre, exit + post]`.
    pub fn buffered(&self, pre: Duration, post: Duration) -> (DateTime<Utc>, DateTime<Utc>) {
        (self.entry - pre, self.exit + post)
    }

    pub fn holding_period(&self) -> Duration {
        self.exit - self.entry
    }
}

const NAIVE_FORMATS: [&str; 2] = ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"];

fn parse_with(
    s: &str,
    naive_to_utc: impl Fn(NaiveDateTime) -> Option<DateTime<Utc>>,
) -> Result<DateTime<Utc>, TradeWindowError> {
    let s = s.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Ok(dt.with_timezone(&Utc));
    }
    NAIVE_FORMATS
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(s, fmt).ok())
        .and_then(naive_to_utc)
        .ok_or_else(|| TradeWindowError::InvalidTimestamp(s.to_string()))
}

/// Parse an ISO-8601 timestamp into a UTC instant, treating naive input as UTC.
pub fn parse_utc(s: &str) -> Result<DateTime<Utc>, TradeWindowError> {
    parse_with(s, |naive| Some(naive.and_utc()))
}

/// Like [`parse_utc`], but naive input is wall-clock time on the exchange.
pub fn parse_exchange_local(s: &str) -> Result<DateTime<Utc>, TradeWindowError> {
    parse_with(s, |naive| exchange_to_utc(naive.date(), naive.time()))
}
