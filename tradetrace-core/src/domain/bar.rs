//! Bar and tick records: the units the fetch pipeline produces.

use super::granularity::Granularity;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// OHLCV bar for one fixed time unit (minute or second).
///
/// `timestamp` is the UTC start of the bar's interval.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BarRecord {
    pub timestamp: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vwap: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transactions: Option<u64>,
}

impl BarRecord {
    /// Returns true if any OHLC field is NaN.
    pub fn is_void(&self) -> bool {
        self.open.is_nan() || self.high.is_nan() || self.low.is_nan() || self.close.is_nan()
    }

    /// low <= {open, close} <= high, all prices positive.
    pub fn is_sane(&self) -> bool {
        if self.is_void() {
            return false;
        }
        self.low > 0.0
            && self.high >= self.low
            && self.high >= self.open
            && self.high >= self.close
            && self.low <= self.open
            && self.low <= self.close
    }
}

/// A single executed trade.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TickRecord {
    /// SIP timestamp, nanosecond precision.
    pub timestamp: DateTime<Utc>,
    pub price: f64,
    pub size: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exchange: Option<i32>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sequence_number: Option<u64>,
}

impl TickRecord {
    pub fn is_sane(&self) -> bool {
        self.price.is_finite() && self.price > 0.0 && self.size > 0
    }
}

/// A fetched price sequence, tagged so bar and tick fields never mix.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum PriceSeries {
    Bars {
        granularity: Granularity,
        bars: Vec<BarRecord>,
    },
    Ticks {
        ticks: Vec<TickRecord>,
    },
}

impl PriceSeries {
    pub fn granularity(&self) -> Granularity {
        match self {
            PriceSeries::Bars { granularity, .. } => *granularity,
            PriceSeries::Ticks { .. } => Granularity::Tick,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            PriceSeries::Bars { bars, .. } => bars.len(),
            PriceSeries::Ticks { ticks } => ticks.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn into_bars(self) -> Option<Vec<BarRecord>> {
        match self {
            PriceSeries::Bars { bars, .. } => Some(bars),
            PriceSeries::Ticks { .. } => None,
        }
    }

    pub fn into_ticks(self) -> Option<Vec<TickRecord>> {
        match self {
            PriceSeries::Ticks { ticks } => Some(ticks),
            PriceSeries::Bars { .. } => None,
        }
    }
}

/// A price resolved for a target instant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PricePoint {
    /// The instant that was asked for (anchor + offset).
    pub target: DateTime<Utc>,
    /// Timestamp of the bar or tick the price came from.
    pub timestamp: DateTime<Utc>,
    pub price: f64,
    pub source: Granularity,
}

impl PricePoint {
    /// Absolute distance between the requested instant and the sample used.
    pub fn timing_error(&self) -> chrono::Duration {
        (self.timestamp - self.target).abs()
    }
}
