//! Exchange session boundaries.
//!
//! Session times are civil times on the exchange's clock (America/New_York).
//! They are converted to UTC instants here, at the point a request window is
//! built, and nowhere else.

use chrono::{DateTime, Datelike, NaiveDate, NaiveTime, TimeZone, Utc, Weekday};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};

/// Timezone the exchange keeps its session clock in.
pub const EXCHANGE_TZ: Tz = chrono_tz::America::New_York;

/// Regular session open, exchange local time.
pub const MARKET_OPEN: (u32, u32) = (9, 30);

/// Regular session close, exchange local time.
pub const MARKET_CLOSE: (u32, u32) = (16, 0);

/// A half-open `[start, end)` window of UTC instants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionWindow {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl SessionWindow {
    pub fn duration(&self) -> chrono::Duration {
        self.end - self.start
    }

    pub fn contains(&self, instant: DateTime<Utc>) -> bool {
        instant >= self.start && instant < self.end
    }
}

pub struct MarketSession;

impl MarketSession {
    /// The regular 09:30–16:00 session for `date`, as UTC instants.
    pub fn regular(date: NaiveDate) -> Option<SessionWindow> {
        let open = NaiveTime::from_hms_opt(MARKET_OPEN.0, MARKET_OPEN.1, 0)?;
        let close = NaiveTime::from_hms_opt(MARKET_CLOSE.0, MARKET_CLOSE.1, 0)?;
        Self::window(date, open, close)
    }

    /// An arbitrary window on `date`, `from`/`to` in exchange local time.
    pub fn window(date: NaiveDate, from: NaiveTime, to: NaiveTime) -> Option<SessionWindow> {
        let start = exchange_to_utc(date, from)?;
        let end = exchange_to_utc(date, to)?;
        if start >= end {
            return None;
        }
        Some(SessionWindow { start, end })
    }
}

/// Convert an exchange-local civil time to a UTC instant.
///
/// Ambiguous times (DST fall-back) resolve to the earlier instant. Times that
/// do not exist (DST spring-forward gap) resolve to the same wall time one hour
/// later, which is the first instant after the gap.
pub fn exchange_to_utc(date: NaiveDate, time: NaiveTime) -> Option<DateTime<Utc>> {
    let naive = date.and_time(time);
    EXCHANGE_TZ
        .from_local_datetime(&naive)
        .earliest()
        .or_else(|| {
            EXCHANGE_TZ
                .from_local_datetime(&(naive + chrono::Duration::hours(1)))
                .earliest()
        })
        .map(|dt| dt.with_timezone(&Utc))
}

/// The exchange's calendar date for a UTC instant.
pub fn exchange_date(instant: DateTime<Utc>) -> NaiveDate {
    instant.with_timezone(&EXCHANGE_TZ).date_naive()
}

/// Today's date on the exchange's clock.
pub fn exchange_today() -> NaiveDate {
    exchange_date(Utc::now())
}

pub fn is_weekend(date: NaiveDate) -> bool {
    matches!(date.weekday(), Weekday::Sat | Weekday::Sun)
}
