//! Domain types: price records, granularity, exchange sessions, trade windows.

pub mod bar;
pub mod granularity;
pub mod session;
pub mod trade;

pub use bar::{BarRecord, PricePoint, PriceSeries, TickRecord};
pub use granularity::{Granularity, REGULAR_SESSION_MINUTES, REGULAR_SESSION_SECONDS};
pub use session::{exchange_date, exchange_to_utc, is_weekend, MarketSession, SessionWindow};
pub use trade::{parse_exchange_local, parse_utc, TradeWindow, TradeWindowError};
