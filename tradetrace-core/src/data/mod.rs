//! Market data acquisition: rate-limited client, disk cache, validator, fetcher.

pub mod batch;
pub mod cache;
pub mod clock;
pub mod error;
pub mod fetcher;
pub mod lookup;
pub mod polygon;
pub mod rate_limit;
pub mod retry;
pub mod trades;
pub mod transport;
pub mod validate;

pub use batch::{prefetch_trades, BatchSummary, PrefetchOutcome};
pub use cache::{CacheEntry, CacheKey, CacheLookup, CacheMeta, CacheStats, DiskCache, MissReason};
pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{CacheError, MarketDataError, RetryClass};
pub use fetcher::{BarFetcher, DataSource, MarketDataApi, PriceSource, ValidatedBars};
pub use polygon::{
    LiveMarketStatus, MarketStatus, Paged, RateLimitedClient, RawAggregate, RawTrade,
    TickerDetails,
};
pub use rate_limit::{RateLimitInfo, RateLimitWindow, RateLimiter};
pub use retry::RetryPolicy;
pub use trades::{read_trade_windows, TradeSourceError};
pub use transport::{HttpResponse, HttpTransport, Transport, TransportError};
pub use validate::{BarGap, DataQualityValidator, QualityReport, QualityWarning, Severity};
