//! Bar and tick retrieval for arbitrary windows.
//!
//! The fetcher is the single entry point for price data. For each request it:
//! 1. Converts the window to UTC and derives the cache key
//! 2. Serves a cache hit if one exists
//! 3. Otherwise calls the API, normalizes the payload (UTC instants, sorted,
//!    deduplicated, clipped to `[start, end)`) and writes it back to the cache
//!
//! Cache problems never fail a fetch; they are logged and treated as misses.
//! A window with no data is an empty result, not an error. Empty results and
//! results cut short by the page cap are returned but never cached.

use super::cache::{CacheKey, CacheLookup, DiskCache, MissReason};
use super::clock::{Clock, SystemClock};
use super::error::MarketDataError;
use super::lookup::{align_down, bar_index_for, nearest_index};
use super::polygon::{MarketStatus, Paged, RateLimitedClient, RawAggregate, RawTrade};
use super::validate::{DataQualityValidator, QualityReport};
use crate::config::{CacheConfig, FetchConfig, MarketDataConfig};
use crate::domain::session::MarketSession;
use crate::domain::{BarRecord, Granularity, PricePoint, PriceSeries, TickRecord, TradeWindow};
use chrono::{DateTime, Duration, NaiveDate, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Upstream operations the fetcher needs.
pub trait MarketDataApi: Send + Sync {
    fn market_status(&self, date: NaiveDate) -> Result<MarketStatus, MarketDataError>;

    fn aggregates(
        &self,
        symbol: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        granularity: Granularity,
        multiplier: u32,
    ) -> Result<Paged<RawAggregate>, MarketDataError>;

    fn trades(
        &self,
        symbol: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Paged<RawTrade>, MarketDataError>;
}

impl MarketDataApi for RateLimitedClient {
    fn market_status(&self, date: NaiveDate) -> Result<MarketStatus, MarketDataError> {
        self.get_market_status(date)
    }

    fn aggregates(
        &self,
        symbol: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        granularity: Granularity,
        multiplier: u32,
    ) -> Result<Paged<RawAggregate>, MarketDataError> {
        self.fetch_aggregates(symbol, start, end, granularity, multiplier)
    }

    fn trades(
        &self,
        symbol: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Paged<RawTrade>, MarketDataError> {
        self.fetch_trades(symbol, start, end)
    }
}

/// Where a price lookup reads from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PriceSource {
    Bars(Granularity),
    Ticks,
}

/// Where a fetch result came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataSource {
    Cache,
    Api,
}

/// Bars together with their quality assessment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidatedBars {
    pub bars: Vec<BarRecord>,
    pub report: QualityReport,
}

pub struct BarFetcher {
    api: Arc<dyn MarketDataApi>,
    cache: Option<DiskCache>,
    validator: DataQualityValidator,
    fetch: FetchConfig,
    cache_config: CacheConfig,
}

impl BarFetcher {
    pub fn new(api: Arc<dyn MarketDataApi>, cache: Option<DiskCache>, config: &MarketDataConfig) -> Self {
        Self {
            api,
            cache,
            validator: DataQualityValidator::new(config.validation.clone()),
            fetch: config.fetch.clone(),
            cache_config: config.cache.clone(),
        }
    }

    /// HTTP client plus the configured cache directory.
    /// An unusable cache directory disables caching rather than failing.
    pub fn from_config(config: &MarketDataConfig) -> Result<Self, MarketDataError> {
        let client = Arc::new(RateLimitedClient::from_config(config)?);
        let cache = open_cache(&config.cache, client.clock().clone());
        Ok(Self::new(client, cache, config))
    }

    pub fn cache(&self) -> Option<&DiskCache> {
        self.cache.as_ref()
    }

    pub fn fetch_config(&self) -> &FetchConfig {
        &self.fetch
    }

    /// Bars in `[start, end)`, ascending and unique by timestamp.
    pub fn fetch_bars_for_range<Tz: TimeZone>(
        &self,
        symbol: &str,
        start: &DateTime<Tz>,
        end: &DateTime<Tz>,
        granularity: Granularity,
    ) -> Result<Vec<BarRecord>, MarketDataError> {
        self.fetch_bars(symbol, start.with_timezone(&Utc), end.with_timezone(&Utc), granularity, 1)
    }

    /// Bars of `multiplier` units each, e.g. 5-minute bars.
    pub fn fetch_bars(
        &self,
        symbol: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        granularity: Granularity,
        multiplier: u32,
    ) -> Result<Vec<BarRecord>, MarketDataError> {
        self.fetch_bars_sourced(symbol, start, end, granularity, multiplier)
            .map(|(bars, _)| bars)
    }

    /// `fetch_bars`, also reporting whether the cache served the request.
    pub fn fetch_bars_sourced(
        &self,
        symbol: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        granularity: Granularity,
        multiplier: u32,
    ) -> Result<(Vec<BarRecord>, DataSource), MarketDataError> {
        if !granularity.is_bar() {
            return Err(MarketDataError::BadRequest(
                "tick granularity has no bars; use fetch_ticks_for_range".into(),
            ));
        }
        let symbol = normalize_symbol(symbol)?;
        check_window(start, end)?;

        let key = CacheKey::for_request(&symbol, start, end, granularity, multiplier);
        let (series, source) = self.cached_or_fetch(&key, &symbol, granularity, || {
            let raw = self.api.aggregates(&symbol, start, end, granularity, multiplier)?;
            let series = PriceSeries::Bars {
                granularity,
                bars: normalize_aggregates(raw.items, start, end),
            };
            Ok((series, raw.truncated))
        })?;

        let bars = series.into_bars().unwrap_or_default();
        if bars.is_empty() {
            warn!(symbol = %symbol, %granularity, %start, %end, "no bars in window");
        }
        Ok((bars, source))
    }

    /// Trades in `[start, end)`, ascending by timestamp.
    pub fn fetch_ticks_for_range<Tz: TimeZone>(
        &self,
        symbol: &str,
        start: &DateTime<Tz>,
        end: &DateTime<Tz>,
    ) -> Result<Vec<TickRecord>, MarketDataError> {
        let start = start.with_timezone(&Utc);
        let end = end.with_timezone(&Utc);
        let symbol = normalize_symbol(symbol)?;
        check_window(start, end)?;

        let key = CacheKey::for_request(&symbol, start, end, Granularity::Tick, 1);
        let (series, _) = self.cached_or_fetch(&key, &symbol, Granularity::Tick, || {
            let raw = self.api.trades(&symbol, start, end)?;
            let series = PriceSeries::Ticks {
                ticks: normalize_trades(raw.items, start, end),
            };
            Ok((series, raw.truncated))
        })?;

        let ticks = series.into_ticks().unwrap_or_default();
        if ticks.is_empty() {
            warn!(symbol = %symbol, %start, %end, "no ticks in window");
        }
        Ok(ticks)
    }

    /// Bars for `[entry - pre, exit + post)`. An instantaneous trade with no
    /// buffers reads the one bar containing it.
    pub fn fetch_bars_for_trade(
        &self,
        entry: DateTime<Utc>,
        exit: DateTime<Utc>,
        symbol: &str,
        granularity: Granularity,
        pre_buffer_minutes: u32,
        post_buffer_minutes: u32,
    ) -> Result<Vec<BarRecord>, MarketDataError> {
        let window = TradeWindow::new(symbol, entry, exit)
            .map_err(|e| MarketDataError::InvalidWindow(e.to_string()))?;
        let (start, end) = window.buffered(
            Duration::minutes(i64::from(pre_buffer_minutes)),
            Duration::minutes(i64::from(post_buffer_minutes)),
        );
        let (start, end) = match granularity.unit() {
            Some(unit) if start >= end => {
                let start = align_down(start, unit);
                (start, start + unit)
            }
            _ => (start, end),
        };
        self.fetch_bars(&window.symbol, start, end, granularity, 1)
    }

    /// Bars for a trade window using the configured buffers.
    pub fn fetch_bars_for_trade_window(
        &self,
        window: &TradeWindow,
        granularity: Granularity,
    ) -> Result<Vec<BarRecord>, MarketDataError> {
        self.fetch_bars_for_trade(
            window.entry,
            window.exit,
            &window.symbol,
            granularity,
            self.fetch.pre_buffer_minutes,
            self.fetch.post_buffer_minutes,
        )
    }

    pub fn fetch_ticks_for_trade(
        &self,
        window: &TradeWindow,
        pre: Duration,
        post: Duration,
    ) -> Result<Vec<TickRecord>, MarketDataError> {
        let (start, mut end) = window.buffered(pre, post);
        if start >= end {
            end = start + Duration::seconds(1);
        }
        self.fetch_ticks_for_range(&window.symbol, &start, &end)
    }

    /// Regular-session bars for `date`, or nothing if the market was closed.
    pub fn fetch_session_bars(
        &self,
        symbol: &str,
        date: NaiveDate,
        granularity: Granularity,
    ) -> Result<Vec<BarRecord>, MarketDataError> {
        let status = self.api.market_status(date)?;
        if !status.open {
            info!(
                symbol,
                %date,
                reason = status.reason.as_deref().unwrap_or("closed"),
                "market closed, skipping fetch"
            );
            return Ok(Vec::new());
        }
        let session = MarketSession::regular(date).ok_or_else(|| {
            MarketDataError::InvalidWindow(format!("no regular session on {date}"))
        })?;
        self.fetch_bars(symbol, session.start, session.end, granularity, 1)
    }

    /// Bars plus a quality report whose expected count comes from the window.
    pub fn fetch_validated_bars_for_range<Tz: TimeZone>(
        &self,
        symbol: &str,
        start: &DateTime<Tz>,
        end: &DateTime<Tz>,
        granularity: Granularity,
    ) -> Result<ValidatedBars, MarketDataError> {
        let bars = self.fetch_bars_for_range(symbol, start, end, granularity)?;
        let expected =
            granularity.expected_bars(start.with_timezone(&Utc), end.with_timezone(&Utc));
        let report = self.validate_bars(&bars, granularity, expected);
        Ok(ValidatedBars { bars, report })
    }

    pub fn validate_bars(
        &self,
        bars: &[BarRecord],
        granularity: Granularity,
        expected_bar_count: Option<usize>,
    ) -> QualityReport {
        self.validator.validate_bars(bars, granularity, expected_bar_count)
    }

    pub fn validate_ticks(&self, ticks: &[TickRecord]) -> QualityReport {
        self.validator.validate_ticks(ticks)
    }

    /// Price nearest to `anchor + offset`, from ticks or from bars at the
    /// configured default granularity.
    pub fn get_price_at_offset(
        &self,
        symbol: &str,
        anchor: DateTime<Utc>,
        offset: Duration,
        use_ticks: bool,
    ) -> Result<Option<PricePoint>, MarketDataError> {
        let source = if use_ticks {
            PriceSource::Ticks
        } else {
            PriceSource::Bars(self.fetch.default_granularity)
        };
        self.get_price_at(symbol, anchor + offset, source)
    }

    /// Price nearest to `target`. Bars report their close. `None` when the
    /// search window holds no data.
    pub fn get_price_at(
        &self,
        symbol: &str,
        target: DateTime<Utc>,
        source: PriceSource,
    ) -> Result<Option<PricePoint>, MarketDataError> {
        let half = Duration::seconds(i64::from(self.fetch.price_window_seconds.max(1)));

        match source {
            PriceSource::Ticks | PriceSource::Bars(Granularity::Tick) => {
                let ticks = self.fetch_ticks_for_range(symbol, &(target - half), &(target + half))?;
                Ok(nearest_index(&ticks, target, |t| t.timestamp).map(|i| PricePoint {
                    target,
                    timestamp: ticks[i].timestamp,
                    price: ticks[i].price,
                    source: Granularity::Tick,
                }))
            }
            PriceSource::Bars(granularity) => {
                let Some(unit) = granularity.unit() else {
                    return Ok(None);
                };
                // Wide enough to hold the bars on both sides of the target.
                let half = half.max(unit * 2);
                let start = align_down(target - half, unit);
                let end = align_down(target + half, unit) + unit;
                let bars = self.fetch_bars(symbol, start, end, granularity, 1)?;

                Ok(bar_index_for(&bars, target, unit).map(|i| {
                    let point = PricePoint {
                        target,
                        timestamp: bars[i].timestamp,
                        price: bars[i].close,
                        source: granularity,
                    };
                    debug!(
                        symbol,
                        %target,
                        timing_error_ms = point.timing_error().num_milliseconds(),
                        "price resolved"
                    );
                    point
                }))
            }
        }
    }

    fn cached_or_fetch(
        &self,
        key: &CacheKey,
        symbol: &str,
        granularity: Granularity,
        fetch: impl FnOnce() -> Result<(PriceSeries, bool), MarketDataError>,
    ) -> Result<(PriceSeries, DataSource), MarketDataError> {
        if let Some(cache) = &self.cache {
            match cache.get(key) {
                CacheLookup::Hit(entry) if entry.payload.granularity() == granularity => {
                    debug!(%key, symbol, items = entry.payload.len(), "cache hit");
                    return Ok((entry.payload, DataSource::Cache));
                }
                CacheLookup::Hit(entry) => {
                    warn!(
                        %key,
                        cached = %entry.payload.granularity(),
                        requested = %granularity,
                        "cache entry has the wrong granularity, refetching"
                    );
                }
                CacheLookup::Miss(MissReason::Unavailable(reason)) => {
                    warn!(%key, %reason, "cache unavailable, fetching live");
                }
                CacheLookup::Miss(reason) => debug!(%key, ?reason, "cache miss"),
            }
        }

        info!(symbol, %granularity, "fetching from API");
        let (series, truncated) = fetch()?;

        if let Some(cache) = &self.cache {
            if series.is_empty() {
                debug!(%key, "empty result not cached");
            } else if truncated {
                warn!(%key, items = series.len(), "truncated result not cached");
            } else if let Err(e) =
                cache.set(key, symbol, &series, self.cache_config.ttl_for(granularity))
            {
                warn!(%key, error = %e, "cache write failed");
            }
        }
        Ok((series, DataSource::Api))
    }
}

/// Open the configured cache, or `None` if disabled or unusable.
pub fn open_cache(config: &CacheConfig, clock: Arc<dyn Clock>) -> Option<DiskCache> {
    if !config.enabled {
        return None;
    }
    match DiskCache::open(&config.dir, clock) {
        Ok(cache) => Some(cache),
        Err(e) => {
            warn!(dir = %config.dir.display(), error = %e, "cache disabled");
            None
        }
    }
}

/// Cache with the system clock, for tooling that never talks to the API.
pub fn open_cache_with_system_clock(config: &CacheConfig) -> Option<DiskCache> {
    open_cache(config, Arc::new(SystemClock))
}

fn normalize_symbol(symbol: &str) -> Result<String, MarketDataError> {
    let symbol = symbol.trim();
    if symbol.is_empty() {
        return Err(MarketDataError::BadRequest("empty symbol".into()));
    }
    Ok(symbol.to_ascii_uppercase())
}

fn check_window(start: DateTime<Utc>, end: DateTime<Utc>) -> Result<(), MarketDataError> {
    if start >= end {
        return Err(MarketDataError::InvalidWindow(format!(
            "start {start} is not before end {end}"
        )));
    }
    Ok(())
}

fn from_millis(ms: i64) -> Option<DateTime<Utc>> {
    DateTime::from_timestamp(ms.div_euclid(1000), (ms.rem_euclid(1000) * 1_000_000) as u32)
}

fn from_nanos(ns: i64) -> Option<DateTime<Utc>> {
    DateTime::from_timestamp(ns.div_euclid(1_000_000_000), ns.rem_euclid(1_000_000_000) as u32)
}

fn to_count(v: f64) -> u64 {
    if v.is_finite() && v > 0.0 {
        v.round() as u64
    } else {
        0
    }
}

/// UTC bars in `[start, end)`, ascending, first occurrence of each timestamp kept.
pub fn normalize_aggregates(
    raw: Vec<RawAggregate>,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
) -> Vec<BarRecord> {
    let total = raw.len();
    let mut bars: Vec<BarRecord> = raw
        .into_iter()
        .filter_map(|r| {
            Some(BarRecord {
                timestamp: from_millis(r.timestamp_ms)?,
                open: r.open,
                high: r.high,
                low: r.low,
                close: r.close,
                volume: to_count(r.volume),
                vwap: r.vwap,
                transactions: r.transactions,
            })
        })
        .filter(|b| b.timestamp >= start && b.timestamp < end)
        .collect();

    bars.sort_by_key(|b| b.timestamp);
    bars.dedup_by_key(|b| b.timestamp);
    if bars.len() < total {
        debug!(received = total, kept = bars.len(), "aggregates clipped or deduplicated");
    }
    bars
}

/// UTC ticks in `[start, end)`, ascending. Trades sharing a timestamp are all
/// kept; exact repeats of one sequence number are dropped.
pub fn normalize_trades(raw: Vec<RawTrade>, start: DateTime<Utc>, end: DateTime<Utc>) -> Vec<TickRecord> {
    let mut ticks: Vec<TickRecord> = raw
        .into_iter()
        .filter_map(|r| {
            Some(TickRecord {
                timestamp: from_nanos(r.sip_timestamp)?,
                price: r.price,
                size: to_count(r.size),
                exchange: r.exchange,
                conditions: r.conditions.unwrap_or_default(),
                sequence_number: r.sequence_number,
            })
        })
        .filter(|t| t.timestamp >= start && t.timestamp < end)
        .collect();

    ticks.sort_by_key(|t| (t.timestamp, t.sequence_number));
    ticks.dedup_by(|a, b| {
        a.sequence_number.is_some() && a.sequence_number == b.sequence_number && a.timestamp == b.timestamp
    });
    ticks
}
