//! End-to-end tests for the fetch pipeline against a scripted upstream.
//!
//! The upstream fake synthesizes one bar per unit (or one trade per second)
//! for whatever window it is asked about and counts every call, so cache
//! behaviour is observable as "did the API get called again".

use chrono::{DateTime, Duration, NaiveDate, TimeZone, Utc};
use chrono_tz::America::New_York;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tradetrace_core::config::MarketDataConfig;
use tradetrace_core::data::{
    prefetch_trades, BarFetcher, CacheKey, Clock, DataSource, DiskCache, ManualClock,
    MarketDataApi, MarketDataError, MarketStatus, Paged, PriceSource, QualityWarning,
    RawAggregate, RawTrade,
};
use tradetrace_core::domain::{Granularity, TradeWindow};

// ── Fake upstream ────────────────────────────────────────────────────

#[derive(Default)]
struct FakeApi {
    aggregate_calls: AtomicUsize,
    trade_calls: AtomicUsize,
    status_calls: AtomicUsize,
    closed_dates: Vec<NaiveDate>,
    /// Windows starting at these instants come back empty.
    empty_from: Vec<DateTime<Utc>>,
    /// Report every result as cut short by the page cap.
    truncate: bool,
}

impl FakeApi {
    fn closed_on(dates: &[NaiveDate]) -> Self {
        Self {
            closed_dates: dates.to_vec(),
            ..Self::default()
        }
    }

    fn aggregate_calls(&self) -> usize {
        self.aggregate_calls.load(Ordering::SeqCst)
    }

    fn trade_calls(&self) -> usize {
        self.trade_calls.load(Ordering::SeqCst)
    }
}

/// Deterministic price for an instant, so lookups can be checked exactly.
fn price_at(ms: i64) -> f64 {
    185.0 + ((ms / 1000) % 600) as f64 * 0.01
}

impl MarketDataApi for FakeApi {
    fn market_status(&self, date: NaiveDate) -> Result<MarketStatus, MarketDataError> {
        self.status_calls.fetch_add(1, Ordering::SeqCst);
        let closed = self.closed_dates.contains(&date);
        Ok(MarketStatus {
            date,
            open: !closed,
            reason: closed.then(|| "holiday".to_string()),
            exchanges: BTreeMap::new(),
        })
    }

    fn aggregates(
        &self,
        _symbol: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        granularity: Granularity,
        multiplier: u32,
    ) -> Result<Paged<RawAggregate>, MarketDataError> {
        self.aggregate_calls.fetch_add(1, Ordering::SeqCst);
        if self.empty_from.contains(&start) {
            return Ok(Paged::complete(Vec::new()));
        }
        let step = granularity.unit().map(|u| u.num_milliseconds()).unwrap_or(1000)
            * i64::from(multiplier);
        // One bar before the window, which the fetcher must clip.
        let mut ms = start.timestamp_millis() - step;
        let mut out = Vec::new();
        while ms < end.timestamp_millis() {
            let close = price_at(ms);
            out.push(RawAggregate {
                timestamp_ms: ms,
                open: close - 0.02,
                high: close + 0.05,
                low: close - 0.05,
                close,
                volume: 1500.0,
                vwap: Some(close),
                transactions: Some(12),
            });
            ms += step;
        }
        Ok(Paged {
            items: out,
            truncated: self.truncate,
        })
    }

    fn trades(
        &self,
        _symbol: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Paged<RawTrade>, MarketDataError> {
        self.trade_calls.fetch_add(1, Ordering::SeqCst);
        // One print per second, 100ms past the second.
        let first = start.timestamp() * 1_000_000_000;
        let mut ns = first + 100_000_000;
        let mut seq = 1;
        let mut out = Vec::new();
        while ns < end.timestamp_nanos_opt().unwrap_or(i64::MAX) {
            out.push(RawTrade {
                sip_timestamp: ns,
                price: price_at(ns / 1_000_000),
                size: 100.0,
                exchange: Some(4),
                conditions: None,
                sequence_number: Some(seq),
            });
            seq += 1;
            ns += 1_000_000_000;
        }
        Ok(Paged {
            items: out,
            truncated: self.truncate,
        })
    }
}

// ── Harness ──────────────────────────────────────────────────────────

struct Harness {
    api: Arc<FakeApi>,
    clock: Arc<ManualClock>,
    fetcher: BarFetcher,
    _dir: tempfile::TempDir,
}

fn harness_with(api: FakeApi) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let clock = Arc::new(ManualClock::starting_at(utc(2024, 1, 20, 12, 0, 0)));
    let dyn_clock: Arc<dyn Clock> = clock.clone();
    let cache = DiskCache::open(dir.path(), dyn_clock).unwrap();

    let mut config = MarketDataConfig::default();
    config.cache.minute_ttl_hours = 1;
    config.cache.second_ttl_hours = 1;
    config.cache.tick_ttl_hours = 1;

    let api = Arc::new(api);
    let fetcher = BarFetcher::new(api.clone(), Some(cache), &config);
    Harness {
        api,
        clock,
        fetcher,
        _dir: dir,
    }
}

fn harness() -> Harness {
    harness_with(FakeApi::default())
}

fn utc(y: i32, mo: u32, d: u32, h: u32, mi: u32, s: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(y, mo, d, h, mi, s).unwrap()
}

// ── Range fetches ────────────────────────────────────────────────────

#[test]
fn regular_session_minute_bars_in_exchange_time() {
    let h = harness();
    let start = New_York.with_ymd_and_hms(2024, 1, 15, 9, 30, 0).unwrap();
    let end = New_York.with_ymd_and_hms(2024, 1, 15, 16, 0, 0).unwrap();

    let bars = h
        .fetcher
        .fetch_bars_for_range("AAPL", &start, &end, Granularity::Minute)
        .unwrap();

    assert!(!bars.is_empty());
    assert!(bars.len() <= 390, "got {} bars", bars.len());
    assert_eq!(bars[0].timestamp, start.with_timezone(&Utc));
    for pair in bars.windows(2) {
        assert!(pair[0].timestamp < pair[1].timestamp);
    }
    assert!(bars.iter().all(|b| b.timestamp < end.with_timezone(&Utc)));
}

#[test]
fn second_fetch_is_served_from_cache() {
    let h = harness();
    let start = utc(2024, 1, 16, 14, 30, 0);
    let end = utc(2024, 1, 16, 15, 0, 0);

    let first = h.fetcher.fetch_bars("aapl", start, end, Granularity::Minute, 1).unwrap();
    let (second, source) = h
        .fetcher
        .fetch_bars_sourced("AAPL", start, end, Granularity::Minute, 1)
        .unwrap();

    assert_eq!(first, second);
    assert_eq!(source, DataSource::Cache);
    assert_eq!(h.api.aggregate_calls(), 1);
}

#[test]
fn granularities_are_cached_separately() {
    let h = harness();
    let start = utc(2024, 1, 16, 14, 30, 0);
    let end = utc(2024, 1, 16, 14, 35, 0);

    let minutes = h.fetcher.fetch_bars("AAPL", start, end, Granularity::Minute, 1).unwrap();
    let seconds = h.fetcher.fetch_bars("AAPL", start, end, Granularity::Second, 1).unwrap();

    assert_eq!(minutes.len(), 5);
    assert_eq!(seconds.len(), 300);
    assert_eq!(h.api.aggregate_calls(), 2);
    assert_ne!(
        CacheKey::for_request("AAPL", start, end, Granularity::Minute, 1),
        CacheKey::for_request("AAPL", start, end, Granularity::Second, 1)
    );
}

#[test]
fn expired_entry_is_refetched() {
    let h = harness();
    let start = utc(2024, 1, 16, 14, 30, 0);
    let end = utc(2024, 1, 16, 14, 40, 0);

    h.fetcher.fetch_bars("AAPL", start, end, Granularity::Minute, 1).unwrap();
    h.clock.advance(std::time::Duration::from_secs(30 * 60));
    h.fetcher.fetch_bars("AAPL", start, end, Granularity::Minute, 1).unwrap();
    assert_eq!(h.api.aggregate_calls(), 1);

    h.clock.advance(std::time::Duration::from_secs(31 * 60));
    let (_, source) = h
        .fetcher
        .fetch_bars_sourced("AAPL", start, end, Granularity::Minute, 1)
        .unwrap();
    assert_eq!(source, DataSource::Api);
    assert_eq!(h.api.aggregate_calls(), 2);
}

#[test]
fn corrupt_payload_falls_through_to_api() {
    let h = harness();
    let start = utc(2024, 1, 16, 14, 30, 0);
    let end = utc(2024, 1, 16, 14, 40, 0);
    let original = h.fetcher.fetch_bars("AAPL", start, end, Granularity::Minute, 1).unwrap();

    let cache_dir = h.fetcher.cache().unwrap().cache_dir().to_path_buf();
    for entry in std::fs::read_dir(&cache_dir).unwrap() {
        let path = entry.unwrap().path();
        let name = path.file_name().unwrap().to_string_lossy().into_owned();
        if name.ends_with(".json") && !name.ends_with(".meta.json") {
            std::fs::write(&path, b"{ not json").unwrap();
        }
    }

    let refetched = h.fetcher.fetch_bars("AAPL", start, end, Granularity::Minute, 1).unwrap();
    assert_eq!(refetched, original);
    assert_eq!(h.api.aggregate_calls(), 2);

    // The refetch repaired the entry.
    h.fetcher.fetch_bars("AAPL", start, end, Granularity::Minute, 1).unwrap();
    assert_eq!(h.api.aggregate_calls(), 2);
}

#[test]
fn empty_window_is_not_cached() {
    let start = utc(2024, 1, 16, 3, 0, 0);
    let h = harness_with(FakeApi {
        empty_from: vec![start],
        ..FakeApi::default()
    });
    let end = start + Duration::minutes(10);

    assert!(h.fetcher.fetch_bars("AAPL", start, end, Granularity::Minute, 1).unwrap().is_empty());
    assert!(h.fetcher.fetch_bars("AAPL", start, end, Granularity::Minute, 1).unwrap().is_empty());
    assert_eq!(h.api.aggregate_calls(), 2);
}

#[test]
fn truncated_result_is_returned_but_not_cached() {
    let h = harness_with(FakeApi {
        truncate: true,
        ..FakeApi::default()
    });
    let start = utc(2024, 1, 16, 14, 30, 0);
    let end = utc(2024, 1, 16, 14, 40, 0);

    let (first, source) = h
        .fetcher
        .fetch_bars_sourced("AAPL", start, end, Granularity::Minute, 1)
        .unwrap();
    assert_eq!(first.len(), 10);
    assert_eq!(source, DataSource::Api);

    let (_, source) = h
        .fetcher
        .fetch_bars_sourced("AAPL", start, end, Granularity::Minute, 1)
        .unwrap();
    assert_eq!(source, DataSource::Api);
    assert_eq!(h.api.aggregate_calls(), 2);
    assert_eq!(h.fetcher.cache().unwrap().stats().unwrap().entry_count, 0);

    h.fetcher.fetch_ticks_for_range("AAPL", &start, &end).unwrap();
    h.fetcher.fetch_ticks_for_range("AAPL", &start, &end).unwrap();
    assert_eq!(h.api.trade_calls(), 2);
}

#[test]
fn invalid_requests_never_reach_the_api() {
    let h = harness();
    let t = utc(2024, 1, 16, 14, 30, 0);

    assert!(matches!(
        h.fetcher.fetch_bars("AAPL", t, t, Granularity::Minute, 1),
        Err(MarketDataError::InvalidWindow(_))
    ));
    assert!(matches!(
        h.fetcher.fetch_bars("  ", t, t + Duration::minutes(1), Granularity::Minute, 1),
        Err(MarketDataError::BadRequest(_))
    ));
    assert!(matches!(
        h.fetcher.fetch_bars("AAPL", t, t + Duration::minutes(1), Granularity::Tick, 1),
        Err(MarketDataError::BadRequest(_))
    ));
    assert_eq!(h.api.aggregate_calls(), 0);
}

// ── Trade windows and sessions ───────────────────────────────────────

#[test]
fn trade_fetch_applies_buffers() {
    let h = harness();
    let entry = utc(2024, 1, 16, 14, 35, 10);
    let exit = utc(2024, 1, 16, 14, 52, 0);

    let bars = h
        .fetcher
        .fetch_bars_for_trade(entry, exit, "AAPL", Granularity::Second, 1, 1)
        .unwrap();

    assert_eq!(bars.first().unwrap().timestamp, entry - Duration::minutes(1));
    assert_eq!(bars.last().unwrap().timestamp, exit + Duration::minutes(1) - Duration::seconds(1));
}

#[test]
fn trade_with_exit_before_entry_is_rejected() {
    let h = harness();
    let entry = utc(2024, 1, 16, 14, 35, 10);
    let result = h.fetcher.fetch_bars_for_trade(
        entry,
        entry - Duration::minutes(5),
        "AAPL",
        Granularity::Minute,
        1,
        1,
    );
    assert!(matches!(result, Err(MarketDataError::InvalidWindow(_))));
}

#[test]
fn instantaneous_trade_reads_the_bar_containing_it() {
    let h = harness();
    let t = utc(2024, 1, 16, 14, 35, 10);

    let bars = h
        .fetcher
        .fetch_bars_for_trade(t, t, "AAPL", Granularity::Minute, 0, 0)
        .unwrap();
    assert_eq!(bars.len(), 1);
    assert_eq!(bars[0].timestamp, utc(2024, 1, 16, 14, 35, 0));

    let window = TradeWindow::new("AAPL", t, t).unwrap();
    let ticks = h
        .fetcher
        .fetch_ticks_for_trade(&window, Duration::zero(), Duration::zero())
        .unwrap();
    assert_eq!(ticks.len(), 1);
    assert_eq!(ticks[0].timestamp, t + Duration::milliseconds(100));
}

#[test]
fn closed_session_returns_no_bars_without_fetching() {
    let holiday = NaiveDate::from_ymd_opt(2024, 1, 15).unwrap();
    let h = harness_with(FakeApi::closed_on(&[holiday]));

    let bars = h.fetcher.fetch_session_bars("AAPL", holiday, Granularity::Minute).unwrap();
    assert!(bars.is_empty());
    assert_eq!(h.api.aggregate_calls(), 0);

    let open_day = NaiveDate::from_ymd_opt(2024, 1, 16).unwrap();
    let bars = h.fetcher.fetch_session_bars("AAPL", open_day, Granularity::Minute).unwrap();
    assert_eq!(bars.len(), 390);
}

#[test]
fn ticks_are_ascending_and_inside_the_window() {
    let h = harness();
    let window = TradeWindow::new("AAPL", utc(2024, 1, 16, 14, 35, 0), utc(2024, 1, 16, 14, 36, 0))
        .unwrap();

    let ticks = h
        .fetcher
        .fetch_ticks_for_trade(&window, Duration::seconds(10), Duration::seconds(10))
        .unwrap();

    assert_eq!(ticks.len(), 80);
    assert!(ticks[0].timestamp >= window.entry - Duration::seconds(10));
    for pair in ticks.windows(2) {
        assert!(pair[0].timestamp <= pair[1].timestamp);
    }
    h.fetcher
        .fetch_ticks_for_trade(&window, Duration::seconds(10), Duration::seconds(10))
        .unwrap();
    assert_eq!(h.api.trade_calls(), 1);
}

// ── Price lookups ────────────────────────────────────────────────────

#[test]
fn second_bar_lookup_on_whole_second_offset_is_exact() {
    let h = harness();
    let entry = utc(2024, 1, 16, 14, 35, 10);
    let target = entry + Duration::seconds(30);

    let point = h
        .fetcher
        .get_price_at("AAPL", target, PriceSource::Bars(Granularity::Second))
        .unwrap()
        .unwrap();

    assert_eq!(point.timestamp, target);
    assert_eq!(point.timing_error(), Duration::zero());
    assert_eq!(point.price, price_at(target.timestamp_millis()));
}

#[test]
fn minute_bar_lookup_is_within_half_a_minute() {
    let h = harness();
    let target = utc(2024, 1, 16, 14, 35, 40);

    let point = h
        .fetcher
        .get_price_at("AAPL", target, PriceSource::Bars(Granularity::Minute))
        .unwrap()
        .unwrap();

    assert_eq!(point.timestamp, utc(2024, 1, 16, 14, 36, 0));
    assert!(point.timing_error().num_seconds().abs() <= 30);
}

#[test]
fn equidistant_minute_bars_resolve_to_the_earlier_one() {
    let h = harness();
    let target = utc(2024, 1, 16, 14, 35, 30);

    let point = h
        .fetcher
        .get_price_at("AAPL", target, PriceSource::Bars(Granularity::Minute))
        .unwrap()
        .unwrap();

    assert_eq!(point.timestamp, utc(2024, 1, 16, 14, 35, 0));
}

#[test]
fn offset_lookup_from_ticks() {
    let h = harness();
    let anchor = utc(2024, 1, 16, 14, 35, 10);

    let point = h
        .fetcher
        .get_price_at_offset("AAPL", anchor, Duration::seconds(60), true)
        .unwrap()
        .unwrap();

    assert_eq!(point.source, Granularity::Tick);
    assert_eq!(point.timing_error(), Duration::milliseconds(100));
}

#[test]
fn lookup_in_an_empty_window_is_none() {
    let target = utc(2024, 1, 16, 3, 0, 0);
    let start = target - Duration::seconds(5);
    let h = harness_with(FakeApi {
        empty_from: vec![start],
        ..FakeApi::default()
    });

    let point = h
        .fetcher
        .get_price_at("AAPL", target, PriceSource::Bars(Granularity::Second))
        .unwrap();
    assert!(point.is_none());
}

// ── Validation ───────────────────────────────────────────────────────

#[test]
fn validated_fetch_reports_full_coverage() {
    let h = harness();
    let start = New_York.with_ymd_and_hms(2024, 1, 16, 10, 0, 0).unwrap();
    let end = New_York.with_ymd_and_hms(2024, 1, 16, 11, 0, 0).unwrap();

    let validated = h
        .fetcher
        .fetch_validated_bars_for_range("AAPL", &start, &end, Granularity::Minute)
        .unwrap();

    assert_eq!(validated.bars.len(), 60);
    assert!(validated.report.valid);
    assert_eq!(validated.report.expected_count, Some(60));
    assert_eq!(validated.report.coverage_ratio, Some(1.0));
    assert!(validated.report.gaps.is_empty());
}

#[test]
fn validator_flags_missing_bars() {
    let h = harness();
    let start = utc(2024, 1, 16, 15, 0, 0);
    let end = utc(2024, 1, 16, 16, 0, 0);
    let mut bars = h.fetcher.fetch_bars("AAPL", start, end, Granularity::Minute, 1).unwrap();
    bars.drain(10..40);

    let report = h.fetcher.validate_bars(&bars, Granularity::Minute, Some(60));
    assert!(report.valid);
    assert_eq!(report.gaps.len(), 1);
    assert_eq!(report.gaps[0].missing_units, 30);
    assert!(report.has_warning(|w| matches!(w, QualityWarning::LowCoverage { .. })));
}

// ── Batch prefetch ───────────────────────────────────────────────────

#[test]
fn prefetch_rerun_is_served_from_cache() {
    let h = harness();
    let windows = vec![
        TradeWindow::new("AAPL", utc(2024, 1, 16, 14, 35, 10), utc(2024, 1, 16, 14, 52, 0)).unwrap(),
        TradeWindow::new("MSFT", utc(2024, 1, 16, 15, 1, 0), utc(2024, 1, 16, 15, 30, 0)).unwrap(),
        TradeWindow::new("NVDA", utc(2024, 1, 17, 14, 31, 0), utc(2024, 1, 17, 14, 45, 0)).unwrap(),
    ];

    let first = prefetch_trades(&h.fetcher, &windows, Granularity::Second, Some(2)).unwrap();
    assert_eq!(first.total, 3);
    assert_eq!(first.fetched, 3);
    assert_eq!(first.from_cache, 0);
    assert!(first.all_succeeded());

    let second = prefetch_trades(&h.fetcher, &windows, Granularity::Second, None).unwrap();
    assert_eq!(second.from_cache, 3);
    assert_eq!(second.fetched, 0);
    assert_eq!(second.bars, first.bars);
    assert_eq!(h.api.aggregate_calls(), 3);
}
