//! Batch prefetch: fetch bars for many trade windows in parallel.
//!
//! All workers share one fetcher, so one rate-limit window and one cache.
//! An interrupted run is resumed by running it again: windows that completed
//! are cache hits.

use super::error::MarketDataError;
use super::fetcher::{BarFetcher, DataSource};
use crate::domain::{Granularity, TradeWindow};
use rayon::prelude::*;
use serde::Serialize;
use tracing::{info, warn};

/// Outcome of one window.
#[derive(Debug)]
pub enum PrefetchOutcome {
    Fetched { bars: usize },
    FromCache { bars: usize },
    Empty,
    Failed(MarketDataError),
}

/// Summary of a batch prefetch.
#[derive(Debug, Default, Serialize)]
pub struct BatchSummary {
    pub total: usize,
    pub fetched: usize,
    pub from_cache: usize,
    pub empty: usize,
    pub failed: usize,
    pub bars: usize,
    /// (symbol, entry, error message) per failed window.
    pub errors: Vec<(String, String, String)>,
}

impl BatchSummary {
    pub fn all_succeeded(&self) -> bool {
        self.failed == 0
    }

    fn record(&mut self, window: &TradeWindow, outcome: PrefetchOutcome) {
        self.total += 1;
        match outcome {
            PrefetchOutcome::Fetched { bars } => {
                self.fetched += 1;
                self.bars += bars;
            }
            PrefetchOutcome::FromCache { bars } => {
                self.from_cache += 1;
                self.bars += bars;
            }
            PrefetchOutcome::Empty => self.empty += 1,
            PrefetchOutcome::Failed(e) => {
                self.failed += 1;
                self.errors
                    .push((window.symbol.clone(), window.entry.to_rfc3339(), e.to_string()));
            }
        }
    }
}

/// Fetch one trade window with the fetcher's configured buffers.
pub fn prefetch_window(
    fetcher: &BarFetcher,
    window: &TradeWindow,
    granularity: Granularity,
) -> PrefetchOutcome {
    let config = fetcher.fetch_config();
    let (start, end) = window.buffered(config.pre_buffer(), config.post_buffer());
    match fetcher.fetch_bars_sourced(&window.symbol, start, end, granularity, 1) {
        Ok((bars, _)) if bars.is_empty() => PrefetchOutcome::Empty,
        Ok((bars, DataSource::Cache)) => PrefetchOutcome::FromCache { bars: bars.len() },
        Ok((bars, DataSource::Api)) => PrefetchOutcome::Fetched { bars: bars.len() },
        Err(e) => {
            warn!(symbol = %window.symbol, entry = %window.entry, error = %e, "prefetch failed");
            PrefetchOutcome::Failed(e)
        }
    }
}

/// Prefetch every window. `threads` bounds parallelism; `None` uses the
/// global rayon pool.
pub fn prefetch_trades(
    fetcher: &BarFetcher,
    windows: &[TradeWindow],
    granularity: Granularity,
    threads: Option<usize>,
) -> Result<BatchSummary, MarketDataError> {
    let run = || -> Vec<PrefetchOutcome> {
        windows
            .par_iter()
            .map(|w| prefetch_window(fetcher, w, granularity))
            .collect()
    };

    let outcomes = match threads {
        Some(n) => rayon::ThreadPoolBuilder::new()
            .num_threads(n.max(1))
            .thread_name(|i| format!("tradetrace-prefetch-{i}"))
            .build()
            .map_err(|e| MarketDataError::Config(format!("failed to build prefetch pool: {e}")))?
            .install(run),
        None => run(),
    };

    let mut summary = BatchSummary::default();
    for (window, outcome) in windows.iter().zip(outcomes) {
        summary.record(window, outcome);
    }
    info!(
        total = summary.total,
        fetched = summary.fetched,
        from_cache = summary.from_cache,
        empty = summary.empty,
        failed = summary.failed,
        "prefetch complete"
    );
    Ok(summary)
}
