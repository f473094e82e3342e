//! Read trade windows from a CSV export of the trade store.
//!
//! Only `symbol`, `entry_timestamp` and `exit_timestamp` are read; any other
//! columns are ignored. Nothing is ever written back.

use crate::domain::{TradeWindow, TradeWindowError};
use serde::Deserialize;
use std::io::Read;
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TradeSourceError {
    #[error("read trade export: {0}")]
    Csv(#[from] csv::Error),

    #[error("trade export row {row}: {source}")]
    Window {
        row: usize,
        source: TradeWindowError,
    },
}

#[derive(Debug, Deserialize)]
struct TradeRow {
    symbol: String,
    entry_timestamp: String,
    exit_timestamp: String,
}

pub fn read_trade_windows(path: &Path) -> Result<Vec<TradeWindow>, TradeSourceError> {
    let reader = csv::ReaderBuilder::new()
        .trim(csv::Trim::All)
        .from_path(path)?;
    collect_windows(reader)
}

pub fn read_trade_windows_from<R: Read>(input: R) -> Result<Vec<TradeWindow>, TradeSourceError> {
    let reader = csv::ReaderBuilder::new()
        .trim(csv::Trim::All)
        .from_reader(input);
    collect_windows(reader)
}

fn collect_windows<R: Read>(mut reader: csv::Reader<R>) -> Result<Vec<TradeWindow>, TradeSourceError> {
    let mut windows = Vec::new();
    for (i, row) in reader.deserialize::<TradeRow>().enumerate() {
        let row = row?;
        // Row 1 is the header.
        let window = TradeWindow::parse(&row.symbol, &row.entry_timestamp, &row.exit_timestamp)
            .map_err(|source| TradeSourceError::Window { row: i + 2, source })?;
        windows.push(window);
    }
    Ok(windows)
}
