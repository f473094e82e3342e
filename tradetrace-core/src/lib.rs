//! TradeTrace Core: market data acquisition for trade analysis.
//!
//! This crate fetches the price history around recorded trades:
//! - Domain types (bars, ticks, granularity, exchange sessions, trade windows)
//! - Rate-limited API client with a rolling per-minute ceiling and backoff
//! - TTL disk cache with atomic writes
//! - Data quality validator
//! - Bar fetcher tying them together, plus parallel batch prefetch

pub mod config;
pub mod data;
pub mod domain;
