//! TradeTrace CLI: market data retrieval around recorded trades.
//!
//! Commands:
//! - `check`: verify the API key and show the rate limit budget
//! - `status`: market status now, or for a given date
//! - `ticker`: reference details for a symbol
//! - `fetch`: bars (or ticks) for an arbitrary window
//! - `session`: regular-session bars for one trading day
//! - `trade`: bars or ticks around one trade
//! - `price`: price at an offset from an anchor instant
//! - `prefetch`: warm the cache for every trade in a CSV export
//! - `cache status|list|remove|clear-expired|clear-all`: cache maintenance
//!
//! Results are printed to stdout as JSON; logs go to stderr.

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Duration, NaiveDate, Utc};
use clap::{Parser, Subcommand, ValueEnum};
use serde::Serialize;
use std::path::{Path, PathBuf};
use tracing::info;
use tracing_subscriber::EnvFilter;
use tradetrace_core::config::MarketDataConfig;
use tradetrace_core::data::fetcher::open_cache_with_system_clock;
use tradetrace_core::data::{
    prefetch_trades, read_trade_windows, BarFetcher, CacheKey, PriceSource, RateLimitedClient,
};
use tradetrace_core::domain::session::exchange_today;
use tradetrace_core::domain::{parse_exchange_local, parse_utc, Granularity, TradeWindow};

/// Config file read when `--config` is not given, if present.
const DEFAULT_CONFIG: &str = "tradetrace.toml";

#[derive(Parser)]
#[command(
    name = "tradetrace",
    version,
    about = "TradeTrace CLI: historical bars and ticks around recorded trades"
)]
struct Cli {
    /// Path to a TOML config file. Defaults to ./tradetrace.toml when present.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// More log output (-v debug, -vv trace). RUST_LOG overrides.
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Verify the API key and report the rate limit budget.
    Check,
    /// Market status now, or for a given date.
    Status {
        /// Trading date (YYYY-MM-DD) in exchange time.
        #[arg(long)]
        date: Option<String>,
    },
    /// Reference details for a symbol.
    Ticker { symbol: String },
    /// Bars for an arbitrary window.
    Fetch {
        symbol: String,

        /// Window start, ISO-8601. Strings without an offset are UTC.
        #[arg(long)]
        start: String,

        /// Window end (exclusive), ISO-8601.
        #[arg(long)]
        end: String,

        /// minute, second or tick. Defaults to the configured granularity.
        #[arg(long)]
        granularity: Option<Granularity>,

        /// Bars per aggregate, e.g. 5 for 5-minute bars.
        #[arg(long, default_value_t = 1)]
        multiplier: u32,

        /// Include a data quality report.
        #[arg(long, default_value_t = false)]
        validate: bool,

        /// How to read --start/--end without an offset.
        #[arg(long, value_enum, default_value_t = TimeBasis::Utc)]
        tz: TimeBasis,
    },
    /// Regular-session bars for one trading day.
    Session {
        symbol: String,

        /// Trading date (YYYY-MM-DD).
        #[arg(long)]
        date: String,

        #[arg(long)]
        granularity: Option<Granularity>,
    },
    /// Bars or ticks around one trade, with the configured buffers.
    Trade {
        symbol: String,

        #[arg(long)]
        entry: String,

        #[arg(long)]
        exit: String,

        #[arg(long)]
        granularity: Option<Granularity>,

        /// Fetch ticks instead of bars.
        #[arg(long, default_value_t = false)]
        ticks: bool,
    },
    /// Price at `--at` plus `--offset-secs`.
    Price {
        symbol: String,

        /// Anchor instant, ISO-8601.
        #[arg(long)]
        at: String,

        /// Offset from the anchor in seconds (may be negative).
        #[arg(long, default_value_t = 0, allow_hyphen_values = true)]
        offset_secs: i64,

        /// Look up from ticks instead of bars.
        #[arg(long, default_value_t = false)]
        ticks: bool,
    },
    /// Fetch bars for every trade in a CSV export. Re-running resumes.
    Prefetch {
        /// CSV with symbol, entry_timestamp and exit_timestamp columns.
        #[arg(long)]
        trades: PathBuf,

        #[arg(long)]
        granularity: Option<Granularity>,

        /// Worker threads. Defaults to rayon's global pool.
        #[arg(long)]
        threads: Option<usize>,
    },
    /// Cache maintenance commands.
    Cache {
        #[command(subcommand)]
        action: CacheAction,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum TimeBasis {
    /// Naive timestamps are UTC.
    Utc,
    /// Naive timestamps are exchange wall-clock time (America/New_York).
    Exchange,
}

#[derive(Subcommand)]
enum CacheAction {
    /// Entry count, size, age range and expired count.
    Status,
    /// Metadata of every entry, oldest first.
    List,
    /// Drop the entry for one request window.
    Remove {
        symbol: String,

        #[arg(long)]
        start: String,

        #[arg(long)]
        end: String,

        #[arg(long, default_value_t = Granularity::Minute)]
        granularity: Granularity,

        #[arg(long, default_value_t = 1)]
        multiplier: u32,
    },
    /// Remove expired, corrupt and orphaned entries.
    ClearExpired,
    /// Remove every entry.
    ClearAll,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);
    let config = load_config(cli.config.as_deref())?;

    match cli.command {
        Commands::Check => run_check(&config),
        Commands::Status { date } => run_status(&config, date.as_deref()),
        Commands::Ticker { symbol } => run_ticker(&config, &symbol),
        Commands::Fetch {
            symbol,
            start,
            end,
            granularity,
            multiplier,
            validate,
            tz,
        } => {
            let start = parse_in("start", &start, tz)?;
            let end = parse_in("end", &end, tz)?;
            run_fetch(&config, &symbol, start, end, granularity, multiplier, validate)
        }
        Commands::Session {
            symbol,
            date,
            granularity,
        } => run_session(&config, &symbol, &date, granularity),
        Commands::Trade {
            symbol,
            entry,
            exit,
            granularity,
            ticks,
        } => run_trade(&config, &symbol, &entry, &exit, granularity, ticks),
        Commands::Price {
            symbol,
            at,
            offset_secs,
            ticks,
        } => run_price(&config, &symbol, &at, offset_secs, ticks),
        Commands::Prefetch {
            trades,
            granularity,
            threads,
        } => run_prefetch(&config, &trades, granularity, threads),
        Commands::Cache { action } => run_cache(&config, action),
    }
}

fn init_tracing(verbose: u8) {
    let default = match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default)),
        )
        .with_writer(std::io::stderr)
        .init();
}

fn load_config(path: Option<&Path>) -> Result<MarketDataConfig> {
    match path {
        Some(path) => MarketDataConfig::from_file(path)
            .with_context(|| format!("loading config {}", path.display())),
        None if Path::new(DEFAULT_CONFIG).exists() => {
            MarketDataConfig::from_file(Path::new(DEFAULT_CONFIG))
                .with_context(|| format!("loading config {DEFAULT_CONFIG}"))
        }
        None => Ok(MarketDataConfig::default()),
    }
}

fn client(config: &MarketDataConfig) -> Result<RateLimitedClient> {
    RateLimitedClient::from_config(config).context("building market data client")
}

fn fetcher(config: &MarketDataConfig) -> Result<BarFetcher> {
    BarFetcher::from_config(config).context("building bar fetcher")
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn parse_instant(label: &str, s: &str) -> Result<DateTime<Utc>> {
    parse_utc(s).with_context(|| format!("invalid --{label} '{s}'"))
}

fn parse_in(label: &str, s: &str, basis: TimeBasis) -> Result<DateTime<Utc>> {
    match basis {
        TimeBasis::Utc => parse_instant(label, s),
        TimeBasis::Exchange => {
            parse_exchange_local(s).with_context(|| format!("invalid --{label} '{s}'"))
        }
    }
}

fn parse_date(s: &str) -> Result<NaiveDate> {
    NaiveDate::parse_from_str(s, "%Y-%m-%d").with_context(|| format!("invalid date '{s}'"))
}

fn run_check(config: &MarketDataConfig) -> Result<()> {
    let client = client(config)?;
    let connected = client.test_connection();
    print_json(&serde_json::json!({
        "connected": connected,
        "rate_limit": client.rate_limit_info(),
    }))?;
    if !connected {
        bail!("connection check failed");
    }
    Ok(())
}

fn run_status(config: &MarketDataConfig, date: Option<&str>) -> Result<()> {
    let client = client(config)?;
    match date {
        Some(date) => print_json(&client.get_market_status(parse_date(date)?)?),
        None => {
            let live = client.market_status_now()?;
            info!(today = %exchange_today(), market = %live.market, "live status");
            print_json(&live)
        }
    }
}

fn run_ticker(config: &MarketDataConfig, symbol: &str) -> Result<()> {
    let client = client(config)?;
    match client.ticker_details(symbol)? {
        Some(details) => print_json(&details),
        None => bail!("unknown symbol {symbol}"),
    }
}

fn run_fetch(
    config: &MarketDataConfig,
    symbol: &str,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    granularity: Option<Granularity>,
    multiplier: u32,
    validate: bool,
) -> Result<()> {
    let fetcher = fetcher(config)?;
    let granularity = granularity.unwrap_or(config.fetch.default_granularity);

    if granularity == Granularity::Tick {
        let ticks = fetcher.fetch_ticks_for_range(symbol, &start, &end)?;
        if validate {
            return print_json(&serde_json::json!({
                "ticks": ticks,
                "report": fetcher.validate_ticks(&ticks),
            }));
        }
        return print_json(&ticks);
    }

    if validate && multiplier == 1 {
        return print_json(&fetcher.fetch_validated_bars_for_range(symbol, &start, &end, granularity)?);
    }
    let bars = fetcher.fetch_bars(symbol, start, end, granularity, multiplier)?;
    if validate {
        let report = fetcher.validate_bars(&bars, granularity, None);
        return print_json(&serde_json::json!({ "bars": bars, "report": report }));
    }
    print_json(&bars)
}

fn run_session(
    config: &MarketDataConfig,
    symbol: &str,
    date: &str,
    granularity: Option<Granularity>,
) -> Result<()> {
    let fetcher = fetcher(config)?;
    let granularity = granularity.unwrap_or(config.fetch.default_granularity);
    let bars = fetcher.fetch_session_bars(symbol, parse_date(date)?, granularity)?;
    let report = fetcher.validate_bars(&bars, granularity, granularity.session_bar_count());
    print_json(&serde_json::json!({ "bars": bars, "report": report }))
}

fn run_trade(
    config: &MarketDataConfig,
    symbol: &str,
    entry: &str,
    exit: &str,
    granularity: Option<Granularity>,
    ticks: bool,
) -> Result<()> {
    let fetcher = fetcher(config)?;
    let window = TradeWindow::new(
        symbol,
        parse_instant("entry", entry)?,
        parse_instant("exit", exit)?,
    )?;

    if ticks {
        let fetch = fetcher.fetch_config();
        let ticks = fetcher.fetch_ticks_for_trade(&window, fetch.pre_buffer(), fetch.post_buffer())?;
        return print_json(&ticks);
    }
    let granularity = granularity.unwrap_or(config.fetch.default_granularity);
    print_json(&fetcher.fetch_bars_for_trade_window(&window, granularity)?)
}

fn run_price(
    config: &MarketDataConfig,
    symbol: &str,
    at: &str,
    offset_secs: i64,
    ticks: bool,
) -> Result<()> {
    let fetcher = fetcher(config)?;
    let anchor = parse_instant("at", at)?;
    match fetcher.get_price_at_offset(symbol, anchor, Duration::seconds(offset_secs), ticks)? {
        Some(point) => print_json(&serde_json::json!({
            "point": point,
            "timing_error_ms": point.timing_error().num_milliseconds(),
        })),
        None => {
            let source = if ticks {
                PriceSource::Ticks
            } else {
                PriceSource::Bars(config.fetch.default_granularity)
            };
            bail!("no data for {symbol} near {} ({source:?})", anchor + Duration::seconds(offset_secs))
        }
    }
}

fn run_prefetch(
    config: &MarketDataConfig,
    trades: &Path,
    granularity: Option<Granularity>,
    threads: Option<usize>,
) -> Result<()> {
    let windows = read_trade_windows(trades)
        .with_context(|| format!("reading trades from {}", trades.display()))?;
    info!(trades = windows.len(), "loaded trade windows");

    let fetcher = fetcher(config)?;
    let granularity = granularity.unwrap_or(config.fetch.default_granularity);
    let summary = prefetch_trades(&fetcher, &windows, granularity, threads)?;
    print_json(&summary)?;

    if !summary.all_succeeded() {
        for (symbol, entry, err) in &summary.errors {
            eprintln!("Error for {symbol} at {entry}: {err}");
        }
        std::process::exit(1);
    }
    Ok(())
}

fn run_cache(config: &MarketDataConfig, action: CacheAction) -> Result<()> {
    let Some(cache) = open_cache_with_system_clock(&config.cache) else {
        bail!("cache is disabled or unusable: {}", config.cache.dir.display());
    };

    match action {
        CacheAction::Status => print_json(&cache.stats()?),
        CacheAction::List => print_json(&cache.entries()?),
        CacheAction::Remove {
            symbol,
            start,
            end,
            granularity,
            multiplier,
        } => {
            let start = parse_instant("start", &start)?;
            let end = parse_instant("end", &end)?;
            let key = CacheKey::for_request(&symbol, start, end, granularity, multiplier);
            let removed = cache.remove(&key);
            print_json(&serde_json::json!({ "key": key.as_str(), "removed": removed }))
        }
        CacheAction::ClearExpired => {
            let removed = cache.clear_expired()?;
            print_json(&serde_json::json!({ "removed": removed }))
        }
        CacheAction::ClearAll => {
            let removed = cache.clear_all()?;
            print_json(&serde_json::json!({ "removed": removed }))
        }
    }
}
