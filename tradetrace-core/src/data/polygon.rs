//! Polygon.io REST client.
//!
//! Fetches aggregate bars, individual trades, market status and ticker details.
//! Every outbound request, retries and pagination pages included, first takes a
//! slot from the shared rate limiter. Entitlement to second bars and ticks is
//! checked against the plan tier before any call is made.

use super::clock::{Clock, SystemClock};
use super::error::MarketDataError;
use super::rate_limit::{RateLimitInfo, RateLimiter};
use super::retry::RetryPolicy;
use super::transport::{HttpResponse, HttpTransport, Transport};
use crate::config::{ApiConfig, MarketDataConfig, PlanTier, RetryConfig};
use crate::domain::session::is_weekend;
use crate::domain::Granularity;
use chrono::{DateTime, NaiveDate, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, warn};
use urlencoding::encode;

/// One aggregate bar as returned by `/v2/aggs`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct RawAggregate {
    /// Bar start, Unix milliseconds.
    #[serde(rename = "t")]
    pub timestamp_ms: i64,
    #[serde(rename = "o")]
    pub open: f64,
    #[serde(rename = "h")]
    pub high: f64,
    #[serde(rename = "l")]
    pub low: f64,
    #[serde(rename = "c")]
    pub close: f64,
    /// Fractional for some instruments.
    #[serde(rename = "v", default)]
    pub volume: f64,
    #[serde(rename = "vw", default)]
    pub vwap: Option<f64>,
    #[serde(rename = "n", default)]
    pub transactions: Option<u64>,
}

/// One trade as returned by `/v3/trades`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct RawTrade {
    /// SIP timestamp, Unix nanoseconds.
    pub sip_timestamp: i64,
    pub price: f64,
    #[serde(default)]
    pub size: f64,
    #[serde(default)]
    pub exchange: Option<i32>,
    #[serde(default)]
    pub conditions: Option<Vec<i32>>,
    #[serde(default)]
    pub sequence_number: Option<u64>,
}

/// Items gathered across `next_url` pages. `truncated` is set when the page
/// cap stopped pagination with more pages still on offer.
#[derive(Debug, Clone, PartialEq)]
pub struct Paged<T> {
    pub items: Vec<T>,
    pub truncated: bool,
}

impl<T> Paged<T> {
    pub fn complete(items: Vec<T>) -> Self {
        Self {
            items,
            truncated: false,
        }
    }
}

#[derive(Debug, Deserialize)]
struct Page<T> {
    #[serde(default = "Vec::new")]
    results: Vec<T>,
    #[serde(default)]
    next_url: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct NowResponse {
    market: String,
    #[serde(default)]
    server_time: Option<String>,
    #[serde(default)]
    exchanges: BTreeMap<String, String>,
}

#[derive(Debug, Deserialize)]
struct UpcomingEntry {
    exchange: String,
    name: String,
    date: NaiveDate,
    status: String,
}

#[derive(Debug, Deserialize)]
struct TickerDetailsResponse {
    results: Option<TickerDetails>,
}

/// Reference data for one ticker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TickerDetails {
    pub ticker: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub market: Option<String>,
    #[serde(default)]
    pub primary_exchange: Option<String>,
    #[serde(default = "default_active")]
    pub active: bool,
}

fn default_active() -> bool {
    true
}

/// Whether the exchanges trade on a given calendar date.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarketStatus {
    pub date: NaiveDate,
    pub open: bool,
    pub reason: Option<String>,
    /// Exchange name to status, for dates the holiday calendar mentions.
    pub exchanges: BTreeMap<String, String>,
}

/// Live status from `/v1/marketstatus/now`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LiveMarketStatus {
    /// `open`, `closed` or `extended-hours`.
    pub market: String,
    pub server_time: Option<String>,
    pub exchanges: BTreeMap<String, String>,
}

/// Rate-limited Polygon client. One instance is shared by every caller so all
/// of them draw from the same call budget.
pub struct RateLimitedClient {
    transport: Arc<dyn Transport>,
    clock: Arc<dyn Clock>,
    limiter: RateLimiter,
    retry: RetryPolicy,
    api_key: String,
    base_url: String,
    plan_tier: PlanTier,
    page_limit: u32,
    max_pages: u32,
}

impl std::fmt::Debug for RateLimitedClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimitedClient")
            .field("base_url", &self.base_url)
            .field("plan_tier", &self.plan_tier)
            .field("limiter", &self.limiter)
            .finish_non_exhaustive()
    }
}

impl RateLimitedClient {
    /// Production client: HTTP transport, system clock, key from the environment.
    pub fn from_config(config: &MarketDataConfig) -> Result<Self, MarketDataError> {
        let api_key = config.resolve_api_key().ok_or_else(|| {
            MarketDataError::Config(format!(
                "no API key: set {} or [api] api_key",
                crate::config::API_KEY_ENV
            ))
        })?;
        let transport = Arc::new(HttpTransport::new(config.api.timeout())?);
        Ok(Self::with_parts(
            &config.api,
            &config.retry,
            api_key,
            transport,
            Arc::new(SystemClock),
        ))
    }

    pub fn with_parts(
        api: &ApiConfig,
        retry: &RetryConfig,
        api_key: String,
        transport: Arc<dyn Transport>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let limiter = RateLimiter::new(
            api.effective_calls_per_minute(),
            api.max_rate_limit_wait(),
            clock.clone(),
        );
        Self {
            transport,
            clock,
            limiter,
            retry: RetryPolicy::from_config(retry),
            api_key,
            base_url: api.base_url.trim_end_matches('/').to_string(),
            plan_tier: api.plan_tier,
            page_limit: api.page_limit.max(1),
            max_pages: api.max_pages.max(1),
        }
    }

    pub fn plan_tier(&self) -> PlanTier {
        self.plan_tier
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub fn rate_limit_info(&self) -> RateLimitInfo {
        self.limiter.info(self.plan_tier)
    }

    fn ensure_entitled(&self, granularity: Granularity) -> Result<(), MarketDataError> {
        if self.plan_tier.allows(granularity) {
            Ok(())
        } else {
            Err(MarketDataError::not_entitled(granularity, self.plan_tier))
        }
    }

    /// One attempt: take a rate-limit slot, send, map the outcome.
    fn attempt(&self, url: &str, resource: &str, attempt: u32) -> Result<String, MarketDataError> {
        self.limiter.acquire()?;
        debug!(url, attempt, "GET");

        let resp = match self.transport.get(url, &self.api_key) {
            Ok(resp) => resp,
            Err(e) if e.is_transient() => {
                return Err(MarketDataError::Transient {
                    attempts: attempt,
                    message: e.to_string(),
                })
            }
            Err(e) => return Err(MarketDataError::BadRequest(e.to_string())),
        };

        map_status(resp, resource, self.plan_tier, attempt)
    }

    fn get_json<T: DeserializeOwned>(&self, url: &str, resource: &str) -> Result<T, MarketDataError> {
        let body = self
            .retry
            .run(self.clock.as_ref(), |attempt| self.attempt(url, resource, attempt))?;
        serde_json::from_str(&body).map_err(|e| {
            MarketDataError::ResponseFormat(format!("failed to parse response for {resource}: {e}"))
        })
    }

    /// Follow `next_url` links until exhausted or `max_pages` is reached.
    fn get_paginated<T: DeserializeOwned>(
        &self,
        first_url: String,
        resource: &str,
    ) -> Result<Paged<T>, MarketDataError> {
        let mut items = Vec::new();
        let mut next = Some(first_url);
        let mut pages = 0;

        while let Some(url) = next {
            let page: Page<T> = self.get_json(&url, resource)?;
            items.extend(page.results);
            pages += 1;
            next = page.next_url;
            if next.is_some() && pages >= self.max_pages {
                warn!(resource, pages, "pagination cap reached, result truncated");
                return Ok(Paged {
                    items,
                    truncated: true,
                });
            }
        }
        Ok(Paged::complete(items))
    }

    /// Verify the key is accepted and the API is reachable.
    pub fn test_connection(&self) -> bool {
        match self.market_status_now() {
            Ok(status) => {
                info!(market = %status.market, "connection ok");
                true
            }
            Err(e) => {
                warn!(error = %e, "connection check failed");
                false
            }
        }
    }

    pub fn market_status_now(&self) -> Result<LiveMarketStatus, MarketDataError> {
        let url = format!("{}/v1/marketstatus/now", self.base_url);
        let now: NowResponse = self.get_json(&url, "market status")?;
        Ok(LiveMarketStatus {
            market: now.market,
            server_time: now.server_time,
            exchanges: now.exchanges,
        })
    }

    /// Trading-day status for `date`.
    ///
    /// Weekends are answered locally. Weekdays consult the holiday calendar,
    /// which only lists upcoming dates: a past holiday reads as open and the
    /// subsequent fetch comes back empty.
    pub fn get_market_status(&self, date: NaiveDate) -> Result<MarketStatus, MarketDataError> {
        if is_weekend(date) {
            return Ok(MarketStatus {
                date,
                open: false,
                reason: Some("weekend".into()),
                exchanges: BTreeMap::new(),
            });
        }

        let url = format!("{}/v1/marketstatus/upcoming", self.base_url);
        let calendar: Vec<UpcomingEntry> = self.get_json(&url, "market holidays")?;
        Ok(status_from_calendar(date, &calendar))
    }

    /// Aggregate bars for `[start, end]` in `multiplier` x `granularity` units.
    pub fn fetch_aggregates(
        &self,
        symbol: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        granularity: Granularity,
        multiplier: u32,
    ) -> Result<Paged<RawAggregate>, MarketDataError> {
        if !granularity.is_bar() {
            return Err(MarketDataError::BadRequest(
                "tick data has no aggregates; fetch trades instead".into(),
            ));
        }
        self.ensure_entitled(granularity)?;

        let url = format!(
            "{}/v2/aggs/ticker/{}/range/{}/{}/{}/{}?adjusted=true&sort=asc&limit={}",
            self.base_url,
            encode(symbol),
            multiplier.max(1),
            granularity.as_str(),
            start.timestamp_millis(),
            end.timestamp_millis(),
            self.page_limit,
        );
        info!(symbol, %granularity, %start, %end, "fetching aggregates");
        self.get_paginated(url, symbol)
    }

    /// Trades with `start <= timestamp < end`.
    pub fn fetch_trades(
        &self,
        symbol: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Paged<RawTrade>, MarketDataError> {
        self.ensure_entitled(Granularity::Tick)?;

        let (Some(gte), Some(lt)) = (start.timestamp_nanos_opt(), end.timestamp_nanos_opt()) else {
            return Err(MarketDataError::InvalidWindow(format!(
                "{start}..{end} is outside the nanosecond timestamp range"
            )));
        };
        let url = format!(
            "{}/v3/trades/{}?timestamp.gte={}&timestamp.lt={}&order=asc&sort=timestamp&limit={}",
            self.base_url,
            encode(symbol),
            gte,
            lt,
            self.page_limit.min(50_000),
        );
        info!(symbol, %start, %end, "fetching trades");
        self.get_paginated(url, symbol)
    }

    /// `None` when the symbol is unknown.
    pub fn ticker_details(&self, symbol: &str) -> Result<Option<TickerDetails>, MarketDataError> {
        let url = format!("{}/v3/reference/tickers/{}", self.base_url, encode(symbol));
        match self.get_json::<TickerDetailsResponse>(&url, symbol) {
            Ok(resp) => Ok(resp.results),
            Err(MarketDataError::SymbolNotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }
}

fn error_message(resp: &HttpResponse) -> String {
    serde_json::from_str::<ErrorBody>(&resp.body)
        .ok()
        .and_then(|b| b.error.or(b.message))
        .unwrap_or_else(|| format!("HTTP {}", resp.status))
}

fn map_status(
    resp: HttpResponse,
    resource: &str,
    tier: PlanTier,
    attempt: u32,
) -> Result<String, MarketDataError> {
    match resp.status {
        200..=299 => Ok(resp.body),
        401 => Err(MarketDataError::Authentication(error_message(&resp))),
        403 => Err(MarketDataError::NotEntitled {
            resource: format!("{resource} ({})", error_message(&resp)),
            tier,
        }),
        404 => Err(MarketDataError::SymbolNotFound(resource.to_string())),
        429 => Err(MarketDataError::Throttled {
            attempts: attempt,
            retry_after_secs: resp.retry_after.unwrap_or(0),
        }),
        500..=599 => Err(MarketDataError::Transient {
            attempts: attempt,
            message: format!("HTTP {}: {}", resp.status, error_message(&resp)),
        }),
        _ => Err(MarketDataError::BadRequest(format!(
            "HTTP {}: {}",
            resp.status,
            error_message(&resp)
        ))),
    }
}

fn status_from_calendar(date: NaiveDate, calendar: &[UpcomingEntry]) -> MarketStatus {
    let entries: Vec<&UpcomingEntry> = calendar.iter().filter(|e| e.date == date).collect();
    let exchanges: BTreeMap<String, String> = entries
        .iter()
        .map(|e| (e.exchange.clone(), e.status.clone()))
        .collect();

    let closed = entries.iter().find(|e| e.status == "closed");
    let early = entries.iter().find(|e| e.status == "early-close");
    let (open, reason) = match (closed, early) {
        (Some(e), _) => (false, Some(e.name.clone())),
        (None, Some(e)) => (true, Some(format!("early close: {}", e.name))),
        (None, None) => (true, None),
    };

    MarketStatus {
        date,
        open,
        reason,
        exchanges,
    }
}
