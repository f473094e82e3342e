//! HTTP seam under the API client.
//!
//! The client speaks to a `Transport` so tests can script responses without
//! a network. `HttpTransport` is the production implementation over a blocking
//! `reqwest` client with an overall per-call timeout.

use super::error::MarketDataError;
use std::time::Duration;
use thiserror::Error;

/// Status, body and `Retry-After` header of a completed request.
#[derive(Debug, Clone, PartialEq)]
pub struct HttpResponse {
    pub status: u16,
    pub body: String,
    pub retry_after: Option<u64>,
}

impl HttpResponse {
    pub fn ok(body: impl Into<String>) -> Self {
        Self {
            status: 200,
            body: body.into(),
            retry_after: None,
        }
    }

    pub fn status(status: u16, body: impl Into<String>) -> Self {
        Self {
            status,
            body: body.into(),
            retry_after: None,
        }
    }
}

/// A request that produced no HTTP response.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum TransportError {
    #[error("timed out: {0}")]
    Timeout(String),

    #[error("connection failed: {0}")]
    Connect(String),

    /// Response started but the body could not be read.
    #[error("reading response body: {0}")]
    Body(String),

    /// The request could not be built or sent at all.
    #[error("request error: {0}")]
    Request(String),
}

impl TransportError {
    pub fn is_transient(&self) -> bool {
        !matches!(self, TransportError::Request(_))
    }
}

pub trait Transport: Send + Sync {
    fn get(&self, url: &str, api_key: &str) -> Result<HttpResponse, TransportError>;
}

pub struct HttpTransport {
    client: reqwest::blocking::Client,
}

impl HttpTransport {
    pub fn new(timeout: Duration) -> Result<Self, MarketDataError> {
        let client = reqwest::blocking::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("tradetrace/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| MarketDataError::Config(format!("failed to build HTTP client: {e}")))?;
        Ok(Self { client })
    }
}

fn classify(e: reqwest::Error) -> TransportError {
    if e.is_timeout() {
        TransportError::Timeout(e.to_string())
    } else if e.is_connect() {
        TransportError::Connect(e.to_string())
    } else if e.is_body() || e.is_decode() {
        TransportError::Body(e.to_string())
    } else {
        TransportError::Request(e.to_string())
    }
}

impl Transport for HttpTransport {
    fn get(&self, url: &str, api_key: &str) -> Result<HttpResponse, TransportError> {
        let resp = self
            .client
            .get(url)
            .bearer_auth(api_key)
            .send()
            .map_err(classify)?;

        let status = resp.status().as_u16();
        let retry_after = resp
            .headers()
            .get(reqwest::header::RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<u64>().ok());
        let body = resp.text().map_err(classify)?;

        Ok(HttpResponse {
            status,
            body,
            retry_after,
        })
    }
}
