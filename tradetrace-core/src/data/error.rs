//! Structured error types for market data operations.
//!
//! Only client failures reach callers. Cache failures are a separate type
//! that the fetcher logs and converts into a miss.

use crate::config::PlanTier;
use crate::domain::Granularity;
use std::time::Duration;
use thiserror::Error;

/// How the client responds to a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryClass {
    /// Back off and try again, up to the policy's attempt limit.
    Retry,
    /// Fail immediately.
    Never,
}

#[derive(Debug, Error)]
pub enum MarketDataError {
    #[error("authentication failed: {0}")]
    Authentication(String),

    #[error("{resource} not available on the {tier} plan")]
    NotEntitled { resource: String, tier: PlanTier },

    #[error("rate limit ceiling reached: next slot in {wait:?}, exceeds maximum wait {max_wait:?}")]
    RateLimitExceeded { wait: Duration, max_wait: Duration },

    #[error("throttled by provider after {attempts} attempts (retry after {retry_after_secs}s)")]
    Throttled { attempts: u32, retry_after_secs: u64 },

    #[error("transient network failure after {attempts} attempts: {message}")]
    Transient { attempts: u32, message: String },

    #[error("symbol not found: {0}")]
    SymbolNotFound(String),

    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("response format changed: {0}")]
    ResponseFormat(String),

    #[error("invalid window: {0}")]
    InvalidWindow(String),

    #[error("configuration error: {0}")]
    Config(String),
}

impl MarketDataError {
    pub fn retry_class(&self) -> RetryClass {
        match self {
            MarketDataError::Throttled { .. } | MarketDataError::Transient { .. } => {
                RetryClass::Retry
            }
            _ => RetryClass::Never,
        }
    }

    pub fn not_entitled(granularity: Granularity, tier: PlanTier) -> Self {
        let resource = match granularity {
            Granularity::Tick => "tick data".to_string(),
            g => format!("{g} bars"),
        };
        MarketDataError::NotEntitled { resource, tier }
    }
}

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("cache I/O on {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },

    #[error("cache serialization: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("corrupt cache entry {key}: {reason}")]
    Corrupt { key: String, reason: String },
}

impl CacheError {
    pub(crate) fn io(path: &std::path::Path, source: std::io::Error) -> Self {
        CacheError::Io {
            path: path.display().to_string(),
            source,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_network_failures_retry() {
        let transient = MarketDataError::Transient {
            attempts: 1,
            message: "timeout".into(),
        };
        assert_eq!(transient.retry_class(), RetryClass::Retry);

        let throttled = MarketDataError::Throttled {
            attempts: 1,
            retry_after_secs: 60,
        };
        assert_eq!(throttled.retry_class(), RetryClass::Retry);

        assert_eq!(
            MarketDataError::Authentication("bad key".into()).retry_class(),
            RetryClass::Never
        );
        assert_eq!(
            MarketDataError::SymbolNotFound("ZZZZ".into()).retry_class(),
            RetryClass::Never
        );
        assert_eq!(
            MarketDataError::not_entitled(Granularity::Tick, PlanTier::Starter).retry_class(),
            RetryClass::Never
        );
    }

    #[test]
    fn entitlement_message_names_resource_and_tier() {
        let err = MarketDataError::not_entitled(Granularity::Second, PlanTier::Free);
        assert_eq!(err.to_string(), "second bars not available on the free plan");
    }
}
