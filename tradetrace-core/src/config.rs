//! Market data configuration.
//!
//! Stored as a TOML file; every section has defaults so an empty file is a
//! valid configuration. The API key comes from `POLYGON_API_KEY` (a `.env`
//! file is honoured) and falls back to `[api] api_key`.

use crate::domain::Granularity;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

/// Environment variable holding the upstream API key.
pub const API_KEY_ENV: &str = "POLYGON_API_KEY";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("read config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("parse config TOML: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Upstream subscription level. Selects the call ceiling and which
/// granularities the client may request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlanTier {
    Free,
    Starter,
    Developer,
    Advanced,
}

impl PlanTier {
    pub fn calls_per_minute(&self) -> u32 {
        match self {
            PlanTier::Free => 5,
            PlanTier::Starter => 100,
            PlanTier::Developer | PlanTier::Advanced => 1000,
        }
    }

    pub fn allows(&self, granularity: Granularity) -> bool {
        match granularity {
            Granularity::Minute => true,
            Granularity::Second => !matches!(self, PlanTier::Free),
            Granularity::Tick => matches!(self, PlanTier::Developer | PlanTier::Advanced),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PlanTier::Free => "free",
            PlanTier::Starter => "starter",
            PlanTier::Developer => "developer",
            PlanTier::Advanced => "advanced",
        }
    }
}

impl fmt::Display for PlanTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PlanTier {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "free" => Ok(PlanTier::Free),
            "starter" => Ok(PlanTier::Starter),
            "developer" => Ok(PlanTier::Developer),
            "advanced" => Ok(PlanTier::Advanced),
            other => Err(format!("unknown plan tier '{other}'")),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ApiConfig {
    pub base_url: String,
    pub plan_tier: PlanTier,
    /// Overrides the tier's ceiling when set.
    pub calls_per_minute: Option<u32>,
    pub timeout_secs: u64,
    pub max_rate_limit_wait_secs: u64,
    pub page_limit: u32,
    pub max_pages: u32,
    pub api_key: Option<String>,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.polygon.io".into(),
            plan_tier: PlanTier::Free,
            calls_per_minute: None,
            timeout_secs: 30,
            max_rate_limit_wait_secs: 120,
            page_limit: 50_000,
            max_pages: 20,
            api_key: None,
        }
    }
}

impl ApiConfig {
    pub fn effective_calls_per_minute(&self) -> u32 {
        self.calls_per_minute
            .unwrap_or_else(|| self.plan_tier.calls_per_minute())
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn max_rate_limit_wait(&self) -> Duration {
        Duration::from_secs(self.max_rate_limit_wait_secs)
    }
}

/// Retry policy for transient failures.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RetryConfig {
    /// Total attempts per call, capped at [`MAX_RETRY_ATTEMPTS`].
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub multiplier: f64,
}

pub const MAX_RETRY_ATTEMPTS: u32 = 10;

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 1000,
            multiplier: 2.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CacheConfig {
    pub enabled: bool,
    pub dir: PathBuf,
    pub minute_ttl_hours: u64,
    pub second_ttl_hours: u64,
    pub tick_ttl_hours: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            dir: PathBuf::from("data/cache"),
            minute_ttl_hours: 24,
            second_ttl_hours: 24,
            tick_ttl_hours: 24,
        }
    }
}

impl CacheConfig {
    pub fn ttl_for(&self, granularity: Granularity) -> Duration {
        let hours = match granularity {
            Granularity::Minute => self.minute_ttl_hours,
            Granularity::Second => self.second_ttl_hours,
            Granularity::Tick => self.tick_ttl_hours,
        };
        Duration::from_secs(hours.saturating_mul(3600))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct FetchConfig {
    pub default_granularity: Granularity,
    pub pre_buffer_minutes: u32,
    pub post_buffer_minutes: u32,
    /// Half-width of the window searched around a price-lookup target.
    pub price_window_seconds: u32,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            default_granularity: Granularity::Minute,
            pre_buffer_minutes: 1,
            post_buffer_minutes: 1,
            price_window_seconds: 5,
        }
    }
}

impl FetchConfig {
    pub fn pre_buffer(&self) -> chrono::Duration {
        chrono::Duration::minutes(i64::from(self.pre_buffer_minutes))
    }

    pub fn post_buffer(&self) -> chrono::Duration {
        chrono::Duration::minutes(i64::from(self.post_buffer_minutes))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ValidationConfig {
    /// Coverage (actual / expected bars) below this produces a warning.
    pub coverage_threshold: f64,
    /// Volume below this (but above zero) counts as low.
    pub low_volume_threshold: u64,
    /// Share of low-volume bars above which a warning is produced.
    pub low_volume_share: f64,
    /// max(high) / min(low) above this is flagged as an extreme move.
    pub extreme_move_ratio: f64,
}

impl Default for ValidationConfig {
    fn default() -> Self {
        Self {
            coverage_threshold: 0.8,
            low_volume_threshold: 100,
            low_volume_share: 0.3,
            extreme_move_ratio: 2.0,
        }
    }
}

/// Complete market data configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct MarketDataConfig {
    pub api: ApiConfig,
    pub retry: RetryConfig,
    pub cache: CacheConfig,
    pub fetch: FetchConfig,
    pub validation: ValidationConfig,
}

impl MarketDataConfig {
    /// Load and validate a config from a TOML file.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&content)
    }

    /// Parse and validate a config from a TOML string.
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(|e| ConfigError::Invalid(format!("serialize: {e}")))
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut problems = Vec::new();

        if self.api.effective_calls_per_minute() == 0 {
            problems.push("api.calls_per_minute must be positive".to_string());
        }
        if self.api.max_pages == 0 {
            problems.push("api.max_pages must be positive".to_string());
        }
        let attempts = self.retry.max_attempts;
        if !(1..=MAX_RETRY_ATTEMPTS).contains(&attempts) {
            problems.push(format!(
                "retry.max_attempts must be in 1..={MAX_RETRY_ATTEMPTS}, got {attempts}"
            ));
        }
        let multiplier = self.retry.multiplier;
        if !(multiplier.is_finite() && multiplier >= 1.0) {
            problems.push(format!(
                "retry.multiplier must be a finite number >= 1.0, got {multiplier}"
            ));
        }
        let threshold = self.validation.coverage_threshold;
        if !(threshold > 0.0 && threshold <= 1.0) {
            problems.push(format!(
                "validation.coverage_threshold must be in (0, 1], got {threshold}"
            ));
        }
        for (name, hours) in [
            ("minute", self.cache.minute_ttl_hours),
            ("second", self.cache.second_ttl_hours),
            ("tick", self.cache.tick_ttl_hours),
        ] {
            if hours == 0 {
                problems.push(format!("cache.{name}_ttl_hours must be positive"));
            }
        }
        let default = self.fetch.default_granularity;
        if !self.api.plan_tier.allows(default) {
            problems.push(format!(
                "fetch.default_granularity '{default}' is not available on the {} plan",
                self.api.plan_tier
            ));
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Invalid(problems.join("; ")))
        }
    }

    /// API key from the environment (after loading `.env`), else from the file.
    pub fn resolve_api_key(&self) -> Option<String> {
        dotenvy::dotenv().ok();
        std::env::var(API_KEY_ENV)
            .ok()
            .filter(|k| !k.trim().is_empty())
            .or_else(|| self.api.api_key.clone())
            .filter(|k| !k.trim().is_empty())
    }
}
