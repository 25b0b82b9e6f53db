pub mod watchlist;

pub use watchlist::{load_watchlist, parse_watchlist, WatchlistError};

use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::execution::{RateLimiter, RetryPolicy};
use crate::session::SessionSchedule;

/// Process configuration: optional YAML file, then `EQUITYBOT__*` env vars
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    // Credentials
    #[serde(default)]
    pub app_key: String,
    #[serde(default)]
    pub app_secret: String,
    #[serde(default)]
    pub account_no: String,
    #[serde(default = "default_product_code")]
    pub account_product_code: String,
    #[serde(default = "default_url_base")]
    pub url_base: String,
    pub discord_webhook_url: Option<String>,

    // Files
    #[serde(default = "default_watchlist_path")]
    pub watchlist_path: PathBuf,
    #[serde(default = "default_token_cache_path")]
    pub token_cache_path: PathBuf,

    // Request pacing
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,
    pub requests_per_second: Option<u32>,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_batch_pause_ms")]
    pub batch_pause_ms: u64,
    #[serde(default = "default_cycle_interval_ms")]
    pub cycle_interval_ms: u64,
    #[serde(default = "default_retry_attempts")]
    pub fetch_retry_attempts: u32,
    #[serde(default = "default_fetch_retry_delay_ms")]
    pub fetch_retry_delay_ms: u64,
    #[serde(default = "default_retry_attempts")]
    pub balance_retry_attempts: u32,
    #[serde(default = "default_balance_retry_delay_ms")]
    pub balance_retry_delay_ms: u64,
    #[serde(default = "default_http_timeout_secs")]
    pub http_timeout_secs: u64,

    // Trading
    #[serde(default = "default_min_credit_buying_power")]
    pub min_credit_buying_power: f64,
    #[serde(default)]
    pub session: SessionSchedule,
    /// Credit buying power the paper broker reports
    #[serde(default)]
    pub paper_credit_buying_power: f64,
}

fn default_product_code() -> String {
    "01".to_string()
}
fn default_url_base() -> String {
    "https://openapi.koreainvestment.com:9443".to_string()
}
fn default_watchlist_path() -> PathBuf {
    PathBuf::from("watchlist.txt")
}
fn default_token_cache_path() -> PathBuf {
    PathBuf::from(".kis_token.json")
}
fn default_max_concurrency() -> usize {
    20
}
fn default_batch_size() -> usize {
    10
}
fn default_batch_pause_ms() -> u64 {
    50
}
fn default_cycle_interval_ms() -> u64 {
    1000
}
fn default_retry_attempts() -> u32 {
    10
}
fn default_fetch_retry_delay_ms() -> u64 {
    2000
}
fn default_balance_retry_delay_ms() -> u64 {
    1000
}
fn default_http_timeout_secs() -> u64 {
    10
}
fn default_min_credit_buying_power() -> f64 {
    30_000_000.0
}

impl AppConfig {
    /// Layer `path` (when given) under the environment
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut builder = Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(File::from(path).required(true));
        } else {
            builder = builder.add_source(File::with_name("config").required(false));
        }
        builder = builder.add_source(
            Environment::with_prefix("EQUITYBOT")
                .prefix_separator("__")
                .separator("__"),
        );

        let settings: AppConfig = builder.build()?.try_deserialize()?;
        settings.validate()?;
        Ok(settings)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if !self.session.is_valid() {
            return Err(ConfigError::Message(format!(
                "session times out of order: start {} time_cut {} exit {}, closing auction sell {} buy {} end {}",
                self.session.start,
                self.session.time_cut,
                self.session.exit,
                self.session.closing_sell,
                self.session.closing_buy,
                self.session.closing_end
            )));
        }
        if self.batch_size == 0 {
            return Err(ConfigError::Message("batch_size must be positive".to_string()));
        }
        Ok(())
    }

    /// Credentials are only needed when talking to the brokerage
    pub fn require_credentials(&self) -> Result<(), ConfigError> {
        for (key, value) in [
            ("app_key", &self.app_key),
            ("app_secret", &self.app_secret),
            ("account_no", &self.account_no),
        ] {
            if value.trim().is_empty() {
                return Err(ConfigError::NotFound(key.to_string()));
            }
        }
        Ok(())
    }

    pub fn limiter(&self) -> RateLimiter {
        let limiter = RateLimiter::new(self.max_concurrency);
        match self.requests_per_second {
            Some(rps) => limiter.with_rate(rps),
            None => limiter,
        }
    }

    pub fn fetch_retry(&self) -> RetryPolicy {
        RetryPolicy::fixed(
            self.fetch_retry_attempts,
            Duration::from_millis(self.fetch_retry_delay_ms),
        )
    }

    pub fn balance_retry(&self) -> RetryPolicy {
        RetryPolicy::fixed(
            self.balance_retry_attempts,
            Duration::from_millis(self.balance_retry_delay_ms),
        )
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_secs)
    }
}
