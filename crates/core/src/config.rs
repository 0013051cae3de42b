//! Configuration types
//!
//! Layering: built-in defaults, then an optional TOML file
//! (`currency.toml`, or the path in `CURRENCY_CONFIG`), then environment
//! variables prefixed `CURRENCY__` with `__` as the section separator,
//! e.g. `CURRENCY__SERVER__PORT=9000`.

use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

use crate::{ConfigLoadError, CurrencyCode};

pub const DEFAULT_CONFIG_FILE: &str = "currency.toml";
pub const CONFIG_PATH_ENV: &str = "CURRENCY_CONFIG";
pub const ENV_PREFIX: &str = "CURRENCY";

/// gRPC listener configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub keep_alive_interval_secs: u64,
    pub keep_alive_timeout_secs: u64,
    pub concurrency_limit_per_connection: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 9092,
            keep_alive_interval_secs: 60,
            keep_alive_timeout_secs: 20,
            concurrency_limit_per_connection: 256,
        }
    }
}

/// Where the initial rate snapshot comes from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    /// ECB daily reference rates
    Ecb,
    /// `RatesConfig::static_rates`
    Static,
}

/// Rate table, fluctuation and broadcast configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RatesConfig {
    pub base_currency: CurrencyCode,
    pub fluctuation_interval_ms: u64,
    /// Upper bound of a single tick's relative change
    pub max_change: f64,
    pub send_timeout_ms: u64,
    /// Outbound buffer per subscription stream
    pub stream_buffer: usize,
    pub source: SourceKind,
    pub ecb_url: String,
    pub static_rates: BTreeMap<String, f64>,
}

impl RatesConfig {
    pub fn fluctuation_interval(&self) -> Duration {
        Duration::from_millis(self.fluctuation_interval_ms)
    }

    pub fn send_timeout(&self) -> Duration {
        Duration::from_millis(self.send_timeout_ms)
    }
}

impl Default for RatesConfig {
    fn default() -> Self {
        Self {
            base_currency: CurrencyCode::EUR,
            fluctuation_interval_ms: 5_000,
            max_change: 0.10,
            send_timeout_ms: 1_000,
            stream_buffer: 64,
            source: SourceKind::Ecb,
            ecb_url: "https://www.ecb.europa.eu/stats/eurofxref/eurofxref-daily.xml".to_string(),
            static_rates: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

/// Complete service configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServiceConfig {
    pub server: ServerConfig,
    pub rates: RatesConfig,
    pub log_format: LogFormat,
}

impl ServiceConfig {
    /// Load defaults, the config file and `CURRENCY__*` environment overrides
    pub fn load() -> Result<Self, ConfigLoadError> {
        let path = std::env::var(CONFIG_PATH_ENV).unwrap_or_else(|_| DEFAULT_CONFIG_FILE.to_string());
        Self::load_from(&path)
    }

    pub fn load_from(path: &str) -> Result<Self, ConfigLoadError> {
        Self::load_layers(path, ENV_PREFIX)
    }

    fn load_layers(path: &str, env_prefix: &str) -> Result<Self, ConfigLoadError> {
        let config = Config::builder()
            .add_source(Config::try_from(&ServiceConfig::default())?)
            .add_source(File::with_name(path).required(false))
            .add_source(
                Environment::with_prefix(env_prefix)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let loaded: ServiceConfig = config.try_deserialize()?;
        loaded.validate()?;
        Ok(loaded)
    }

    pub fn validate(&self) -> Result<(), ConfigLoadError> {
        if self.rates.fluctuation_interval_ms == 0 {
            return Err(ConfigLoadError::Invalid(
                "rates.fluctuation_interval_ms must be greater than zero".to_string(),
            ));
        }
        if !(self.rates.max_change > 0.0 && self.rates.max_change < 1.0) {
            return Err(ConfigLoadError::Invalid(format!(
                "rates.max_change must be in (0, 1), got {}",
                self.rates.max_change
            )));
        }
        if self.rates.stream_buffer == 0 {
            return Err(ConfigLoadError::Invalid(
                "rates.stream_buffer must be greater than zero".to_string(),
            ));
        }
        if self.rates.source == SourceKind::Static && self.rates.static_rates.is_empty() {
            return Err(ConfigLoadError::Invalid(
                "rates.static_rates must not be empty when rates.source = \"static\"".to_string(),
            ));
        }
        Ok(())
    }
}
