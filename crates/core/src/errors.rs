//! Error types

use thiserror::Error;

use crate::{ConnectionId, CurrencyCode, CurrencyPair};

/// Rate table and subscription errors
#[derive(Debug, Clone, PartialEq, Error)]
pub enum RateError {
    #[error("Rate not found for currency {0}")]
    UnknownCurrency(CurrencyCode),

    #[error("Base rate {base} can not be equal to destination rate {destination}")]
    InvalidArgument {
        base: CurrencyCode,
        destination: CurrencyCode,
    },

    #[error("Connection {0} is already registered")]
    DuplicateConnection(ConnectionId),

    #[error("Connection {0} is not registered")]
    UnknownConnection(ConnectionId),

    #[error("Subscription already active for rate {0}")]
    AlreadySubscribed(CurrencyPair),

    #[error("Base currency {0} can not be modified")]
    BaseCurrencyImmutable(CurrencyCode),

    #[error("Invalid rate {rate} for currency {code}")]
    InvalidRate { code: CurrencyCode, rate: f64 },

    #[error("Invalid currency code: {0:?}")]
    InvalidCurrencyCode(String),
}

/// Initial rate snapshot errors
#[derive(Debug, Error)]
pub enum SourceError {
    #[error("HTTP request failed: {0}")]
    Http(String),

    #[error("Expected status code 200 got {0}")]
    Status(u16),

    #[error("Unable to parse rate data: {0}")]
    Parse(String),

    #[error(transparent)]
    InvalidRate(#[from] RateError),

    #[error("Rate source returned no rates")]
    Empty,
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigLoadError {
    #[error(transparent)]
    Source(#[from] config::ConfigError),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Result type alias
pub type RateResult<T> = Result<T, RateError>;
pub type SourceResult<T> = Result<T, SourceError>;
