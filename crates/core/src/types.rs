//! Core type definitions

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::RateError;

/// ISO-4217 style currency code (three ASCII letters, upper-case)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct CurrencyCode([u8; 3]);

impl CurrencyCode {
    pub const EUR: CurrencyCode = CurrencyCode(*b"EUR");
    pub const USD: CurrencyCode = CurrencyCode(*b"USD");
    pub const GBP: CurrencyCode = CurrencyCode(*b"GBP");
    pub const JPY: CurrencyCode = CurrencyCode(*b"JPY");

    pub fn new(code: &str) -> Result<Self, RateError> {
        let bytes = code.trim().as_bytes();
        if bytes.len() != 3 || !bytes.iter().all(u8::is_ascii_alphabetic) {
            return Err(RateError::InvalidCurrencyCode(code.to_string()));
        }

        let mut upper = [0u8; 3];
        for (dst, src) in upper.iter_mut().zip(bytes) {
            *dst = src.to_ascii_uppercase();
        }
        Ok(Self(upper))
    }

    pub fn as_str(&self) -> &str {
        // Only ever built from validated ASCII letters
        std::str::from_utf8(&self.0).unwrap_or("???")
    }
}

impl fmt::Display for CurrencyCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CurrencyCode {
    type Err = RateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl TryFrom<String> for CurrencyCode {
    type Error = RateError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(&value)
    }
}

impl TryFrom<&str> for CurrencyCode {
    type Error = RateError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<CurrencyCode> for String {
    fn from(code: CurrencyCode) -> Self {
        code.as_str().to_string()
    }
}

/// Ordered (base, destination) pair
///
/// `base != destination` is only enforced by direct rate queries, a pair
/// with equal sides is a valid value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CurrencyPair {
    pub base: CurrencyCode,
    pub destination: CurrencyCode,
}

impl CurrencyPair {
    pub fn new(base: CurrencyCode, destination: CurrencyCode) -> Self {
        Self { base, destination }
    }

    pub fn is_identity(&self) -> bool {
        self.base == self.destination
    }
}

impl fmt::Display for CurrencyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.base, self.destination)
    }
}

/// Rate for a pair: destination units per one base unit
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RateQuote {
    pub pair: CurrencyPair,
    pub rate: f64,
}

impl RateQuote {
    pub fn new(pair: CurrencyPair, rate: f64) -> Self {
        Self { pair, rate }
    }
}

/// Status code carried by an in-band stream error
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StreamErrorCode {
    InvalidArgument,
    NotFound,
}

/// Connection-scoped error reported over an open subscription stream.
/// Receiving one never closes the stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubscriptionError {
    pub code: StreamErrorCode,
    pub message: String,
    /// The offending request, when it could be decoded
    pub pair: Option<CurrencyPair>,
}

impl SubscriptionError {
    pub fn already_subscribed(pair: CurrencyPair) -> Self {
        Self {
            code: StreamErrorCode::InvalidArgument,
            message: "Subscription already active for rate".to_string(),
            pair: Some(pair),
        }
    }

    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self {
            code: StreamErrorCode::InvalidArgument,
            message: message.into(),
            pair: None,
        }
    }
}

/// Server to client message on a subscription stream
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum StreamMessage {
    Rate(RateQuote),
    Error(SubscriptionError),
}

impl StreamMessage {
    pub fn pair(&self) -> Option<CurrencyPair> {
        match self {
            StreamMessage::Rate(quote) => Some(quote.pair),
            StreamMessage::Error(err) => err.pair,
        }
    }
}

/// Process-unique handle for a subscription stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    pub fn generate() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

impl From<u64> for ConnectionId {
    fn from(id: u64) -> Self {
        Self(id)
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}
