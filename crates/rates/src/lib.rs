//! Exchange rate table and subscription fan-out
//!
//! Features:
//! - Base-relative rate table with ratio lookups
//! - Simulated periodic rate drift
//! - Per-connection subscription registry
//! - Broadcast of recomputed rates after every drift tick
//! - Startup snapshot sources (static, ECB reference rates)

pub mod broadcaster;
pub mod engine;
pub mod fluctuator;
pub mod registry;
pub mod source;
pub mod table;

pub use broadcaster::{BroadcastReport, RateBroadcaster};
pub use engine::{EngineConfig, RateEngine};
pub use fluctuator::{FluctuatorConfig, RateFluctuator, RateTick};
pub use registry::{ConnectionClosed, ConnectionSnapshot, DisconnectReason, SubscriptionRegistry};
pub use source::{parse_ecb_xml, EcbRateSource, RateSource, StaticRateSource};
pub use table::{RateSnapshot, RateTable};
