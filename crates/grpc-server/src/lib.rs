//! gRPC exchange rate service
//!
//! Serves one-shot rate queries and bidirectional rate subscriptions on top
//! of the `currency-rates` engine, plus the client used by rate consumers.

pub mod client;
pub mod conversions;
pub mod server;
pub mod service;

// Re-export proto types
pub mod proto {
    tonic::include_proto!("currency");
}

pub use client::{RateClient, Subscription};
pub use server::{GrpcServer, GrpcServerBuilder, GrpcServerConfig};
pub use service::{CurrencyService, OpenConnection, StreamFailure, SubscribeOutcome};
