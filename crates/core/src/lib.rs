//! Core types and utilities for the currency rate service
//!
//! This crate provides shared types used across all components:
//! - Currency codes and currency pairs
//! - Rate quotes and subscription stream messages
//! - Error taxonomy
//! - Service configuration

pub mod types;
pub mod config;
pub mod errors;

pub use types::*;
pub use config::*;
pub use errors::*;
