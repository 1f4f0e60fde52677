//! # miner-core
//!
//! Foundation types and utilities shared by the points miner crates.
//!
//! - **Nonces**: [`ids::Nonce`] newtype for correlating commands with replies
//! - **Backoff**: [`backoff`] exponential reconnect delay with jitter
//! - **Logging**: [`logging::init_subscriber`] for the `tracing` subscriber

#![deny(unsafe_code)]

pub mod backoff;
pub mod ids;
pub mod logging;

pub use backoff::{BackoffConfig, backoff_delay, next_backoff_delay};
pub use ids::Nonce;
