//! # miner-pubsub
//!
//! Client for the platform's real-time event bus.
//!
//! - **Codec**: [`codec`] JSON text frames, typed inbound envelope
//! - **Topics**: [`topic::TopicRegistry`] survives reconnects
//! - **Keepalive**: [`keepalive::run_keepalive`] pings and liveness timeout
//! - **Correlation**: [`pending::PendingRequests`] nonce → waiting caller
//! - **Client**: [`client::PubSubClient`] connection state machine
//! - **Dispatch**: [`dispatch::PubSubListener`] fan-out off the read path
//! - **Pool**: [`pool::PubSubPool`] topics spread across connections

#![deny(unsafe_code)]

pub mod client;
pub mod codec;
pub mod config;
pub mod dispatch;
pub mod errors;
pub mod keepalive;
pub mod pending;
pub mod pool;
pub mod state;
pub mod topic;

pub use client::{ListenerId, PubSubClient};
pub use codec::{InboundFrame, MessageFrame, OutboundCommand, ResponseFrame};
pub use config::ClientConfig;
pub use dispatch::{CloseInfo, PubSubListener};
pub use errors::{DecodeError, PubSubError, RequestError};
pub use pool::PubSubPool;
pub use state::ConnectionState;
pub use topic::{Topic, TopicName};
