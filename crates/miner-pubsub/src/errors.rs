//! Event-bus client error types.
//!
//! Errors fall into the classes the client treats differently:
//!
//! - transport failures: reconnect with backoff
//! - protocol failures ([`DecodeError`]): surfaced to listeners, link stays up
//! - authentication failures: fatal for the link, no automatic retry
//! - request failures ([`RequestError`]): reported only to the waiting caller

use thiserror::Error;

/// Errors from the event-bus client.
#[derive(Debug, Error)]
pub enum PubSubError {
    /// Opening the socket failed.
    #[error("failed to connect to {url}: {reason}")]
    Connect {
        /// The URI we tried.
        url: String,
        /// Why it failed.
        reason: String,
    },

    /// The link dropped or a socket read/write failed.
    #[error("transport error: {0}")]
    Transport(String),

    /// An inbound frame could not be decoded.
    #[error(transparent)]
    Decode(#[from] DecodeError),

    /// The server rejected our credentials.
    #[error("authentication failed: {reason}")]
    AuthFailed {
        /// Error string sent by the server.
        reason: String,
    },

    /// A correlated request failed.
    #[error(transparent)]
    Request(RequestError),

    /// The connection already holds the maximum number of topics.
    #[error("topic limit of {limit} reached")]
    TopicLimit {
        /// Configured per-connection cap.
        limit: usize,
    },

    /// A blocking wait exceeded its bound.
    #[error("timed out after {timeout_ms}ms: {context}")]
    Timeout {
        /// How long we waited.
        timeout_ms: u64,
        /// What we were waiting for.
        context: String,
    },

    /// The client was closed and will not reconnect on its own.
    #[error("client is closed")]
    Closed,
}

impl From<RequestError> for PubSubError {
    fn from(err: RequestError) -> Self {
        match err {
            RequestError::AuthFailed { reason, .. } => Self::AuthFailed { reason },
            other => Self::Request(other),
        }
    }
}

impl PubSubError {
    /// Whether this error permanently halts automatic reconnection.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::AuthFailed { .. } | Self::Closed)
    }
}

/// Failures reported to the caller awaiting a correlated reply.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum RequestError {
    /// No reply arrived within the request timeout.
    #[error("request {nonce} timed out after {timeout_ms}ms")]
    Timeout {
        /// Nonce of the abandoned request.
        nonce: String,
        /// Timeout that expired.
        timeout_ms: u64,
    },

    /// The link dropped while the reply was outstanding.
    #[error("connection lost before a reply arrived")]
    ConnectionLost,

    /// The server answered with a non-empty error.
    #[error("request {nonce} rejected: {reason}")]
    Rejected {
        /// Nonce of the rejected request.
        nonce: String,
        /// Error string sent by the server.
        reason: String,
    },

    /// The server refused the request's credentials.
    #[error("request {nonce} refused: {reason}")]
    AuthFailed {
        /// Nonce of the refused request.
        nonce: String,
        /// Error string sent by the server.
        reason: String,
    },

    /// Not connected and no reconnect completed in time.
    #[error("not connected")]
    NotConnected,

    /// The client was closed.
    #[error("client is closed")]
    Closed,

    /// Another request with the same nonce is already outstanding.
    #[error("nonce {0} is already in flight")]
    DuplicateNonce(String),
}

/// Malformed inbound frames.
#[derive(Debug, Error)]
pub enum DecodeError {
    /// The frame is not valid JSON.
    #[error("frame is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),

    /// The frame is JSON but not an object with a string `type`.
    #[error("frame has no type discriminator")]
    MissingType,

    /// A known frame type lacks a required field.
    #[error("{kind} frame is missing `{field}`")]
    MissingField {
        /// Frame type discriminator.
        kind: String,
        /// Dotted path of the missing field.
        field: &'static str,
    },
}
