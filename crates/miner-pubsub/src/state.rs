//! Connection lifecycle states.

use std::fmt;

/// Where a client is in its connection lifecycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    /// No socket; a reconnect may be scheduled.
    Disconnected,
    /// Opening the socket.
    Connecting,
    /// Socket open, topics re-sent.
    Connected,
    /// Close frame queued, waiting for the socket to wind down.
    Closing,
    /// Terminal until `connect()` is called again.
    Closed,
}

impl ConnectionState {
    /// Stable lowercase name for logs.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Closing => "closing",
            Self::Closed => "closed",
        }
    }

    /// Whether automatic reconnection is halted.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Closing | Self::Closed)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_states() {
        assert!(ConnectionState::Closed.is_terminal());
        assert!(ConnectionState::Closing.is_terminal());
        assert!(!ConnectionState::Disconnected.is_terminal());
        assert!(!ConnectionState::Connected.is_terminal());
    }

    #[test]
    fn display() {
        assert_eq!(ConnectionState::Connecting.to_string(), "connecting");
    }
}
