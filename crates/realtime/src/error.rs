use thiserror::Error;

use crate::types::SessionState;

/// Errors raised by the realtime protocol client and parser.
#[derive(Debug, Error)]
pub enum RealtimeError {
    /// The client has no open connection (never connected, closed, or failed).
    #[error("Realtime client is not connected")]
    NotConnected,

    /// The operation is not valid in the current session lifecycle state.
    #[error("Cannot {operation} while session is {state:?}")]
    InvalidState {
        operation: &'static str,
        state: SessionState,
    },

    /// Handshake or transport failure. Marks the client inactive.
    #[error("Connection error: {0}")]
    Connection(String),

    /// A malformed or unusable inbound envelope.
    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl RealtimeError {
    /// Only transport failures end a session; everything else is recoverable.
    pub fn is_fatal(&self) -> bool {
        matches!(self, RealtimeError::Connection(_))
    }
}

pub type Result<T, E = RealtimeError> = std::result::Result<T, E>;
