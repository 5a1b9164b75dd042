//! Error types for flowwire.

use std::time::Duration;

use thiserror::Error;

/// Main error type for all flowwire operations.
#[derive(Debug, Error)]
pub enum FlowError {
    /// I/O error during socket operations.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error (attribute headers).
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Malformed frame, oversized length field, or stream closed mid-frame.
    #[error("Framing error: {0}")]
    Framing(String),

    /// Header bytes are not a valid attribute map.
    #[error("Attribute decode error: {0}")]
    AttributeDecode(String),

    /// A single outbound message could not be delivered.
    #[error("Send error: {0}")]
    Send(String),

    /// Listener could not be bound. Fatal at startup.
    #[error("Failed to bind {address}: {source}")]
    Bind {
        address: String,
        #[source]
        source: std::io::Error,
    },

    /// No connection became available within the acquire timeout.
    #[error("Connection pool exhausted for {destination} after {waited:?}")]
    PoolExhausted {
        destination: String,
        waited: Duration,
    },

    /// TLS handshake or configuration error.
    #[error("TLS error: {0}")]
    Tls(String),

    /// Invalid configuration rejected at build time.
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// The host collaborator refused an operation.
    #[error("Host error: {0}")]
    Host(String),

    /// Operation attempted after shutdown.
    #[error("Shut down")]
    Shutdown,
}

impl FlowError {
    /// Whether this error was caused by an elapsed timeout.
    pub fn is_timeout(&self) -> bool {
        match self {
            FlowError::Io(e) => e.kind() == std::io::ErrorKind::TimedOut,
            FlowError::PoolExhausted { .. } => true,
            _ => false,
        }
    }
}

/// Result type alias using FlowError.
pub type Result<T> = std::result::Result<T, FlowError>;
