//! Error types for fcgi-bridge.

use thiserror::Error;

/// Main error type for all bridge operations.
///
/// Format and protocol errors are fatal to the connection that produced
/// them and nothing else. Backend errors are surfaced to the affected
/// requests as failed end-request results.
#[derive(Debug, Error)]
pub enum BridgeError {
    /// I/O error on a front-facing or backend stream.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Malformed header, body or length field.
    #[error("Format error: {0}")]
    Format(String),

    /// Protocol violation (oversized frame, id collision, bad sequencing).
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Connecting to, writing to or reading from the backend failed.
    #[error("Backend unavailable: {0}")]
    BackendUnavailable(String),

    /// Connection closed unexpectedly.
    #[error("Connection closed")]
    ConnectionClosed,

    /// Backpressure timeout - write buffer full.
    #[error("Backpressure timeout")]
    BackpressureTimeout,

    /// A bounded wait (connect, response, management query) expired.
    #[error("Timed out: {0}")]
    Timeout(&'static str),

    /// Invalid configuration.
    #[error("Configuration error: {0}")]
    Config(String),

    /// JSON configuration could not be parsed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl BridgeError {
    /// Whether this error must terminate the connection it occurred on.
    pub fn is_connection_fatal(&self) -> bool {
        matches!(
            self,
            BridgeError::Format(_)
                | BridgeError::Protocol(_)
                | BridgeError::Io(_)
                | BridgeError::ConnectionClosed
        )
    }
}

/// Result type alias using BridgeError.
pub type Result<T> = std::result::Result<T, BridgeError>;
