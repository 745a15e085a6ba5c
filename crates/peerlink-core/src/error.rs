//! Error types for peerlink.
//!
//! The manager itself never returns errors from its public entry points once
//! constructed: failures reach the owner through observer hooks and request
//! callbacks. These types cover construction, the connector seam and the
//! bundled IPC transport.

use crate::request::AbandonReason;
use std::time::Duration;
use thiserror::Error;

/// Main error type for the peerlink library.
#[derive(Debug, Error)]
pub enum PeerError {
    // Configuration errors
    #[error("Configuration error: {message}")]
    Config { message: String },

    // Peer lifecycle errors
    #[error("Request timeout after {0:?}")]
    Timeout(Duration),

    #[error("Peer unavailable: {identity}")]
    PeerUnavailable { identity: String },

    #[error("Link to {identity} failed: {message}")]
    LinkFailed { identity: String, message: String },

    #[error("Request abandoned: {0}")]
    Abandoned(AbandonReason),

    // Transport errors
    #[error("IO error: {message}")]
    Io {
        message: String,
        #[source]
        source: Option<std::io::Error>,
    },

    #[error("JSON error: {message}")]
    Json {
        message: String,
        #[source]
        source: Option<serde_json::Error>,
    },

    #[error("Validation error for {field}: {message}")]
    Validation { field: String, message: String },

    #[error("Remote error {code}: {message}")]
    Rpc { code: i32, message: String },

    #[error("Invalid params: {message}")]
    InvalidParams { message: String },

    // Generic errors
    #[error("{0}")]
    Other(String),
}

/// Result type alias for peerlink operations.
pub type Result<T> = std::result::Result<T, PeerError>;

impl From<std::io::Error> for PeerError {
    fn from(err: std::io::Error) -> Self {
        PeerError::Io {
            message: err.to_string(),
            source: Some(err),
        }
    }
}

impl From<serde_json::Error> for PeerError {
    fn from(err: serde_json::Error) -> Self {
        PeerError::Json {
            message: err.to_string(),
            source: Some(err),
        }
    }
}

impl PeerError {
    /// Create a configuration error.
    pub fn config(message: impl Into<String>) -> Self {
        PeerError::Config {
            message: message.into(),
        }
    }

    /// Convert to a JSON-RPC error code.
    ///
    /// Standard JSON-RPC error codes:
    /// - -32700: Parse error
    /// - -32600: Invalid Request
    /// - -32601: Method not found
    /// - -32602: Invalid params
    /// - -32603: Internal error
    ///
    /// Custom error codes (application-defined, -32000 to -32099):
    /// - -32000: Peer unavailable / link failure
    /// - -32001: Timeout
    /// - -32002: Abandoned by destroy
    /// - -32005: Validation error
    pub fn to_rpc_error_code(&self) -> i32 {
        match self {
            PeerError::PeerUnavailable { .. } | PeerError::LinkFailed { .. } => -32000,
            PeerError::Timeout(_) => -32001,
            PeerError::Abandoned(AbandonReason::Destroyed) => -32002,
            PeerError::Abandoned(AbandonReason::PeerUnavailable) => -32000,
            PeerError::Validation { .. } | PeerError::Config { .. } => -32005,
            PeerError::InvalidParams { .. } => -32602,
            PeerError::Json { .. } => -32700,
            PeerError::Rpc { code, .. } => *code,
            _ => -32603,
        }
    }

    /// Check if a caller could reasonably try the same operation again.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            PeerError::Timeout(_)
                | PeerError::PeerUnavailable { .. }
                | PeerError::LinkFailed { .. }
                | PeerError::Abandoned(AbandonReason::PeerUnavailable)
        )
    }
}
