//! Error types for mqrpc.
//!
//! Every stage of a call (envelope parsing, argument coercion, handler
//! invocation, transport I/O) reports failures as [`RpcError`]. The dispatcher
//! collapses them onto the JSON-RPC taxonomy with [`RpcError::to_rpc_error_code`].

use crate::taxonomy::ErrorKind;
use std::time::Duration;
use thiserror::Error;

/// Main error type for mqrpc.
#[derive(Debug, Error)]
pub enum RpcError {
    /// A failure that carries a taxonomy code, raised locally or received from a peer.
    #[error("{message}")]
    Protocol { kind: ErrorKind, message: String },

    /// A peer answered with a code outside the taxonomy.
    #[error("Unknown JSON-RPC error code {code}")]
    UnknownErrorCode { code: i64, message: Option<String> },

    // Serialization errors
    #[error("JSON error: {message}")]
    Json {
        message: String,
        #[source]
        source: Option<serde_json::Error>,
    },

    #[error("Invalid UTF-8 payload: {0}")]
    Utf8(#[from] std::str::Utf8Error),

    // Transport errors
    #[error("Transport error: {message}")]
    Transport { message: String },

    #[error("Not connected to the broker")]
    NotConnected,

    #[error("Caller not started: no reply queue has been declared")]
    CallerNotStarted,

    #[error("Delivery is missing its {field}")]
    MissingProperty { field: &'static str },

    // Correlation errors
    #[error("No pending call for correlation id {token}")]
    UnknownCorrelation { token: String },

    #[error("Pending call {token} was dropped before a reply arrived")]
    CallDropped { token: String },

    #[error("Call to {method} timed out after {timeout:?}")]
    Timeout { method: String, timeout: Duration },

    // Generic errors
    #[error("{0}")]
    Other(String),
}

/// Result type alias for mqrpc operations.
pub type Result<T> = std::result::Result<T, RpcError>;

impl From<serde_json::Error> for RpcError {
    fn from(err: serde_json::Error) -> Self {
        RpcError::Json {
            message: err.to_string(),
            source: Some(err),
        }
    }
}

impl RpcError {
    /// Create a taxonomy error with a custom message.
    pub fn protocol(kind: ErrorKind, message: impl Into<String>) -> Self {
        RpcError::Protocol {
            kind,
            message: message.into(),
        }
    }

    /// Create a taxonomy error with the kind's default message.
    pub fn from_kind(kind: ErrorKind) -> Self {
        Self::protocol(kind, kind.default_message())
    }

    pub fn invalid_params(message: impl Into<String>) -> Self {
        Self::protocol(ErrorKind::InvalidParams, message)
    }

    pub fn other(message: impl Into<String>) -> Self {
        RpcError::Other(message.into())
    }

    /// The taxonomy kind this error carries, if it carries one.
    pub fn kind(&self) -> Option<ErrorKind> {
        match self {
            RpcError::Protocol { kind, .. } => Some(*kind),
            _ => None,
        }
    }

    /// Convert to a JSON-RPC error code.
    ///
    /// Errors raised with a taxonomy kind keep its code; everything else is
    /// reported as -32603 (Internal error).
    pub fn to_rpc_error_code(&self) -> i64 {
        self.kind().unwrap_or(ErrorKind::InternalError).code()
    }

    /// Message to put on the wire for this error.
    ///
    /// Unmapped errors never leak their details to the peer; the dispatcher logs
    /// them instead.
    pub fn to_rpc_message(&self) -> String {
        match self {
            RpcError::Protocol { message, .. } => message.clone(),
            _ => ErrorKind::InternalError.default_message().to_string(),
        }
    }
}
