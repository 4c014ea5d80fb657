//! JSON-RPC 2.0 error taxonomy.
//!
//! The five standard error kinds and their wire codes. Codes are the identity
//! used across processes; messages are only defaults and may be overridden by
//! the raising side.
//!
//! | Kind             | Code   | Default message    |
//! |------------------|--------|--------------------|
//! | `ParseError`     | -32700 | Parse error        |
//! | `InvalidRequest` | -32600 | Invalid Request    |
//! | `MethodNotFound` | -32601 | Method not found   |
//! | `InvalidParams`  | -32602 | Invalid params     |
//! | `InternalError`  | -32603 | Internal error     |

use crate::error::{Result, RpcError};

/// Standard JSON-RPC error kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    ParseError,
    InvalidRequest,
    MethodNotFound,
    InvalidParams,
    InternalError,
}

impl ErrorKind {
    /// Every member of the taxonomy, in code order.
    pub const ALL: [ErrorKind; 5] = [
        ErrorKind::ParseError,
        ErrorKind::InvalidRequest,
        ErrorKind::MethodNotFound,
        ErrorKind::InvalidParams,
        ErrorKind::InternalError,
    ];

    /// Wire code for this kind.
    pub fn code(&self) -> i64 {
        match self {
            ErrorKind::ParseError => -32700,
            ErrorKind::InvalidRequest => -32600,
            ErrorKind::MethodNotFound => -32601,
            ErrorKind::InvalidParams => -32602,
            ErrorKind::InternalError => -32603,
        }
    }

    pub fn default_message(&self) -> &'static str {
        match self {
            ErrorKind::ParseError => "Parse error",
            ErrorKind::InvalidRequest => "Invalid Request",
            ErrorKind::MethodNotFound => "Method not found",
            ErrorKind::InvalidParams => "Invalid params",
            ErrorKind::InternalError => "Internal error",
        }
    }

    /// Map a wire code back to its kind.
    ///
    /// Codes outside the taxonomy mean the peer speaks a different protocol
    /// dialect. The failure is reported as [`RpcError::UnknownErrorCode`] and
    /// callers must not substitute a kind of their own.
    pub fn from_code(code: i64) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.code() == code)
            .ok_or(RpcError::UnknownErrorCode {
                code,
                message: None,
            })
    }
}

impl TryFrom<i64> for ErrorKind {
    type Error = RpcError;

    fn try_from(code: i64) -> Result<Self> {
        Self::from_code(code)
    }
}

impl From<ErrorKind> for i64 {
    fn from(kind: ErrorKind) -> Self {
        kind.code()
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.default_message(), self.code())
    }
}
