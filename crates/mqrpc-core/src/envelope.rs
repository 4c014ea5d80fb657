//! JSON-RPC 2.0 envelope types.
//!
//! Three records travel over the broker as UTF-8 JSON text:
//!
//! ```text
//! Request  {"jsonrpc":"2.0","method":"add","params":[1,2],"id":7}
//! Response {"jsonrpc":"2.0","result":3,"id":7}
//! Error    {"jsonrpc":"2.0","error":{"code":-32602,"message":"Invalid params"},"id":7}
//! ```
//!
//! Optional fields are omitted from the wire, never written as `null`. A request
//! without `id` is a notification and never gets a reply.

use crate::config::ProtocolConfig;
use crate::error::{Result, RpcError};
use crate::taxonomy::ErrorKind;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

fn default_version() -> String {
    ProtocolConfig::JSONRPC_VERSION.to_string()
}

/// Call arguments: either positional or named, never both.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Params {
    Positional(Vec<Value>),
    Named(Map<String, Value>),
}

impl Params {
    pub fn len(&self) -> usize {
        match self {
            Params::Positional(values) => values.len(),
            Params::Named(values) => values.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// An empty mapping carries no arguments; treat it like an empty sequence.
    fn normalize(self) -> Self {
        match self {
            Params::Named(values) if values.is_empty() => Params::default(),
            other => other,
        }
    }
}

impl Default for Params {
    fn default() -> Self {
        Params::Positional(Vec::new())
    }
}

impl From<Vec<Value>> for Params {
    fn from(values: Vec<Value>) -> Self {
        Params::Positional(values)
    }
}

impl From<Map<String, Value>> for Params {
    fn from(values: Map<String, Value>) -> Self {
        Params::Named(values).normalize()
    }
}

/// Absent, `null` and `{}` params all become `[]`.
fn deserialize_params<'de, D>(deserializer: D) -> std::result::Result<Params, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<Params>::deserialize(deserializer)?
        .map(Params::normalize)
        .unwrap_or_default())
}

/// JSON-RPC 2.0 request or notification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    #[serde(default = "default_version")]
    pub jsonrpc: String,
    pub method: String,
    #[serde(default, deserialize_with = "deserialize_params")]
    pub params: Params,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<i64>,
}

impl Request {
    /// Create a request that expects a reply.
    pub fn new(method: impl Into<String>, params: impl Into<Params>, id: i64) -> Self {
        Self {
            jsonrpc: default_version(),
            method: method.into(),
            params: params.into(),
            id: Some(id),
        }
    }

    /// Create a notification (no id, no reply).
    pub fn notification(method: impl Into<String>, params: impl Into<Params>) -> Self {
        Self {
            jsonrpc: default_version(),
            method: method.into(),
            params: params.into(),
            id: None,
        }
    }

    pub fn is_notification(&self) -> bool {
        self.id.is_none()
    }

    /// Parse a request from wire text.
    ///
    /// Anything that is not a well-formed request envelope (invalid JSON, a
    /// non-string method, a non-integer id, params that are neither an array
    /// nor an object) is a ParseError.
    pub fn parse(raw: &str) -> Result<Self> {
        serde_json::from_str(raw).map_err(|e| {
            RpcError::protocol(ErrorKind::ParseError, format!("Parse error: {}", e))
        })
    }

    pub fn encode(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

/// JSON-RPC 2.0 success response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    #[serde(default = "default_version")]
    pub jsonrpc: String,
    /// A missing result decodes as `null`.
    #[serde(default)]
    pub result: Value,
    pub id: i64,
}

impl Response {
    pub fn new(result: Value, id: i64) -> Self {
        Self {
            jsonrpc: default_version(),
            result,
            id,
        }
    }

    pub fn encode(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

/// JSON-RPC 2.0 error object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorStatus {
    pub code: i64,
    pub message: String,
}

/// JSON-RPC 2.0 error response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorResponse {
    #[serde(default = "default_version")]
    pub jsonrpc: String,
    pub error: ErrorStatus,
    /// Unknown when the failure happened before the request id could be read.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<i64>,
}

impl ErrorResponse {
    pub fn new(code: i64, message: impl Into<String>, id: Option<i64>) -> Self {
        Self {
            jsonrpc: default_version(),
            error: ErrorStatus {
                code,
                message: message.into(),
            },
            id,
        }
    }

    /// Build the wire form of `error` via the taxonomy mapping.
    pub fn from_error(error: &RpcError, id: Option<i64>) -> Self {
        Self::new(error.to_rpc_error_code(), error.to_rpc_message(), id)
    }

    pub fn encode(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Turn a received error back into the matching local error.
    pub fn into_error(self) -> RpcError {
        match ErrorKind::from_code(self.error.code) {
            Ok(kind) => RpcError::protocol(kind, self.error.message),
            Err(_) => RpcError::UnknownErrorCode {
                code: self.error.code,
                message: Some(self.error.message),
            },
        }
    }
}

/// A decoded reply to an awaited call.
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    Success(Response),
    Failure(ErrorResponse),
}

impl Reply {
    /// Decode reply text, trying the error shape first.
    pub fn decode(raw: &str) -> Result<Self> {
        let value: Value = serde_json::from_str(raw).map_err(|e| {
            RpcError::protocol(ErrorKind::ParseError, format!("Malformed reply: {}", e))
        })?;

        let is_error = value.get("error").is_some();
        let reply = if is_error {
            serde_json::from_value(value).map(Reply::Failure)
        } else {
            serde_json::from_value(value).map(Reply::Success)
        };

        reply.map_err(|e| {
            RpcError::protocol(ErrorKind::ParseError, format!("Malformed reply: {}", e))
        })
    }

    /// The call's result, or the re-raised remote error.
    pub fn into_result(self) -> Result<Value> {
        match self {
            Reply::Success(response) => Ok(response.result),
            Reply::Failure(error) => Err(error.into_error()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_request_params_normalize_to_empty_sequence() {
        for raw in [
            r#"{"jsonrpc":"2.0","method":"m","id":1}"#,
            r#"{"jsonrpc":"2.0","method":"m","params":null,"id":1}"#,
            r#"{"jsonrpc":"2.0","method":"m","params":{},"id":1}"#,
        ] {
            let request = Request::parse(raw).unwrap();
            assert_eq!(request.params, Params::Positional(vec![]));
        }
    }

    #[test]
    fn test_request_encode_then_parse_normalizes_params() {
        let request = Request::notification("m", Map::new());
        let encoded = request.encode().unwrap();
        assert_eq!(encoded, r#"{"jsonrpc":"2.0","method":"m","params":[]}"#);

        let parsed = Request::parse(&encoded).unwrap();
        assert_eq!(parsed.params, Params::default());
        assert!(parsed.is_notification());
    }

    #[test]
    fn test_request_named_and_positional_params() {
        let request =
            Request::parse(r#"{"method":"m","params":{"x":1,"y":2,"z":0.9},"id":3}"#).unwrap();
        assert_eq!(request.jsonrpc, "2.0");
        assert!(matches!(request.params, Params::Named(ref m) if m.len() == 3));

        let request = Request::parse(r#"{"method":"m","params":[1,"2",{"x":1}]}"#).unwrap();
        assert_eq!(request.params.len(), 3);
        assert_eq!(request.id, None);
    }

    #[test]
    fn test_request_rejects_scalar_params() {
        let err = Request::parse(r#"{"method":"m","params":1,"id":1}"#).unwrap_err();
        assert_eq!(err.kind(), Some(ErrorKind::ParseError));

        let err = Request::parse(r#"{"method":"m","params":"invalid","id":1}"#).unwrap_err();
        assert_eq!(err.kind(), Some(ErrorKind::ParseError));
    }

    #[test]
    fn test_request_rejects_non_integer_id() {
        for raw in [
            r#"{"method":"m","id":1.5}"#,
            r#"{"method":"m","id":"7"}"#,
            r#"{"method":"m","id":true}"#,
        ] {
            let err = Request::parse(raw).unwrap_err();
            assert_eq!(err.kind(), Some(ErrorKind::ParseError), "{}", raw);
        }
    }

    #[test]
    fn test_request_rejects_missing_method_and_bad_json() {
        assert!(Request::parse(r#"{"params":[]}"#).is_err());
        assert!(Request::parse("not valid json").is_err());
        assert!(Request::parse(r#"{"method":42}"#).is_err());
    }

    #[test]
    fn test_request_null_id_is_notification() {
        let request = Request::parse(r#"{"method":"m","id":null}"#).unwrap();
        assert!(request.is_notification());
    }

    #[test]
    fn test_response_wire_format() {
        let encoded = Response::new(json!(6), 1).encode().unwrap();
        assert_eq!(encoded, r#"{"jsonrpc":"2.0","result":6,"id":1}"#);
    }

    #[test]
    fn test_error_response_omits_unknown_id() {
        let encoded = ErrorResponse::new(-32700, "Parse error", None).encode().unwrap();
        assert_eq!(
            encoded,
            r#"{"jsonrpc":"2.0","error":{"code":-32700,"message":"Parse error"}}"#
        );
    }

    #[test]
    fn test_error_response_from_unmapped_error() {
        let envelope = ErrorResponse::from_error(&RpcError::other("boom"), Some(4));
        assert_eq!(envelope.error.code, -32603);
        assert_eq!(envelope.error.message, "Internal error");
        assert_eq!(envelope.id, Some(4));
    }

    #[test]
    fn test_reply_decodes_error_first() {
        let raw = r#"{"jsonrpc":"2.0","error":{"code":-32600,"message":"Invalid Request"},"id":8}"#;
        let err = Reply::decode(raw).unwrap().into_result().unwrap_err();
        assert_eq!(err.kind(), Some(ErrorKind::InvalidRequest));
    }

    #[test]
    fn test_reply_unknown_error_code() {
        let raw = r#"{"jsonrpc":"2.0","error":{"code":-32099,"message":"custom"},"id":8}"#;
        match Reply::decode(raw).unwrap().into_result() {
            Err(RpcError::UnknownErrorCode { code, message }) => {
                assert_eq!(code, -32099);
                assert_eq!(message.as_deref(), Some("custom"));
            }
            other => panic!("Expected UnknownErrorCode, got: {:?}", other),
        }
    }

    #[test]
    fn test_reply_success_with_missing_result() {
        let reply = Reply::decode(r#"{"jsonrpc":"2.0","id":2}"#).unwrap();
        assert_eq!(reply.into_result().unwrap(), Value::Null);
    }

    #[test]
    fn test_reply_malformed() {
        let err = Reply::decode("garbage").unwrap_err();
        assert_eq!(err.kind(), Some(ErrorKind::ParseError));
    }
}
