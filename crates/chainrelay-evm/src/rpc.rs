//! JSON-RPC 2.0 wire types and RPC errors.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use chainrelay_core::backoff::Retryable;
use chainrelay_core::error::RelayError;

/// Errors talking to an EVM node.
#[derive(Debug, Error)]
pub enum RpcError {
    #[error("HTTP error: {0}")]
    Http(String),

    #[error("Request timed out")]
    Timeout,

    /// The node answered with a JSON-RPC error object.
    #[error("JSON-RPC error {code}: {message}")]
    Node { code: i64, message: String },

    /// The node answered, but the result had an unexpected shape.
    #[error("Malformed response: {0}")]
    Malformed(String),
}

impl RpcError {
    /// Transport failures and rate limits are worth retrying; malformed
    /// payloads are not.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Http(_) | Self::Timeout => true,
            // -32005: limit exceeded, -32603: internal error (often transient on public nodes)
            Self::Node { code, .. } => matches!(code, -32005 | -32603 | 429),
            Self::Malformed(_) => false,
        }
    }
}

impl Retryable for RpcError {
    fn is_retryable(&self) -> bool {
        RpcError::is_retryable(self)
    }
}

impl From<RpcError> for RelayError {
    fn from(e: RpcError) -> Self {
        RelayError::Rpc(e.to_string())
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: &'static str,
    pub method: String,
    pub params: Vec<Value>,
    pub id: u64,
}

impl JsonRpcRequest {
    pub fn new(id: u64, method: impl Into<String>, params: Vec<Value>) -> Self {
        Self {
            jsonrpc: "2.0",
            method: method.into(),
            params,
            id,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct JsonRpcErrorObject {
    pub code: i64,
    pub message: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct JsonRpcResponse {
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub error: Option<JsonRpcErrorObject>,
}

impl JsonRpcResponse {
    pub fn into_result(self) -> Result<Value, RpcError> {
        match self.error {
            Some(err) => Err(RpcError::Node {
                code: err.code,
                message: err.message,
            }),
            None => Ok(self.result.unwrap_or(Value::Null)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_serialization() {
        let req = JsonRpcRequest::new(1, "eth_blockNumber", vec![]);
        let json = serde_json::to_string(&req).unwrap();
        assert!(json.contains("\"jsonrpc\":\"2.0\""));
        assert!(json.contains("\"method\":\"eth_blockNumber\""));
    }

    #[test]
    fn node_error_surfaces() {
        let resp: JsonRpcResponse = serde_json::from_str(
            r#"{"jsonrpc":"2.0","id":1,"error":{"code":-32005,"message":"query returned more than 10000 results"}}"#,
        )
        .unwrap();
        let err = resp.into_result().unwrap_err();
        assert!(err.is_retryable());
        assert!(matches!(err, RpcError::Node { code: -32005, .. }));
    }

    #[test]
    fn malformed_is_permanent() {
        assert!(!RpcError::Malformed("bad hex".into()).is_retryable());
        assert!(RpcError::Timeout.is_retryable());
    }
}
