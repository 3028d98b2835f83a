//! Wire formats shared by the engine transports.
//!
//! The stdio transport frames JSON-RPC 2.0 lines; the http transport posts
//! JSON bodies to a local endpoint. Field order in the serialized structs is
//! part of the wire contract, so the struct declarations below keep it.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// JSON-RPC version tag written on every request line.
pub const JSONRPC_VERSION: &str = "2.0";

/// Response header carrying engine-side elapsed time in microseconds.
pub const ELAPSED_HEADER: &str = "x-elapsed";

/// One JSON-RPC request line written to the engine's stdin.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcRequest {
    pub id: u64,
    pub jsonrpc: String,
    pub method: String,
    pub params: Vec<Value>,
}

impl RpcRequest {
    /// Wrap a payload as the single element of `params`.
    #[must_use]
    pub fn new(id: u64, method: impl Into<String>, payload: Value) -> Self {
        Self {
            id,
            jsonrpc: JSONRPC_VERSION.to_string(),
            method: method.into(),
            params: vec![payload],
        }
    }

    /// Serialize to a single line, without the trailing newline.
    ///
    /// # Errors
    ///
    /// Returns the serialization error if the payload cannot be encoded.
    pub fn to_line(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// One response line from the engine: a `result` or an `error`, keyed by id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcResponse {
    pub id: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcError>,
}

/// Error half of an RPC response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcError {
    #[serde(default)]
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<RpcErrorData>,
}

/// Optional structured payload inside an RPC error.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcErrorData {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_panic: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Parse a child output line as an RPC response.
///
/// Lines that are not JSON objects with a numeric `id` (log records, panic
/// sentinels, plain text) return `None` and flow to the log classifier.
#[must_use]
pub fn parse_response(line: &str) -> Option<RpcResponse> {
    serde_json::from_str(line.trim()).ok()
}

/// Single-query POST body for the http transport.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryBody {
    pub variables: Map<String, Value>,
    pub query: String,
}

impl QueryBody {
    #[must_use]
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            variables: Map::new(),
            query: query.into(),
        }
    }
}

/// Batched POST body for the http transport.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchBody {
    pub batch: Vec<QueryBody>,
    pub transaction: bool,
    #[serde(
        rename = "isolationLevel",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub isolation_level: Option<String>,
}

/// Parsed body of a query or batch response.
///
/// Single queries fill `data`, batches fill `batch_result`, and failures of
/// either shape arrive through `errors`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HttpResponseBody {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub errors: Option<Vec<RequestError>>,
    #[serde(
        rename = "batchResult",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub batch_result: Option<Vec<Value>>,
}

/// One entry of an `errors` array in an http response.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RequestError {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_facing_error: Option<UserFacingError>,
}

/// Structured error the engine intends for the caller.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UserFacingError {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_panic: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
}

/// Options for `POST /transaction/start`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransactionOptions {
    /// Milliseconds the engine may wait to acquire the transaction.
    pub max_wait: u64,
    /// Milliseconds before the engine aborts the open transaction.
    pub timeout: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub isolation_level: Option<String>,
}

impl Default for TransactionOptions {
    fn default() -> Self {
        Self {
            max_wait: 2000,
            timeout: 5000,
            isolation_level: None,
        }
    }
}

/// Engine reply to a transaction start.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransactionInfo {
    pub id: String,
}

/// Parse the engine's elapsed-time header value.
#[must_use]
pub fn parse_elapsed(raw: &str) -> Option<Duration> {
    raw.trim().parse::<u64>().ok().map(Duration::from_micros)
}
