//! The transport contract shared by the stdio and http framings.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::EngineError;
use crate::transport::protocol::{RpcResponse, TransactionInfo, TransactionOptions};

/// Identifies the active wire framing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    StdioJsonRpc,
    SocketHttp,
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::StdioJsonRpc => f.write_str("stdio-jsonrpc"),
            Self::SocketHttp => f.write_str("socket-http"),
        }
    }
}

/// A request as callers hand it to the supervisor, before framing.
#[derive(Debug, Clone, PartialEq)]
pub struct EngineRequest {
    pub method: String,
    pub payload: Value,
}

impl EngineRequest {
    /// An RPC-style request with a structured payload.
    #[must_use]
    pub fn rpc(method: impl Into<String>, payload: Value) -> Self {
        Self {
            method: method.into(),
            payload,
        }
    }

    /// A query request; over http the payload becomes the posted query text.
    #[must_use]
    pub fn query(text: impl Into<String>) -> Self {
        Self {
            method: "query".to_string(),
            payload: Value::String(text.into()),
        }
    }

    /// Query text for http framing: strings pass through untouched, any
    /// other JSON payload is compacted.
    #[must_use]
    pub fn query_text(&self) -> String {
        match &self.payload {
            Value::String(text) => text.clone(),
            other => other.to_string(),
        }
    }
}

/// Engine reply payload plus transport metadata.
#[derive(Debug, Clone, PartialEq)]
pub struct EngineResponse {
    pub data: Value,
    /// Engine-side processing time, when the transport reports one.
    pub elapsed: Option<Duration>,
}

impl EngineResponse {
    #[must_use]
    pub fn new(data: Value) -> Self {
        Self {
            data,
            elapsed: None,
        }
    }

    #[must_use]
    pub fn with_elapsed(mut self, elapsed: Option<Duration>) -> Self {
        self.elapsed = elapsed;
        self
    }
}

/// A batch of queries dispatched as one unit over http.
#[derive(Debug, Clone, PartialEq)]
pub struct BatchRequest {
    pub queries: Vec<String>,
    pub transaction: bool,
    pub isolation_level: Option<String>,
}

impl BatchRequest {
    #[must_use]
    pub fn new(queries: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            queries: queries.into_iter().map(Into::into).collect(),
            transaction: false,
            isolation_level: None,
        }
    }

    /// Run the batch inside a single transaction.
    #[must_use]
    pub fn transactional(mut self, enabled: bool) -> Self {
        self.transaction = enabled;
        self
    }

    #[must_use]
    pub fn isolation_level(mut self, level: impl Into<String>) -> Self {
        self.isolation_level = Some(level.into());
        self
    }
}

/// What dispatching a request produced.
#[derive(Debug)]
pub enum Sent {
    /// Written to the engine; the response arrives later on an output line.
    Dispatched,
    /// Completed in-line by a request/response transport.
    Completed(EngineResponse),
}

/// Contract shared by both transport variants.
///
/// A transport only frames and moves bytes. Correlation, retry, and crash
/// handling live in the supervisor.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Which framing this transport speaks.
    fn kind(&self) -> TransportKind;

    /// Frame and dispatch one request under the given correlation id.
    ///
    /// # Errors
    ///
    /// Returns `ConnectionLost` when the engine cannot be reached and a
    /// domain error when the engine answers with one in-line.
    async fn send(&self, id: u64, request: &EngineRequest) -> Result<Sent, EngineError>;

    /// Inspect one child output line for a response to a dispatched request.
    ///
    /// Only the stdio framing receives responses this way; the http framing
    /// always returns `None` so every line flows to the log classifier.
    fn on_line(&self, line: &str) -> Option<RpcResponse>;

    /// Dispatch a batch; per-query outcomes on success.
    ///
    /// # Errors
    ///
    /// Returns an error when the whole batch fails, or on framings that
    /// cannot express batches.
    async fn send_batch(
        &self,
        batch: &BatchRequest,
    ) -> Result<Vec<Result<EngineResponse, EngineError>>, EngineError> {
        let _ = batch;
        Err(EngineError::UnknownDomain {
            message: format!("batch requests require the http transport (active: {})", self.kind()),
        })
    }

    /// Open an interactive transaction.
    ///
    /// # Errors
    ///
    /// Returns an error when the engine refuses the transaction, or on
    /// framings that cannot express them.
    async fn transaction_begin(
        &self,
        options: &TransactionOptions,
    ) -> Result<TransactionInfo, EngineError> {
        let _ = options;
        Err(transactions_unsupported(self.kind()))
    }

    /// Commit an open transaction.
    ///
    /// # Errors
    ///
    /// Same conditions as [`Transport::transaction_begin`].
    async fn transaction_commit(&self, id: &str) -> Result<(), EngineError> {
        let _ = id;
        Err(transactions_unsupported(self.kind()))
    }

    /// Roll back an open transaction.
    ///
    /// # Errors
    ///
    /// Same conditions as [`Transport::transaction_begin`].
    async fn transaction_rollback(&self, id: &str) -> Result<(), EngineError> {
        let _ = id;
        Err(transactions_unsupported(self.kind()))
    }
}

fn transactions_unsupported(kind: TransportKind) -> EngineError {
    EngineError::UnknownDomain {
        message: format!("interactive transactions require the http transport (active: {kind})"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn query_text_passes_strings_through() {
        let request = EngineRequest::query("{ me }");
        assert_eq!(request.method, "query");
        assert_eq!(request.query_text(), "{ me }");
    }

    #[test]
    fn query_text_compacts_structured_payloads() {
        let request = EngineRequest::rpc("query", json!({"batch": [1, 2]}));
        assert_eq!(request.query_text(), r#"{"batch":[1,2]}"#);
    }

    #[test]
    fn batch_request_builder() {
        let batch = BatchRequest::new(["a", "b"])
            .transactional(true)
            .isolation_level("Serializable");
        assert_eq!(batch.queries, vec!["a", "b"]);
        assert!(batch.transaction);
        assert_eq!(batch.isolation_level.as_deref(), Some("Serializable"));
    }

    #[test]
    fn transport_kind_display() {
        assert_eq!(TransportKind::StdioJsonRpc.to_string(), "stdio-jsonrpc");
        assert_eq!(TransportKind::SocketHttp.to_string(), "socket-http");
    }
}
