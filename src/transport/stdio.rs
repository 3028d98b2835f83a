//! JSON-RPC line framing over the engine's stdio.

use async_trait::async_trait;
use tokio::io::{AsyncWrite, AsyncWriteExt, BufWriter};
use tokio::process::ChildStdin;
use tokio::sync::Mutex;

use crate::error::EngineError;
use crate::transport::protocol::{parse_response, RpcRequest, RpcResponse};
use crate::transport::types::{EngineRequest, Sent, Transport, TransportKind};

/// Writes one JSON-RPC request line per call to the child's stdin.
///
/// Responses come back interleaved with log lines on stdout and are matched
/// to their requests through [`Transport::on_line`].
#[derive(Debug)]
pub struct StdioJsonRpcTransport<W = ChildStdin> {
    stdin: Mutex<BufWriter<W>>,
}

impl<W> StdioJsonRpcTransport<W>
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    #[must_use]
    pub fn new(stdin: W) -> Self {
        Self {
            stdin: Mutex::new(BufWriter::new(stdin)),
        }
    }
}

#[async_trait]
impl<W> Transport for StdioJsonRpcTransport<W>
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    fn kind(&self) -> TransportKind {
        TransportKind::StdioJsonRpc
    }

    async fn send(&self, id: u64, request: &EngineRequest) -> Result<Sent, EngineError> {
        let line = RpcRequest::new(id, request.method.clone(), request.payload.clone())
            .to_line()
            .map_err(|err| EngineError::UnknownDomain {
                message: format!("failed to serialize request: {err}"),
            })?;
        tracing::trace!(id, method = %request.method, "Writing request line");

        let mut stdin = self.stdin.lock().await;
        let write = async {
            stdin.write_all(line.as_bytes()).await?;
            stdin.write_all(b"\n").await?;
            stdin.flush().await
        };
        write.await.map_err(|err| EngineError::ConnectionLost {
            message: format!("failed to write to engine stdin: {err}"),
        })?;
        Ok(Sent::Dispatched)
    }

    fn on_line(&self, line: &str) -> Option<RpcResponse> {
        parse_response(line)
    }
}
