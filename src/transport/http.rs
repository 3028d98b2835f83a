//! HTTP transport against a local TCP port or Unix domain socket.

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::CONTENT_TYPE;
use reqwest::Client;
use serde_json::Value;
use url::Url;

use crate::error::EngineError;
use crate::transport::protocol::{
    parse_elapsed, BatchBody, HttpResponseBody, QueryBody, RequestError, RpcResponse,
    TransactionInfo, TransactionOptions, ELAPSED_HEADER,
};
use crate::transport::types::{
    BatchRequest, EngineRequest, EngineResponse, Sent, Transport, TransportKind,
};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug)]
enum HttpTarget {
    Tcp { base: Url, client: Client },
    Unix { socket: PathBuf },
}

/// Posts request bodies to the engine's local http endpoint.
///
/// Requests complete in-line; the child's stdout only carries log records,
/// so [`Transport::on_line`] never yields a response here.
#[derive(Debug)]
pub struct SocketHttpTransport {
    target: HttpTarget,
}

impl SocketHttpTransport {
    /// Transport for an engine listening on a loopback TCP port.
    ///
    /// # Errors
    ///
    /// Returns an error when the http client cannot be constructed.
    pub fn tcp(port: u16) -> Result<Self, EngineError> {
        let base = Url::parse(&format!("http://127.0.0.1:{port}/")).map_err(|err| {
            EngineError::UnknownDomain {
                message: format!("invalid engine endpoint: {err}"),
            }
        })?;
        let client = Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .map_err(|err| EngineError::from_reqwest(&err))?;
        Ok(Self {
            target: HttpTarget::Tcp { base, client },
        })
    }

    /// Transport for an engine listening on a Unix domain socket.
    #[must_use]
    pub fn unix(socket: impl Into<PathBuf>) -> Self {
        Self {
            target: HttpTarget::Unix {
                socket: socket.into(),
            },
        }
    }

    async fn post(&self, route: &str, body: String) -> Result<(Value, Option<Duration>), EngineError> {
        let raw = match &self.target {
            HttpTarget::Tcp { base, client } => {
                let url = base.join(route).map_err(|err| EngineError::UnknownDomain {
                    message: format!("invalid engine route {route}: {err}"),
                })?;
                let response = client
                    .post(url)
                    .header(CONTENT_TYPE, "application/json")
                    .body(body)
                    .send()
                    .await
                    .map_err(|err| EngineError::from_reqwest(&err))?;
                let status = response.status().as_u16();
                let elapsed = response
                    .headers()
                    .get(ELAPSED_HEADER)
                    .and_then(|value| value.to_str().ok())
                    .and_then(parse_elapsed);
                let bytes = response
                    .bytes()
                    .await
                    .map_err(|err| EngineError::from_reqwest(&err))?;
                RawResponse {
                    status,
                    elapsed,
                    body: bytes.to_vec(),
                }
            }
            HttpTarget::Unix { socket } => {
                #[cfg(unix)]
                {
                    uds_exchange(socket, route, &body).await?
                }
                #[cfg(not(unix))]
                {
                    let _ = socket;
                    return Err(EngineError::UnknownDomain {
                        message: "unix socket transport is not supported on this platform"
                            .to_string(),
                    });
                }
            }
        };

        if raw.body.iter().all(u8::is_ascii_whitespace) {
            return Ok((Value::Null, raw.elapsed));
        }
        match serde_json::from_slice(&raw.body) {
            Ok(value) => Ok((value, raw.elapsed)),
            Err(_) if raw.status >= 400 => Err(EngineError::UnknownDomain {
                message: format!("engine returned http {}", raw.status),
            }),
            Err(err) => Err(EngineError::UnknownDomain {
                message: format!("failed to parse engine response: {err}"),
            }),
        }
    }

    async fn finish_transaction(&self, route: &str) -> Result<(), EngineError> {
        let (value, _) = self.post(route, String::new()).await?;
        check_transaction_errors(&value)
    }
}

#[async_trait]
impl Transport for SocketHttpTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::SocketHttp
    }

    async fn send(&self, id: u64, request: &EngineRequest) -> Result<Sent, EngineError> {
        let body = serde_json::to_string(&QueryBody::new(request.query_text()))
            .map_err(serialize_error)?;
        tracing::trace!(id, method = %request.method, "Posting query to engine");
        let (value, elapsed) = self.post("/", body).await?;
        let parsed = parse_body(value)?;
        if let Some(errors) = parsed.errors {
            if !errors.is_empty() {
                return Err(collapse_errors(errors));
            }
        }
        Ok(Sent::Completed(EngineResponse {
            data: parsed.data.unwrap_or(Value::Null),
            elapsed,
        }))
    }

    fn on_line(&self, _line: &str) -> Option<RpcResponse> {
        None
    }

    async fn send_batch(
        &self,
        batch: &BatchRequest,
    ) -> Result<Vec<Result<EngineResponse, EngineError>>, EngineError> {
        let body = serde_json::to_string(&BatchBody {
            batch: batch
                .queries
                .iter()
                .map(|query| QueryBody::new(query.clone()))
                .collect(),
            transaction: batch.transaction,
            isolation_level: batch.isolation_level.clone(),
        })
        .map_err(serialize_error)?;
        tracing::trace!(queries = batch.queries.len(), "Posting batch to engine");
        let (value, elapsed) = self.post("/", body).await?;
        let parsed = parse_body(value)?;
        if let Some(items) = parsed.batch_result {
            return Ok(items
                .into_iter()
                .map(|item| batch_item_outcome(item, elapsed))
                .collect());
        }
        if let Some(errors) = parsed.errors {
            if !errors.is_empty() {
                return Err(collapse_errors(errors));
            }
        }
        Err(EngineError::UnknownDomain {
            message: "engine batch response carried no batchResult".to_string(),
        })
    }

    async fn transaction_begin(
        &self,
        options: &TransactionOptions,
    ) -> Result<TransactionInfo, EngineError> {
        let body = serde_json::to_string(options).map_err(serialize_error)?;
        let (value, _) = self.post("/transaction/start", body).await?;
        check_transaction_errors(&value)?;
        serde_json::from_value(value).map_err(|err| EngineError::UnknownDomain {
            message: format!("engine transaction response was malformed: {err}"),
        })
    }

    async fn transaction_commit(&self, id: &str) -> Result<(), EngineError> {
        self.finish_transaction(&format!("/transaction/{id}/commit"))
            .await
    }

    async fn transaction_rollback(&self, id: &str) -> Result<(), EngineError> {
        self.finish_transaction(&format!("/transaction/{id}/rollback"))
            .await
    }
}

#[derive(Debug)]
struct RawResponse {
    status: u16,
    elapsed: Option<Duration>,
    body: Vec<u8>,
}

/// One HTTP/1.1 exchange over a Unix socket.
///
/// The engine's socket endpoint speaks plain HTTP but no client stack in the
/// dependency tree dials Unix sockets, so the exchange is framed by hand.
/// `connection: close` bounds the read; the body is then cut to the framing
/// the engine declared, content-length or chunked.
#[cfg(unix)]
async fn uds_exchange(
    socket: &std::path::Path,
    route: &str,
    body: &str,
) -> Result<RawResponse, EngineError> {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    let mut stream = tokio::net::UnixStream::connect(socket).await.map_err(|err| {
        EngineError::ConnectionLost {
            message: format!("failed to connect to engine socket: {err}"),
        }
    })?;
    let request = format!(
        "POST {route} HTTP/1.1\r\nhost: localhost\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{body}",
        body.len()
    );
    stream
        .write_all(request.as_bytes())
        .await
        .map_err(|err| EngineError::ConnectionLost {
            message: format!("failed to write to engine socket: {err}"),
        })?;

    let mut raw = Vec::new();
    stream
        .read_to_end(&mut raw)
        .await
        .map_err(|err| EngineError::ConnectionLost {
            message: format!("failed to read from engine socket: {err}"),
        })?;
    parse_http_response(&raw)
}

fn parse_http_response(raw: &[u8]) -> Result<RawResponse, EngineError> {
    let split = find_subsequence(raw, b"\r\n\r\n").ok_or_else(|| EngineError::ConnectionLost {
        message: "engine closed the socket before completing the response".to_string(),
    })?;
    let head = String::from_utf8_lossy(&raw[..split]);
    let mut lines = head.split("\r\n");

    let status_line = lines.next().unwrap_or_default();
    let status = status_line
        .split_whitespace()
        .nth(1)
        .and_then(|code| code.parse::<u16>().ok())
        .ok_or_else(|| EngineError::ConnectionLost {
            message: format!("engine sent a malformed status line: {status_line}"),
        })?;

    let mut elapsed = None;
    let mut content_length = None;
    let mut chunked = false;
    for line in lines {
        if let Some((name, value)) = line.split_once(':') {
            let name = name.trim();
            if name.eq_ignore_ascii_case(ELAPSED_HEADER) {
                elapsed = parse_elapsed(value);
            } else if name.eq_ignore_ascii_case("content-length") {
                content_length = value.trim().parse::<usize>().ok();
            } else if name.eq_ignore_ascii_case("transfer-encoding") {
                chunked = value.to_ascii_lowercase().contains("chunked");
            }
        }
    }

    let rest = &raw[split + 4..];
    let body = if chunked {
        decode_chunked(rest)?
    } else if let Some(length) = content_length {
        if rest.len() < length {
            return Err(EngineError::ConnectionLost {
                message: "engine closed the socket mid-body".to_string(),
            });
        }
        rest[..length].to_vec()
    } else {
        rest.to_vec()
    };

    Ok(RawResponse {
        status,
        elapsed,
        body,
    })
}

/// Reassembles a `transfer-encoding: chunked` body. Trailers are ignored.
fn decode_chunked(mut rest: &[u8]) -> Result<Vec<u8>, EngineError> {
    let mut body = Vec::new();
    loop {
        let line_end = find_subsequence(rest, b"\r\n").ok_or_else(truncated_chunk)?;
        let size_line = &rest[..line_end];
        // Chunk extensions after `;` carry nothing we need.
        let size_line = size_line
            .iter()
            .position(|byte| *byte == b';')
            .map_or(size_line, |at| &size_line[..at]);
        let digits = String::from_utf8_lossy(size_line);
        let digits = digits.trim();
        let size = usize::from_str_radix(digits, 16).map_err(|_| {
            EngineError::ConnectionLost {
                message: format!("engine sent a malformed chunk size: {digits}"),
            }
        })?;
        rest = &rest[line_end + 2..];
        if size == 0 {
            return Ok(body);
        }
        if rest.len() < size + 2 {
            return Err(truncated_chunk());
        }
        body.extend_from_slice(&rest[..size]);
        if &rest[size..size + 2] != b"\r\n" {
            return Err(EngineError::ConnectionLost {
                message: "engine sent a malformed chunk boundary".to_string(),
            });
        }
        rest = &rest[size + 2..];
    }
}

fn truncated_chunk() -> EngineError {
    EngineError::ConnectionLost {
        message: "engine closed the socket mid-chunk".to_string(),
    }
}

fn find_subsequence(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

fn parse_body(value: Value) -> Result<HttpResponseBody, EngineError> {
    if value.is_null() {
        return Ok(HttpResponseBody::default());
    }
    serde_json::from_value(value).map_err(|err| EngineError::UnknownDomain {
        message: format!("failed to parse engine response: {err}"),
    })
}

fn batch_item_outcome(
    item: Value,
    elapsed: Option<Duration>,
) -> Result<EngineResponse, EngineError> {
    if let Some(errors) = item.get("errors").and_then(Value::as_array) {
        if !errors.is_empty() {
            let parsed = errors
                .iter()
                .map(|error| serde_json::from_value(error.clone()).unwrap_or_default())
                .collect();
            return Err(collapse_errors(parsed));
        }
    }
    Ok(EngineResponse {
        data: item,
        elapsed,
    })
}

fn check_transaction_errors(value: &Value) -> Result<(), EngineError> {
    if let Some(errors) = value.get("errors").and_then(Value::as_array) {
        if !errors.is_empty() {
            let parsed = errors
                .iter()
                .map(|error| serde_json::from_value(error.clone()).unwrap_or_default())
                .collect();
            return Err(collapse_errors(parsed));
        }
    }
    Ok(())
}

fn collapse_errors(mut errors: Vec<RequestError>) -> EngineError {
    if errors.len() == 1 {
        return EngineError::from_request_error(errors.remove(0));
    }
    let message = serde_json::to_string(&errors)
        .unwrap_or_else(|_| "multiple engine errors".to_string());
    EngineError::UnknownDomain { message }
}

fn serialize_error(err: serde_json::Error) -> EngineError {
    EngineError::UnknownDomain {
        message: format!("failed to serialize request: {err}"),
    }
}
