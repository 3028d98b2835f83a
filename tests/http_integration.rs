//! Integration tests for the http transport against a canned local server.
//!
//! The "engine" here is a script that announces readiness and sleeps; the
//! test itself owns the socket and answers with prepared HTTP responses, so
//! every wire byte the supervisor produces can be asserted.

#![cfg(unix)]

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use engine_supervisor::config::{EngineConfig, TransportConfig};
use engine_supervisor::error::EngineError;
use engine_supervisor::supervisor::{EngineSupervisor, SupervisorRegistry, SupervisorState};
use engine_supervisor::transport::{BatchRequest, EngineRequest, TransactionOptions};
use serde_json::json;
use tempfile::TempDir;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::mpsc;

/// Announces readiness on stdout, then idles until terminated.
const READY_SLEEPER: &str = r#"#!/bin/sh
printf '%s\n' '{"timestamp":"2024-01-01T00:00:00Z","level":"info","target":"engine","fields":{"message":"Started http server on 127.0.0.1"}}'
exec sleep 300
"#;

/// Per-request canned reply: status, optional x-elapsed microseconds, body.
/// A zero status drops the connection without answering.
type Reply = (u16, Option<u64>, String);
type Handler = Arc<dyn Fn(usize, &str, &str) -> Reply + Send + Sync>;

fn write_script(dir: &TempDir, body: &str) -> PathBuf {
    let path = dir.path().join("engine");
    std::fs::write(&path, body).expect("write script");
    let mut perms = std::fs::metadata(&path).expect("script metadata").permissions();
    perms.set_mode(0o755);
    std::fs::set_permissions(&path, perms).expect("chmod script");
    path
}

fn count_lines(path: &Path) -> usize {
    std::fs::read_to_string(path).unwrap_or_default().lines().count()
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|window| window == needle)
}

/// Read one HTTP/1.1 request; returns (head, body).
async fn read_request<S>(stream: &mut S) -> (String, String)
where
    S: AsyncReadExt + Unpin,
{
    let mut buf = Vec::new();
    let mut chunk = [0u8; 1024];
    let header_end = loop {
        if let Some(pos) = find(&buf, b"\r\n\r\n") {
            break pos;
        }
        let n = stream.read(&mut chunk).await.expect("read request head");
        assert!(n > 0, "connection closed before request head");
        buf.extend_from_slice(&chunk[..n]);
    };
    let head = String::from_utf8_lossy(&buf[..header_end]).to_string();
    let content_length = head
        .lines()
        .find_map(|line| {
            let (name, value) = line.split_once(':')?;
            if name.eq_ignore_ascii_case("content-length") {
                value.trim().parse::<usize>().ok()
            } else {
                None
            }
        })
        .unwrap_or(0);

    let mut body = buf[header_end + 4..].to_vec();
    while body.len() < content_length {
        let n = stream.read(&mut chunk).await.expect("read request body");
        assert!(n > 0, "connection closed before request body");
        body.extend_from_slice(&chunk[..n]);
    }
    (head, String::from_utf8_lossy(&body).to_string())
}

async fn write_reply<S>(stream: &mut S, status: u16, elapsed: Option<u64>, body: &str)
where
    S: AsyncWriteExt + Unpin,
{
    let mut response = format!(
        "HTTP/1.1 {status} OK\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n",
        body.len()
    );
    if let Some(micros) = elapsed {
        response.push_str(&format!("x-elapsed: {micros}\r\n"));
    }
    response.push_str("\r\n");
    response.push_str(body);
    stream.write_all(response.as_bytes()).await.expect("write reply");
    stream.flush().await.expect("flush reply");
}

/// Serve canned replies on a TCP listener, reporting every captured request.
fn spawn_tcp_responder(
    listener: tokio::net::TcpListener,
    handler: Handler,
) -> mpsc::UnboundedReceiver<(String, String)> {
    let (tx, rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        let mut served = 0usize;
        while let Ok((mut stream, _)) = listener.accept().await {
            let (head, body) = read_request(&mut stream).await;
            let (status, elapsed, reply) = handler(served, &head, &body);
            if tx.send((head, body)).is_err() {
                break;
            }
            if status != 0 {
                write_reply(&mut stream, status, elapsed, &reply).await;
            }
            drop(stream);
            served += 1;
        }
    });
    rx
}

fn spawn_unix_responder(
    listener: tokio::net::UnixListener,
    handler: Handler,
) -> mpsc::UnboundedReceiver<(String, String)> {
    let (tx, rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        let mut served = 0usize;
        while let Ok((mut stream, _)) = listener.accept().await {
            let (head, body) = read_request(&mut stream).await;
            let (status, elapsed, reply) = handler(served, &head, &body);
            if tx.send((head, body)).is_err() {
                break;
            }
            if status != 0 {
                write_reply(&mut stream, status, elapsed, &reply).await;
            }
            drop(stream);
            served += 1;
        }
    });
    rx
}

async fn bound_port_listener() -> (tokio::net::TcpListener, u16) {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind test listener");
    let port = listener.local_addr().expect("listener addr").port();
    (listener, port)
}

#[tokio::test]
async fn query_round_trip_over_http() {
    let dir = TempDir::new().expect("tempdir");
    let binary = write_script(&dir, READY_SLEEPER);
    let (listener, port) = bound_port_listener().await;
    let mut captured = spawn_tcp_responder(
        listener,
        Arc::new(|_, _, _| (200, Some(2500), r#"{"data":{"users":[1,2]}}"#.to_string())),
    );

    let supervisor =
        EngineSupervisor::new(EngineConfig::new(binary, TransportConfig::http_port(port)));
    let response = supervisor
        .request(EngineRequest::query("query { users }"))
        .await
        .expect("request succeeds");
    assert_eq!(response.data, json!({"users": [1, 2]}));
    assert_eq!(response.elapsed, Some(Duration::from_micros(2500)));

    let (head, body) = captured.recv().await.expect("captured request");
    assert!(head.starts_with("POST / "), "unexpected request head: {head}");
    assert_eq!(body, r#"{"variables":{},"query":"query { users }"}"#);

    supervisor.stop().await;
    assert_eq!(supervisor.state(), SupervisorState::Stopped);
}

#[tokio::test]
async fn engine_errors_collapse_to_known_domain() {
    let dir = TempDir::new().expect("tempdir");
    let binary = write_script(&dir, READY_SLEEPER);
    let (listener, port) = bound_port_listener().await;
    let _captured = spawn_tcp_responder(
        listener,
        Arc::new(|_, _, _| {
            (
                200,
                None,
                r#"{"errors":[{"error":"query failed","user_facing_error":{"is_panic":false,"message":"unique violation","error_code":"P2002"}}]}"#
                    .to_string(),
            )
        }),
    );

    let supervisor =
        EngineSupervisor::new(EngineConfig::new(binary, TransportConfig::http_port(port)));
    let err = supervisor
        .request(EngineRequest::query("{ users }"))
        .await
        .expect_err("request must fail");
    match err {
        EngineError::KnownDomain { code, message } => {
            assert_eq!(code, "P2002");
            assert!(message.contains("unique violation"), "got: {message}");
        }
        other => panic!("expected known domain error, got {other:?}"),
    }
    supervisor.stop().await;
}

#[tokio::test]
async fn http_error_status_without_json_is_unknown_domain() {
    let dir = TempDir::new().expect("tempdir");
    let binary = write_script(&dir, READY_SLEEPER);
    let (listener, port) = bound_port_listener().await;
    let _captured = spawn_tcp_responder(
        listener,
        Arc::new(|_, _, _| (500, None, "Internal Server Error".to_string())),
    );

    let supervisor =
        EngineSupervisor::new(EngineConfig::new(binary, TransportConfig::http_port(port)));
    let err = supervisor
        .request(EngineRequest::query("{ users }"))
        .await
        .expect_err("request must fail");
    match err {
        EngineError::UnknownDomain { message } => {
            assert!(message.contains("http 500"), "got: {message}");
        }
        other => panic!("expected unknown domain error, got {other:?}"),
    }
    supervisor.stop().await;
}

#[tokio::test]
async fn batch_round_trip_reports_per_query_outcomes() {
    let dir = TempDir::new().expect("tempdir");
    let binary = write_script(&dir, READY_SLEEPER);
    let (listener, port) = bound_port_listener().await;
    let mut captured = spawn_tcp_responder(
        listener,
        Arc::new(|_, _, _| {
            (
                200,
                None,
                r#"{"batchResult":[{"data":{"a":1}},{"errors":[{"error":"gone","user_facing_error":{"is_panic":false,"message":"record not found","error_code":"P2025"}}]}]}"#
                    .to_string(),
            )
        }),
    );

    let supervisor =
        EngineSupervisor::new(EngineConfig::new(binary, TransportConfig::http_port(port)));
    let outcomes = supervisor
        .request_batch(BatchRequest::new(["query { a }", "query { b }"]).transactional(true))
        .await
        .expect("batch dispatch succeeds");

    assert_eq!(outcomes.len(), 2);
    assert_eq!(
        outcomes[0].as_ref().expect("first item succeeds").data,
        json!({"a": 1})
    );
    match &outcomes[1] {
        Err(EngineError::KnownDomain { code, .. }) => assert_eq!(code, "P2025"),
        other => panic!("expected known domain error, got {other:?}"),
    }

    let (_, body) = captured.recv().await.expect("captured request");
    let parsed: serde_json::Value = serde_json::from_str(&body).expect("batch body is json");
    assert_eq!(
        parsed,
        json!({
            "batch": [
                {"variables": {}, "query": "query { a }"},
                {"variables": {}, "query": "query { b }"},
            ],
            "transaction": true,
        })
    );
    supervisor.stop().await;
}

#[tokio::test]
async fn transaction_lifecycle_hits_the_documented_routes() {
    let dir = TempDir::new().expect("tempdir");
    let binary = write_script(&dir, READY_SLEEPER);
    let (listener, port) = bound_port_listener().await;
    let mut captured = spawn_tcp_responder(
        listener,
        Arc::new(|served, _, _| match served {
            0 => (200, None, r#"{"id":"tx-123"}"#.to_string()),
            2 => (200, None, r#"{"id":"tx-456"}"#.to_string()),
            _ => (200, None, "{}".to_string()),
        }),
    );

    let supervisor =
        EngineSupervisor::new(EngineConfig::new(binary, TransportConfig::http_port(port)));

    let tx = supervisor
        .transaction_begin(TransactionOptions::default())
        .await
        .expect("begin succeeds");
    assert_eq!(tx.id, "tx-123");
    supervisor
        .transaction_commit(&tx.id)
        .await
        .expect("commit succeeds");

    let tx2 = supervisor
        .transaction_begin(TransactionOptions::default())
        .await
        .expect("second begin succeeds");
    supervisor
        .transaction_rollback(&tx2.id)
        .await
        .expect("rollback succeeds");

    let (head, body) = captured.recv().await.expect("begin request");
    assert!(head.starts_with("POST /transaction/start "), "got: {head}");
    assert_eq!(body, r#"{"max_wait":2000,"timeout":5000}"#);

    let (head, _) = captured.recv().await.expect("commit request");
    assert!(head.starts_with("POST /transaction/tx-123/commit "), "got: {head}");

    let _ = captured.recv().await.expect("second begin request");
    let (head, _) = captured.recv().await.expect("rollback request");
    assert!(head.starts_with("POST /transaction/tx-456/rollback "), "got: {head}");

    supervisor.stop().await;
}

#[tokio::test]
async fn start_waits_for_the_ready_line() {
    let dir = TempDir::new().expect("tempdir");
    let binary = write_script(
        &dir,
        r#"#!/bin/sh
sleep 0.5
printf '%s\n' '{"timestamp":"2024-01-01T00:00:00Z","level":"info","target":"engine","fields":{"message":"Started http server on 127.0.0.1"}}'
exec sleep 300
"#,
    );

    let supervisor = EngineSupervisor::new(EngineConfig::new(binary, TransportConfig::http()));
    let started = Instant::now();
    supervisor.start().await.expect("start succeeds");
    assert!(
        started.elapsed() >= Duration::from_millis(400),
        "start returned before the engine announced readiness"
    );
    assert_eq!(supervisor.state(), SupervisorState::Running);
    supervisor.stop().await;
}

#[tokio::test]
async fn exit_before_ready_is_an_initialization_error() {
    let dir = TempDir::new().expect("tempdir");
    let binary = write_script(
        &dir,
        r#"#!/bin/sh
echo 'bind failed: address already in use' >&2
sleep 0.3
exit 1
"#,
    );

    let supervisor = EngineSupervisor::new(EngineConfig::new(binary, TransportConfig::http()));
    let err = supervisor.start().await.expect_err("start must fail");
    match err {
        EngineError::Initialization { message, exit_code } => {
            assert_eq!(exit_code, Some(1));
            assert!(message.contains("bind failed"), "got: {message}");
        }
        other => panic!("expected initialization error, got {other:?}"),
    }
    assert_eq!(supervisor.state(), SupervisorState::Crashed);
}

#[tokio::test]
async fn dropped_connection_is_retried_without_a_respawn() {
    let dir = TempDir::new().expect("tempdir");
    let binary = write_script(
        &dir,
        r#"#!/bin/sh
echo spawn >> "$SPAWN_LOG"
printf '%s\n' '{"timestamp":"2024-01-01T00:00:00Z","level":"info","target":"engine","fields":{"message":"Started http server on 127.0.0.1"}}'
exec sleep 300
"#,
    );
    let spawn_log = dir.path().join("spawns");
    let (listener, port) = bound_port_listener().await;
    let mut captured = spawn_tcp_responder(
        listener,
        Arc::new(|served, _, _| {
            if served == 0 {
                // Close without answering; the engine process itself stays up.
                (0, None, String::new())
            } else {
                (200, None, r#"{"data":{"ok":true}}"#.to_string())
            }
        }),
    );

    let supervisor = EngineSupervisor::new(
        EngineConfig::new(binary, TransportConfig::http_port(port))
            .env_var("SPAWN_LOG", spawn_log.display().to_string()),
    );
    let response = supervisor
        .request(EngineRequest::query("{ ok }"))
        .await
        .expect("retried request succeeds");
    assert_eq!(response.data, json!({"ok": true}));

    // Both attempts hit the wire, served by the same engine process.
    let _ = captured.recv().await.expect("first attempt");
    let _ = captured.recv().await.expect("second attempt");
    assert_eq!(count_lines(&spawn_log), 1);
    assert_eq!(supervisor.state(), SupervisorState::Running);
    supervisor.stop().await;
}

#[tokio::test]
async fn unix_socket_round_trip_and_cleanup() {
    let dir = TempDir::new().expect("tempdir");
    let binary = write_script(&dir, READY_SLEEPER);
    let socket_path = dir.path().join("engine.sock");
    let listener = tokio::net::UnixListener::bind(&socket_path).expect("bind unix socket");
    let mut captured = spawn_unix_responder(
        listener,
        Arc::new(|_, _, _| (200, None, r#"{"data":{"ok":true}}"#.to_string())),
    );

    let supervisor = EngineSupervisor::new(EngineConfig::new(
        binary,
        TransportConfig::http_unix_at(&socket_path),
    ));
    let response = supervisor
        .request(EngineRequest::query("{ ok }"))
        .await
        .expect("request succeeds");
    assert_eq!(response.data, json!({"ok": true}));

    let (head, body) = captured.recv().await.expect("captured request");
    assert!(head.starts_with("POST / HTTP/1.1"), "got: {head}");
    assert_eq!(body, r#"{"variables":{},"query":"{ ok }"}"#);

    supervisor.stop().await;
    assert!(!socket_path.exists(), "socket file survived the stop");
}

#[tokio::test]
async fn registry_shutdown_stops_running_engines() {
    let dir = TempDir::new().expect("tempdir");
    let binary = write_script(&dir, READY_SLEEPER);

    let registry = SupervisorRegistry::new();
    let supervisor = EngineSupervisor::with_registry(
        EngineConfig::new(binary, TransportConfig::http()),
        Arc::clone(&registry),
    );
    supervisor.start().await.expect("start succeeds");
    assert_eq!(registry.count().await, 1);

    registry.shutdown_all().await;
    assert_eq!(supervisor.state(), SupervisorState::Stopped);
    assert_eq!(registry.count().await, 0);
}
