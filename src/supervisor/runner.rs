//! The engine supervisor.
//!
//! Connects the process spawner, line readers, log classifier, and transport
//! into one long-lived session: callers issue requests, the supervisor keeps
//! the engine alive within its restart budget and fails every in-flight
//! request exactly once when it cannot.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};
use std::time::Duration;

use futures_core::Stream;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::{EngineConfig, HttpEndpoint, TransportConfig};
use crate::engine::{
    classify_line, is_stderr_noise, line_channel, probe_version, Classified, EngineProcess,
    ExitSummary, LogLevel, LogRecord, DEFAULT_LINE_CAPACITY,
};
use crate::error::{classify_exit, EngineError};
use crate::supervisor::{
    filtered_stream, EngineEvent, EventHub, EventKind, RequestTable, StateMachine,
    SupervisorRegistry, SupervisorState,
};
use crate::transport::{
    BatchRequest, EngineRequest, EngineResponse, Sent, SocketHttpTransport, StdioJsonRpcTransport,
    TransactionInfo, TransactionOptions, Transport,
};

/// Bound on draining the output routers once the child has exited.
const OUTPUT_DRAIN_GRACE: Duration = Duration::from_secs(1);

/// Supervises one external engine process.
///
/// The handle is cheap to clone; all clones drive the same session. Requests
/// may be issued concurrently from any number of tasks and are multiplexed
/// over the configured transport.
#[derive(Clone)]
pub struct EngineSupervisor {
    inner: Arc<Inner>,
}

/// Weak handle that does not keep the supervisor alive.
#[derive(Clone)]
pub struct WeakSupervisor(Weak<Inner>);

impl WeakSupervisor {
    #[must_use]
    pub fn upgrade(&self) -> Option<EngineSupervisor> {
        self.0.upgrade().map(|inner| EngineSupervisor { inner })
    }
}

struct Inner {
    id: Uuid,
    config: EngineConfig,
    lifecycle: Mutex<Lifecycle>,
    table: RequestTable,
    events: EventHub,
    state_tx: watch::Sender<SupervisorState>,
    registry: Option<Arc<SupervisorRegistry>>,
    version_cache: Mutex<Option<String>>,
}

#[derive(Default)]
struct Lifecycle {
    machine: StateMachine,
    start_count: u32,
    session: Option<Session>,
    start_waiters: Vec<oneshot::Sender<Result<(), EngineError>>>,
    stop_waiters: Vec<oneshot::Sender<()>>,
    /// Completion gate for the current start attempt's ready signal.
    ready_tx: Option<oneshot::Sender<Result<(), EngineError>>>,
    last_panic: Option<crate::engine::PanicDetails>,
    last_error: Option<String>,
    stderr: String,
}

impl Lifecycle {
    /// Most specific failure derivable from the accumulated diagnostics.
    fn most_specific_failure(&self) -> EngineError {
        if let Some(details) = &self.last_panic {
            return EngineError::Panic(details.clone());
        }
        let context = self
            .last_error
            .clone()
            .filter(|message| !message.is_empty())
            .unwrap_or_else(|| self.stderr.trim().to_string());
        let message = if context.is_empty() {
            format!(
                "engine did not stay up after {} start attempt(s)",
                self.start_count
            )
        } else {
            format!(
                "engine did not stay up after {} start attempt(s): {context}",
                self.start_count
            )
        };
        EngineError::Initialization {
            message,
            exit_code: None,
        }
    }
}

struct Session {
    transport: Arc<dyn Transport>,
    cancel: CancellationToken,
    socket_path: Option<PathBuf>,
    pid: Option<u32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OutputStream {
    Stdout,
    Stderr,
}

impl EngineSupervisor {
    #[must_use]
    pub fn new(config: EngineConfig) -> Self {
        Self::build(config, None)
    }

    /// A supervisor that reports its lifetime to a shared registry.
    #[must_use]
    pub fn with_registry(config: EngineConfig, registry: Arc<SupervisorRegistry>) -> Self {
        Self::build(config, Some(registry))
    }

    fn build(config: EngineConfig, registry: Option<Arc<SupervisorRegistry>>) -> Self {
        let (state_tx, _state_rx) = watch::channel(SupervisorState::NotStarted);
        Self {
            inner: Arc::new(Inner {
                id: Uuid::new_v4(),
                config,
                lifecycle: Mutex::new(Lifecycle::default()),
                table: RequestTable::new(),
                events: EventHub::default(),
                state_tx,
                registry,
                version_cache: Mutex::new(None),
            }),
        }
    }

    /// Unique id of this supervisor instance.
    #[must_use]
    pub fn id(&self) -> Uuid {
        self.inner.id
    }

    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> SupervisorState {
        *self.inner.state_tx.borrow()
    }

    #[must_use]
    pub fn downgrade(&self) -> WeakSupervisor {
        WeakSupervisor(Arc::downgrade(&self.inner))
    }

    /// Subscribe to every engine event in emission order.
    ///
    /// A subscriber that falls more than the channel capacity behind loses
    /// the oldest events.
    #[must_use]
    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<EngineEvent> {
        self.inner.events.subscribe()
    }

    /// Stream of engine events of one kind.
    #[must_use]
    pub fn on(&self, kind: EventKind) -> impl Stream<Item = EngineEvent> {
        filtered_stream(self.subscribe(), kind)
    }

    /// Engine `--version` output, cached after the first successful probe.
    ///
    /// # Errors
    ///
    /// Returns `Initialization` when the binary cannot be launched.
    pub async fn version(&self) -> Result<String, EngineError> {
        let mut cache = self.inner.version_cache.lock().await;
        if let Some(version) = cache.as_ref() {
            return Ok(version.clone());
        }
        let binary = self.inner.config.resolved_binary();
        let version =
            probe_version(&binary)
                .await
                .map_err(|err| EngineError::Initialization {
                    message: err.to_string(),
                    exit_code: None,
                })?;
        *cache = Some(version.clone());
        Ok(version)
    }

    /// Start the engine session.
    ///
    /// Idempotent: when the engine is already running this returns
    /// immediately, and concurrent callers share a single spawn attempt.
    /// A stopped supervisor may be started again.
    ///
    /// # Errors
    ///
    /// Returns `Initialization` when the engine cannot reach the running
    /// state within the restart budget, or the panic that brought the last
    /// session down when one was recorded.
    pub async fn start(&self) -> Result<(), EngineError> {
        loop {
            let action = {
                let mut lc = self.inner.lifecycle.lock().await;
                match lc.machine.state() {
                    SupervisorState::Running => return Ok(()),
                    SupervisorState::Starting => {
                        let (tx, rx) = oneshot::channel();
                        lc.start_waiters.push(tx);
                        StartAction::Wait(rx)
                    }
                    SupervisorState::Stopping => {
                        let (tx, rx) = oneshot::channel();
                        lc.stop_waiters.push(tx);
                        StartAction::AwaitStop(rx)
                    }
                    state @ (SupervisorState::NotStarted
                    | SupervisorState::Stopped
                    | SupervisorState::Crashed) => {
                        // Only crash recovery is bounded by the restart
                        // budget; an explicit start from a clean state
                        // begins a fresh session.
                        if state == SupervisorState::Crashed {
                            let budget = self.inner.config.retry.max_starts.max(1);
                            if lc.start_count >= budget {
                                return Err(lc.most_specific_failure());
                            }
                        }
                        lc.start_count += 1;
                        self.inner.set_state(&mut lc, SupervisorState::Starting);
                        let (tx, rx) = oneshot::channel();
                        lc.start_waiters.push(tx);
                        StartAction::Perform(rx)
                    }
                }
            };
            match action {
                StartAction::Wait(rx) => return flatten_start(rx.await),
                StartAction::AwaitStop(rx) => {
                    let _ = rx.await;
                }
                StartAction::Perform(rx) => {
                    let outcome = self.spawn_session().await;
                    self.finish_start(outcome).await;
                    return flatten_start(rx.await);
                }
            }
        }
    }

    /// Stop the engine and release its resources.
    ///
    /// In-flight requests get a bounded grace period, then any survivors are
    /// failed with `ConnectionLost`. Stopping is idempotent, concurrent
    /// callers share one shutdown, and a stop issued mid-start waits for the
    /// start to settle first. Stopping never fails; termination problems are
    /// logged and the state still ends at `Stopped`.
    pub async fn stop(&self) {
        loop {
            let action = {
                let mut lc = self.inner.lifecycle.lock().await;
                match lc.machine.state() {
                    SupervisorState::Stopped => StopAction::Done,
                    SupervisorState::NotStarted => {
                        self.inner.set_state(&mut lc, SupervisorState::Stopped);
                        StopAction::Done
                    }
                    SupervisorState::Stopping => {
                        let (tx, rx) = oneshot::channel();
                        lc.stop_waiters.push(tx);
                        StopAction::Wait(rx)
                    }
                    SupervisorState::Starting => {
                        let (tx, rx) = oneshot::channel();
                        lc.start_waiters.push(tx);
                        StopAction::AwaitStart(rx)
                    }
                    SupervisorState::Running | SupervisorState::Crashed => {
                        self.inner.set_state(&mut lc, SupervisorState::Stopping);
                        if let Some(cancel) =
                            lc.session.as_ref().map(|session| session.cancel.clone())
                        {
                            let (tx, rx) = oneshot::channel();
                            lc.stop_waiters.push(tx);
                            StopAction::Shutdown { cancel, rx }
                        } else {
                            // Crashed and already reaped; nothing left to terminate.
                            lc.start_count = 0;
                            self.inner.set_state(&mut lc, SupervisorState::Stopped);
                            StopAction::Finish(std::mem::take(&mut lc.stop_waiters))
                        }
                    }
                }
            };
            match action {
                StopAction::Done => break,
                StopAction::Finish(waiters) => {
                    for tx in waiters {
                        let _ = tx.send(());
                    }
                    break;
                }
                StopAction::Wait(rx) => {
                    let _ = rx.await;
                    break;
                }
                StopAction::AwaitStart(rx) => {
                    let _ = rx.await;
                }
                StopAction::Shutdown { cancel, rx } => {
                    let grace = self.inner.config.stop_grace;
                    if tokio::time::timeout(grace, self.inner.table.wait_idle())
                        .await
                        .is_err()
                    {
                        tracing::warn!(
                            supervisor = %self.inner.id,
                            "Stop grace elapsed with requests still in flight"
                        );
                        self.inner
                            .table
                            .sweep(&EngineError::ConnectionLost {
                                message: "engine stopped".to_string(),
                            })
                            .await;
                    }
                    cancel.cancel();
                    let _ = rx.await;
                    break;
                }
            }
        }
        if let Some(registry) = &self.inner.registry {
            registry.deregister(self.inner.id).await;
        }
    }

    /// Issue one request, starting the engine first if needed.
    ///
    /// Failed requests are retried transparently with fresh correlation ids
    /// when the failure is retryable, the retry budget allows it, and no
    /// panic was recorded. A successful round trip resets the consecutive
    /// start counter.
    ///
    /// # Errors
    ///
    /// Returns the classified engine error: `Initialization` when the engine
    /// cannot be (re)started, `ConnectionLost` when it died mid-request and
    /// retries ran out, `KnownDomain`/`UnknownDomain` for engine-reported
    /// failures, and `Panic` when the engine panicked.
    pub async fn request(&self, request: EngineRequest) -> Result<EngineResponse, EngineError> {
        let mut attempt: u32 = 0;
        loop {
            if self.state().stop_begun() {
                return Err(EngineError::ConnectionLost {
                    message: "engine has been stopped".to_string(),
                });
            }
            self.start().await?;

            match self.dispatch_once(&request).await {
                Ok(response) => {
                    let mut lc = self.inner.lifecycle.lock().await;
                    lc.start_count = 0;
                    return Ok(response);
                }
                Err(err) => {
                    if let Some(next) = self.next_attempt(&err, attempt).await {
                        attempt = next;
                        tracing::debug!(
                            supervisor = %self.inner.id,
                            attempt,
                            error = %err,
                            "Retrying engine request"
                        );
                        continue;
                    }
                    return Err(self.prefer_recorded_panic(err).await);
                }
            }
        }
    }

    /// Issue a batch of queries as one unit.
    ///
    /// Only the http transport can express batches; on stdio this fails with
    /// `UnknownDomain`. The same retry rules as [`EngineSupervisor::request`]
    /// apply to whole-batch failures.
    ///
    /// # Errors
    ///
    /// Returns an error when the batch as a whole fails; per-query failures
    /// come back inside the `Ok` vector.
    pub async fn request_batch(
        &self,
        batch: BatchRequest,
    ) -> Result<Vec<Result<EngineResponse, EngineError>>, EngineError> {
        let mut attempt: u32 = 0;
        loop {
            if self.state().stop_begun() {
                return Err(EngineError::ConnectionLost {
                    message: "engine has been stopped".to_string(),
                });
            }
            self.start().await?;
            let transport = self.current_transport().await?;

            let (id, mut swept) = self.inner.table.register("batch").await;
            let outcome = tokio::select! {
                biased;
                outcome = &mut swept => match outcome {
                    Ok(Err(err)) => Err(err),
                    _ => Err(EngineError::ConnectionLost {
                        message: "request dropped during engine shutdown".to_string(),
                    }),
                },
                result = transport.send_batch(&batch) => {
                    let _ = self.inner.table.take(id).await;
                    result
                }
            };

            match outcome {
                Ok(items) => {
                    let mut lc = self.inner.lifecycle.lock().await;
                    lc.start_count = 0;
                    return Ok(items);
                }
                Err(err) => {
                    if let Some(next) = self.next_attempt(&err, attempt).await {
                        attempt = next;
                        tracing::debug!(
                            supervisor = %self.inner.id,
                            attempt,
                            error = %err,
                            "Retrying engine batch"
                        );
                        continue;
                    }
                    return Err(self.prefer_recorded_panic(err).await);
                }
            }
        }
    }

    /// Open an interactive transaction (http transport only).
    ///
    /// # Errors
    ///
    /// Returns the classified engine error, including `UnknownDomain` on
    /// transports that cannot express transactions.
    pub async fn transaction_begin(
        &self,
        options: TransactionOptions,
    ) -> Result<TransactionInfo, EngineError> {
        self.transaction_gate().await?;
        let transport = self.current_transport().await?;
        transport.transaction_begin(&options).await
    }

    /// Commit an open transaction.
    ///
    /// # Errors
    ///
    /// Same conditions as [`EngineSupervisor::transaction_begin`].
    pub async fn transaction_commit(&self, id: &str) -> Result<(), EngineError> {
        self.transaction_gate().await?;
        let transport = self.current_transport().await?;
        transport.transaction_commit(id).await
    }

    /// Roll back an open transaction.
    ///
    /// # Errors
    ///
    /// Same conditions as [`EngineSupervisor::transaction_begin`].
    pub async fn transaction_rollback(&self, id: &str) -> Result<(), EngineError> {
        self.transaction_gate().await?;
        let transport = self.current_transport().await?;
        transport.transaction_rollback(id).await
    }

    async fn transaction_gate(&self) -> Result<(), EngineError> {
        if self.state().stop_begun() {
            return Err(EngineError::ConnectionLost {
                message: "engine has been stopped".to_string(),
            });
        }
        self.start().await
    }

    /// Decide whether a failed attempt may be retried; returns the next
    /// attempt number if so.
    async fn next_attempt(&self, err: &EngineError, attempt: u32) -> Option<u32> {
        if !err.is_retryable() {
            return None;
        }
        if attempt >= self.inner.config.retry.max_request_retries {
            return None;
        }
        let lc = self.inner.lifecycle.lock().await;
        if lc.last_panic.is_some() {
            return None;
        }
        if lc.start_count >= self.inner.config.retry.max_starts.max(1) {
            return None;
        }
        Some(attempt + 1)
    }

    /// A recorded panic is more specific than whatever error won the race.
    async fn prefer_recorded_panic(&self, err: EngineError) -> EngineError {
        if matches!(err, EngineError::Panic(_)) {
            return err;
        }
        let lc = self.inner.lifecycle.lock().await;
        match &lc.last_panic {
            Some(details) => EngineError::Panic(details.clone()),
            None => err,
        }
    }

    async fn current_transport(&self) -> Result<Arc<dyn Transport>, EngineError> {
        let lc = self.inner.lifecycle.lock().await;
        lc.session
            .as_ref()
            .map(|session| Arc::clone(&session.transport))
            .ok_or_else(|| EngineError::ConnectionLost {
                message: "engine is not running".to_string(),
            })
    }

    /// Register, dispatch, and await one request without retry handling.
    async fn dispatch_once(&self, request: &EngineRequest) -> Result<EngineResponse, EngineError> {
        let transport = self.current_transport().await?;
        let (id, mut rx) = self.inner.table.register(&request.method).await;
        tracing::trace!(
            supervisor = %self.inner.id,
            id,
            method = %request.method,
            "Dispatching engine request"
        );

        tokio::select! {
            biased;
            outcome = &mut rx => flatten_outcome(outcome),
            sent = transport.send(id, request) => match sent {
                Ok(Sent::Completed(response)) => {
                    if self.inner.table.take(id).await {
                        Ok(response)
                    } else {
                        // A crash sweep claimed the entry first; its verdict wins.
                        flatten_outcome(rx.await)
                    }
                }
                Ok(Sent::Dispatched) => flatten_outcome(rx.await),
                Err(err) => {
                    if self.inner.table.take(id).await {
                        Err(err)
                    } else {
                        flatten_outcome(rx.await)
                    }
                }
            },
        }
    }

    /// Spawn the engine and wait for its ready signal.
    async fn spawn_session(&self) -> Result<(), EngineError> {
        let config = &self.inner.config;
        let binary = config.resolved_binary();

        let mut args = config.args.clone();
        let mut http_port = None;
        let mut socket_path = None;
        if let TransportConfig::Http {
            endpoint,
            endpoint_flag,
            ..
        } = &config.transport
        {
            match endpoint {
                HttpEndpoint::Tcp { port } => {
                    let port = match port {
                        Some(port) => *port,
                        None => free_port().await?,
                    };
                    args.push(endpoint_flag.clone());
                    args.push(port.to_string());
                    http_port = Some(port);
                }
                HttpEndpoint::Unix {
                    socket_path: configured,
                } => {
                    let path = configured.clone().unwrap_or_else(|| {
                        std::env::temp_dir().join(format!("engine-{}.sock", self.inner.id))
                    });
                    args.push(endpoint_flag.clone());
                    args.push(path.display().to_string());
                    socket_path = Some(path);
                }
            }
        }

        {
            // Diagnostics are per-attempt.
            let mut lc = self.inner.lifecycle.lock().await;
            lc.last_panic = None;
            lc.last_error = None;
            lc.stderr.clear();
        }

        let env = config.child_env();
        tracing::info!(
            supervisor = %self.inner.id,
            binary = %binary.display(),
            "Starting engine"
        );
        let mut process = EngineProcess::spawn(&binary, &args, &env, config.working_dir.as_deref())
            .map_err(|err| EngineError::Initialization {
                message: err.to_string(),
                exit_code: None,
            })?;
        let pid = process.id();
        let stdin = process.take_stdin();
        let stdout = process.take_stdout();
        let stderr = process.take_stderr();

        let transport: Arc<dyn Transport> = match &config.transport {
            TransportConfig::Stdio { .. } => {
                let Some(stdin) = stdin else {
                    return Err(EngineError::Initialization {
                        message: "engine stdin pipe was not available".to_string(),
                        exit_code: None,
                    });
                };
                Arc::new(StdioJsonRpcTransport::new(stdin))
            }
            TransportConfig::Http { .. } => match (http_port, &socket_path) {
                (Some(port), _) => Arc::new(SocketHttpTransport::tcp(port)?),
                (None, Some(path)) => Arc::new(SocketHttpTransport::unix(path)),
                (None, None) => {
                    return Err(EngineError::Initialization {
                        message: "no http endpoint was assigned".to_string(),
                        exit_code: None,
                    });
                }
            },
        };

        let cancel = CancellationToken::new();
        let (ready_tx, ready_rx) = oneshot::channel();
        {
            let mut lc = self.inner.lifecycle.lock().await;
            lc.session = Some(Session {
                transport: Arc::clone(&transport),
                cancel: cancel.clone(),
                socket_path: socket_path.clone(),
                pid,
            });
            lc.ready_tx = matches!(config.transport, TransportConfig::Http { .. })
                .then_some(ready_tx);
        }

        let mut routers = Vec::new();
        if let Some(stdout) = stdout {
            routers.push(self.spawn_output_router(
                OutputStream::Stdout,
                line_channel(stdout, DEFAULT_LINE_CAPACITY),
                Arc::clone(&transport),
                cancel.clone(),
            ));
        }
        if let Some(stderr) = stderr {
            routers.push(self.spawn_output_router(
                OutputStream::Stderr,
                line_channel(stderr, DEFAULT_LINE_CAPACITY),
                Arc::clone(&transport),
                cancel.clone(),
            ));
        }
        self.spawn_monitor(process, cancel, routers);

        if let Some(registry) = &self.inner.registry {
            registry.register(self, socket_path).await;
        }

        match &config.transport {
            TransportConfig::Stdio { handshake } => {
                if let Some(method) = handshake {
                    let request = EngineRequest::rpc(method.clone(), Value::Object(Default::default()));
                    if let Err(err) = self.dispatch_once(&request).await {
                        return Err(EngineError::Initialization {
                            message: format!("handshake `{method}` failed: {err}"),
                            exit_code: None,
                        });
                    }
                }
                Ok(())
            }
            TransportConfig::Http { .. } => match ready_rx.await {
                Ok(outcome) => outcome,
                Err(_) => Err(EngineError::Initialization {
                    message: "engine exited before announcing its endpoint".to_string(),
                    exit_code: None,
                }),
            },
        }
    }

    /// Settle the start attempt and wake every waiter with its outcome.
    async fn finish_start(&self, outcome: Result<(), EngineError>) {
        let (outcome, waiters) = {
            let mut lc = self.inner.lifecycle.lock().await;
            let outcome = if lc.machine.state() == SupervisorState::Starting {
                match &outcome {
                    Ok(()) => self.inner.set_state(&mut lc, SupervisorState::Running),
                    Err(_) => {
                        self.inner.set_state(&mut lc, SupervisorState::Crashed);
                        if let Some(session) = &lc.session {
                            session.cancel.cancel();
                        }
                    }
                }
                outcome
            } else if outcome.is_ok() {
                // The engine died between its ready signal and now.
                Err(lc.most_specific_failure())
            } else {
                outcome
            };
            (outcome, std::mem::take(&mut lc.start_waiters))
        };
        if let Err(err) = &outcome {
            tracing::warn!(supervisor = %self.inner.id, error = %err, "Engine start failed");
        }
        for tx in waiters {
            let _ = tx.send(outcome.clone());
        }
    }

    fn spawn_output_router(
        &self,
        source: OutputStream,
        mut lines: mpsc::Receiver<String>,
        transport: Arc<dyn Transport>,
        cancel: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;

                    () = cancel.cancelled() => break,
                    line = lines.recv() => {
                        let Some(line) = line else { break };
                        Inner::route_line(&inner, &transport, source, &line).await;
                    }
                }
            }
        })
    }

    fn spawn_monitor(
        &self,
        mut process: EngineProcess,
        cancel: CancellationToken,
        routers: Vec<tokio::task::JoinHandle<()>>,
    ) {
        let inner = Arc::clone(&self.inner);
        let terminate_grace = self.inner.config.terminate_grace;
        tokio::spawn(async move {
            let (status, requested) = tokio::select! {
                biased;

                () = cancel.cancelled() => {
                    let status = match process.graceful_terminate(terminate_grace).await {
                        Ok(status) => Some(status),
                        Err(err) => {
                            tracing::warn!(error = %err, "Failed to terminate engine cleanly");
                            process.wait().await.ok()
                        }
                    };
                    (status, true)
                }
                status = process.wait() => (status.ok(), false),
            };
            // The pipes may still hold the child's last lines; exit
            // classification reads the diagnostics they feed.
            if tokio::time::timeout(OUTPUT_DRAIN_GRACE, futures_util::future::join_all(routers))
                .await
                .is_err()
            {
                cancel.cancel();
                tracing::debug!(
                    supervisor = %inner.id,
                    "Engine output routers outlived the drain grace"
                );
            }
            let summary = status.map(ExitSummary::from_status);
            Inner::handle_exit(&inner, summary, requested).await;
        });
    }
}

impl Inner {
    fn set_state(&self, lc: &mut Lifecycle, to: SupervisorState) {
        lc.machine.transition(to);
        self.state_tx.send_replace(to);
    }

    /// Route one child output line: responses to the request table,
    /// everything else through the log classifier.
    async fn route_line(
        inner: &Arc<Self>,
        transport: &Arc<dyn Transport>,
        source: OutputStream,
        line: &str,
    ) {
        if let Some(response) = transport.on_line(line) {
            Self::route_response(inner, response).await;
            return;
        }
        match classify_line(line) {
            Classified::Log(record) => Self::handle_log(inner, record).await,
            Classified::Panic(details) => Self::handle_panic(inner, details).await,
            Classified::Fatal { message, backtrace } => {
                Self::handle_fatal(inner, message, backtrace).await;
            }
            Classified::Opaque(text) => {
                if source == OutputStream::Stderr {
                    if !is_stderr_noise(&text) {
                        let mut lc = inner.lifecycle.lock().await;
                        lc.stderr.push_str(&text);
                        lc.stderr.push('\n');
                    }
                } else {
                    tracing::warn!(
                        supervisor = %inner.id,
                        line = %text,
                        "Could not parse engine output line"
                    );
                }
            }
        }
    }

    async fn route_response(inner: &Arc<Self>, response: crate::transport::RpcResponse) {
        let id = response.id;
        let outcome = match (response.result, response.error) {
            (Some(result), _) => Ok(EngineResponse::new(result)),
            (None, Some(error)) => Err(EngineError::from_rpc_error(error)),
            (None, None) => Err(EngineError::UnknownDomain {
                message: "engine response carried neither result nor error".to_string(),
            }),
        };
        if !inner.table.resolve(id, outcome).await {
            tracing::warn!(
                supervisor = %inner.id,
                id,
                "Dropping response for unknown request id"
            );
        }
    }

    async fn handle_log(inner: &Arc<Self>, record: LogRecord) {
        if record.level == LogLevel::Info {
            if let TransportConfig::Http { ready_prefix, .. } = &inner.config.transport {
                if record
                    .message()
                    .is_some_and(|message| message.starts_with(ready_prefix.as_str()))
                {
                    let mut lc = inner.lifecycle.lock().await;
                    if let Some(tx) = lc.ready_tx.take() {
                        let _ = tx.send(Ok(()));
                    }
                }
            }
        }
        if record.level == LogLevel::Error {
            let text = record.message().map_or_else(
                || Value::Object(record.fields.clone()).to_string(),
                ToString::to_string,
            );
            let mut lc = inner.lifecycle.lock().await;
            lc.last_error = Some(text);
        }
        inner.events.publish(EngineEvent::Log(record));
    }

    /// A panic sentinel is fatal for the whole session: record it, fail
    /// every pending request with it, and bring the process down.
    async fn handle_panic(inner: &Arc<Self>, details: crate::engine::PanicDetails) {
        tracing::error!(
            supervisor = %inner.id,
            reason = %details.reason,
            "Engine panic detected"
        );
        let error = EngineError::Panic(details.clone());
        {
            let mut lc = inner.lifecycle.lock().await;
            lc.last_panic = Some(details.clone());
            if let Some(tx) = lc.ready_tx.take() {
                let _ = tx.send(Err(error.clone()));
            }
            if lc.machine.state() == SupervisorState::Running {
                inner.set_state(&mut lc, SupervisorState::Crashed);
            }
            if let Some(session) = &lc.session {
                session.cancel.cancel();
            }
        }
        inner.table.sweep(&error).await;
        inner.events.publish(EngineEvent::Panic(details));
    }

    async fn handle_fatal(inner: &Arc<Self>, message: String, backtrace: Option<String>) {
        tracing::warn!(supervisor = %inner.id, %message, "Engine reported a fatal error");
        let mut lc = inner.lifecycle.lock().await;
        lc.last_error = Some(match &backtrace {
            Some(trace) => format!("{message}\n{trace}"),
            None => message.clone(),
        });
        if let Some(tx) = lc.ready_tx.take() {
            let _ = tx.send(Err(EngineError::Initialization {
                message,
                exit_code: None,
            }));
        }
    }

    /// The child exited. Requested exits settle `stop()`; everything else is
    /// a crash that fails all pending requests exactly once.
    async fn handle_exit(inner: &Arc<Self>, summary: Option<ExitSummary>, requested: bool) {
        let mut stop_waiters = Vec::new();
        let error = {
            let mut lc = inner.lifecycle.lock().await;
            let state = lc.machine.state();
            let (socket, pid) = lc
                .session
                .take()
                .map_or((None, None), |session| (session.socket_path, session.pid));
            if let Some(path) = &socket {
                remove_socket_file(path);
            }
            tracing::debug!(
                supervisor = %inner.id,
                pid,
                requested,
                summary = ?summary,
                "Engine process exited"
            );

            match state {
                SupervisorState::Stopping => {
                    // A cleanly stopped session leaves the next explicit
                    // start with a fresh restart budget.
                    lc.start_count = 0;
                    inner.set_state(&mut lc, SupervisorState::Stopped);
                    stop_waiters = std::mem::take(&mut lc.stop_waiters);
                    None
                }
                SupervisorState::Starting | SupervisorState::Running | SupervisorState::Crashed => {
                    let summary = summary.unwrap_or(ExitSummary {
                        code: None,
                        signal: None,
                    });
                    let classified = classify_exit(
                        summary,
                        lc.last_panic.clone(),
                        lc.last_error.clone(),
                        &lc.stderr,
                        state == SupervisorState::Starting,
                    );
                    if state != SupervisorState::Crashed {
                        inner.set_state(&mut lc, SupervisorState::Crashed);
                    }
                    if let Some(tx) = lc.ready_tx.take() {
                        let _ = tx.send(Err(classified.clone()));
                    }
                    Some(classified)
                }
                SupervisorState::NotStarted | SupervisorState::Stopped => None,
            }
        };

        if let Some(err) = error {
            tracing::error!(supervisor = %inner.id, error = %err, "Engine exited unexpectedly");
            inner.table.sweep(&err).await;
            inner.events.publish(EngineEvent::Log(LogRecord::synthesized(
                LogLevel::Error,
                "engine::process",
                err.to_string(),
            )));
        } else {
            // Entries that slipped in during the shutdown window.
            inner
                .table
                .sweep(&EngineError::ConnectionLost {
                    message: "engine stopped".to_string(),
                })
                .await;
        }
        for tx in stop_waiters {
            let _ = tx.send(());
        }
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        if let Ok(lc) = self.lifecycle.try_lock() {
            if let Some(session) = &lc.session {
                session.cancel.cancel();
            }
        }
    }
}

fn flatten_start(
    outcome: Result<Result<(), EngineError>, oneshot::error::RecvError>,
) -> Result<(), EngineError> {
    outcome.unwrap_or_else(|_| {
        Err(EngineError::ConnectionLost {
            message: "supervisor dropped during start".to_string(),
        })
    })
}

fn flatten_outcome(
    outcome: Result<Result<EngineResponse, EngineError>, oneshot::error::RecvError>,
) -> Result<EngineResponse, EngineError> {
    outcome.unwrap_or_else(|_| {
        Err(EngineError::ConnectionLost {
            message: "request dropped during engine shutdown".to_string(),
        })
    })
}

/// Reserve a free loopback port by binding port zero and releasing it.
async fn free_port() -> Result<u16, EngineError> {
    let listener = tokio::net::TcpListener::bind(("127.0.0.1", 0))
        .await
        .map_err(|err| EngineError::Initialization {
            message: format!("failed to reserve a port: {err}"),
            exit_code: None,
        })?;
    let port = listener
        .local_addr()
        .map_err(|err| EngineError::Initialization {
            message: format!("failed to read the reserved port: {err}"),
            exit_code: None,
        })?
        .port();
    drop(listener);
    Ok(port)
}

fn remove_socket_file(path: &Path) {
    match std::fs::remove_file(path) {
        Ok(()) => tracing::debug!(path = %path.display(), "Removed engine socket"),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
        Err(err) => {
            tracing::warn!(path = %path.display(), error = %err, "Failed to remove engine socket");
        }
    }
}

enum StartAction {
    /// Another caller is starting; wait for its outcome.
    Wait(oneshot::Receiver<Result<(), EngineError>>),
    /// A stop is in flight; wait for it, then reevaluate.
    AwaitStop(oneshot::Receiver<()>),
    /// This caller performs the spawn.
    Perform(oneshot::Receiver<Result<(), EngineError>>),
}

enum StopAction {
    /// Already stopped (or never started).
    Done,
    /// Stopped inline; wake these waiters.
    Finish(Vec<oneshot::Sender<()>>),
    /// Another caller is stopping; wait for it.
    Wait(oneshot::Receiver<()>),
    /// A start is in flight; wait for it to settle, then reevaluate.
    AwaitStart(oneshot::Receiver<Result<(), EngineError>>),
    /// This caller drives the shutdown.
    Shutdown {
        cancel: CancellationToken,
        rx: oneshot::Receiver<()>,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{env_lock, RetryConfig};

    fn missing_binary_config() -> EngineConfig {
        EngineConfig::new("/nonexistent/engine-binary", TransportConfig::stdio())
    }

    #[tokio::test]
    async fn start_with_missing_binary_is_initialization_error() {
        let _env = env_lock();
        let supervisor = EngineSupervisor::new(missing_binary_config());
        let err = supervisor.start().await.unwrap_err();
        match err {
            EngineError::Initialization { message, .. } => {
                assert!(message.contains("not found"), "unexpected message: {message}");
            }
            other => panic!("expected initialization error, got {other:?}"),
        }
        assert_eq!(supervisor.state(), SupervisorState::Crashed);
    }

    #[tokio::test]
    async fn start_budget_is_enforced() {
        let _env = env_lock();
        let supervisor = EngineSupervisor::new(missing_binary_config());
        assert!(supervisor.start().await.is_err());
        assert!(supervisor.start().await.is_err());

        // Third start is rejected without another spawn attempt.
        let err = supervisor.start().await.unwrap_err();
        match err {
            EngineError::Initialization { message, .. } => {
                assert!(
                    message.contains("start attempt"),
                    "unexpected message: {message}"
                );
            }
            other => panic!("expected initialization error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn explicit_stop_resets_the_start_budget() {
        let _env = env_lock();
        let supervisor = EngineSupervisor::new(missing_binary_config());
        assert!(supervisor.start().await.is_err());
        assert!(supervisor.start().await.is_err());
        supervisor.stop().await;
        assert_eq!(supervisor.state(), SupervisorState::Stopped);

        // The next explicit start spawns again instead of rejecting on the
        // spent budget.
        let err = supervisor.start().await.unwrap_err();
        match err {
            EngineError::Initialization { message, .. } => {
                assert!(message.contains("not found"), "unexpected message: {message}");
            }
            other => panic!("expected initialization error, got {other:?}"),
        }

        // The failure that followed the stop counts from zero again.
        let err = supervisor.start().await.unwrap_err();
        match err {
            EngineError::Initialization { message, .. } => {
                assert!(message.contains("not found"), "unexpected message: {message}");
            }
            other => panic!("expected initialization error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn stop_before_start_reaches_stopped() {
        let supervisor = EngineSupervisor::new(missing_binary_config());
        supervisor.stop().await;
        assert_eq!(supervisor.state(), SupervisorState::Stopped);
    }

    #[tokio::test]
    async fn requests_after_stop_are_refused() {
        let supervisor = EngineSupervisor::new(missing_binary_config());
        supervisor.stop().await;
        let err = supervisor
            .request(EngineRequest::query("{ me }"))
            .await
            .unwrap_err();
        match err {
            EngineError::ConnectionLost { message } => assert!(message.contains("stopped")),
            other => panic!("expected connection lost, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn request_propagates_start_failure() {
        let _env = env_lock();
        let supervisor = EngineSupervisor::new(
            missing_binary_config().retry(RetryConfig::disabled()),
        );
        let err = supervisor
            .request(EngineRequest::query("{ me }"))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Initialization { .. }));
    }

    #[tokio::test]
    async fn stop_is_idempotent() {
        let supervisor = EngineSupervisor::new(missing_binary_config());
        supervisor.stop().await;
        supervisor.stop().await;
        assert_eq!(supervisor.state(), SupervisorState::Stopped);
    }

    #[tokio::test]
    async fn weak_handle_drops_with_supervisor() {
        let supervisor = EngineSupervisor::new(missing_binary_config());
        let weak = supervisor.downgrade();
        assert!(weak.upgrade().is_some());
        drop(supervisor);
        assert!(weak.upgrade().is_none());
    }

    #[tokio::test]
    async fn version_probe_of_missing_binary_fails() {
        let _env = env_lock();
        let supervisor = EngineSupervisor::new(missing_binary_config());
        assert!(matches!(
            supervisor.version().await,
            Err(EngineError::Initialization { .. })
        ));
    }
}
