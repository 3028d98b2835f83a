//! Spawn contract and policies for a supervised engine.

use std::collections::HashMap;
use std::env;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Environment variable overriding the configured engine binary path.
pub const ENV_BINARY_OVERRIDE: &str = "ENGINE_BINARY_PATH";

/// Environment variable disabling restarts and request retries.
pub const ENV_NO_RETRY: &str = "ENGINE_NO_RETRY";

/// Default environment variable telling the engine where its config lives.
pub const DEFAULT_CONFIG_PATH_VAR: &str = "ENGINE_CONFIG_PATH";

/// Default log message prefix announcing that the http server is up.
pub const DEFAULT_READY_PREFIX: &str = "Started http server";

/// Default flag used to pass a TCP port to the engine.
pub const DEFAULT_PORT_FLAG: &str = "--port";

/// Default flag used to pass a Unix socket path to the engine.
pub const DEFAULT_SOCKET_FLAG: &str = "--unix-path";

/// Default grace given to in-flight requests during `stop()`.
pub const DEFAULT_STOP_GRACE: Duration = Duration::from_secs(5);

/// Default SIGTERM-to-SIGKILL window when terminating the child.
pub const DEFAULT_TERMINATE_GRACE: Duration = Duration::from_secs(2);

/// Restart and request retry budgets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Consecutive process starts allowed before giving up.
    pub max_starts: u32,
    /// Transparent retries of a single failed request.
    pub max_request_retries: u32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_starts: 2,
            max_request_retries: 2,
        }
    }
}

impl RetryConfig {
    /// Budgets honoring the `ENGINE_NO_RETRY` escape hatch.
    #[must_use]
    pub fn from_env() -> Self {
        if env::var_os(ENV_NO_RETRY).is_some() {
            Self::disabled()
        } else {
            Self::default()
        }
    }

    /// One start, no retries.
    #[must_use]
    pub const fn disabled() -> Self {
        Self {
            max_starts: 1,
            max_request_retries: 0,
        }
    }
}

/// Where the http engine listens.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum HttpEndpoint {
    /// Loopback TCP; `None` reserves a free port at spawn time.
    Tcp { port: Option<u16> },
    /// Unix domain socket; `None` generates a unique path under the temp dir.
    Unix { socket_path: Option<PathBuf> },
}

/// Transport selection, fixed for the lifetime of a supervisor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransportConfig {
    /// Line-delimited JSON-RPC over the child's stdin and stdout.
    Stdio {
        /// Optional handshake method dispatched right after spawning; its
        /// completion is the ready signal. Without one the engine counts as
        /// ready as soon as it is spawned.
        handshake: Option<String>,
    },
    /// HTTP against a local endpoint the child binds.
    Http {
        endpoint: HttpEndpoint,
        /// An info-level log message starting with this prefix marks the
        /// server as ready.
        ready_prefix: String,
        /// Flag used to hand the endpoint to the engine on the command line.
        endpoint_flag: String,
    },
}

impl TransportConfig {
    /// Stdio transport that is ready at spawn.
    #[must_use]
    pub fn stdio() -> Self {
        Self::Stdio { handshake: None }
    }

    /// Stdio transport gated on a handshake RPC.
    #[must_use]
    pub fn stdio_with_handshake(method: impl Into<String>) -> Self {
        Self::Stdio {
            handshake: Some(method.into()),
        }
    }

    /// HTTP over a free loopback port.
    #[must_use]
    pub fn http() -> Self {
        Self::Http {
            endpoint: HttpEndpoint::Tcp { port: None },
            ready_prefix: DEFAULT_READY_PREFIX.to_string(),
            endpoint_flag: DEFAULT_PORT_FLAG.to_string(),
        }
    }

    /// HTTP over a fixed loopback port.
    #[must_use]
    pub fn http_port(port: u16) -> Self {
        Self::Http {
            endpoint: HttpEndpoint::Tcp { port: Some(port) },
            ready_prefix: DEFAULT_READY_PREFIX.to_string(),
            endpoint_flag: DEFAULT_PORT_FLAG.to_string(),
        }
    }

    /// HTTP over a generated Unix socket path.
    #[must_use]
    pub fn http_unix() -> Self {
        Self::Http {
            endpoint: HttpEndpoint::Unix { socket_path: None },
            ready_prefix: DEFAULT_READY_PREFIX.to_string(),
            endpoint_flag: DEFAULT_SOCKET_FLAG.to_string(),
        }
    }

    /// HTTP over a fixed Unix socket path.
    #[must_use]
    pub fn http_unix_at(socket_path: impl Into<PathBuf>) -> Self {
        Self::Http {
            endpoint: HttpEndpoint::Unix {
                socket_path: Some(socket_path.into()),
            },
            ready_prefix: DEFAULT_READY_PREFIX.to_string(),
            endpoint_flag: DEFAULT_SOCKET_FLAG.to_string(),
        }
    }
}

/// Everything needed to spawn and talk to one engine.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub binary_path: PathBuf,
    pub args: Vec<String>,
    pub env: HashMap<String, String>,
    pub working_dir: Option<PathBuf>,
    /// Path exported to the engine through `config_path_var`.
    pub config_path: Option<PathBuf>,
    pub config_path_var: String,
    pub transport: TransportConfig,
    pub retry: RetryConfig,
    /// Ask the engine to emit query events.
    pub log_queries: bool,
    /// Force ANSI colors in engine output unless `NO_COLOR` is set.
    pub force_colors: bool,
    /// Grace given to in-flight requests during `stop()`.
    pub stop_grace: Duration,
    /// SIGTERM-to-SIGKILL window when terminating the child.
    pub terminate_grace: Duration,
}

impl EngineConfig {
    #[must_use]
    pub fn new(binary_path: impl Into<PathBuf>, transport: TransportConfig) -> Self {
        Self {
            binary_path: binary_path.into(),
            args: Vec::new(),
            env: HashMap::new(),
            working_dir: None,
            config_path: None,
            config_path_var: DEFAULT_CONFIG_PATH_VAR.to_string(),
            transport,
            retry: RetryConfig::default(),
            log_queries: false,
            force_colors: false,
            stop_grace: DEFAULT_STOP_GRACE,
            terminate_grace: DEFAULT_TERMINATE_GRACE,
        }
    }

    #[must_use]
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    #[must_use]
    pub fn args(mut self, args: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    #[must_use]
    pub fn env_var(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    #[must_use]
    pub fn working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    #[must_use]
    pub fn config_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config_path = Some(path.into());
        self
    }

    #[must_use]
    pub fn config_path_var(mut self, name: impl Into<String>) -> Self {
        self.config_path_var = name.into();
        self
    }

    #[must_use]
    pub fn retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    #[must_use]
    pub fn log_queries(mut self, enabled: bool) -> Self {
        self.log_queries = enabled;
        self
    }

    #[must_use]
    pub fn force_colors(mut self, enabled: bool) -> Self {
        self.force_colors = enabled;
        self
    }

    #[must_use]
    pub fn stop_grace(mut self, grace: Duration) -> Self {
        self.stop_grace = grace;
        self
    }

    #[must_use]
    pub fn terminate_grace(mut self, grace: Duration) -> Self {
        self.terminate_grace = grace;
        self
    }

    /// Binary path honoring the `ENGINE_BINARY_PATH` override.
    #[must_use]
    pub fn resolved_binary(&self) -> PathBuf {
        env::var_os(ENV_BINARY_OVERRIDE).map_or_else(|| self.binary_path.clone(), PathBuf::from)
    }

    /// Extra environment handed to the child on top of the inherited one.
    ///
    /// Explicit entries from `env` always win. `RUST_BACKTRACE` and
    /// `RUST_LOG` get defaults only when neither the config nor the parent
    /// process provides them.
    #[must_use]
    pub fn child_env(&self) -> HashMap<String, String> {
        let mut env = self.env.clone();
        if let Some(path) = &self.config_path {
            env.entry(self.config_path_var.clone())
                .or_insert_with(|| path.display().to_string());
        }
        if self.log_queries {
            env.entry("LOG_QUERIES".to_string())
                .or_insert_with(|| "true".to_string());
        }
        if self.force_colors && env::var_os("NO_COLOR").is_none() {
            env.entry("CLICOLOR_FORCE".to_string())
                .or_insert_with(|| "1".to_string());
        }
        if !env.contains_key("RUST_BACKTRACE") && env::var_os("RUST_BACKTRACE").is_none() {
            env.insert("RUST_BACKTRACE".to_string(), "1".to_string());
        }
        if !env.contains_key("RUST_LOG") && env::var_os("RUST_LOG").is_none() {
            env.insert("RUST_LOG".to_string(), "info".to_string());
        }
        env
    }
}

/// Serializes tests that touch process-global environment variables against
/// the tests that read them through `resolved_binary` or `child_env`.
#[cfg(test)]
pub(crate) fn env_lock() -> std::sync::MutexGuard<'static, ()> {
    static LOCK: std::sync::Mutex<()> = std::sync::Mutex::new(());
    LOCK.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}
