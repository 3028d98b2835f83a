//! Classified failures surfaced by the supervisor.
//!
//! The taxonomy is closed: every transport fault, engine exit, and error
//! payload maps onto one of five variants. Variants are cloneable because a
//! single crash resolves every pending request with the same error.

use thiserror::Error;

use crate::engine::{ExitSummary, PanicDetails};
use crate::transport::{RequestError, RpcError};

/// Errors produced by a supervised engine session.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum EngineError {
    /// The engine never reached the running state.
    #[error("engine failed to initialize: {message}")]
    Initialization {
        message: String,
        exit_code: Option<i32>,
    },

    /// The engine became unreachable mid-session. The only retryable variant.
    #[error("connection to engine lost: {message}")]
    ConnectionLost { message: String },

    /// The engine rejected the request with a recognized error code.
    #[error("engine error {code}: {message}")]
    KnownDomain { code: String, message: String },

    /// The engine reported an error without a recognized code.
    #[error("engine error: {message}")]
    UnknownDomain { message: String },

    /// The engine hit an internal panic.
    #[error("engine panicked: {0}")]
    Panic(PanicDetails),
}

impl EngineError {
    /// Whether a request that failed with this error may be retried.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::ConnectionLost { .. })
    }

    /// The engine-assigned error code, for recognized domain errors.
    #[must_use]
    pub fn error_code(&self) -> Option<&str> {
        match self {
            Self::KnownDomain { code, .. } => Some(code),
            _ => None,
        }
    }

    /// Classify the error half of an RPC response.
    ///
    /// The `data` payload is consulted first: an `is_panic` flag wins, then a
    /// message paired with an `error_code`, then a bare message. Responses
    /// without usable data fall back to the outer message.
    #[must_use]
    pub fn from_rpc_error(error: RpcError) -> Self {
        let RpcError { message, data } = error;
        let Some(data) = data else {
            return Self::UnknownDomain { message };
        };
        if data.is_panic.unwrap_or(false) {
            let reason = data.message.unwrap_or(message);
            return Self::Panic(PanicDetails {
                reason,
                file: None,
                line: None,
                column: None,
                backtrace: None,
            });
        }
        match (data.message, data.error_code) {
            (Some(msg), Some(code)) => Self::KnownDomain { code, message: msg },
            (Some(msg), None) => Self::UnknownDomain { message: msg },
            (None, Some(code)) => Self::KnownDomain { code, message },
            (None, None) => Self::UnknownDomain { message },
        }
    }

    /// Classify one entry of an http `errors` array.
    #[must_use]
    pub fn from_request_error(error: RequestError) -> Self {
        if let Some(user) = error.user_facing_error {
            if user.is_panic.unwrap_or(false) {
                let reason = user
                    .message
                    .or(error.error)
                    .unwrap_or_else(|| "engine panicked".to_string());
                return Self::Panic(PanicDetails {
                    reason,
                    file: None,
                    line: None,
                    column: None,
                    backtrace: None,
                });
            }
            let message = user
                .message
                .or(error.error)
                .unwrap_or_else(|| "unknown engine error".to_string());
            return match user.error_code {
                Some(code) => Self::KnownDomain { code, message },
                None => Self::UnknownDomain { message },
            };
        }
        Self::UnknownDomain {
            message: error
                .error
                .unwrap_or_else(|| "unknown engine error".to_string()),
        }
    }

    /// Classify a transport-level http failure.
    #[must_use]
    pub fn from_reqwest(error: &reqwest::Error) -> Self {
        let message = error.to_string();
        if error.is_connect() || error.is_timeout() {
            return Self::ConnectionLost { message };
        }
        if error.is_decode() || error.is_status() || error.is_builder() || error.is_redirect() {
            return Self::UnknownDomain { message };
        }
        if error.is_request() || error.is_body() {
            // The socket dropped mid-exchange; the engine is likely gone.
            return Self::ConnectionLost { message };
        }
        Self::UnknownDomain { message }
    }
}

/// Classify an unexpected engine exit.
///
/// A captured panic takes priority over the raw status: exit code 255 paired
/// with a panic log, or a SIGABRT, is a panic. Exit code 126 means the binary
/// could not run on this platform. Otherwise a crash during startup is an
/// initialization failure and a crash mid-session is a lost connection, both
/// carrying whatever diagnostics were accumulated.
#[must_use]
pub fn classify_exit(
    summary: ExitSummary,
    last_panic: Option<PanicDetails>,
    last_error: Option<String>,
    stderr: &str,
    during_start: bool,
) -> EngineError {
    if let Some(details) = last_panic {
        return EngineError::Panic(details);
    }

    #[cfg(unix)]
    let aborted = summary.signal == Some(nix::sys::signal::Signal::SIGABRT as i32);
    #[cfg(not(unix))]
    let aborted = false;
    if aborted {
        let stderr = stderr.trim();
        return EngineError::Panic(PanicDetails {
            reason: "engine terminated by SIGABRT".to_string(),
            file: None,
            line: None,
            column: None,
            backtrace: (!stderr.is_empty()).then(|| stderr.to_string()),
        });
    }

    if summary.code == Some(126) {
        return EngineError::Initialization {
            message: "engine binary is not executable on this platform".to_string(),
            exit_code: Some(126),
        };
    }

    let context = last_error
        .filter(|message| !message.is_empty())
        .unwrap_or_else(|| stderr.trim().to_string());
    let mut message = format!("engine {}", summary.describe());
    if !context.is_empty() {
        message.push_str(": ");
        message.push_str(&context);
    }

    if during_start {
        EngineError::Initialization {
            message,
            exit_code: summary.code,
        }
    } else {
        EngineError::ConnectionLost { message }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{RpcErrorData, UserFacingError};

    fn rpc_error(data: Option<RpcErrorData>) -> RpcError {
        RpcError {
            message: "request failed".to_string(),
            data,
        }
    }

    #[test]
    fn display_formats() {
        let init = EngineError::Initialization {
            message: "exited with code 1".to_string(),
            exit_code: Some(1),
        };
        assert_eq!(
            init.to_string(),
            "engine failed to initialize: exited with code 1"
        );

        let known = EngineError::KnownDomain {
            code: "P2001".to_string(),
            message: "bad column".to_string(),
        };
        assert_eq!(known.to_string(), "engine error P2001: bad column");
    }

    #[test]
    fn only_connection_lost_is_retryable() {
        assert!(EngineError::ConnectionLost {
            message: "gone".to_string()
        }
        .is_retryable());
        assert!(!EngineError::UnknownDomain {
            message: "nope".to_string()
        }
        .is_retryable());
        assert!(!EngineError::Initialization {
            message: "nope".to_string(),
            exit_code: None
        }
        .is_retryable());
    }

    #[test]
    fn rpc_data_with_code_is_known_domain() {
        let error = EngineError::from_rpc_error(rpc_error(Some(RpcErrorData {
            is_panic: Some(false),
            error_code: Some("P2001".to_string()),
            message: Some("bad column".to_string()),
        })));
        assert_eq!(
            error,
            EngineError::KnownDomain {
                code: "P2001".to_string(),
                message: "bad column".to_string(),
            }
        );
        assert_eq!(error.error_code(), Some("P2001"));
    }

    #[test]
    fn rpc_data_without_code_is_unknown_domain() {
        let error = EngineError::from_rpc_error(rpc_error(Some(RpcErrorData {
            is_panic: None,
            error_code: None,
            message: Some("something odd".to_string()),
        })));
        assert_eq!(
            error,
            EngineError::UnknownDomain {
                message: "something odd".to_string()
            }
        );
    }

    #[test]
    fn rpc_without_data_uses_outer_message() {
        let error = EngineError::from_rpc_error(rpc_error(None));
        assert_eq!(
            error,
            EngineError::UnknownDomain {
                message: "request failed".to_string()
            }
        );
    }

    #[test]
    fn rpc_panic_flag_wins_over_code() {
        let error = EngineError::from_rpc_error(rpc_error(Some(RpcErrorData {
            is_panic: Some(true),
            error_code: Some("P2001".to_string()),
            message: Some("thread panicked".to_string()),
        })));
        match error {
            EngineError::Panic(details) => assert_eq!(details.reason, "thread panicked"),
            other => panic!("expected panic, got {other:?}"),
        }
    }

    #[test]
    fn request_error_maps_user_facing_code() {
        let error = EngineError::from_request_error(RequestError {
            error: Some("raw".to_string()),
            user_facing_error: Some(UserFacingError {
                is_panic: Some(false),
                message: Some("unique constraint".to_string()),
                error_code: Some("P2002".to_string()),
            }),
        });
        assert_eq!(error.error_code(), Some("P2002"));
    }

    #[test]
    fn request_error_without_user_facing_is_unknown() {
        let error = EngineError::from_request_error(RequestError {
            error: Some("raw failure".to_string()),
            user_facing_error: None,
        });
        assert_eq!(
            error,
            EngineError::UnknownDomain {
                message: "raw failure".to_string()
            }
        );
    }

    #[test]
    fn exit_with_recorded_panic_is_panic() {
        let summary = ExitSummary {
            code: Some(255),
            signal: None,
        };
        let details = PanicDetails {
            reason: "boom".to_string(),
            file: None,
            line: None,
            column: None,
            backtrace: None,
        };
        let error = classify_exit(summary, Some(details.clone()), None, "", false);
        assert_eq!(error, EngineError::Panic(details));
    }

    #[cfg(unix)]
    #[test]
    fn sigabrt_is_panic_with_stderr_backtrace() {
        let summary = ExitSummary {
            code: None,
            signal: Some(nix::sys::signal::Signal::SIGABRT as i32),
        };
        match classify_exit(summary, None, None, "stack trace\n", false) {
            EngineError::Panic(details) => {
                assert_eq!(details.reason, "engine terminated by SIGABRT");
                assert_eq!(details.backtrace.as_deref(), Some("stack trace"));
            }
            other => panic!("expected panic, got {other:?}"),
        }
    }

    #[test]
    fn exit_126_is_initialization_failure() {
        let summary = ExitSummary {
            code: Some(126),
            signal: None,
        };
        match classify_exit(summary, None, None, "", true) {
            EngineError::Initialization { exit_code, message } => {
                assert_eq!(exit_code, Some(126));
                assert!(message.contains("not executable"));
            }
            other => panic!("expected initialization error, got {other:?}"),
        }
    }

    #[test]
    fn crash_during_start_is_initialization_with_stderr() {
        let summary = ExitSummary {
            code: Some(1),
            signal: None,
        };
        match classify_exit(summary, None, None, "missing config\n", true) {
            EngineError::Initialization { message, exit_code } => {
                assert_eq!(exit_code, Some(1));
                assert!(message.contains("exited with code 1"));
                assert!(message.contains("missing config"));
            }
            other => panic!("expected initialization error, got {other:?}"),
        }
    }

    #[test]
    fn crash_mid_session_is_connection_lost_with_last_error() {
        let summary = ExitSummary {
            code: Some(1),
            signal: None,
        };
        match classify_exit(summary, None, Some("db gone".to_string()), "ignored", false) {
            EngineError::ConnectionLost { message } => {
                assert!(message.contains("exited with code 1"));
                assert!(message.contains("db gone"));
            }
            other => panic!("expected connection lost, got {other:?}"),
        }
    }
}
