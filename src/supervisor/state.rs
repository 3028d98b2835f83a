//! Supervisor lifecycle states.

use serde::{Deserialize, Serialize};

/// Lifecycle of a supervised engine session.
///
/// `Crashed` is recoverable while the restart budget lasts; `Stopped` is
/// recoverable only through an explicit `start()`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum SupervisorState {
    /// No start has been attempted yet.
    #[default]
    NotStarted,
    /// A spawn is underway; the ready signal has not arrived.
    Starting,
    /// The engine is serving requests.
    Running,
    /// An orderly shutdown is in progress.
    Stopping,
    /// The session ended on request.
    Stopped,
    /// The engine died unexpectedly.
    Crashed,
}

impl SupervisorState {
    /// Whether requests may still be issued in this state.
    #[must_use]
    pub const fn accepts_requests(self) -> bool {
        matches!(
            self,
            Self::NotStarted | Self::Starting | Self::Running | Self::Crashed
        )
    }

    /// Whether a live child process may exist in this state.
    #[must_use]
    pub const fn has_process(self) -> bool {
        matches!(self, Self::Starting | Self::Running | Self::Stopping)
    }

    /// Whether an orderly shutdown has begun or finished.
    #[must_use]
    pub const fn stop_begun(self) -> bool {
        matches!(self, Self::Stopping | Self::Stopped)
    }
}

/// Holds the current state and logs every transition.
#[derive(Debug, Clone, Default)]
pub struct StateMachine {
    state: SupervisorState,
}

impl StateMachine {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn state(&self) -> SupervisorState {
        self.state
    }

    /// Move to `to`, returning the state that was left.
    pub fn transition(&mut self, to: SupervisorState) -> SupervisorState {
        tracing::debug!(from = ?self.state, to = ?to, "State transition");
        std::mem::replace(&mut self.state, to)
    }
}
