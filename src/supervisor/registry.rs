//! Process-wide registry of live supervisors.
//!
//! Engine processes outlive the task that spawned them, so something has to
//! know about every running engine when the host application shuts down.
//! Supervisors report themselves here on spawn and remove themselves on
//! stop; [`SupervisorRegistry::shutdown_all`] stops whatever is left.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::Mutex;
use uuid::Uuid;

use crate::supervisor::{EngineSupervisor, WeakSupervisor};

/// One registered supervisor.
struct Registered {
    supervisor: WeakSupervisor,
    socket_path: Option<PathBuf>,
}

/// Tracks every supervisor with a live engine process.
///
/// Holds only weak handles, so registration does not keep a supervisor
/// alive; entries whose supervisor was dropped are pruned on access.
#[derive(Default)]
pub struct SupervisorRegistry {
    entries: Mutex<HashMap<Uuid, Registered>>,
}

impl SupervisorRegistry {
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Record a supervisor whose engine process is now running.
    pub async fn register(&self, supervisor: &EngineSupervisor, socket_path: Option<PathBuf>) {
        let mut entries = self.entries.lock().await;
        entries.insert(
            supervisor.id(),
            Registered {
                supervisor: supervisor.downgrade(),
                socket_path,
            },
        );
    }

    /// Remove a supervisor, typically because it stopped.
    pub async fn deregister(&self, id: Uuid) {
        self.entries.lock().await.remove(&id);
    }

    /// Number of registered supervisors, dropped ones excluded.
    pub async fn count(&self) -> usize {
        self.registered().await.len()
    }

    /// Strong handles to every registered supervisor that is still alive.
    pub async fn registered(&self) -> Vec<EngineSupervisor> {
        let mut entries = self.entries.lock().await;
        entries.retain(|_, entry| entry.supervisor.upgrade().is_some());
        entries
            .values()
            .filter_map(|entry| entry.supervisor.upgrade())
            .collect()
    }

    /// Stop every registered engine and clean up leftover socket files.
    pub async fn shutdown_all(&self) {
        let (supervisors, sockets) = {
            let mut entries = self.entries.lock().await;
            let mut supervisors = Vec::new();
            let mut sockets = Vec::new();
            for (_, entry) in entries.drain() {
                if let Some(supervisor) = entry.supervisor.upgrade() {
                    supervisors.push(supervisor);
                } else if let Some(path) = entry.socket_path {
                    // The supervisor is gone but its socket file may remain.
                    sockets.push(path);
                }
            }
            (supervisors, sockets)
        };

        tracing::info!(count = supervisors.len(), "Stopping all registered engines");
        futures_util::future::join_all(supervisors.iter().map(EngineSupervisor::stop)).await;

        for path in sockets {
            if let Err(err) = std::fs::remove_file(&path) {
                if err.kind() != std::io::ErrorKind::NotFound {
                    tracing::warn!(path = %path.display(), error = %err, "Leftover socket not removed");
                }
            }
        }
    }

    /// Block until a termination signal arrives, then stop every engine.
    ///
    /// # Errors
    ///
    /// Returns an error when the signal listeners cannot be installed.
    pub async fn run_until_shutdown(&self) -> std::io::Result<()> {
        wait_for_shutdown_signal().await?;
        tracing::info!("Received shutdown signal");
        self.shutdown_all().await;
        Ok(())
    }
}

/// Waits for SIGINT, SIGTERM, or SIGQUIT, with Ctrl-C as fallback.
#[cfg(unix)]
async fn wait_for_shutdown_signal() -> std::io::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigquit = signal(SignalKind::quit())?;

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = sigint.recv() => {}
        _ = sigterm.recv() => {}
        _ = sigquit.recv() => {}
    }
    Ok(())
}

#[cfg(not(unix))]
async fn wait_for_shutdown_signal() -> std::io::Result<()> {
    tokio::signal::ctrl_c().await
}
