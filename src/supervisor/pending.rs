//! In-flight request bookkeeping.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use tokio::sync::{oneshot, Mutex, Notify};

use crate::error::EngineError;
use crate::transport::EngineResponse;

/// How one in-flight request ends.
pub type RequestOutcome = Result<EngineResponse, EngineError>;

#[derive(Debug)]
struct PendingRequest {
    method: String,
    created_at: DateTime<Utc>,
    slot: oneshot::Sender<RequestOutcome>,
}

/// Table of in-flight requests keyed by correlation id.
///
/// Ids increase monotonically and are never reused, even across engine
/// restarts. Resolving removes the entry together with its completion slot,
/// so no request can complete twice.
#[derive(Debug)]
pub struct RequestTable {
    entries: Mutex<HashMap<u64, PendingRequest>>,
    next_id: AtomicU64,
    idle: Notify,
}

impl Default for RequestTable {
    fn default() -> Self {
        Self::new()
    }
}

impl RequestTable {
    #[must_use]
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            idle: Notify::new(),
        }
    }

    /// Allocate a fresh id and register a pending slot under it.
    pub async fn register(&self, method: &str) -> (u64, oneshot::Receiver<RequestOutcome>) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        let mut entries = self.entries.lock().await;
        entries.insert(
            id,
            PendingRequest {
                method: method.to_string(),
                created_at: Utc::now(),
                slot: tx,
            },
        );
        (id, rx)
    }

    /// Complete the request registered under `id`.
    ///
    /// Returns `false` when the id is unknown, which means the request was
    /// already resolved or the engine answered with an id it was never asked
    /// about.
    pub async fn resolve(&self, id: u64, outcome: RequestOutcome) -> bool {
        let entry = {
            let mut entries = self.entries.lock().await;
            let entry = entries.remove(&id);
            if entries.is_empty() {
                self.idle.notify_waiters();
            }
            entry
        };
        match entry {
            Some(pending) => {
                tracing::trace!(id, method = %pending.method, "Resolving request");
                let _ = pending.slot.send(outcome);
                true
            }
            None => false,
        }
    }

    /// Remove an entry without completing its slot.
    ///
    /// Used when the dispatching task finished the request locally; `false`
    /// means something else (a crash sweep) already claimed it.
    pub async fn take(&self, id: u64) -> bool {
        let mut entries = self.entries.lock().await;
        let taken = entries.remove(&id).is_some();
        if taken && entries.is_empty() {
            self.idle.notify_waiters();
        }
        taken
    }

    /// Resolve every pending request with a clone of `error`.
    pub async fn sweep(&self, error: &EngineError) -> usize {
        let drained: Vec<(u64, PendingRequest)> = {
            let mut entries = self.entries.lock().await;
            let drained = entries.drain().collect();
            self.idle.notify_waiters();
            drained
        };
        let count = drained.len();
        for (id, pending) in drained {
            let age_ms = (Utc::now() - pending.created_at).num_milliseconds();
            tracing::debug!(id, method = %pending.method, age_ms, "Sweeping pending request");
            let _ = pending.slot.send(Err(error.clone()));
        }
        count
    }

    /// Number of requests currently in flight.
    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.lock().await.is_empty()
    }

    /// Wait until no requests are in flight.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.idle.notified();
            if self.entries.lock().await.is_empty() {
                return;
            }
            notified.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Duration;

    #[tokio::test]
    async fn ids_are_monotonic_from_one() {
        let table = RequestTable::new();
        let (first, _rx1) = table.register("a").await;
        let (second, _rx2) = table.register("b").await;
        assert_eq!(first, 1);
        assert_eq!(second, 2);
    }

    #[tokio::test]
    async fn resolve_delivers_outcome_once() {
        let table = RequestTable::new();
        let (id, rx) = table.register("query").await;

        assert!(table.resolve(id, Ok(EngineResponse::new(json!(1)))).await);
        assert_eq!(rx.await.unwrap().unwrap().data, json!(1));

        // Second resolution finds nothing to resolve.
        assert!(!table.resolve(id, Ok(EngineResponse::new(json!(2)))).await);
    }

    #[tokio::test]
    async fn unknown_id_is_rejected() {
        let table = RequestTable::new();
        assert!(!table.resolve(99, Ok(EngineResponse::new(json!(null)))).await);
    }

    #[tokio::test]
    async fn sweep_fails_every_pending_request_with_same_error() {
        let table = RequestTable::new();
        let (_id1, rx1) = table.register("a").await;
        let (_id2, rx2) = table.register("b").await;

        let error = EngineError::ConnectionLost {
            message: "engine gone".to_string(),
        };
        assert_eq!(table.sweep(&error).await, 2);
        assert_eq!(table.len().await, 0);

        assert_eq!(rx1.await.unwrap().unwrap_err(), error);
        assert_eq!(rx2.await.unwrap().unwrap_err(), error);
    }

    #[tokio::test]
    async fn take_removes_without_completing() {
        let table = RequestTable::new();
        let (id, rx) = table.register("query").await;
        assert!(table.take(id).await);
        assert!(!table.take(id).await);
        // The slot was dropped, not completed.
        assert!(rx.await.is_err());
    }

    #[tokio::test]
    async fn wait_idle_returns_once_drained() {
        let table = std::sync::Arc::new(RequestTable::new());
        let (id, _rx) = table.register("query").await;

        let waiter = {
            let table = std::sync::Arc::clone(&table);
            tokio::spawn(async move { table.wait_idle().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        assert!(table.take(id).await);
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
    }
}
