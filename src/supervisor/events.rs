//! Engine observability events.

use futures_core::Stream;
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::StreamExt;

use crate::engine::{LogLevel, LogRecord, PanicDetails};

/// Default capacity of the event channel.
pub const DEFAULT_EVENT_CAPACITY: usize = 256;

/// Event kinds a subscriber can filter on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Info,
    Warn,
    Error,
    Query,
    Panic,
}

/// One event delivered to subscribers, in engine emission order.
#[derive(Debug, Clone, PartialEq)]
pub enum EngineEvent {
    /// A structured log record from the engine.
    Log(LogRecord),
    /// A fatal panic notification.
    Panic(PanicDetails),
}

impl EngineEvent {
    /// Kind used by subscription filters; trace and debug records map to
    /// none and are only visible to unfiltered subscribers.
    #[must_use]
    pub fn kind(&self) -> Option<EventKind> {
        match self {
            Self::Panic(_) => Some(EventKind::Panic),
            Self::Log(record) => match record.level {
                LogLevel::Info => Some(EventKind::Info),
                LogLevel::Warn => Some(EventKind::Warn),
                LogLevel::Error => Some(EventKind::Error),
                LogLevel::Query => Some(EventKind::Query),
                LogLevel::Trace | LogLevel::Debug => None,
            },
        }
    }

    /// Primary human-readable text of the event.
    #[must_use]
    pub fn message(&self) -> Option<&str> {
        match self {
            Self::Log(record) => record.message(),
            Self::Panic(details) => Some(&details.reason),
        }
    }
}

/// Fan-out hub for engine events.
///
/// Sending never blocks; a subscriber that falls more than the channel
/// capacity behind loses the oldest events.
#[derive(Debug, Clone)]
pub struct EventHub {
    tx: broadcast::Sender<EngineEvent>,
}

impl Default for EventHub {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_CAPACITY)
    }
}

impl EventHub {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Publish to all current subscribers. A hub without subscribers simply
    /// drops the event.
    pub fn publish(&self, event: EngineEvent) {
        let _ = self.tx.send(event);
    }

    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.tx.subscribe()
    }
}

/// Turn a subscription into a stream of events of one kind.
///
/// Lagged gaps are skipped silently; order within the surviving events is
/// preserved.
pub fn filtered_stream(
    rx: broadcast::Receiver<EngineEvent>,
    kind: EventKind,
) -> impl Stream<Item = EngineEvent> {
    BroadcastStream::new(rx).filter_map(move |event| match event {
        Ok(event) if event.kind() == Some(kind) => Some(event),
        _ => None,
    })
}
