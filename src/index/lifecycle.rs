//! Index lifecycle notifications
//!
//! `Refreshing(t)`: content below `t` may be incomplete, as of now.
//! `Synced(t)`: content up to `t` is complete and durable.
//!
//! Delivery uses a tokio broadcast channel. Sending never waits: with no
//! subscribers the event is simply dropped, and a subscriber that falls more
//! than the channel capacity behind sees `RecvError::Lagged`. The latest
//! event is also kept so late observers can read the current state.

use serde::Serialize;
use std::fmt;
use std::sync::Mutex;
use tokio::sync::broadcast;

/// Default number of buffered events per subscriber
pub const DEFAULT_LIFECYCLE_CAPACITY: usize = 64;

/// Advisory consistency state of an index
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum IndexState {
    Refreshing,
    Synced,
}

impl fmt::Display for IndexState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IndexState::Refreshing => write!(f, "refreshing"),
            IndexState::Synced => write!(f, "synced"),
        }
    }
}

/// A state paired with the timestamp it refers to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct LifecycleEvent {
    pub state: IndexState,
    pub timestamp_ms: i64,
}

/// Fire-and-forget lifecycle sink shared by the index adapters
#[derive(Debug)]
pub struct LifecycleNotifier {
    tx: broadcast::Sender<LifecycleEvent>,
    latest: Mutex<Option<LifecycleEvent>>,
}

impl Default for LifecycleNotifier {
    fn default() -> Self {
        Self::new(DEFAULT_LIFECYCLE_CAPACITY)
    }
}

impl LifecycleNotifier {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self {
            tx,
            latest: Mutex::new(None),
        }
    }

    pub fn notify(&self, state: IndexState, timestamp_ms: i64) {
        let event = LifecycleEvent {
            state,
            timestamp_ms,
        };

        if let Ok(mut latest) = self.latest.lock() {
            *latest = Some(event);
        }

        // Err only means nobody is listening
        let receivers = self.tx.send(event).unwrap_or(0);
        tracing::debug!(%state, timestamp_ms, receivers, "Index lifecycle change");
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LifecycleEvent> {
        self.tx.subscribe()
    }

    /// Most recent event, if any was announced
    pub fn latest(&self) -> Option<LifecycleEvent> {
        self.latest.lock().ok().and_then(|latest| *latest)
    }
}
