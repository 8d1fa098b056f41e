//! Subscribable event bus for state changes, progress and errors.
//!
//! The engine never calls into a UI directly. Host applications subscribe and
//! render whatever they receive; a bus with no subscribers drops events.

use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;

use crate::vpn::connection::ConnectionState;

const EVENT_CAPACITY: usize = 256;

// ── Event types ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub enum EngineEvent {
    /// The orchestrator moved to a new connection state.
    StateChanged(ConnectionState),
    /// Human-readable progress ("Trying next server ...").
    Progress(String),
    /// One candidate finished probing (`latency_ms == -1` when unreachable).
    ProbeCompleted {
        index: usize,
        hostname: String,
        latency_ms: i64,
    },
    /// A failover step abandoned `hostname`.
    FailedOver {
        hostname: String,
        attempt: u32,
        max_attempts: u32,
    },
    /// A user-visible error. Never emitted while failover is retrying.
    Error { code: i32, message: String },
}

// ── Bus ─────────────────────────────────────────────────────────────────────

#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<EngineEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(EVENT_CAPACITY);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.sender.subscribe()
    }

    /// Subscribe as a `Stream`. Lagged receivers see an error item and resume.
    pub fn stream(&self) -> BroadcastStream<EngineEvent> {
        BroadcastStream::new(self.sender.subscribe())
    }

    pub fn emit(&self, event: EngineEvent) {
        // No subscribers is fine
        let _ = self.sender.send(event);
    }

    pub fn fire_state_change(&self, state: &ConnectionState) {
        self.emit(EngineEvent::StateChanged(state.clone()));
    }

    pub fn fire_progress(&self, msg: impl Into<String>) {
        self.emit(EngineEvent::Progress(msg.into()));
    }

    pub fn fire_error(&self, code: i32, msg: &str) {
        self.emit(EngineEvent::Error {
            code,
            message: msg.to_string(),
        });
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
