//! Engine event fan-out with replayable history.
//!
//! Every event goes to every listener. A listener that panics or fails is
//! isolated from the others, and one that reports itself disconnected is
//! dropped. The last `capacity` events are kept so a listener attached
//! mid-session receives recent history first.

use std::collections::VecDeque;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;

/// Default number of events retained for replay.
pub const DEFAULT_EVENT_BUFFER: usize = 500;

/// Kinds of events the engine emits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    CycleStart,
    CycleComplete,
    CycleFailed,
    AgentStart,
    AgentComplete,
    AgentFailed,
    PhaseChange,
    IssueCreated,
    IssueResolved,
    IssueFailed,
    TestResult,
    GitCheckpoint,
    GitRollback,
    RateLimit,
    SessionStatus,
    Text,
    ToolStart,
    ToolEnd,
    ReviewIteration,
    Error,
}

/// One event as delivered to listeners.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineEvent {
    #[serde(rename = "type")]
    pub event_type: EventType,
    pub data: Value,
    pub timestamp: DateTime<Utc>,
}

impl EngineEvent {
    pub fn new(event_type: EventType, data: Value) -> Self {
        Self {
            event_type,
            data,
            timestamp: Utc::now(),
        }
    }
}

/// Why a listener could not take an event.
#[derive(Debug, thiserror::Error)]
pub enum ListenerError {
    /// The listener is gone and should be removed.
    #[error("listener disconnected")]
    Disconnected,
    /// Delivery failed but the listener stays attached.
    #[error("listener failed: {0}")]
    Failed(String),
}

/// Receives engine events.
///
/// Listeners run while the bus is locked and must not emit events themselves.
pub trait EventListener: Send {
    fn on_event(&mut self, event: &EngineEvent) -> Result<(), ListenerError>;
}

impl<F> EventListener for F
where
    F: FnMut(&EngineEvent) -> Result<(), ListenerError> + Send,
{
    fn on_event(&mut self, event: &EngineEvent) -> Result<(), ListenerError> {
        self(event)
    }
}

struct ChannelListener(mpsc::UnboundedSender<EngineEvent>);

impl EventListener for ChannelListener {
    fn on_event(&mut self, event: &EngineEvent) -> Result<(), ListenerError> {
        self.0
            .send(event.clone())
            .map_err(|_| ListenerError::Disconnected)
    }
}

/// Handle used to detach a listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

struct Inner {
    listeners: Vec<(ListenerId, Box<dyn EventListener>)>,
    history: VecDeque<EngineEvent>,
    capacity: usize,
    next_id: u64,
}

/// Event bus shared by the engine and its observers.
pub struct EventBus {
    inner: Mutex<Inner>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_BUFFER)
    }
}

/// Delivers one event, containing panics. Returns false if the listener should be dropped.
fn deliver(id: ListenerId, listener: &mut Box<dyn EventListener>, event: &EngineEvent) -> bool {
    match catch_unwind(AssertUnwindSafe(|| listener.on_event(event))) {
        Ok(Ok(())) => true,
        Ok(Err(ListenerError::Disconnected)) => {
            tracing::debug!(listener = id.0, "listener disconnected, removing");
            false
        }
        Ok(Err(e)) => {
            tracing::warn!(listener = id.0, error = %e, "listener failed to handle event");
            true
        }
        Err(_) => {
            tracing::error!(listener = id.0, "listener panicked while handling event");
            true
        }
    }
}

impl EventBus {
    /// Creates a bus retaining the last `capacity` events.
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                listeners: Vec::new(),
                history: VecDeque::with_capacity(capacity.min(DEFAULT_EVENT_BUFFER)),
                capacity,
                next_id: 0,
            }),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Attaches a listener after replaying buffered history to it.
    pub fn add_listener(&self, listener: impl EventListener + 'static) -> ListenerId {
        let mut inner = self.lock();
        let id = ListenerId(inner.next_id);
        inner.next_id += 1;

        let mut listener: Box<dyn EventListener> = Box::new(listener);
        let attached = inner
            .history
            .iter()
            .all(|event| deliver(id, &mut listener, event));

        if attached {
            inner.listeners.push((id, listener));
        }
        id
    }

    /// Detaches a listener. Unknown ids are ignored.
    pub fn remove_listener(&self, id: ListenerId) {
        self.lock().listeners.retain(|(lid, _)| *lid != id);
    }

    /// Attaches a channel-backed listener.
    ///
    /// Dropping the receiver detaches it on the next emitted event.
    pub fn subscribe(&self) -> (ListenerId, mpsc::UnboundedReceiver<EngineEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.add_listener(ChannelListener(tx));
        (id, rx)
    }

    /// Records and delivers an event.
    pub fn emit(&self, event_type: EventType, data: Value) {
        let event = EngineEvent::new(event_type, data);
        tracing::trace!(event_type = ?event_type, "emitting event");

        let mut inner = self.lock();
        if inner.capacity > 0 {
            if inner.history.len() == inner.capacity {
                inner.history.pop_front();
            }
            inner.history.push_back(event.clone());
        }

        inner
            .listeners
            .retain_mut(|(id, listener)| deliver(*id, listener, &event));
    }

    /// Buffered events, oldest first.
    pub fn history(&self) -> Vec<EngineEvent> {
        self.lock().history.iter().cloned().collect()
    }

    pub fn listener_count(&self) -> usize {
        self.lock().listeners.len()
    }
}
