//! # Event Bus
//!
//! Typed, fire-and-forget notifications from the sync engine, delivered over a
//! `tokio::sync::broadcast` channel.
//!
//! ## Overview
//!
//! Components that accept a bus (`with_event_bus`) publish what happened to
//! them; hosts subscribe to drive progress bars, alerts or audit logs.
//! Publishing never blocks and never fails the operation that produced the
//! event: callers use `emit(..).ok()`.
//!
//! ```text
//!  Checkpoints ──┐
//!  Retry / DLQ ──┤  emit   ┌──────────┐  subscribe  ┌────────────┐
//!  Breakers ─────┼────────>│ EventBus ├────────────>│ Subscriber │
//!  Resolver ─────┘         └──────────┘             └────────────┘
//! ```
//!
//! ## Usage
//!
//! ```rust
//! use core_runtime::events::{CoreEvent, EventBus, SyncEvent};
//!
//! # #[tokio::main]
//! # async fn main() {
//! let bus = EventBus::new(64);
//! let mut stream = bus.subscribe();
//!
//! bus.emit(CoreEvent::Sync(SyncEvent::CheckpointCreated {
//!     sync_id: "weekly".to_string(),
//!     operation: "playlist_build".to_string(),
//!     total_items: 10,
//! }))
//! .ok();
//!
//! let event = stream.recv().await.unwrap();
//! assert_eq!(event.description(), "Checkpoint created");
//! # }
//! ```
//!
//! ## Lagging subscribers
//!
//! A slow subscriber receives `RecvError::Lagged(n)` and keeps going; it never
//! slows down publishers. `RecvError::Closed` means every bus handle is gone.

use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::sync::broadcast;

pub use tokio::sync::broadcast::error::{RecvError, SendError};
pub use tokio::sync::broadcast::Receiver;

pub const DEFAULT_EVENT_BUFFER_SIZE: usize = 256;

// ============================================================================
// Event Types
// ============================================================================

/// Top-level event published on the bus.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", content = "payload")]
pub enum CoreEvent {
    Sync(SyncEvent),
    Breaker(BreakerEvent),
    Match(MatchEvent),
}

impl CoreEvent {
    /// Short human readable summary.
    pub fn description(&self) -> &str {
        match self {
            CoreEvent::Sync(e) => e.description(),
            CoreEvent::Breaker(e) => e.description(),
            CoreEvent::Match(e) => e.description(),
        }
    }

    pub fn severity(&self) -> EventSeverity {
        match self {
            CoreEvent::Sync(SyncEvent::ItemDeadLettered { .. }) => EventSeverity::Error,
            CoreEvent::Breaker(BreakerEvent::StateChanged { to, .. }) if to == "open" => {
                EventSeverity::Warning
            }
            CoreEvent::Sync(SyncEvent::ItemFailed { .. }) => EventSeverity::Warning,
            CoreEvent::Sync(SyncEvent::BatchCompleted { failed, .. }) if *failed > 0 => {
                EventSeverity::Warning
            }
            CoreEvent::Sync(SyncEvent::BatchCompleted { .. })
            | CoreEvent::Breaker(_)
            | CoreEvent::Match(MatchEvent::Unmatched { .. }) => EventSeverity::Info,
            _ => EventSeverity::Debug,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum EventSeverity {
    Debug,
    Info,
    Warning,
    Error,
}

/// Batch and checkpoint lifecycle.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "event")]
pub enum SyncEvent {
    CheckpointCreated {
        sync_id: String,
        operation: String,
        total_items: u64,
    },
    ItemFailed {
        sync_id: String,
        item_id: String,
        message: String,
        attempts: u32,
    },
    ItemDeadLettered {
        item_id: String,
        owner_key: String,
        reason: String,
    },
    BatchCompleted {
        sync_id: String,
        succeeded: u64,
        skipped: u64,
        failed: u64,
        dead_lettered: u64,
    },
}

impl SyncEvent {
    fn description(&self) -> &str {
        match self {
            SyncEvent::CheckpointCreated { .. } => "Checkpoint created",
            SyncEvent::ItemFailed { .. } => "Item failed",
            SyncEvent::ItemDeadLettered { .. } => "Item moved to dead-letter queue",
            SyncEvent::BatchCompleted { .. } => "Batch completed",
        }
    }
}

/// Circuit breaker transitions. States are the lowercase wire names
/// (`closed`, `open`, `half_open`).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "event")]
pub enum BreakerEvent {
    StateChanged {
        name: String,
        from: String,
        to: String,
    },
}

impl BreakerEvent {
    fn description(&self) -> &str {
        match self {
            BreakerEvent::StateChanged { .. } => "Circuit breaker state changed",
        }
    }
}

/// Match resolution outcomes.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "event")]
pub enum MatchEvent {
    Matched {
        catalog_entry_id: String,
        track_title: String,
        external_id: String,
        confidence: f64,
        from_cache: bool,
    },
    Unmatched {
        catalog_entry_id: String,
        track_title: String,
        playlist_context: String,
        near_misses: usize,
    },
}

impl MatchEvent {
    fn description(&self) -> &str {
        match self {
            MatchEvent::Matched { .. } => "Track matched",
            MatchEvent::Unmatched { .. } => "Track left unmatched",
        }
    }
}

// ============================================================================
// Event Bus
// ============================================================================

/// Cloneable handle to the broadcast channel.
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<CoreEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Publish an event. Errors only when nobody is subscribed.
    pub fn emit(&self, event: CoreEvent) -> Result<usize, SendError<CoreEvent>> {
        self.sender.send(event)
    }

    pub fn subscribe(&self) -> Receiver<CoreEvent> {
        self.sender.subscribe()
    }

    /// Subscribe through a filtering [`EventStream`].
    pub fn stream(&self) -> EventStream {
        EventStream::new(self.subscribe())
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_BUFFER_SIZE)
    }
}

impl fmt::Debug for EventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventBus")
            .field("subscriber_count", &self.subscriber_count())
            .finish()
    }
}

// ============================================================================
// Event Stream
// ============================================================================

type EventFilter = Box<dyn Fn(&CoreEvent) -> bool + Send + Sync>;

/// Receiver that skips events rejected by an optional predicate.
pub struct EventStream {
    receiver: Receiver<CoreEvent>,
    filter: Option<EventFilter>,
}

impl EventStream {
    pub fn new(receiver: Receiver<CoreEvent>) -> Self {
        Self {
            receiver,
            filter: None,
        }
    }

    pub fn filter<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&CoreEvent) -> bool + Send + Sync + 'static,
    {
        self.filter = Some(Box::new(predicate));
        self
    }

    fn accepts(&self, event: &CoreEvent) -> bool {
        self.filter.as_ref().map_or(true, |f| f(event))
    }

    pub async fn recv(&mut self) -> Result<CoreEvent, RecvError> {
        loop {
            let event = self.receiver.recv().await?;
            if self.accepts(&event) {
                return Ok(event);
            }
        }
    }

    /// Non-blocking receive. `None` when nothing matching is buffered.
    pub fn try_recv(&mut self) -> Option<Result<CoreEvent, RecvError>> {
        use tokio::sync::broadcast::error::TryRecvError;

        loop {
            match self.receiver.try_recv() {
                Ok(event) if self.accepts(&event) => return Some(Ok(event)),
                Ok(_) => continue,
                Err(TryRecvError::Empty) => return None,
                Err(TryRecvError::Lagged(n)) => return Some(Err(RecvError::Lagged(n))),
                Err(TryRecvError::Closed) => return Some(Err(RecvError::Closed)),
            }
        }
    }
}
