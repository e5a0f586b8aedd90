//! # Event Bus System
//!
//! Decoupled notifications between the service components using
//! `tokio::sync::broadcast`.
//!
//! ```text
//! ┌──────────────────────┐  StateChanged   ┌──────────┐
//! │ ConnectionSupervisor ├────────────────>│          │    subscribe    ┌─────────────┐
//! └──────────────────────┘                 │          ├────────────────>│ ServiceLoop │
//! ┌──────────────────────┐  Batch*         │ EventBus │                 └─────────────┘
//! │ SyncOrchestrator     ├────────────────>│          │    subscribe    ┌─────────────┐
//! └──────────────────────┘                 │          ├────────────────>│ host / UI   │
//! ┌──────────────────────┐  Progress/State │          │                 └─────────────┘
//! │ ServiceLoop          ├────────────────>│          │
//! └──────────────────────┘                 └──────────┘
//! ```
//!
//! Connection state transitions are published here and only here; other
//! components observe the state, they never drive it.
//!
//! ## Usage
//!
//! ```rust
//! use core_runtime::events::{ConnectionEvent, ConnectionState, CoreEvent, EventBus};
//!
//! # #[tokio::main]
//! # async fn main() {
//! let bus = EventBus::new(100);
//! let mut rx = bus.subscribe();
//!
//! bus.emit(CoreEvent::Connection(ConnectionEvent::StateChanged {
//!     server_id: None,
//!     from: ConnectionState::Connecting,
//!     to: ConnectionState::SignedIn,
//! }))
//! .ok();
//!
//! assert!(matches!(rx.recv().await, Ok(CoreEvent::Connection(_))));
//! # }
//! ```
//!
//! ## Error Handling
//!
//! - **`RecvError::Lagged(n)`**: the subscriber missed `n` events. Non-fatal.
//! - **`RecvError::Closed`**: every sender is gone; treat as shutdown.

use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::sync::broadcast;

pub use tokio::sync::broadcast::error::{RecvError, SendError};
pub use tokio::sync::broadcast::Receiver;

/// Default buffer size for the event bus channel.
pub const DEFAULT_EVENT_BUFFER_SIZE: usize = 100;

// ============================================================================
// Core Event Types
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", content = "payload")]
pub enum CoreEvent {
    Connection(ConnectionEvent),
    Library(LibraryEvent),
    Playback(PlaybackEvent),
    Service(ServiceEvent),
}

impl CoreEvent {
    /// Returns a human-readable description of the event.
    pub fn description(&self) -> &str {
        match self {
            CoreEvent::Connection(e) => e.description(),
            CoreEvent::Library(e) => e.description(),
            CoreEvent::Playback(e) => e.description(),
            CoreEvent::Service(e) => e.description(),
        }
    }

    /// Returns the severity level of the event.
    pub fn severity(&self) -> EventSeverity {
        match self {
            CoreEvent::Library(LibraryEvent::BatchFailed { .. }) => EventSeverity::Error,
            CoreEvent::Connection(ConnectionEvent::StateChanged {
                to: ConnectionState::Unauthorized,
                ..
            }) => EventSeverity::Error,
            CoreEvent::Connection(ConnectionEvent::StateChanged {
                to: ConnectionState::Unreachable,
                ..
            }) => EventSeverity::Warning,
            CoreEvent::Connection(ConnectionEvent::StateChanged {
                to: ConnectionState::SignedIn,
                ..
            }) => EventSeverity::Info,
            CoreEvent::Library(LibraryEvent::BatchCommitted { .. }) => EventSeverity::Info,
            CoreEvent::Service(_) => EventSeverity::Info,
            _ => EventSeverity::Debug,
        }
    }
}

/// Event severity levels for filtering and logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum EventSeverity {
    Debug,
    Info,
    Warning,
    Error,
}

// ============================================================================
// Connection Events
// ============================================================================

/// Connection state of one server. Exactly one state per server id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum ConnectionState {
    #[default]
    SignedOut,
    Connecting,
    SignedIn,
    Unreachable,
    Unauthorized,
}

impl ConnectionState {
    pub fn is_signed_in(&self) -> bool {
        matches!(self, ConnectionState::SignedIn)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::SignedOut => write!(f, "Signed Out"),
            ConnectionState::Connecting => write!(f, "Connecting..."),
            ConnectionState::SignedIn => write!(f, "Signed In"),
            ConnectionState::Unreachable => write!(f, "Unreachable"),
            ConnectionState::Unauthorized => write!(f, "Unauthorized"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "event")]
pub enum ConnectionEvent {
    /// A server moved between connection states.
    StateChanged {
        /// `None` designates the default server.
        server_id: Option<String>,
        from: ConnectionState,
        to: ConnectionState,
    },
    /// Signed in; carries the session user for user-data filtering.
    SessionEstablished {
        server_id: Option<String>,
        user_id: String,
    },
}

impl ConnectionEvent {
    fn description(&self) -> &str {
        match self {
            ConnectionEvent::StateChanged { .. } => "Server connection state changed",
            ConnectionEvent::SessionEstablished { .. } => "Server session established",
        }
    }
}

// ============================================================================
// Library Events
// ============================================================================

/// Progress of catalog synchronization batches.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "event")]
pub enum LibraryEvent {
    BatchStarted {
        library_id: String,
        incremental: bool,
    },
    BatchCommitted {
        library_id: String,
        items_upserted: u64,
        items_removed: u64,
        /// RestorePoint cursor recorded for the library, if any.
        restore_point: Option<String>,
    },
    BatchFailed {
        library_id: String,
        message: String,
        /// Queued for the single retry pass.
        queued_for_retry: bool,
    },
    LibraryRemoved {
        library_id: String,
    },
}

impl LibraryEvent {
    fn description(&self) -> &str {
        match self {
            LibraryEvent::BatchStarted { .. } => "Library sync batch started",
            LibraryEvent::BatchCommitted { .. } => "Library sync batch committed",
            LibraryEvent::BatchFailed { .. } => "Library sync batch failed",
            LibraryEvent::LibraryRemoved { .. } => "Library removed",
        }
    }
}

// ============================================================================
// Playback Events
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "event")]
pub enum PlaybackEvent {
    /// Time to push the playback position to the server.
    ///
    /// `report` marks the infrequent full progress report.
    ProgressRequested { report: bool },
}

impl PlaybackEvent {
    fn description(&self) -> &str {
        match self {
            PlaybackEvent::ProgressRequested { report: true } => "Playback progress report due",
            PlaybackEvent::ProgressRequested { report: false } => "Playback position update due",
        }
    }
}

// ============================================================================
// Service Events
// ============================================================================

/// Lifecycle phase of the top-level service loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ServicePhase {
    Starting,
    Running,
    Restarting,
    ShuttingDown,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "event")]
pub enum ServiceEvent {
    PhaseChanged { phase: ServicePhase },
}

impl ServiceEvent {
    fn description(&self) -> &str {
        match self {
            ServiceEvent::PhaseChanged { .. } => "Service phase changed",
        }
    }
}

// ============================================================================
// Event Bus
// ============================================================================

/// Central event bus for publishing and subscribing to events.
///
/// Clone freely; every clone publishes into the same channel.
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<CoreEvent>,
}

impl EventBus {
    /// Creates a new event bus with the specified per-subscriber buffer.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Publishes an event to all subscribers.
    ///
    /// Returns the number of subscribers reached, or an error when there are
    /// none. Publishers ignore the error.
    pub fn emit(&self, event: CoreEvent) -> Result<usize, SendError<CoreEvent>> {
        self.sender.send(event)
    }

    /// Creates a new subscriber. Past events are not replayed.
    pub fn subscribe(&self) -> Receiver<CoreEvent> {
        self.sender.subscribe()
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
// Event Stream Wrapper
// ============================================================================

type EventFilter = Box<dyn Fn(&CoreEvent) -> bool + Send + Sync>;

/// A `broadcast::Receiver` with an optional filter.
///
/// ```rust
/// use core_runtime::events::{CoreEvent, EventBus, EventStream};
///
/// let bus = EventBus::default();
/// let connection_only = EventStream::new(bus.subscribe())
///     .filter(|event| matches!(event, CoreEvent::Connection(_)));
/// ```
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

    /// Receives the next event that passes the filter.
    ///
    /// Lagging is logged and skipped; only `Closed` is returned as an error.
    pub async fn recv(&mut self) -> Result<CoreEvent, RecvError> {
        loop {
            match self.receiver.recv().await {
                Ok(event) => {
                    if self.filter.as_ref().map_or(true, |f| f(&event)) {
                        return Ok(event);
                    }
                }
                Err(RecvError::Lagged(missed)) => {
                    tracing::warn!(missed, "Event subscriber lagged");
                }
                Err(RecvError::Closed) => return Err(RecvError::Closed),
            }
        }
    }

    /// Non-blocking receive of the next matching event, if one is buffered.
    pub fn try_recv(&mut self) -> Option<CoreEvent> {
        loop {
            match self.receiver.try_recv() {
                Ok(event) => {
                    if self.filter.as_ref().map_or(true, |f| f(&event)) {
                        return Some(event);
                    }
                }
                Err(broadcast::error::TryRecvError::Lagged(missed)) => {
                    tracing::warn!(missed, "Event subscriber lagged");
                }
                Err(_) => return None,
            }
        }
    }
}
