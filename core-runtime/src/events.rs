//! # Event Bus System
//!
//! Typed, broadcast-based notifications about what the upload engine is doing.
//!
//! ## Overview
//!
//! The engine reports every state transition of a tracked file, plus process
//! lifecycle transitions, on an [`EventBus`]. Nothing in the engine depends on
//! anyone listening: emission never blocks and a bus without subscribers
//! simply drops the event. Hosts subscribe for dashboards or audit trails;
//! tests subscribe to observe ordering without sleeping on timers.
//!
//! ```text
//! ┌──────────────┐  emit   ┌──────────┐  subscribe  ┌────────────┐
//! │ Orchestrator ├────────>│          ├────────────>│ Host UI    │
//! ├──────────────┤         │ EventBus │             ├────────────┤
//! │ Scheduler    ├────────>│          ├────────────>│ Test probe │
//! ├──────────────┤         │          │             └────────────┘
//! │ Service      ├────────>│          │
//! └──────────────┘         └──────────┘
//! ```
//!
//! ## Usage
//!
//! ```rust
//! use core_runtime::events::{CoreEvent, EventBus, UploadEvent};
//!
//! # #[tokio::main]
//! # async fn main() {
//! let bus = EventBus::new(16);
//! let mut rx = bus.subscribe();
//!
//! bus.emit(CoreEvent::Upload(UploadEvent::Queued {
//!     media_name: "live/clip.mp4".to_string(),
//! }))
//! .ok();
//!
//! assert!(matches!(rx.recv().await, Ok(CoreEvent::Upload(UploadEvent::Queued { .. }))));
//! # }
//! ```
//!
//! ## Error Handling
//!
//! - **`RecvError::Lagged(n)`**: the subscriber missed `n` events; keep reading.
//! - **`RecvError::Closed`**: every sender is gone; the engine was dropped.

use core_async::sync::broadcast;
use serde::{Deserialize, Serialize};
use std::fmt;

pub use core_async::sync::broadcast::error::{RecvError, SendError};
pub use core_async::sync::broadcast::Receiver;

/// Default buffer size for the event bus channel.
pub const DEFAULT_EVENT_BUFFER_SIZE: usize = 256;

// ============================================================================
// Core Event Types
// ============================================================================

/// Top-level event published on the bus.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", content = "payload")]
pub enum CoreEvent {
    /// Per-file upload pipeline events
    Upload(UploadEvent),
    /// Process-wide lifecycle events
    Lifecycle(LifecycleEvent),
}

impl CoreEvent {
    pub fn description(&self) -> &str {
        match self {
            CoreEvent::Upload(e) => e.description(),
            CoreEvent::Lifecycle(e) => e.description(),
        }
    }

    pub fn severity(&self) -> EventSeverity {
        match self {
            CoreEvent::Upload(UploadEvent::Failed { will_retry: false, .. }) => {
                EventSeverity::Error
            }
            CoreEvent::Lifecycle(LifecycleEvent::UploadingDisabled { .. }) => EventSeverity::Error,
            CoreEvent::Upload(UploadEvent::Failed { .. })
            | CoreEvent::Upload(UploadEvent::Abandoned { .. })
            | CoreEvent::Upload(UploadEvent::Orphaned { .. }) => EventSeverity::Warning,
            CoreEvent::Upload(UploadEvent::Completed { .. })
            | CoreEvent::Upload(UploadEvent::Started { .. })
            | CoreEvent::Lifecycle(_) => EventSeverity::Info,
            _ => EventSeverity::Debug,
        }
    }

    /// The tracked file this event concerns, if any.
    pub fn media_name(&self) -> Option<&str> {
        match self {
            CoreEvent::Upload(e) => Some(e.media_name()),
            CoreEvent::Lifecycle(_) => None,
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
// Upload Events
// ============================================================================

/// Why a pending stability wait was dropped without starting an upload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AbandonReason {
    /// The engine is shutting down.
    ShuttingDown,
    /// The sidecar marker disappeared while waiting.
    MarkerRemoved,
    /// The source file changed after it was presumed final.
    SourceModified,
}

impl AbandonReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            AbandonReason::ShuttingDown => "shutting_down",
            AbandonReason::MarkerRemoved => "marker_removed",
            AbandonReason::SourceModified => "source_modified",
        }
    }
}

/// Events describing one tracked file moving through the pipeline.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "event")]
pub enum UploadEvent {
    /// A write-complete notification was accepted and the marker exists.
    Queued { media_name: String },
    /// A stability wait was armed.
    Scheduled { media_name: String, delay_ms: u64 },
    /// A transfer was handed to the object store.
    Started {
        media_name: String,
        key: String,
        /// `true` when continuing from a persisted checkpoint.
        resumed: bool,
    },
    /// A checkpoint was persisted to the marker.
    Checkpointed { media_name: String, key: String },
    /// The object is fully uploaded and the marker removed.
    Completed { media_name: String, key: String },
    /// The attempt failed.
    Failed {
        media_name: String,
        key: Option<String>,
        reason: String,
        /// Whether a retry was scheduled.
        will_retry: bool,
    },
    /// A stability wait ended without an upload.
    Abandoned {
        media_name: String,
        reason: AbandonReason,
    },
    /// The marker pointed at a missing source file and was removed.
    Orphaned { media_name: String },
}

impl UploadEvent {
    fn description(&self) -> &str {
        match self {
            UploadEvent::Queued { .. } => "Upload queued",
            UploadEvent::Scheduled { .. } => "Waiting for file to settle",
            UploadEvent::Started { resumed: true, .. } => "Upload resumed",
            UploadEvent::Started { .. } => "Upload started",
            UploadEvent::Checkpointed { .. } => "Checkpoint saved",
            UploadEvent::Completed { .. } => "Upload completed",
            UploadEvent::Failed { .. } => "Upload failed",
            UploadEvent::Abandoned { .. } => "Stability wait abandoned",
            UploadEvent::Orphaned { .. } => "Orphaned marker removed",
        }
    }

    pub fn media_name(&self) -> &str {
        match self {
            UploadEvent::Queued { media_name }
            | UploadEvent::Scheduled { media_name, .. }
            | UploadEvent::Started { media_name, .. }
            | UploadEvent::Checkpointed { media_name, .. }
            | UploadEvent::Completed { media_name, .. }
            | UploadEvent::Failed { media_name, .. }
            | UploadEvent::Abandoned { media_name, .. }
            | UploadEvent::Orphaned { media_name } => media_name,
        }
    }
}

// ============================================================================
// Lifecycle Events
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "event")]
pub enum LifecycleEvent {
    /// Startup checks passed.
    UploadingEnabled { bucket: String },
    /// Startup checks failed; uploads are off until restart.
    UploadingDisabled { reason: String },
    /// The startup marker scan found `markers` pending files.
    RecoveryStarted { markers: usize, resume: bool },
    /// Shutdown began; `cancelled_timers` pending waits were dropped.
    ShutdownRequested { cancelled_timers: usize },
}

impl LifecycleEvent {
    fn description(&self) -> &str {
        match self {
            LifecycleEvent::UploadingEnabled { .. } => "Uploading enabled",
            LifecycleEvent::UploadingDisabled { .. } => "Uploading disabled",
            LifecycleEvent::RecoveryStarted { .. } => "Recovery scan started",
            LifecycleEvent::ShutdownRequested { .. } => "Shutdown requested",
        }
    }
}

// ============================================================================
// Event Bus
// ============================================================================

/// Broadcast channel for [`CoreEvent`]s. Cheap to clone; clones share the
/// same channel.
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<CoreEvent>,
}

impl EventBus {
    /// Creates a bus buffering up to `capacity` events per subscriber.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Publishes an event. Errors only when nobody is subscribed.
    pub fn emit(&self, event: CoreEvent) -> Result<usize, SendError<CoreEvent>> {
        self.sender.send(event)
    }

    /// Shorthand for emitting an [`UploadEvent`], ignoring the no-subscriber case.
    pub fn upload(&self, event: UploadEvent) {
        let _ = self.emit(CoreEvent::Upload(event));
    }

    /// Shorthand for emitting a [`LifecycleEvent`], ignoring the no-subscriber case.
    pub fn lifecycle(&self, event: LifecycleEvent) {
        let _ = self.emit(CoreEvent::Lifecycle(event));
    }

    /// New independent receiver for future events. Past events are not replayed.
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
/// use core_runtime::events::{EventBus, EventStream};
///
/// let bus = EventBus::new(16);
/// let stream = EventStream::new(bus.subscribe())
///     .filter(|event| event.media_name() == Some("live/clip.mp4"));
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

    fn accepts(&self, event: &CoreEvent) -> bool {
        self.filter.as_ref().map(|f| f(event)).unwrap_or(true)
    }

    /// Receives the next event that passes the filter.
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
        loop {
            match self.receiver.try_recv() {
                Ok(event) if self.accepts(&event) => return Some(Ok(event)),
                Ok(_) => continue,
                Err(broadcast::error::TryRecvError::Empty) => return None,
                Err(broadcast::error::TryRecvError::Lagged(n)) => {
                    return Some(Err(RecvError::Lagged(n)))
                }
                Err(broadcast::error::TryRecvError::Closed) => return Some(Err(RecvError::Closed)),
            }
        }
    }
}

impl fmt::Debug for EventStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventStream")
            .field("has_filter", &self.filter.is_some())
            .finish()
    }
}

// ============================================================================
// Tests
// ============================================================================
