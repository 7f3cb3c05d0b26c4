//! # Host Bridge Traits
//!
//! Capability interfaces the upload engine depends on but does not implement.
//!
//! ## Overview
//!
//! The engine decides *when* and *under which key* a media file is uploaded.
//! Moving bytes, talking to the host runtime and reading the wall clock are
//! capabilities injected through the traits in this crate, so the engine can
//! run against a real object store in production and against in-memory fakes
//! in tests.
//!
//! ## Traits
//!
//! - [`ObjectStore`](object_store::ObjectStore) - Start/resume transfers, existence and
//!   incomplete-upload probes, bulk abort, graceful shutdown
//! - [`HostSession`](host::HostSession) - Keep-alive touches to the host session
//! - [`Clock`](time::Clock) - Wall-clock source used for file-age decisions
//! - [`LoggerSink`](time::LoggerSink) - Forward structured logs to host logging
//!
//! ## Implementations
//!
//! | Host | Implementation Crate |
//! |------|---------------------|
//! | Desktop / local directory | `bridge-desktop` |
//!
//! ## Error Handling
//!
//! All traits use [`BridgeError`](error::BridgeError). Implementations should
//! map service errors that may succeed on retry to
//! [`BridgeError::OperationFailed`] or [`BridgeError::Io`], which
//! [`BridgeError::is_transient`] reports as retryable.
//!
//! ## Thread Safety
//!
//! All traits require `Send + Sync`; the engine shares them across tasks
//! behind `Arc<dyn Trait>`.

pub mod error;
pub mod host;
pub mod object_store;
pub mod time;

pub use error::BridgeError;

pub use host::{HostSession, NoopHostSession};
pub use object_store::{
    AccessControl, GroupGrantee, ObjectStore, Permission, PutRequest, Transfer, TransferEvent,
};
pub use time::{Clock, ConsoleLogger, LogEntry, LogLevel, LoggerSink, ManualClock, SystemClock};
