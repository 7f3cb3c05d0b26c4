//! # Desktop Bridge Implementations
//!
//! Default implementations of the bridge traits for desktop platforms
//! (macOS, Windows, Linux).
//!
//! - [`LocalObjectStore`]: `ObjectStore` over a local directory, with
//!   resumable multi-part transfers and JSON checkpoints
//! - [`DesktopHostSession`]: `HostSession` that records keep-alive touches
//!
//! ## Usage
//!
//! ```ignore
//! use bridge_desktop::{DesktopHostSession, LocalObjectStore};
//! use std::sync::Arc;
//!
//! let store = Arc::new(LocalObjectStore::new("/srv/bucket"));
//! let host = Arc::new(DesktopHostSession::default());
//! // Hand both to the upload service.
//! ```

mod host;
mod object_store;

pub use host::{DesktopHostSession, DEFAULT_IDLE_TIMEOUT};
pub use object_store::{LocalObjectStore, DEFAULT_PART_SIZE};
