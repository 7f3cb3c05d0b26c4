//! # Core Upload
//!
//! Debounced, resumable upload of finished media files to an object store.
//!
//! ## Overview
//!
//! Each file that needs uploading is tracked by a sidecar marker
//! (`<mediaName>.upload`). The [`UploadOrchestrator`] creates markers on
//! write-complete, waits for files to settle through the [`Scheduler`],
//! picks a collision-free object key with the [`NamingResolver`], and keeps
//! the marker updated with transfer checkpoints so an interrupted upload
//! resumes to the same key after a restart.
//!
//! ```ignore
//! let orchestrator = UploadOrchestrator::new(
//!     OrchestratorConfig::from(&config),
//!     store,
//!     host,
//!     Arc::new(SystemClock),
//!     events,
//! );
//! orchestrator.spawn_recovery();
//! orchestrator.on_write_complete("live/clip.mp4").await?;
//! // ...
//! orchestrator.shutdown().await;
//! ```

pub mod error;
pub mod keep_alive;
pub mod marker;
pub mod naming;
pub mod orchestrator;
pub mod recovery;
pub mod scheduler;
pub mod state;

pub use error::{Result, UploadError};
pub use keep_alive::KeepAlive;
pub use marker::{MarkerEntry, MarkerState, MarkerStore, MARKER_SUFFIX};
pub use naming::{KeyLedger, NamingResolver};
pub use orchestrator::{OrchestratorConfig, StartOutcome, UploadOrchestrator};
pub use recovery::RecoveryReport;
pub use scheduler::{Scheduler, UploadTrigger};
