//! Upload service façade and bootstrap helpers.
//!
//! This crate wires host-provided bridge implementations (object store, host
//! session, clock) into the upload engine. It runs the startup checks, owns
//! the enabled/disabled state for the life of the process, and exposes the
//! two entry points a host calls: write-complete and app-stop. Desktop hosts
//! typically enable the `desktop-shims` feature, which pulls in
//! `bridge-desktop` and [`UploadDependencies::desktop`].

pub mod error;

pub use error::{Result, ServiceError};

use std::path::Path;
use std::sync::Arc;

use bridge_traits::{host::HostSession, object_store::ObjectStore, time::Clock, SystemClock};
use core_async::sync::Mutex;
use core_async::task::JoinHandle;
use core_runtime::logging::{self, LoggingConfig};
use core_runtime::{EventBus, LifecycleEvent, UploadConfig};
use core_upload::{OrchestratorConfig, RecoveryReport, UploadOrchestrator};
use tracing::{error, info, instrument, warn};

/// Install the global `tracing` subscriber at the level `config` asks for.
///
/// Hosts that bring their own subscriber skip this.
pub fn init_logging(config: &UploadConfig) -> Result<()> {
    logging::init_logging(LoggingConfig::from(config))?;
    Ok(())
}

/// Aggregated handle to all bridge dependencies the engine requires.
pub struct UploadDependencies {
    pub store: Arc<dyn ObjectStore>,
    pub host: Arc<dyn HostSession>,
    pub clock: Arc<dyn Clock>,
    pub events: EventBus,
}

impl UploadDependencies {
    /// Construct a dependency bundle with the system clock and a fresh bus.
    pub fn new(store: Arc<dyn ObjectStore>, host: Arc<dyn HostSession>) -> Self {
        Self {
            store,
            host,
            clock: Arc::new(SystemClock),
            events: EventBus::default(),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_events(mut self, events: EventBus) -> Self {
        self.events = events;
        self
    }

    /// Directory-backed store and a desktop host session.
    #[cfg(feature = "desktop-shims")]
    pub fn desktop(bucket_root: impl Into<std::path::PathBuf>) -> Self {
        Self::new(
            Arc::new(bridge_desktop::LocalObjectStore::new(bucket_root)),
            Arc::new(bridge_desktop::DesktopHostSession::default()),
        )
    }
}

/// Whether the startup checks let uploads through.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServiceStatus {
    Enabled { bucket: String },
    Disabled { reason: String },
}

impl ServiceStatus {
    pub fn is_enabled(&self) -> bool {
        matches!(self, ServiceStatus::Enabled { .. })
    }
}

/// Primary façade exposed to host applications.
pub struct UploadService {
    status: ServiceStatus,
    orchestrator: Option<Arc<UploadOrchestrator>>,
    events: EventBus,
    recovery: Mutex<Option<JoinHandle<Option<RecoveryReport>>>>,
}

impl UploadService {
    /// Validate the configuration, probe the bucket and start recovery.
    ///
    /// Missing credentials or an unreachable bucket do not fail the call; they
    /// leave the service permanently disabled. Only an invalid configuration
    /// or a missing storage root is returned as an error.
    #[instrument(skip_all, fields(storage_root = %config.storage_root.display()))]
    pub async fn start(config: UploadConfig, deps: UploadDependencies) -> Result<Self> {
        config.validate()?;
        if !config.storage_root.is_dir() {
            return Err(ServiceError::InitializationFailed(format!(
                "storage root {} is not a directory",
                config.storage_root.display()
            )));
        }

        let events = deps.events.clone();
        let status = Self::probe(&config, deps.store.as_ref()).await;

        let bucket = match &status {
            ServiceStatus::Enabled { bucket } => bucket.clone(),
            ServiceStatus::Disabled { reason } => {
                events.lifecycle(LifecycleEvent::UploadingDisabled {
                    reason: reason.clone(),
                });
                return Ok(Self {
                    status,
                    orchestrator: None,
                    events,
                    recovery: Mutex::new(None),
                });
            }
        };

        info!(
            bucket = %bucket,
            resume_uploads = config.resume_uploads,
            delete_original = config.delete_original,
            versioning = config.naming.versioning,
            "Uploading enabled"
        );
        events.lifecycle(LifecycleEvent::UploadingEnabled {
            bucket: bucket.clone(),
        });

        let orchestrator = UploadOrchestrator::new(
            OrchestratorConfig::from(&config),
            deps.store,
            deps.host,
            deps.clock,
            events.clone(),
        );
        let recovery = orchestrator.spawn_recovery();

        Ok(Self {
            status,
            orchestrator: Some(orchestrator),
            events,
            recovery: Mutex::new(Some(recovery)),
        })
    }

    async fn probe(config: &UploadConfig, store: &dyn ObjectStore) -> ServiceStatus {
        if config.credentials.is_none() {
            warn!("Upload credentials are not configured, uploading disabled");
            return ServiceStatus::Disabled {
                reason: "missing credentials".to_string(),
            };
        }
        let Some(bucket) = config.bucket.clone() else {
            warn!("Upload bucket is not configured, uploading disabled");
            return ServiceStatus::Disabled {
                reason: "missing bucket".to_string(),
            };
        };

        match store.bucket_exists().await {
            Ok(true) => ServiceStatus::Enabled { bucket },
            Ok(false) => {
                error!(bucket = %bucket, "Bucket does not exist, uploading disabled");
                ServiceStatus::Disabled {
                    reason: format!("bucket {bucket} does not exist"),
                }
            }
            Err(e) => {
                error!(bucket = %bucket, error = %e, "Bucket probe failed, uploading disabled");
                ServiceStatus::Disabled {
                    reason: format!("bucket probe failed: {e}"),
                }
            }
        }
    }

    pub fn status(&self) -> &ServiceStatus {
        &self.status
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    /// The running engine, `None` while disabled.
    pub fn orchestrator(&self) -> Option<&Arc<UploadOrchestrator>> {
        self.orchestrator.as_ref()
    }

    /// Host notification that `media_name` was fully written.
    pub async fn on_write_complete(&self, media_name: &str) {
        let Some(orchestrator) = &self.orchestrator else {
            error!(media_name, "Uploading is disabled, ignoring write-complete");
            return;
        };
        if let Err(e) = orchestrator.on_write_complete(media_name).await {
            error!(media_name, error = %e, "Failed to queue upload");
        }
    }

    /// Path-based variant of [`on_write_complete`](Self::on_write_complete).
    pub async fn on_write_complete_path(&self, path: &Path) {
        let Some(orchestrator) = &self.orchestrator else {
            error!(path = %path.display(), "Uploading is disabled, ignoring write-complete");
            return;
        };
        if let Err(e) = orchestrator.on_write_complete_path(path).await {
            error!(path = %path.display(), error = %e, "Failed to queue upload");
        }
    }

    /// Host notification that the process is stopping.
    ///
    /// Cancels pending waits and asks the store to drain. Markers stay on
    /// disk for the next startup's recovery scan.
    pub async fn on_app_stop(&self) {
        let Some(orchestrator) = &self.orchestrator else {
            return;
        };
        let cancelled = orchestrator.shutdown().await;
        info!(cancelled_timers = cancelled, "Upload service stopped");
    }

    /// Waits for the startup recovery scan. Returns `None` when disabled, when
    /// the scan failed, or on the second call.
    pub async fn wait_for_recovery(&self) -> Option<RecoveryReport> {
        let handle = self.recovery.lock().await.take()?;
        match handle.await {
            Ok(report) => report,
            Err(e) => {
                warn!(error = %e, "Recovery task did not finish");
                None
            }
        }
    }
}
