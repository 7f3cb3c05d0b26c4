//! # Upload Orchestrator
//!
//! Drives one transfer attempt per media file and reacts to what the object
//! store reports back.
//!
//! ## Flow
//!
//! 1. `on_write_complete` creates the marker (if absent) and asks the
//!    [`Scheduler`] to wait for the file to settle.
//! 2. The scheduler calls [`UploadTrigger::start_upload`], which reads the
//!    marker:
//!    - empty: resolve a fresh key and `put`
//!    - checkpoint: `resume`, keeping the key recorded in the checkpoint
//!    - missing source: delete the orphaned marker
//! 3. A listener task consumes the transfer's events:
//!    - `Checkpoint`: persisted on the `checkpoints` work queue
//!    - `Completed`: marker removed, original optionally deleted
//!    - `Failed` (or the stream closing): rescheduled with backoff
//!
//! ## Locking
//!
//! One mutex ([`SharedState`]) guards timers, in-flight keys, active
//! attempts and the shutdown flag, together with marker check-then-act
//! sequences. Transfers, key probing and checkpoint writes run outside it.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use bridge_traits::{
    AccessControl, BridgeError, Clock, HostSession, ObjectStore, PutRequest, Transfer,
    TransferEvent,
};
use bytes::Bytes;
use core_async::fs;
use core_async::sync::Mutex;
use core_async::{Duration, WorkQueue};
use core_runtime::{
    EventBus, LifecycleEvent, NamingPolicy, RetryPolicy, UploadConfig, UploadEvent,
};
use tracing::{debug, error, info, instrument, trace, warn};

use crate::error::{Result, UploadError};
use crate::keep_alive::KeepAlive;
use crate::marker::{MarkerState, MarkerStore};
use crate::naming::NamingResolver;
use crate::scheduler::{Scheduler, UploadTrigger};
use crate::state::{AttemptId, InFlightLedger, SharedState, UploadState};

const CHECKPOINT_QUEUE: &str = "checkpoints";

// ============================================================================
// Configuration
// ============================================================================

/// The slice of [`UploadConfig`] the orchestrator acts on.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub storage_root: PathBuf,
    pub naming: NamingPolicy,
    pub resume_uploads: bool,
    pub retry: RetryPolicy,
    pub initial_delay: Duration,
    pub delete_original: bool,
    pub acl: Option<AccessControl>,
}

impl From<&UploadConfig> for OrchestratorConfig {
    fn from(config: &UploadConfig) -> Self {
        Self {
            storage_root: config.storage_root.clone(),
            naming: config.naming.clone(),
            resume_uploads: config.resume_uploads,
            retry: config.retry,
            initial_delay: config.initial_delay,
            delete_original: config.delete_original,
            acl: config.acl,
        }
    }
}

/// Result of a call to [`UploadOrchestrator::try_start_upload`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StartOutcome {
    /// A fresh transfer was submitted to `key`.
    Started { key: String },
    /// A checkpointed transfer to `key` was resumed.
    Resumed { key: String },
    /// No marker: already finished or never tracked.
    NoMarker,
    /// Another attempt for this file is running.
    AlreadyActive,
    /// The source file was gone; its marker was removed.
    SourceMissing,
    ShuttingDown,
}

// ============================================================================
// Orchestrator
// ============================================================================

pub struct UploadOrchestrator {
    pub(crate) config: OrchestratorConfig,
    pub(crate) state: SharedState,
    pub(crate) markers: MarkerStore,
    pub(crate) store: Arc<dyn ObjectStore>,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) keep_alive: KeepAlive,
    pub(crate) events: EventBus,
    pub(crate) scheduler: Scheduler,
    naming: NamingResolver,
    ledger: InFlightLedger,
    checkpoints: WorkQueue,
    weak_self: Weak<UploadOrchestrator>,
}

impl UploadOrchestrator {
    /// Builds the orchestrator and starts its checkpoint worker.
    ///
    /// # Panics
    ///
    /// Panics when called outside of a tokio runtime context.
    pub fn new(
        config: OrchestratorConfig,
        store: Arc<dyn ObjectStore>,
        host: Arc<dyn HostSession>,
        clock: Arc<dyn Clock>,
        events: EventBus,
    ) -> Arc<Self> {
        let state: SharedState = Arc::new(Mutex::new(UploadState::new()));
        let markers = MarkerStore::new(config.storage_root.clone());
        let keep_alive = KeepAlive::new(host);
        let naming = NamingResolver::new(config.naming.clone(), store.clone(), keep_alive.clone());
        let ledger = InFlightLedger::new(state.clone());
        let checkpoints = WorkQueue::spawn(CHECKPOINT_QUEUE);

        Arc::new_cyclic(|weak: &Weak<UploadOrchestrator>| {
            let trigger: Weak<dyn UploadTrigger> = weak.clone();
            let scheduler = Scheduler::new(
                state.clone(),
                markers.clone(),
                clock.clone(),
                keep_alive.clone(),
                events.clone(),
                trigger,
            );
            Self {
                config,
                state,
                markers,
                store,
                clock,
                keep_alive,
                events,
                scheduler,
                naming,
                ledger,
                checkpoints,
                weak_self: weak.clone(),
            }
        })
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub fn markers(&self) -> &MarkerStore {
        &self.markers
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    // ------------------------------------------------------------------------
    // Entry points
    // ------------------------------------------------------------------------

    /// Handles the host's "file is complete" notification.
    ///
    /// Creates an empty marker unless one already exists (an existing
    /// checkpoint is kept) and starts the stability wait.
    #[instrument(skip(self))]
    pub async fn on_write_complete(&self, media_name: &str) -> Result<()> {
        let created = {
            let state = self.state.lock().await;
            if state.shutting_down {
                debug!("Ignoring write-complete during shutdown");
                return Err(UploadError::ShuttingDown);
            }
            self.markers.create_if_absent(media_name).await?
        };

        debug!(created, "Marker ready");
        self.events.upload(UploadEvent::Queued {
            media_name: media_name.to_string(),
        });
        self.scheduler
            .schedule(media_name, self.config.initial_delay)
            .await;
        Ok(())
    }

    /// Same as [`on_write_complete`](Self::on_write_complete) for an
    /// absolute path under the storage root.
    pub async fn on_write_complete_path(&self, path: &Path) -> Result<()> {
        let media_name =
            self.markers
                .media_name_for(path)
                .ok_or_else(|| UploadError::InvalidMediaName {
                    name: path.display().to_string(),
                    reason: "not under the storage root".to_string(),
                })?;
        self.on_write_complete(&media_name).await
    }

    /// Starts or resumes the upload of `media_name` if its marker says so.
    #[instrument(skip(self))]
    pub async fn try_start_upload(&self, media_name: &str) -> Result<StartOutcome> {
        let (attempt, marker) = {
            let mut state = self.state.lock().await;
            if state.shutting_down {
                return Ok(StartOutcome::ShuttingDown);
            }

            let marker = self.markers.state(media_name).await?;
            if marker == MarkerState::Absent {
                debug!("No marker; nothing to upload");
                return Ok(StartOutcome::NoMarker);
            }

            if self.markers.source_modified(media_name).await?.is_none() {
                warn!("Source file missing; removing orphaned marker");
                self.markers.remove(media_name).await?;
                self.events.upload(UploadEvent::Orphaned {
                    media_name: media_name.to_string(),
                });
                return Ok(StartOutcome::SourceMissing);
            }

            match state.begin_attempt(media_name) {
                Some(attempt) => (attempt, marker),
                None => {
                    debug!("Upload already active");
                    return Ok(StartOutcome::AlreadyActive);
                }
            }
        };

        let started = match marker {
            MarkerState::Checkpoint(checkpoint) => self.resume_transfer(media_name, checkpoint).await,
            _ => self.start_fresh_transfer(media_name).await,
        };

        match started {
            Ok((transfer, resumed)) => {
                let key = transfer.key().to_string();
                info!(key = %key, resumed, attempt, "Upload started");
                self.events.upload(UploadEvent::Started {
                    media_name: media_name.to_string(),
                    key: key.clone(),
                    resumed,
                });
                self.spawn_listener(media_name.to_string(), attempt, transfer);
                Ok(if resumed {
                    StartOutcome::Resumed { key }
                } else {
                    StartOutcome::Started { key }
                })
            }
            Err((key, err)) => {
                let retry = match &err {
                    UploadError::Store(BridgeError::InvalidCheckpoint(reason)) => {
                        warn!(reason = %reason, "Checkpoint rejected; restarting from scratch");
                        match self.markers.reset(media_name).await {
                            Ok(()) => true,
                            Err(e) => {
                                warn!(error = %e, "Failed to reset marker");
                                false
                            }
                        }
                    }
                    UploadError::VersionsExhausted { .. } => {
                        error!(error = %err, "No free object key; leaving marker in place");
                        false
                    }
                    other => other.is_retryable(),
                };
                self.fail_attempt(media_name, attempt, key, err.to_string(), retry)
                    .await;
                Err(err)
            }
        }
    }

    async fn start_fresh_transfer(
        &self,
        media_name: &str,
    ) -> std::result::Result<(Transfer, bool), (Option<String>, UploadError)> {
        let key = self
            .naming
            .resolve(media_name, &self.ledger)
            .await
            .map_err(|e| (None, e))?;

        let source = self.markers.media_path(media_name).map_err(|e| (Some(key.clone()), e))?;
        let request = PutRequest::new(key.clone(), source).with_acl(self.config.acl);
        match self.store.put(request).await {
            Ok(transfer) => Ok((transfer, false)),
            Err(e) => Err((Some(key), e.into())),
        }
    }

    async fn resume_transfer(
        &self,
        media_name: &str,
        checkpoint: Bytes,
    ) -> std::result::Result<(Transfer, bool), (Option<String>, UploadError)> {
        let transfer = self.store.resume(checkpoint).await.map_err(|e| (None, e.into()))?;
        if self.state.lock().await.in_flight.acquire(transfer.key()) > 1 {
            warn!(media_name, key = %transfer.key(), "Resumed key already marked in flight");
        }
        Ok((transfer, true))
    }

    // ------------------------------------------------------------------------
    // Transfer events
    // ------------------------------------------------------------------------

    fn spawn_listener(&self, media_name: String, attempt: AttemptId, transfer: Transfer) {
        let Some(this) = self.weak_self.upgrade() else {
            return;
        };
        core_async::spawn(async move {
            this.listen(media_name, attempt, transfer).await;
        });
    }

    async fn listen(self: Arc<Self>, media_name: String, attempt: AttemptId, transfer: Transfer) {
        let (key, mut events) = transfer.into_parts();

        loop {
            let event = events.recv().await;
            self.keep_alive.touch();

            match event {
                Some(TransferEvent::Progress {
                    bytes_transferred,
                    total_bytes,
                }) => {
                    trace!(media_name = %media_name, bytes_transferred, total_bytes = ?total_bytes, "Progress");
                }
                Some(TransferEvent::Checkpoint(checkpoint)) => {
                    self.queue_checkpoint(&media_name, attempt, &key, checkpoint);
                }
                Some(TransferEvent::Completed) => {
                    self.complete_attempt(&media_name, attempt, &key).await;
                    return;
                }
                Some(TransferEvent::Failed(reason)) => {
                    self.checkpoints.flush().await;
                    self.fail_attempt(&media_name, attempt, Some(key), reason, true)
                        .await;
                    return;
                }
                None => {
                    self.checkpoints.flush().await;
                    self.fail_attempt(
                        &media_name,
                        attempt,
                        Some(key),
                        "transfer ended without a result".to_string(),
                        true,
                    )
                    .await;
                    return;
                }
            }
        }
    }

    fn queue_checkpoint(&self, media_name: &str, attempt: AttemptId, key: &str, checkpoint: Bytes) {
        let Some(this) = self.weak_self.upgrade() else {
            return;
        };
        let media_name = media_name.to_string();
        let key = key.to_string();
        let queued = self.checkpoints.submit(async move {
            this.persist_checkpoint(&media_name, attempt, &key, checkpoint)
                .await;
        });
        if !queued {
            warn!("Checkpoint worker stopped; dropping checkpoint");
        }
    }

    /// Writes a checkpoint into the marker, unless the attempt already ended
    /// or the marker was removed in the meantime.
    async fn persist_checkpoint(
        &self,
        media_name: &str,
        attempt: AttemptId,
        key: &str,
        checkpoint: Bytes,
    ) {
        let staged = match self.markers.stage_checkpoint(media_name, &checkpoint).await {
            Ok(staged) => staged,
            Err(e) => {
                warn!(media_name, error = %e, "Failed to write checkpoint");
                return;
            }
        };

        let committed = {
            let state = self.state.lock().await;
            if !state.is_current_attempt(media_name, attempt) {
                false
            } else {
                match self.markers.exists(media_name).await {
                    Ok(true) => match self.markers.commit_checkpoint(media_name, &staged).await {
                        Ok(()) => true,
                        Err(e) => {
                            warn!(media_name, error = %e, "Failed to commit checkpoint");
                            false
                        }
                    },
                    Ok(false) => false,
                    Err(e) => {
                        warn!(media_name, error = %e, "Failed to check marker");
                        false
                    }
                }
            }
        };

        if committed {
            debug!(media_name, key, bytes = checkpoint.len(), "Checkpoint saved");
            self.events.upload(UploadEvent::Checkpointed {
                media_name: media_name.to_string(),
                key: key.to_string(),
            });
        } else {
            trace!(media_name, "Discarding stale checkpoint");
            self.markers.discard_staged(&staged).await;
        }
    }

    async fn complete_attempt(&self, media_name: &str, attempt: AttemptId, key: &str) {
        {
            let mut state = self.state.lock().await;
            state.in_flight.release(key);
            state.end_attempt(media_name, attempt);
            if let Err(e) = self.markers.remove(media_name).await {
                warn!(media_name, error = %e, "Failed to remove marker after upload");
            }
        }

        info!(media_name, key, "Upload completed");
        self.events.upload(UploadEvent::Completed {
            media_name: media_name.to_string(),
            key: key.to_string(),
        });

        if self.config.delete_original {
            self.delete_original(media_name).await;
        }
    }

    async fn delete_original(&self, media_name: &str) {
        let path = match self.markers.media_path(media_name) {
            Ok(path) => path,
            Err(e) => {
                warn!(media_name, error = %e, "Cannot resolve original for deletion");
                return;
            }
        };
        match fs::remove_file(&path).await {
            Ok(()) => debug!(media_name, "Deleted original file"),
            Err(e) => warn!(media_name, error = %e, "Failed to delete original file"),
        }
    }

    /// Ends a failed attempt and, if allowed, schedules a retry.
    ///
    /// The marker is always left in place so a later recovery can pick the
    /// file up again.
    async fn fail_attempt(
        &self,
        media_name: &str,
        attempt: AttemptId,
        key: Option<String>,
        reason: String,
        retryable: bool,
    ) {
        let shutting_down = {
            let mut state = self.state.lock().await;
            if let Some(key) = &key {
                state.in_flight.release(key);
            }
            state.end_attempt(media_name, attempt);
            state.shutting_down
        };

        let will_retry = !shutting_down && retryable && self.config.retry.enabled;
        warn!(media_name, key = ?key, reason = %reason, will_retry, "Upload failed");
        self.events.upload(UploadEvent::Failed {
            media_name: media_name.to_string(),
            key,
            reason,
            will_retry,
        });

        if shutting_down {
            debug!(media_name, "Shutting down; marker kept for recovery");
            return;
        }
        if !will_retry {
            return;
        }

        let age = match self.markers.source_modified(media_name).await {
            Ok(Some(modified)) => self.clock.age_of(modified),
            Ok(None) => Duration::ZERO,
            Err(e) => {
                warn!(media_name, error = %e, "Cannot stat source file; not retrying");
                return;
            }
        };
        self.scheduler
            .schedule(media_name, self.config.retry.timeout + age)
            .await;
    }

    // ------------------------------------------------------------------------
    // Shutdown
    // ------------------------------------------------------------------------

    /// Stops all pending waits and tells the object store to stop accepting
    /// transfers. Running transfers drain on their own.
    ///
    /// Returns the number of cancelled waits. Calling it again is a no-op.
    pub async fn shutdown(&self) -> usize {
        let cancelled = {
            let mut state = self.state.lock().await;
            if state.shutting_down {
                debug!("Shutdown already requested");
                return 0;
            }
            state.shutting_down = true;
            state.timers.cancel_all()
        };

        info!(cancelled_timers = cancelled, "Upload engine shutting down");
        self.store.shutdown().await;
        self.checkpoints.flush().await;
        self.events.lifecycle(LifecycleEvent::ShutdownRequested {
            cancelled_timers: cancelled,
        });
        cancelled
    }

    // ------------------------------------------------------------------------
    // Introspection
    // ------------------------------------------------------------------------

    pub async fn is_shutting_down(&self) -> bool {
        self.state.lock().await.shutting_down
    }

    pub async fn pending_timers(&self) -> usize {
        self.state.lock().await.timers.len()
    }

    /// Object keys currently reserved or uploading, sorted.
    pub async fn in_flight_keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.state.lock().await.in_flight.keys().cloned().collect();
        keys.sort();
        keys
    }

    pub async fn active_uploads(&self) -> usize {
        self.state.lock().await.active.len()
    }

    /// Waits for every checkpoint queued so far to be written.
    pub async fn flush_checkpoints(&self) {
        self.checkpoints.flush().await;
    }
}

#[async_trait]
impl UploadTrigger for UploadOrchestrator {
    async fn start_upload(&self, media_name: &str) {
        match self.try_start_upload(media_name).await {
            Ok(outcome) => trace!(media_name, ?outcome, "Start request handled"),
            Err(e) => debug!(media_name, error = %e, "Start request failed"),
        }
    }
}

impl std::fmt::Debug for UploadOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UploadOrchestrator")
            .field("config", &self.config)
            .field("checkpoints", &self.checkpoints)
            .finish()
    }
}
