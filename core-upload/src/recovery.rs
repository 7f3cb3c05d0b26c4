//! Startup recovery of markers left behind by a previous run.

use std::sync::Arc;

use core_async::task::JoinHandle;
use core_runtime::LifecycleEvent;
use tracing::{info, instrument, warn};

use crate::error::Result;
use crate::orchestrator::UploadOrchestrator;

/// What [`UploadOrchestrator::recover_all`] did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    /// Markers found on disk.
    pub found: usize,
    /// Files handed to the scheduler, oldest first.
    pub scheduled: Vec<String>,
    /// Markers deleted because resuming is disabled.
    pub removed: usize,
    /// Remote multipart uploads aborted because resuming is disabled.
    pub aborted: usize,
}

impl UploadOrchestrator {
    /// Re-enters every marker under the storage root into the pipeline.
    ///
    /// With resuming enabled each file goes through the normal stability
    /// wait, oldest marker first. With resuming disabled all markers are
    /// deleted and unfinished remote uploads are aborted.
    #[instrument(skip(self), fields(resume = self.config.resume_uploads))]
    pub async fn recover_all(&self) -> Result<RecoveryReport> {
        let entries = self.markers.scan().await?;
        let mut report = RecoveryReport {
            found: entries.len(),
            ..RecoveryReport::default()
        };

        info!(markers = entries.len(), "Recovering pending uploads");
        self.events.lifecycle(LifecycleEvent::RecoveryStarted {
            markers: entries.len(),
            resume: self.config.resume_uploads,
        });

        if !self.config.resume_uploads {
            for entry in &entries {
                let _state = self.state.lock().await;
                match self.markers.remove(&entry.media_name).await {
                    Ok(true) => report.removed += 1,
                    Ok(false) => {}
                    Err(e) => warn!(media_name = %entry.media_name, error = %e, "Failed to remove marker"),
                }
            }
            report.aborted = match self.store.abort_all(self.clock.now()).await {
                Ok(count) => count,
                Err(e) => {
                    warn!(error = %e, "Failed to abort unfinished uploads");
                    0
                }
            };
            info!(
                removed = report.removed,
                aborted = report.aborted,
                "Resume disabled; discarded pending uploads"
            );
            return Ok(report);
        }

        for entry in entries {
            if self.is_shutting_down().await {
                info!("Shutdown requested; stopping recovery");
                break;
            }
            self.scheduler
                .schedule(&entry.media_name, self.config.initial_delay)
                .await;
            report.scheduled.push(entry.media_name);
        }

        info!(scheduled = report.scheduled.len(), "Recovery complete");
        Ok(report)
    }

    /// Runs [`recover_all`](Self::recover_all) on a background task.
    pub fn spawn_recovery(self: &Arc<Self>) -> JoinHandle<Option<RecoveryReport>> {
        let this = Arc::clone(self);
        core_async::spawn(async move {
            match this.recover_all().await {
                Ok(report) => Some(report),
                Err(e) => {
                    warn!(error = %e, "Recovery scan failed");
                    None
                }
            }
        })
    }
}
