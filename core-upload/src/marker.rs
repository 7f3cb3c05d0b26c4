//! # Sidecar Markers
//!
//! Every file that still needs uploading has a marker next to it at
//! `<mediaName>.upload`. The marker is the only durable record the engine
//! keeps:
//!
//! - empty marker: pending, no transfer started yet
//! - non-empty marker: an opaque checkpoint from the object store
//! - no marker: never tracked, or already finished
//!
//! Checkpoints are written to a temporary sibling first and renamed into
//! place, so a crash mid-write leaves either the old or the new checkpoint,
//! never a torn one. Temporary files end in `.tmp` and are ignored by
//! [`MarkerStore::scan`].

use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};
use std::time::SystemTime;

use bytes::Bytes;
use core_async::fs;
use core_async::task;
use tracing::debug;

use crate::error::{Result, UploadError};

pub const MARKER_SUFFIX: &str = ".upload";
const STAGING_SUFFIX: &str = ".tmp";

/// What the marker says about a file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MarkerState {
    Absent,
    Pending,
    Checkpoint(Bytes),
}

/// A marker found by [`MarkerStore::scan`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MarkerEntry {
    pub media_name: String,
    pub modified: SystemTime,
}

#[derive(Debug, Clone)]
pub struct MarkerStore {
    root: PathBuf,
}

impl MarkerStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Absolute path of the source file for `media_name`.
    pub fn media_path(&self, media_name: &str) -> Result<PathBuf> {
        validate_media_name(media_name)?;
        Ok(self.root.join(media_name))
    }

    pub fn marker_path(&self, media_name: &str) -> Result<PathBuf> {
        validate_media_name(media_name)?;
        Ok(self.root.join(format!("{media_name}{MARKER_SUFFIX}")))
    }

    fn staging_path(&self, media_name: &str) -> Result<PathBuf> {
        validate_media_name(media_name)?;
        Ok(self
            .root
            .join(format!("{media_name}{MARKER_SUFFIX}{STAGING_SUFFIX}")))
    }

    /// Media name for an absolute path under the root, using `/` separators.
    ///
    /// Returns `None` for paths outside the root.
    pub fn media_name_for(&self, path: &Path) -> Option<String> {
        let relative = path.strip_prefix(&self.root).ok()?;
        let mut parts = Vec::new();
        for component in relative.components() {
            match component {
                Component::Normal(part) => parts.push(part.to_str()?.to_string()),
                Component::CurDir => {}
                _ => return None,
            }
        }
        if parts.is_empty() {
            None
        } else {
            Some(parts.join("/"))
        }
    }

    pub async fn exists(&self, media_name: &str) -> Result<bool> {
        let path = self.marker_path(media_name)?;
        fs::try_exists(&path)
            .await
            .map_err(|e| UploadError::marker_io(media_name, e))
    }

    pub async fn state(&self, media_name: &str) -> Result<MarkerState> {
        let path = self.marker_path(media_name)?;
        match fs::read(&path).await {
            Ok(contents) if contents.is_empty() => Ok(MarkerState::Pending),
            Ok(contents) => Ok(MarkerState::Checkpoint(Bytes::from(contents))),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(MarkerState::Absent),
            Err(e) => Err(UploadError::marker_io(media_name, e)),
        }
    }

    /// Creates an empty marker. Returns `false` if one already existed; an
    /// existing marker is left untouched, checkpoint included.
    pub async fn create_if_absent(&self, media_name: &str) -> Result<bool> {
        let path = self.marker_path(media_name)?;
        match fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .await
        {
            Ok(_) => Ok(true),
            Err(e) if e.kind() == ErrorKind::AlreadyExists => Ok(false),
            Err(e) => Err(UploadError::marker_io(media_name, e)),
        }
    }

    /// Writes `checkpoint` to the staging file without touching the marker.
    pub async fn stage_checkpoint(&self, media_name: &str, checkpoint: &[u8]) -> Result<PathBuf> {
        let staged = self.staging_path(media_name)?;
        fs::write(&staged, checkpoint)
            .await
            .map_err(|e| UploadError::marker_io(media_name, e))?;
        Ok(staged)
    }

    /// Atomically replaces the marker with a previously staged checkpoint.
    pub async fn commit_checkpoint(&self, media_name: &str, staged: &Path) -> Result<()> {
        let path = self.marker_path(media_name)?;
        fs::rename(staged, &path)
            .await
            .map_err(|e| UploadError::marker_io(media_name, e))
    }

    /// Drops a staged checkpoint that will not be committed.
    pub async fn discard_staged(&self, staged: &Path) {
        if let Err(e) = fs::remove_file(staged).await {
            if e.kind() != ErrorKind::NotFound {
                debug!(path = %staged.display(), error = %e, "Failed to remove staged checkpoint");
            }
        }
    }

    /// Empties the marker back to "pending".
    pub async fn reset(&self, media_name: &str) -> Result<()> {
        let path = self.marker_path(media_name)?;
        fs::write(&path, b"")
            .await
            .map_err(|e| UploadError::marker_io(media_name, e))
    }

    /// Deletes the marker. Returns `false` if it was already gone.
    pub async fn remove(&self, media_name: &str) -> Result<bool> {
        let path = self.marker_path(media_name)?;
        match fs::remove_file(&path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(UploadError::marker_io(media_name, e)),
        }
    }

    /// Modification time of the source file, or `None` if it does not exist.
    pub async fn source_modified(&self, media_name: &str) -> Result<Option<SystemTime>> {
        let path = self.media_path(media_name)?;
        match fs::metadata(&path).await {
            Ok(meta) if meta.is_file() => meta
                .modified()
                .map(Some)
                .map_err(|e| UploadError::marker_io(media_name, e)),
            Ok(_) => Ok(None),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(UploadError::marker_io(media_name, e)),
        }
    }

    /// Every marker under the root, oldest modification first.
    ///
    /// Unreadable directory entries are skipped.
    pub async fn scan(&self) -> Result<Vec<MarkerEntry>> {
        let store = self.clone();
        let root_label = self.root.display().to_string();
        task::spawn_blocking(move || store.scan_blocking())
            .await
            .map_err(|e| UploadError::marker_io(&root_label, std::io::Error::other(e)))
    }

    fn scan_blocking(&self) -> Vec<MarkerEntry> {
        let mut entries: Vec<MarkerEntry> = walkdir::WalkDir::new(&self.root)
            .follow_links(false)
            .into_iter()
            .filter_map(|entry| match entry {
                Ok(entry) => Some(entry),
                Err(e) => {
                    debug!(error = %e, "Skipping unreadable entry during marker scan");
                    None
                }
            })
            .filter(|entry| entry.file_type().is_file())
            .filter_map(|entry| {
                let file_name = entry.file_name().to_str()?;
                if !file_name.ends_with(MARKER_SUFFIX) {
                    return None;
                }
                let marker_name = self.media_name_for(entry.path())?;
                let media_name = marker_name.strip_suffix(MARKER_SUFFIX)?.to_string();
                if validate_media_name(&media_name).is_err() {
                    return None;
                }
                let modified = entry.metadata().ok()?.modified().ok()?;
                Some(MarkerEntry {
                    media_name,
                    modified,
                })
            })
            .collect();

        entries.sort_by(|a, b| {
            a.modified
                .cmp(&b.modified)
                .then_with(|| a.media_name.cmp(&b.media_name))
        });
        entries
    }
}

/// Rejects names that would escape the storage root or are not relative.
pub fn validate_media_name(name: &str) -> Result<()> {
    let invalid = |reason: &str| UploadError::InvalidMediaName {
        name: name.to_string(),
        reason: reason.to_string(),
    };

    if name.trim().is_empty() {
        return Err(invalid("empty"));
    }
    if name.starts_with('/') || name.starts_with('\\') || Path::new(name).is_absolute() {
        return Err(invalid("must be relative to the storage root"));
    }
    if name.split(['/', '\\']).any(|segment| segment == "..") {
        return Err(invalid("must not contain '..'"));
    }
    if name.ends_with('/') {
        return Err(invalid("must name a file"));
    }
    Ok(())
}
