//! Object Store Capability
//!
//! The upload engine never talks to a storage service directly. Everything it
//! needs (starting and resuming transfers, existence probes, cleanup of
//! abandoned multi-part uploads) goes through [`ObjectStore`].
//!
//! A transfer reports back through a [`Transfer`] handle: an owned object key
//! plus a channel of [`TransferEvent`]s. The engine reacts to the event
//! variants; it never sees callbacks or listener objects.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use core_async::sync::mpsc;
use serde::{Deserialize, Serialize};

use crate::error::{BridgeError, Result};

/// Progress notification emitted by a running transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferEvent {
    /// Bytes acknowledged so far. Purely informational.
    Progress {
        bytes_transferred: u64,
        total_bytes: Option<u64>,
    },
    /// Opaque resumable state. Only the store that produced it can decode it.
    Checkpoint(Bytes),
    /// The object is fully written under the transfer's key.
    Completed,
    /// The attempt stopped. Already-acknowledged parts stay on the remote side.
    Failed(String),
}

impl TransferEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TransferEvent::Completed | TransferEvent::Failed(_))
    }
}

/// Handle for one running transfer.
#[derive(Debug)]
pub struct Transfer {
    key: String,
    events: mpsc::Receiver<TransferEvent>,
}

impl Transfer {
    pub fn new(key: impl Into<String>, events: mpsc::Receiver<TransferEvent>) -> Self {
        Self {
            key: key.into(),
            events,
        }
    }

    /// Creates a transfer together with the sender its driver reports on.
    pub fn channel(key: impl Into<String>, buffer: usize) -> (mpsc::Sender<TransferEvent>, Self) {
        let (tx, rx) = mpsc::channel(buffer.max(1));
        (tx, Self::new(key, rx))
    }

    /// Destination object key. For resumed transfers this comes from the
    /// checkpoint, never from fresh name resolution.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Next event, or `None` once the driver has dropped its sender.
    pub async fn next_event(&mut self) -> Option<TransferEvent> {
        self.events.recv().await
    }

    pub fn into_parts(self) -> (String, mpsc::Receiver<TransferEvent>) {
        (self.key, self.events)
    }
}

/// Predefined grantee groups, identified by their canonical URIs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum GroupGrantee {
    AllUsers,
    AuthenticatedUsers,
    LogDelivery,
}

impl GroupGrantee {
    pub fn uri(&self) -> &'static str {
        match self {
            GroupGrantee::AllUsers => "http://acs.amazonaws.com/groups/global/AllUsers",
            GroupGrantee::AuthenticatedUsers => {
                "http://acs.amazonaws.com/groups/global/AuthenticatedUsers"
            }
            GroupGrantee::LogDelivery => "http://acs.amazonaws.com/groups/s3/LogDelivery",
        }
    }
}

impl FromStr for GroupGrantee {
    type Err = BridgeError;

    fn from_str(value: &str) -> Result<Self> {
        let value = value.trim();
        [
            GroupGrantee::AllUsers,
            GroupGrantee::AuthenticatedUsers,
            GroupGrantee::LogDelivery,
        ]
        .into_iter()
        .find(|grantee| grantee.uri().eq_ignore_ascii_case(value))
        .ok_or_else(|| BridgeError::OperationFailed(format!("unknown grantee URI: {value}")))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Permission {
    FullControl,
    Read,
    Write,
    ReadAcp,
    WriteAcp,
}

impl Permission {
    pub fn as_str(&self) -> &'static str {
        match self {
            Permission::FullControl => "FULL_CONTROL",
            Permission::Read => "READ",
            Permission::Write => "WRITE",
            Permission::ReadAcp => "READ_ACP",
            Permission::WriteAcp => "WRITE_ACP",
        }
    }
}

impl FromStr for Permission {
    type Err = BridgeError;

    /// Parses case-insensitively (`read_acp` and `READ_ACP` are equal).
    fn from_str(value: &str) -> Result<Self> {
        match value.trim().to_ascii_uppercase().as_str() {
            "FULL_CONTROL" => Ok(Permission::FullControl),
            "READ" => Ok(Permission::Read),
            "WRITE" => Ok(Permission::Write),
            "READ_ACP" => Ok(Permission::ReadAcp),
            "WRITE_ACP" => Ok(Permission::WriteAcp),
            other => Err(BridgeError::OperationFailed(format!(
                "unknown permission: {other}"
            ))),
        }
    }
}

impl fmt::Display for Permission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Access-control grant applied to every freshly started upload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessControl {
    pub grantee: GroupGrantee,
    pub permission: Permission,
}

impl AccessControl {
    pub fn new(grantee: GroupGrantee, permission: Permission) -> Self {
        Self {
            grantee,
            permission,
        }
    }
}

/// Request to start a fresh transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PutRequest {
    pub key: String,
    pub source: PathBuf,
    pub acl: Option<AccessControl>,
}

impl PutRequest {
    pub fn new(key: impl Into<String>, source: impl Into<PathBuf>) -> Self {
        Self {
            key: key.into(),
            source: source.into(),
            acl: None,
        }
    }

    pub fn with_acl(mut self, acl: Option<AccessControl>) -> Self {
        self.acl = acl;
        self
    }
}

/// Remote object store.
///
/// Implementations own all network I/O and multi-part semantics. Transfers
/// run on the implementation's own tasks; `put` and `resume` return as soon
/// as the transfer is accepted.
///
/// # Example
///
/// ```ignore
/// let mut transfer = store.put(PutRequest::new("live/clip.mp4", path)).await?;
/// while let Some(event) = transfer.next_event().await {
///     if event.is_terminal() {
///         break;
///     }
/// }
/// ```
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Starts uploading `request.source` to `request.key`.
    async fn put(&self, request: PutRequest) -> Result<Transfer>;

    /// Resumes the transfer described by a checkpoint this store emitted.
    ///
    /// Returns [`BridgeError::InvalidCheckpoint`] if the blob cannot be decoded.
    async fn resume(&self, checkpoint: Bytes) -> Result<Transfer>;

    /// Whether a finished object exists under `key`.
    async fn exists(&self, key: &str) -> Result<bool>;

    /// Keys of unfinished multi-part uploads starting with `prefix`.
    async fn list_incomplete_by_prefix(&self, prefix: &str) -> Result<Vec<String>>;

    /// Aborts every unfinished multi-part upload initiated before `older_than`.
    /// Returns how many were aborted.
    async fn abort_all(&self, older_than: DateTime<Utc>) -> Result<usize>;

    /// Whether the configured bucket exists and is reachable with the
    /// configured credentials.
    async fn bucket_exists(&self) -> Result<bool>;

    /// Stops accepting new transfers. Running transfers keep going until they
    /// finish or fail on their own.
    async fn shutdown(&self);
}
