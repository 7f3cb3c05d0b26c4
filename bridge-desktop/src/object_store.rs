//! Directory-backed object store.
//!
//! Layout under the root:
//!
//! ```text
//! <root>/<key>                              finished objects
//! <root>/.multipart/<upload-id>/upload.json  upload metadata
//! <root>/.multipart/<upload-id>/part-00001   acknowledged parts
//! ```
//!
//! A transfer copies the source in fixed-size parts. After each part it
//! emits `Progress` and a JSON `Checkpoint`; resuming from a checkpoint
//! continues after its last acknowledged part. The finished object is
//! assembled inside the upload directory and renamed into place, so readers
//! never see a partial object.

use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bridge_traits::{
    error::{BridgeError, Result},
    object_store::{ObjectStore, PutRequest, Transfer, TransferEvent},
};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use core_async::fs;
use core_async::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt, SeekFrom};
use core_async::sync::mpsc;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

/// Default part size (5 MiB).
pub const DEFAULT_PART_SIZE: usize = 5 * 1024 * 1024;

const MULTIPART_DIR: &str = ".multipart";
const UPLOAD_META: &str = "upload.json";
const ASSEMBLY_FILE: &str = "assembled";
/// A transfer blocks once this many events are unread.
const EVENT_BUFFER: usize = 4;

/// State of one multi-part upload; also the checkpoint format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct MultipartUpload {
    upload_id: String,
    key: String,
    source: PathBuf,
    part_size: u64,
    parts_done: u64,
    created_at: DateTime<Utc>,
}

impl MultipartUpload {
    fn checkpoint(&self) -> Result<Bytes> {
        serde_json::to_vec(self)
            .map(Bytes::from)
            .map_err(|e| BridgeError::OperationFailed(format!("checkpoint encoding failed: {e}")))
    }

    fn decode(checkpoint: &[u8]) -> Result<Self> {
        let upload: MultipartUpload = serde_json::from_slice(checkpoint)
            .map_err(|e| BridgeError::InvalidCheckpoint(e.to_string()))?;
        if Uuid::parse_str(&upload.upload_id).is_err() {
            return Err(BridgeError::InvalidCheckpoint(format!(
                "malformed upload id {}",
                upload.upload_id
            )));
        }
        if upload.part_size == 0 {
            return Err(BridgeError::InvalidCheckpoint("zero part size".to_string()));
        }
        Ok(upload)
    }
}

struct Inner {
    root: PathBuf,
    part_size: usize,
    accepting: AtomicBool,
    active: AtomicUsize,
}

/// [`ObjectStore`] over a local directory.
#[derive(Clone)]
pub struct LocalObjectStore {
    inner: Arc<Inner>,
}

impl LocalObjectStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self::with_part_size(root, DEFAULT_PART_SIZE)
    }

    pub fn with_part_size(root: impl Into<PathBuf>, part_size: usize) -> Self {
        Self {
            inner: Arc::new(Inner {
                root: root.into(),
                part_size: part_size.max(1),
                accepting: AtomicBool::new(true),
                active: AtomicUsize::new(0),
            }),
        }
    }

    pub fn root(&self) -> &Path {
        &self.inner.root
    }

    /// Transfers currently running.
    pub fn active_transfers(&self) -> usize {
        self.inner.active.load(Ordering::SeqCst)
    }

    pub fn is_accepting(&self) -> bool {
        self.inner.accepting.load(Ordering::SeqCst)
    }

    fn multipart_root(&self) -> PathBuf {
        self.inner.root.join(MULTIPART_DIR)
    }

    fn upload_dir(&self, upload_id: &str) -> PathBuf {
        self.multipart_root().join(upload_id)
    }

    fn object_path(&self, key: &str) -> Result<PathBuf> {
        validate_key(key)?;
        Ok(self.inner.root.join(key))
    }

    fn ensure_accepting(&self) -> Result<()> {
        if self.is_accepting() {
            Ok(())
        } else {
            Err(BridgeError::ShuttingDown)
        }
    }

    /// Metadata of every unfinished upload. Unreadable entries are skipped.
    async fn pending_uploads(&self) -> Result<Vec<MultipartUpload>> {
        let mut uploads = Vec::new();
        let mut entries = match fs::read_dir(self.multipart_root()).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(uploads),
            Err(e) => return Err(e.into()),
        };

        while let Some(entry) = entries.next_entry().await? {
            let meta_path = entry.path().join(UPLOAD_META);
            match fs::read(&meta_path).await {
                Ok(contents) => match serde_json::from_slice::<MultipartUpload>(&contents) {
                    Ok(upload) => uploads.push(upload),
                    Err(e) => debug!(path = ?meta_path, error = %e, "Skipping unreadable upload"),
                },
                Err(e) => debug!(path = ?meta_path, error = %e, "Skipping upload without metadata"),
            }
        }
        Ok(uploads)
    }

    fn spawn_transfer(&self, upload: MultipartUpload) -> Transfer {
        let (events, transfer) = Transfer::channel(upload.key.clone(), EVENT_BUFFER);
        let store = self.clone();
        self.inner.active.fetch_add(1, Ordering::SeqCst);
        core_async::spawn(async move {
            store.run_transfer(upload, events).await;
            store.inner.active.fetch_sub(1, Ordering::SeqCst);
        });
        transfer
    }

    async fn run_transfer(&self, mut upload: MultipartUpload, events: mpsc::Sender<TransferEvent>) {
        match self.copy_parts(&mut upload, &events).await {
            Ok(()) => {
                debug!(key = %upload.key, parts = upload.parts_done, "Object published");
                let _ = events.send(TransferEvent::Completed).await;
            }
            Err(e) => {
                warn!(key = %upload.key, upload_id = %upload.upload_id, error = %e, "Transfer failed");
                let _ = events.send(TransferEvent::Failed(e.to_string())).await;
            }
        }
    }

    async fn copy_parts(
        &self,
        upload: &mut MultipartUpload,
        events: &mpsc::Sender<TransferEvent>,
    ) -> Result<()> {
        let upload_dir = self.upload_dir(&upload.upload_id);
        let total_bytes = fs::metadata(&upload.source).await?.len();
        let part_size = upload.part_size;

        let mut source = fs::File::open(&upload.source).await?;
        source
            .seek(SeekFrom::Start(upload.parts_done * part_size))
            .await?;

        let mut buffer = vec![0u8; part_size as usize];
        loop {
            let read = read_part(&mut source, &mut buffer).await?;
            if read == 0 {
                break;
            }

            fs::write(upload_dir.join(part_name(upload.parts_done + 1)), &buffer[..read]).await?;
            upload.parts_done += 1;

            let progress = TransferEvent::Progress {
                bytes_transferred: (upload.parts_done * part_size).min(total_bytes),
                total_bytes: Some(total_bytes),
            };
            let checkpoint = TransferEvent::Checkpoint(upload.checkpoint()?);
            if events.send(progress).await.is_err() || events.send(checkpoint).await.is_err() {
                return Err(BridgeError::OperationFailed(
                    "transfer listener went away".to_string(),
                ));
            }

            if (read as u64) < part_size {
                break;
            }
        }

        self.publish(upload, &upload_dir).await
    }

    async fn publish(&self, upload: &MultipartUpload, upload_dir: &Path) -> Result<()> {
        let assembly_path = upload_dir.join(ASSEMBLY_FILE);
        let mut assembled = fs::File::create(&assembly_path).await?;
        for part in 1..=upload.parts_done {
            let bytes = fs::read(upload_dir.join(part_name(part))).await?;
            assembled.write_all(&bytes).await?;
        }
        assembled.flush().await?;
        drop(assembled);

        let object_path = self.object_path(&upload.key)?;
        if let Some(parent) = object_path.parent() {
            fs::create_dir_all(parent).await?;
        }
        fs::rename(&assembly_path, &object_path).await?;
        fs::remove_dir_all(upload_dir).await?;
        Ok(())
    }
}

#[async_trait]
impl ObjectStore for LocalObjectStore {
    #[instrument(skip(self, request), fields(key = %request.key))]
    async fn put(&self, request: PutRequest) -> Result<Transfer> {
        self.ensure_accepting()?;
        validate_key(&request.key)?;
        if !fs::metadata(&request.source).await?.is_file() {
            return Err(BridgeError::InvalidRequest(format!(
                "source {} is not a file",
                request.source.display()
            )));
        }
        if let Some(acl) = &request.acl {
            debug!(grantee = acl.grantee.uri(), permission = %acl.permission, "ACL requested");
        }

        let upload = MultipartUpload {
            upload_id: Uuid::new_v4().to_string(),
            key: request.key,
            source: request.source,
            part_size: self.inner.part_size as u64,
            parts_done: 0,
            created_at: Utc::now(),
        };

        let upload_dir = self.upload_dir(&upload.upload_id);
        fs::create_dir_all(&upload_dir).await?;
        let meta = serde_json::to_vec_pretty(&upload)
            .map_err(|e| BridgeError::OperationFailed(e.to_string()))?;
        fs::write(upload_dir.join(UPLOAD_META), meta).await?;

        debug!(upload_id = %upload.upload_id, "Multipart upload created");
        Ok(self.spawn_transfer(upload))
    }

    async fn resume(&self, checkpoint: Bytes) -> Result<Transfer> {
        self.ensure_accepting()?;
        let upload = MultipartUpload::decode(&checkpoint)?;
        validate_key(&upload.key).map_err(|e| BridgeError::InvalidCheckpoint(e.to_string()))?;

        if !fs::try_exists(self.upload_dir(&upload.upload_id)).await? {
            return Err(BridgeError::InvalidCheckpoint(format!(
                "unknown upload {}",
                upload.upload_id
            )));
        }

        debug!(
            key = %upload.key,
            upload_id = %upload.upload_id,
            parts_done = upload.parts_done,
            "Resuming multipart upload"
        );
        Ok(self.spawn_transfer(upload))
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        let path = self.object_path(key)?;
        match fs::metadata(&path).await {
            Ok(meta) => Ok(meta.is_file()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn list_incomplete_by_prefix(&self, prefix: &str) -> Result<Vec<String>> {
        let mut keys: Vec<String> = self
            .pending_uploads()
            .await?
            .into_iter()
            .filter(|upload| upload.key.starts_with(prefix))
            .map(|upload| upload.key)
            .collect();
        keys.sort();
        keys.dedup();
        Ok(keys)
    }

    async fn abort_all(&self, older_than: DateTime<Utc>) -> Result<usize> {
        let mut aborted = 0;
        for upload in self.pending_uploads().await? {
            if upload.created_at >= older_than {
                continue;
            }
            match fs::remove_dir_all(self.upload_dir(&upload.upload_id)).await {
                Ok(()) => aborted += 1,
                Err(e) => warn!(upload_id = %upload.upload_id, error = %e, "Failed to abort upload"),
            }
        }
        if aborted > 0 {
            info!(aborted, "Aborted unfinished uploads");
        }
        Ok(aborted)
    }

    async fn bucket_exists(&self) -> Result<bool> {
        match fs::metadata(&self.inner.root).await {
            Ok(meta) => Ok(meta.is_dir()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn shutdown(&self) {
        if self.inner.accepting.swap(false, Ordering::SeqCst) {
            info!(
                active = self.active_transfers(),
                "Object store stopped accepting transfers"
            );
        }
    }
}

fn part_name(index: u64) -> String {
    format!("part-{index:05}")
}

/// Fills `buffer` from `source`, returning fewer bytes only at end of file.
async fn read_part(source: &mut fs::File, buffer: &mut [u8]) -> Result<usize> {
    let mut filled = 0;
    while filled < buffer.len() {
        let read = source.read(&mut buffer[filled..]).await?;
        if read == 0 {
            break;
        }
        filled += read;
    }
    Ok(filled)
}

fn validate_key(key: &str) -> Result<()> {
    let invalid = |reason: &str| Err(BridgeError::InvalidRequest(format!("key '{key}' {reason}")));
    if key.is_empty() || key.ends_with('/') {
        return invalid("does not name an object");
    }
    let path = Path::new(key);
    if path.is_absolute() {
        return invalid("must be relative");
    }
    for (index, component) in path.components().enumerate() {
        match component {
            Component::Normal(part) if index == 0 && part == MULTIPART_DIR => {
                return invalid("uses a reserved prefix");
            }
            Component::Normal(_) => {}
            _ => return invalid("must not contain '.' or '..' segments"),
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use core_async::time::{sleep, Duration};
    use tempfile::TempDir;

    struct Fixture {
        _dir: TempDir,
        source_dir: PathBuf,
        store: LocalObjectStore,
    }

    fn fixture(part_size: usize) -> Fixture {
        let dir = TempDir::new().unwrap();
        let bucket = dir.path().join("bucket");
        let source_dir = dir.path().join("content");
        std::fs::create_dir_all(&bucket).unwrap();
        std::fs::create_dir_all(&source_dir).unwrap();
        Fixture {
            store: LocalObjectStore::with_part_size(bucket, part_size),
            source_dir,
            _dir: dir,
        }
    }

    fn write_source(fixture: &Fixture, name: &str, contents: &[u8]) -> PathBuf {
        let path = fixture.source_dir.join(name);
        std::fs::write(&path, contents).unwrap();
        path
    }

    async fn drain(transfer: &mut Transfer) -> Vec<TransferEvent> {
        let mut seen = Vec::new();
        while let Some(event) = transfer.next_event().await {
            let terminal = event.is_terminal();
            seen.push(event);
            if terminal {
                break;
            }
        }
        seen
    }

    async fn wait_idle(store: &LocalObjectStore) {
        for _ in 0..200 {
            if store.active_transfers() == 0 {
                return;
            }
            sleep(Duration::from_millis(5)).await;
        }
        panic!("transfers did not finish");
    }

    #[tokio::test]
    async fn test_put_uploads_in_parts() {
        let f = fixture(4);
        let source = write_source(&f, "clip.mp4", b"0123456789");

        let mut transfer = f
            .store
            .put(PutRequest::new("live/clip.mp4", &source))
            .await
            .unwrap();
        assert_eq!(transfer.key(), "live/clip.mp4");
        let events = drain(&mut transfer).await;

        let checkpoints = events
            .iter()
            .filter(|e| matches!(e, TransferEvent::Checkpoint(_)))
            .count();
        assert_eq!(checkpoints, 3);
        assert_eq!(
            events.iter().rev().nth(2),
            Some(&TransferEvent::Progress {
                bytes_transferred: 10,
                total_bytes: Some(10)
            })
        );
        assert_eq!(events.last(), Some(&TransferEvent::Completed));

        assert!(f.store.exists("live/clip.mp4").await.unwrap());
        assert_eq!(
            std::fs::read(f.store.root().join("live/clip.mp4")).unwrap(),
            b"0123456789"
        );
        assert!(f.store.list_incomplete_by_prefix("").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_resume_continues_after_checkpoint() {
        let f = fixture(2);
        let contents = b"abcdefghijklmnopqrstuvwxyz";
        let source = write_source(&f, "clip.mp4", contents);

        let mut transfer = f.store.put(PutRequest::new("clip.mp4", &source)).await.unwrap();
        let checkpoint = loop {
            match transfer.next_event().await.unwrap() {
                TransferEvent::Checkpoint(checkpoint) => break checkpoint,
                TransferEvent::Progress { .. } => continue,
                other => panic!("unexpected {other:?}"),
            }
        };
        // Simulate a crash: nobody listens any more.
        drop(transfer);
        wait_idle(&f.store).await;

        assert!(!f.store.exists("clip.mp4").await.unwrap());
        assert_eq!(
            f.store.list_incomplete_by_prefix("clip").await.unwrap(),
            vec!["clip.mp4"]
        );

        let mut resumed = f.store.resume(checkpoint).await.unwrap();
        assert_eq!(resumed.key(), "clip.mp4");
        let events = drain(&mut resumed).await;
        assert_eq!(events.last(), Some(&TransferEvent::Completed));
        // The first part was not copied again.
        assert!(matches!(
            events.first(),
            Some(TransferEvent::Progress { bytes_transferred: 4, .. })
        ));
        assert_eq!(std::fs::read(f.store.root().join("clip.mp4")).unwrap(), contents);
    }

    #[tokio::test]
    async fn test_resume_rejects_bad_checkpoints() {
        let f = fixture(4);

        let err = f.store.resume(Bytes::from_static(b"not json")).await.unwrap_err();
        assert!(matches!(err, BridgeError::InvalidCheckpoint(_)));

        let unknown = MultipartUpload {
            upload_id: Uuid::new_v4().to_string(),
            key: "clip.mp4".to_string(),
            source: f.source_dir.join("clip.mp4"),
            part_size: 4,
            parts_done: 1,
            created_at: Utc::now(),
        };
        let err = f.store.resume(unknown.checkpoint().unwrap()).await.unwrap_err();
        assert!(matches!(err, BridgeError::InvalidCheckpoint(_)));

        let escaping = MultipartUpload {
            upload_id: "../../etc".to_string(),
            ..unknown
        };
        let err = f.store.resume(escaping.checkpoint().unwrap()).await.unwrap_err();
        assert!(matches!(err, BridgeError::InvalidCheckpoint(_)));
    }

    #[tokio::test]
    async fn test_missing_source_fails_put() {
        let f = fixture(4);
        let err = f
            .store
            .put(PutRequest::new("clip.mp4", f.source_dir.join("missing.mp4")))
            .await
            .unwrap_err();
        assert!(matches!(err, BridgeError::Io(_)));
    }

    #[tokio::test]
    async fn test_shutdown_rejects_new_transfers() {
        let f = fixture(4);
        let source = write_source(&f, "clip.mp4", b"data");

        f.store.shutdown().await;
        f.store.shutdown().await;
        assert!(!f.store.is_accepting());

        let err = f.store.put(PutRequest::new("clip.mp4", &source)).await.unwrap_err();
        assert!(matches!(err, BridgeError::ShuttingDown));
    }

    #[tokio::test]
    async fn test_abort_all_respects_age() {
        let f = fixture(2);
        let source = write_source(&f, "clip.mp4", b"abcdef");

        let transfer = f.store.put(PutRequest::new("clip.mp4", &source)).await.unwrap();
        drop(transfer);
        wait_idle(&f.store).await;

        let before_upload = Utc::now() - chrono::Duration::hours(1);
        assert_eq!(f.store.abort_all(before_upload).await.unwrap(), 0);
        assert_eq!(f.store.list_incomplete_by_prefix("").await.unwrap().len(), 1);

        let later = Utc::now() + chrono::Duration::seconds(1);
        assert_eq!(f.store.abort_all(later).await.unwrap(), 1);
        assert!(f.store.list_incomplete_by_prefix("").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_key_validation() {
        let f = fixture(4);
        for key in ["", "../x", "/abs", "a/../b", ".multipart/x", "dir/"] {
            assert!(
                matches!(f.store.exists(key).await, Err(BridgeError::InvalidRequest(_))),
                "{key} should be rejected"
            );
        }
        assert!(!f.store.exists("a/b/c.mp4").await.unwrap());
    }

    #[tokio::test]
    async fn test_bucket_probe() {
        let f = fixture(4);
        assert!(f.store.bucket_exists().await.unwrap());

        let missing = LocalObjectStore::new(f.source_dir.join("nope"));
        assert!(!missing.bucket_exists().await.unwrap());
    }
}
