#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use bridge_traits::error::Result;
use bridge_traits::{
    BridgeError, Clock, HostSession, ObjectStore, PutRequest, Transfer, TransferEvent,
};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use core_runtime::{CoreEvent, EventBus, NamingPolicy, RetryPolicy, UploadEvent};
use core_upload::{OrchestratorConfig, UploadOrchestrator};
use filetime::{set_file_mtime, FileTime};
use tokio::sync::{broadcast, mpsc};

// ============================================================================
// Object store
// ============================================================================

/// Object store whose transfers are driven by the test.
///
/// Checkpoints are `ckpt:<key>`; anything else is rejected on resume.
#[derive(Default)]
pub struct ScriptedObjectStore {
    inner: Mutex<StoreState>,
    shutdown_calls: AtomicUsize,
}

#[derive(Default)]
struct StoreState {
    existing: HashSet<String>,
    incomplete: HashSet<String>,
    puts: Vec<PutRequest>,
    resumes: Vec<String>,
    started: Vec<String>,
    senders: HashMap<String, mpsc::Sender<TransferEvent>>,
    fail_next_put: Option<BridgeError>,
    accepting: bool,
    aborted_before: Vec<DateTime<Utc>>,
}

impl ScriptedObjectStore {
    pub fn new() -> Arc<Self> {
        let store = Self::default();
        store.inner.lock().unwrap().accepting = true;
        Arc::new(store)
    }

    pub fn add_existing(&self, key: &str) {
        self.inner.lock().unwrap().existing.insert(key.to_string());
    }

    pub fn add_incomplete(&self, key: &str) {
        self.inner.lock().unwrap().incomplete.insert(key.to_string());
    }

    pub fn fail_next_put(&self, error: BridgeError) {
        self.inner.lock().unwrap().fail_next_put = Some(error);
    }

    pub fn checkpoint_for(key: &str) -> Bytes {
        Bytes::from(format!("ckpt:{key}"))
    }

    pub fn put_keys(&self) -> Vec<String> {
        self.inner
            .lock()
            .unwrap()
            .puts
            .iter()
            .map(|request| request.key.clone())
            .collect()
    }

    pub fn puts(&self) -> Vec<PutRequest> {
        self.inner.lock().unwrap().puts.clone()
    }

    pub fn resume_keys(&self) -> Vec<String> {
        self.inner.lock().unwrap().resumes.clone()
    }

    /// Keys of every accepted put or resume, in order.
    pub fn started_keys(&self) -> Vec<String> {
        self.inner.lock().unwrap().started.clone()
    }

    pub fn shutdown_calls(&self) -> usize {
        self.shutdown_calls.load(Ordering::SeqCst)
    }

    pub fn aborted_before(&self) -> Vec<DateTime<Utc>> {
        self.inner.lock().unwrap().aborted_before.clone()
    }

    /// Delivers `event` to the transfer for `key`.
    pub async fn emit(&self, key: &str, event: TransferEvent) {
        let sender = self
            .inner
            .lock()
            .unwrap()
            .senders
            .get(key)
            .cloned()
            .unwrap_or_else(|| panic!("no transfer for {key}"));
        if event.is_terminal() {
            self.inner.lock().unwrap().senders.remove(key);
            if event == TransferEvent::Completed {
                self.inner.lock().unwrap().existing.insert(key.to_string());
            }
        }
        sender.send(event).await.unwrap();
    }

    /// Closes the event stream for `key` without a terminal event.
    pub fn drop_transfer(&self, key: &str) {
        self.inner.lock().unwrap().senders.remove(key);
    }

    fn open(&self, key: &str) -> Transfer {
        let (sender, transfer) = Transfer::channel(key, 16);
        self.inner
            .lock()
            .unwrap()
            .senders
            .insert(key.to_string(), sender);
        transfer
    }
}

#[async_trait]
impl ObjectStore for ScriptedObjectStore {
    async fn put(&self, request: PutRequest) -> Result<Transfer> {
        {
            let mut inner = self.inner.lock().unwrap();
            if !inner.accepting {
                return Err(BridgeError::ShuttingDown);
            }
            if let Some(error) = inner.fail_next_put.take() {
                return Err(error);
            }
            inner.puts.push(request.clone());
            inner.started.push(request.key.clone());
        }
        Ok(self.open(&request.key))
    }

    async fn resume(&self, checkpoint: Bytes) -> Result<Transfer> {
        let text = String::from_utf8(checkpoint.to_vec())
            .map_err(|e| BridgeError::InvalidCheckpoint(e.to_string()))?;
        let key = text
            .strip_prefix("ckpt:")
            .ok_or_else(|| BridgeError::InvalidCheckpoint(format!("unknown checkpoint {text}")))?
            .to_string();
        {
            let mut inner = self.inner.lock().unwrap();
            if !inner.accepting {
                return Err(BridgeError::ShuttingDown);
            }
            inner.resumes.push(key.clone());
            inner.started.push(key.clone());
        }
        Ok(self.open(&key))
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        Ok(self.inner.lock().unwrap().existing.contains(key))
    }

    async fn list_incomplete_by_prefix(&self, prefix: &str) -> Result<Vec<String>> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .incomplete
            .iter()
            .filter(|key| key.starts_with(prefix))
            .cloned()
            .collect())
    }

    async fn abort_all(&self, older_than: DateTime<Utc>) -> Result<usize> {
        let mut inner = self.inner.lock().unwrap();
        inner.aborted_before.push(older_than);
        let count = inner.incomplete.len();
        inner.incomplete.clear();
        Ok(count)
    }

    async fn bucket_exists(&self) -> Result<bool> {
        Ok(true)
    }

    async fn shutdown(&self) {
        self.shutdown_calls.fetch_add(1, Ordering::SeqCst);
        self.inner.lock().unwrap().accepting = false;
    }
}

// ============================================================================
// Host and clock
// ============================================================================

pub struct RecordingHost {
    pub touches: AtomicUsize,
    idle_timeout: Duration,
}

impl RecordingHost {
    pub fn new(idle_timeout: Duration) -> Arc<Self> {
        Arc::new(Self {
            touches: AtomicUsize::new(0),
            idle_timeout,
        })
    }

    pub fn touches(&self) -> usize {
        self.touches.load(Ordering::SeqCst)
    }
}

impl HostSession for RecordingHost {
    fn touch(&self) {
        self.touches.fetch_add(1, Ordering::SeqCst);
    }

    fn idle_timeout(&self) -> Duration {
        self.idle_timeout
    }
}

/// Wall clock that advances with tokio's (possibly paused) clock.
///
/// The starting point is truncated to whole seconds so file mtimes set
/// from it compare exactly.
pub struct TokioClock {
    base: DateTime<Utc>,
    origin: tokio::time::Instant,
}

impl TokioClock {
    pub fn new() -> Arc<Self> {
        let secs = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_secs() as i64;
        Arc::new(Self {
            base: DateTime::from_timestamp(secs, 0).unwrap(),
            origin: tokio::time::Instant::now(),
        })
    }

    pub fn system_now(&self) -> SystemTime {
        self.now().into()
    }
}

impl Clock for TokioClock {
    fn now(&self) -> DateTime<Utc> {
        let elapsed = tokio::time::Instant::now() - self.origin;
        self.base + chrono::Duration::from_std(elapsed).unwrap()
    }
}

// ============================================================================
// Fixtures
// ============================================================================

pub fn config(root: &Path) -> OrchestratorConfig {
    OrchestratorConfig {
        storage_root: root.to_path_buf(),
        naming: NamingPolicy {
            prefix: Some("recordings".to_string()),
            versioning: false,
            strip_legacy_suffix: true,
            max_versions: 100,
        },
        resume_uploads: true,
        retry: RetryPolicy {
            enabled: true,
            timeout: Duration::from_secs(60),
        },
        initial_delay: Duration::ZERO,
        delete_original: false,
        acl: None,
    }
}

pub struct Harness {
    pub store: Arc<ScriptedObjectStore>,
    pub host: Arc<RecordingHost>,
    pub clock: Arc<TokioClock>,
    pub events: EventBus,
    pub orchestrator: Arc<UploadOrchestrator>,
}

impl Harness {
    pub fn new(config: OrchestratorConfig) -> Self {
        Self::with_store(config, ScriptedObjectStore::new())
    }

    pub fn with_store(config: OrchestratorConfig, store: Arc<ScriptedObjectStore>) -> Self {
        let host = RecordingHost::new(Duration::from_secs(60));
        let clock = TokioClock::new();
        let events = EventBus::default();
        let orchestrator = UploadOrchestrator::new(
            config,
            store.clone(),
            host.clone(),
            clock.clone(),
            events.clone(),
        );
        Self {
            store,
            host,
            clock,
            events,
            orchestrator,
        }
    }
}

/// Writes a media file whose mtime is `age` before the clock's now.
pub fn write_media(root: &Path, media_name: &str, clock: &TokioClock, age: Duration) {
    let path = root.join(media_name);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).unwrap();
    }
    std::fs::write(&path, b"media bytes").unwrap();
    set_mtime(&path, clock.system_now() - age);
}

pub fn set_mtime(path: &Path, time: SystemTime) {
    set_file_mtime(path, FileTime::from_system_time(time)).unwrap();
}

pub fn marker_path(root: &Path, media_name: &str) -> std::path::PathBuf {
    root.join(format!("{media_name}.upload"))
}

/// Waits (up to 5s) for an upload event matching `predicate`.
pub async fn wait_for<F>(events: &mut broadcast::Receiver<CoreEvent>, mut predicate: F) -> UploadEvent
where
    F: FnMut(&UploadEvent) -> bool,
{
    let deadline = Duration::from_secs(5);
    tokio::time::timeout(deadline, async {
        loop {
            match events.recv().await {
                Ok(CoreEvent::Upload(event)) if predicate(&event) => return event,
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(e) => panic!("event bus closed: {e}"),
            }
        }
    })
    .await
    .expect("timed out waiting for upload event")
}
