mod common;

use std::time::Duration;

use bridge_traits::{AccessControl, BridgeError, GroupGrantee, Permission, TransferEvent};
use bytes::Bytes;
use common::{config, marker_path, wait_for, write_media, Harness, ScriptedObjectStore};
use core_runtime::UploadEvent;
use core_upload::{StartOutcome, UploadError};
use tempfile::TempDir;

const KEY: &str = "recordings/clip.mp4";

#[tokio::test]
async fn completion_removes_marker_and_keeps_original_by_default() {
    let dir = TempDir::new().unwrap();
    let h = Harness::new(config(dir.path()));
    let mut events = h.events.subscribe();
    write_media(dir.path(), "clip.mp4", &h.clock, Duration::from_secs(10));

    h.orchestrator.on_write_complete("clip.mp4").await.unwrap();
    assert!(marker_path(dir.path(), "clip.mp4").exists());

    h.store.emit(KEY, TransferEvent::Completed).await;
    wait_for(&mut events, |e| matches!(e, UploadEvent::Completed { .. })).await;

    assert!(!marker_path(dir.path(), "clip.mp4").exists());
    assert!(dir.path().join("clip.mp4").exists());
    assert!(h.orchestrator.in_flight_keys().await.is_empty());
    assert_eq!(h.orchestrator.active_uploads().await, 0);
}

#[tokio::test]
async fn completion_deletes_original_when_configured() {
    let dir = TempDir::new().unwrap();
    let mut cfg = config(dir.path());
    cfg.delete_original = true;
    let h = Harness::new(cfg);
    let mut events = h.events.subscribe();
    write_media(dir.path(), "clip.mp4", &h.clock, Duration::from_secs(10));

    h.orchestrator.on_write_complete("clip.mp4").await.unwrap();
    h.store.emit(KEY, TransferEvent::Completed).await;
    wait_for(&mut events, |e| matches!(e, UploadEvent::Completed { .. })).await;

    // Deletion happens after the event, outside the lock.
    for _ in 0..50 {
        if !dir.path().join("clip.mp4").exists() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(!dir.path().join("clip.mp4").exists());
}

#[tokio::test]
async fn acl_is_applied_to_fresh_uploads() {
    let dir = TempDir::new().unwrap();
    let mut cfg = config(dir.path());
    let acl = AccessControl::new(GroupGrantee::AllUsers, Permission::Read);
    cfg.acl = Some(acl);
    let h = Harness::new(cfg);
    write_media(dir.path(), "clip.mp4", &h.clock, Duration::from_secs(10));

    h.orchestrator.on_write_complete("clip.mp4").await.unwrap();

    let puts = h.store.puts();
    assert_eq!(puts.len(), 1);
    assert_eq!(puts[0].acl, Some(acl));
    assert_eq!(puts[0].source, dir.path().join("clip.mp4"));
}

#[tokio::test]
async fn write_complete_keeps_existing_checkpoint() {
    let dir = TempDir::new().unwrap();
    let h = Harness::new(config(dir.path()));
    write_media(dir.path(), "clip.mp4", &h.clock, Duration::from_secs(10));
    std::fs::write(marker_path(dir.path(), "clip.mp4"), format!("ckpt:{KEY}")).unwrap();

    h.orchestrator.on_write_complete("clip.mp4").await.unwrap();

    assert_eq!(h.store.resume_keys(), vec![KEY]);
    assert!(h.store.put_keys().is_empty());
}

#[tokio::test]
async fn write_complete_by_path() {
    let dir = TempDir::new().unwrap();
    let h = Harness::new(config(dir.path()));
    write_media(dir.path(), "live/clip.mp4", &h.clock, Duration::from_secs(10));

    h.orchestrator
        .on_write_complete_path(&dir.path().join("live/clip.mp4"))
        .await
        .unwrap();
    assert_eq!(h.store.put_keys(), vec!["recordings/live/clip.mp4"]);

    let outside = TempDir::new().unwrap();
    let err = h
        .orchestrator
        .on_write_complete_path(&outside.path().join("clip.mp4"))
        .await
        .unwrap_err();
    assert!(matches!(err, UploadError::InvalidMediaName { .. }));
}

#[tokio::test]
async fn marker_io_error_only_affects_that_file() {
    let dir = TempDir::new().unwrap();
    let h = Harness::new(config(dir.path()));
    write_media(dir.path(), "clip.mp4", &h.clock, Duration::from_secs(10));

    let err = h
        .orchestrator
        .on_write_complete("missing-dir/clip.mp4")
        .await
        .unwrap_err();
    assert!(matches!(err, UploadError::MarkerIo { .. }));

    h.orchestrator.on_write_complete("clip.mp4").await.unwrap();
    assert_eq!(h.store.put_keys(), vec![KEY]);
}

#[tokio::test]
async fn missing_marker_or_source() {
    let dir = TempDir::new().unwrap();
    let h = Harness::new(config(dir.path()));
    let mut events = h.events.subscribe();

    assert_eq!(
        h.orchestrator.try_start_upload("clip.mp4").await.unwrap(),
        StartOutcome::NoMarker
    );

    std::fs::write(marker_path(dir.path(), "gone.mp4"), b"").unwrap();
    assert_eq!(
        h.orchestrator.try_start_upload("gone.mp4").await.unwrap(),
        StartOutcome::SourceMissing
    );
    assert!(!marker_path(dir.path(), "gone.mp4").exists());
    wait_for(&mut events, |e| matches!(e, UploadEvent::Orphaned { .. })).await;
    assert!(h.store.started_keys().is_empty());
}

#[tokio::test]
async fn checkpoints_are_persisted_in_order() {
    let dir = TempDir::new().unwrap();
    let h = Harness::new(config(dir.path()));
    let mut events = h.events.subscribe();
    write_media(dir.path(), "clip.mp4", &h.clock, Duration::from_secs(10));
    h.orchestrator.on_write_complete("clip.mp4").await.unwrap();

    for part in 1..=3 {
        h.store
            .emit(KEY, TransferEvent::Checkpoint(Bytes::from(format!("ckpt:{KEY}#{part}"))))
            .await;
    }
    for _ in 1..=3 {
        wait_for(&mut events, |e| matches!(e, UploadEvent::Checkpointed { .. })).await;
    }

    assert_eq!(
        std::fs::read_to_string(marker_path(dir.path(), "clip.mp4")).unwrap(),
        format!("ckpt:{KEY}#3")
    );
    assert!(!dir.path().join("clip.mp4.upload.tmp").exists());
}

#[tokio::test]
async fn late_checkpoint_does_not_recreate_marker() {
    let dir = TempDir::new().unwrap();
    let h = Harness::new(config(dir.path()));
    let mut events = h.events.subscribe();
    write_media(dir.path(), "clip.mp4", &h.clock, Duration::from_secs(10));
    h.orchestrator.on_write_complete("clip.mp4").await.unwrap();

    h.store
        .emit(KEY, TransferEvent::Checkpoint(ScriptedObjectStore::checkpoint_for(KEY)))
        .await;
    h.store.emit(KEY, TransferEvent::Completed).await;
    wait_for(&mut events, |e| matches!(e, UploadEvent::Completed { .. })).await;
    h.orchestrator.flush_checkpoints().await;

    assert!(!marker_path(dir.path(), "clip.mp4").exists());
    assert!(!dir.path().join("clip.mp4.upload.tmp").exists());
}

#[tokio::test(start_paused = true)]
async fn failure_retries_after_timeout_plus_age() {
    let dir = TempDir::new().unwrap();
    let h = Harness::new(config(dir.path()));
    let mut events = h.events.subscribe();
    write_media(dir.path(), "clip.mp4", &h.clock, Duration::from_secs(10));
    h.orchestrator.on_write_complete("clip.mp4").await.unwrap();

    h.store
        .emit(KEY, TransferEvent::Failed("connection reset".into()))
        .await;
    let failed = wait_for(&mut events, |e| matches!(e, UploadEvent::Failed { .. })).await;
    assert!(matches!(failed, UploadEvent::Failed { will_retry: true, .. }));
    assert_eq!(h.orchestrator.pending_timers().await, 1);
    assert!(h.orchestrator.in_flight_keys().await.is_empty());
    assert!(marker_path(dir.path(), "clip.mp4").exists());

    // Age at failure was 10s, so the retry waits for an age of 70s: 60s more.
    tokio::time::sleep(Duration::from_secs(59)).await;
    assert_eq!(h.store.put_keys().len(), 1);

    tokio::time::sleep(Duration::from_secs(2)).await;
    assert_eq!(h.store.put_keys(), vec![KEY, KEY]);
}

#[tokio::test]
async fn failure_without_retry_leaves_marker() {
    let dir = TempDir::new().unwrap();
    let mut cfg = config(dir.path());
    cfg.retry.enabled = false;
    let h = Harness::new(cfg);
    let mut events = h.events.subscribe();
    write_media(dir.path(), "clip.mp4", &h.clock, Duration::from_secs(10));
    h.orchestrator.on_write_complete("clip.mp4").await.unwrap();

    h.store.drop_transfer(KEY);
    let failed = wait_for(&mut events, |e| matches!(e, UploadEvent::Failed { .. })).await;
    assert!(matches!(failed, UploadEvent::Failed { will_retry: false, .. }));
    assert_eq!(h.orchestrator.pending_timers().await, 0);
    assert_eq!(h.orchestrator.active_uploads().await, 0);
    assert!(marker_path(dir.path(), "clip.mp4").exists());
}

#[tokio::test]
async fn checkpoint_before_failure_is_kept_in_marker() {
    let dir = TempDir::new().unwrap();
    let mut cfg = config(dir.path());
    cfg.retry.enabled = false;
    let h = Harness::new(cfg);
    let mut events = h.events.subscribe();
    write_media(dir.path(), "clip.mp4", &h.clock, Duration::from_secs(10));
    h.orchestrator.on_write_complete("clip.mp4").await.unwrap();

    h.store
        .emit(KEY, TransferEvent::Checkpoint(ScriptedObjectStore::checkpoint_for(KEY)))
        .await;
    h.store
        .emit(KEY, TransferEvent::Failed("connection reset".into()))
        .await;
    wait_for(&mut events, |e| matches!(e, UploadEvent::Failed { .. })).await;

    assert_eq!(
        std::fs::read_to_string(marker_path(dir.path(), "clip.mp4")).unwrap(),
        format!("ckpt:{KEY}")
    );
    assert!(!dir.path().join("clip.mp4.upload.tmp").exists());
}

#[tokio::test]
async fn checkpoint_before_closed_stream_is_kept_in_marker() {
    let dir = TempDir::new().unwrap();
    let mut cfg = config(dir.path());
    cfg.retry.enabled = false;
    let h = Harness::new(cfg);
    let mut events = h.events.subscribe();
    write_media(dir.path(), "clip.mp4", &h.clock, Duration::from_secs(10));
    h.orchestrator.on_write_complete("clip.mp4").await.unwrap();

    h.store
        .emit(KEY, TransferEvent::Checkpoint(ScriptedObjectStore::checkpoint_for(KEY)))
        .await;
    h.store.drop_transfer(KEY);
    wait_for(&mut events, |e| matches!(e, UploadEvent::Failed { .. })).await;

    assert_eq!(
        std::fs::read_to_string(marker_path(dir.path(), "clip.mp4")).unwrap(),
        format!("ckpt:{KEY}")
    );
}

#[tokio::test(start_paused = true)]
async fn retry_after_failure_resumes_same_key() {
    let dir = TempDir::new().unwrap();
    let mut cfg = config(dir.path());
    cfg.naming.versioning = true;
    let h = Harness::new(cfg);
    let mut events = h.events.subscribe();
    write_media(dir.path(), "clip.mp4", &h.clock, Duration::from_secs(10));
    h.orchestrator.on_write_complete("clip.mp4").await.unwrap();
    assert_eq!(h.store.put_keys(), vec![KEY]);

    h.store
        .emit(KEY, TransferEvent::Checkpoint(ScriptedObjectStore::checkpoint_for(KEY)))
        .await;
    // The multipart upload for KEY is now unfinished on the remote side.
    h.store.add_incomplete(KEY);
    h.store
        .emit(KEY, TransferEvent::Failed("connection reset".into()))
        .await;
    let failed = wait_for(&mut events, |e| matches!(e, UploadEvent::Failed { .. })).await;
    assert!(matches!(failed, UploadEvent::Failed { will_retry: true, .. }));

    tokio::time::sleep(Duration::from_secs(61)).await;
    assert_eq!(h.store.resume_keys(), vec![KEY]);
    assert_eq!(h.store.put_keys(), vec![KEY]);
    assert_eq!(h.store.started_keys(), vec![KEY, KEY]);
}

#[tokio::test]
async fn shared_key_stays_in_flight_until_last_holder_ends() {
    let dir = TempDir::new().unwrap();
    let mut cfg = config(dir.path());
    cfg.retry.enabled = false;
    let h = Harness::new(cfg);
    let mut events = h.events.subscribe();
    write_media(dir.path(), "a.mp4", &h.clock, Duration::from_secs(10));
    write_media(dir.path(), "b.mp4", &h.clock, Duration::from_secs(10));
    let shared = "recordings/a.mp4";

    h.orchestrator.on_write_complete("a.mp4").await.unwrap();
    // b's checkpoint points at the key a is uploading to. Resuming it
    // replaces a's transfer, whose stream then closes.
    std::fs::write(marker_path(dir.path(), "b.mp4"), format!("ckpt:{shared}")).unwrap();
    h.orchestrator.on_write_complete("b.mp4").await.unwrap();
    assert_eq!(h.store.resume_keys(), vec![shared]);

    let failed = wait_for(&mut events, |e| matches!(e, UploadEvent::Failed { .. })).await;
    assert_eq!(failed.media_name(), "a.mp4");
    assert_eq!(h.orchestrator.in_flight_keys().await, vec![shared]);

    h.store.emit(shared, TransferEvent::Completed).await;
    let done = wait_for(&mut events, |e| matches!(e, UploadEvent::Completed { .. })).await;
    assert_eq!(done.media_name(), "b.mp4");
    assert!(h.orchestrator.in_flight_keys().await.is_empty());
}

#[tokio::test]
async fn rejected_put_is_retried_only_when_transient() {
    let dir = TempDir::new().unwrap();
    let h = Harness::new(config(dir.path()));
    write_media(dir.path(), "a.mp4", &h.clock, Duration::from_secs(10));
    write_media(dir.path(), "b.mp4", &h.clock, Duration::from_secs(10));

    h.store
        .fail_next_put(BridgeError::OperationFailed("503 Slow Down".into()));
    h.orchestrator.on_write_complete("a.mp4").await.unwrap();
    assert_eq!(h.orchestrator.pending_timers().await, 1);
    assert!(h.orchestrator.in_flight_keys().await.is_empty());

    h.store.fail_next_put(BridgeError::NotAvailable("no credentials".into()));
    h.orchestrator.on_write_complete("b.mp4").await.unwrap();
    assert_eq!(h.orchestrator.pending_timers().await, 1);
    assert!(marker_path(dir.path(), "b.mp4").exists());
    assert_eq!(h.orchestrator.active_uploads().await, 0);
}

#[tokio::test]
async fn invalid_checkpoint_restarts_from_scratch() {
    let dir = TempDir::new().unwrap();
    let h = Harness::new(config(dir.path()));
    write_media(dir.path(), "clip.mp4", &h.clock, Duration::from_secs(10));
    std::fs::write(marker_path(dir.path(), "clip.mp4"), b"garbage").unwrap();

    let err = h.orchestrator.try_start_upload("clip.mp4").await.unwrap_err();
    assert!(matches!(err, UploadError::Store(BridgeError::InvalidCheckpoint(_))));

    assert_eq!(std::fs::read(marker_path(dir.path(), "clip.mp4")).unwrap(), b"");
    assert_eq!(h.orchestrator.pending_timers().await, 1);
    assert_eq!(h.orchestrator.active_uploads().await, 0);
}

#[tokio::test]
async fn exhausted_versions_leave_marker_without_retry() {
    let dir = TempDir::new().unwrap();
    let mut cfg = config(dir.path());
    cfg.naming.versioning = true;
    cfg.naming.max_versions = 2;
    let h = Harness::new(cfg);
    for key in ["recordings/clip.mp4", "recordings/clip_0.mp4", "recordings/clip_1.mp4"] {
        h.store.add_existing(key);
    }
    write_media(dir.path(), "clip.mp4", &h.clock, Duration::from_secs(10));
    std::fs::write(marker_path(dir.path(), "clip.mp4"), b"").unwrap();

    let err = h.orchestrator.try_start_upload("clip.mp4").await.unwrap_err();
    assert!(matches!(err, UploadError::VersionsExhausted { attempts: 2, .. }));
    assert!(marker_path(dir.path(), "clip.mp4").exists());
    assert_eq!(h.orchestrator.pending_timers().await, 0);
    assert!(h.store.put_keys().is_empty());
}

#[tokio::test]
async fn transfer_events_touch_host_at_most_once_per_interval() {
    let dir = TempDir::new().unwrap();
    let h = Harness::new(config(dir.path()));
    let mut events = h.events.subscribe();
    write_media(dir.path(), "clip.mp4", &h.clock, Duration::from_secs(10));
    h.orchestrator.on_write_complete("clip.mp4").await.unwrap();

    for sent in 1..=10u64 {
        h.store
            .emit(
                KEY,
                TransferEvent::Progress {
                    bytes_transferred: sent * 100,
                    total_bytes: Some(1000),
                },
            )
            .await;
    }
    h.store.emit(KEY, TransferEvent::Completed).await;
    wait_for(&mut events, |e| matches!(e, UploadEvent::Completed { .. })).await;

    assert_eq!(h.host.touches(), 1);
}
