// Tests for partial failure handling

use std::sync::Arc;

use blobvault::fs::{Materializer, ObjectStore};
use blobvault::sync::{
    CancelSignal, ContainerStatus, ErrorKind, PassStatus, StateStore, SyncEngine,
};
use tempfile::TempDir;

use crate::fake_store::{engine, local_file, run, scoped, FakeStore};

fn load_state(dir: &TempDir) -> blobvault::sync::SyncStateFile {
    let raw = std::fs::read(dir.path().join("sync_metadata.json")).unwrap();
    serde_json::from_slice(&raw).unwrap()
}

fn partial_files(root: &std::path::Path) -> Vec<String> {
    jwalk::WalkDir::new(root)
        .into_iter()
        .filter_map(|e| e.ok())
        .map(|e| e.file_name().to_string_lossy().to_string())
        .filter(|name| name.ends_with(".blobvault-partial"))
        .collect()
}

#[tokio::test]
async fn test_listing_failure_keeps_prior_state() {
    let dir = TempDir::new().unwrap();
    let store = FakeStore::new();
    for container in ["a", "b", "c"] {
        store.put_object(container, "file.txt", b"one", "2024-01-01T00:00:00Z");
    }
    let engine = engine(&store, dir.path(), scoped("ALL"));
    assert!(run(&engine).await.is_success());
    let before = load_state(&dir);

    for container in ["a", "b", "c"] {
        store.put_object(container, "file.txt", b"two", "2024-01-05T00:00:00Z");
    }
    store.fail_listing("b", true);
    let report = run(&engine).await;

    assert_eq!(report.status, PassStatus::DoneWithErrors);
    assert_eq!(report.container("a").unwrap().status, ContainerStatus::Done);
    assert_eq!(report.container("b").unwrap().status, ContainerStatus::Failed);
    assert_eq!(report.container("c").unwrap().status, ContainerStatus::Done);
    assert_eq!(report.count_errors(ErrorKind::Listing), 1);
    assert!(report.summary().contains("b: failed"));

    let after = load_state(&dir);
    assert_eq!(after.containers["b"], before.containers["b"]);
    assert_ne!(after.containers["a"].files, before.containers["a"].files);
    assert_ne!(after.containers["c"].files, before.containers["c"].files);
    assert_eq!(std::fs::read(local_file(dir.path(), "b", "file.txt")).unwrap(), b"one");
    assert_eq!(std::fs::read(local_file(dir.path(), "a", "file.txt")).unwrap(), b"two");

    // Once listing works again b catches up
    store.fail_listing("b", false);
    store.reset_counters();
    let report = run(&engine).await;
    assert!(report.is_success());
    assert_eq!(store.fetches(), 1);
}

#[tokio::test]
async fn test_panicked_container_is_reported_by_name() {
    let dir = TempDir::new().unwrap();
    let store = FakeStore::new();
    for container in ["a", "b", "c"] {
        store.put_object(container, "file.txt", b"one", "2024-01-01T00:00:00Z");
    }
    let engine = engine(&store, dir.path(), scoped("ALL"));
    assert!(run(&engine).await.is_success());
    let before = load_state(&dir);

    store.put_object("a", "new.txt", b"new", "2024-01-05T00:00:00Z");
    store.panic_listing("b");
    let report = run(&engine).await;

    assert_eq!(report.status, PassStatus::DoneWithErrors);
    assert_eq!(report.containers.len(), 3);
    let b = report.container("b").unwrap();
    assert_eq!(b.status, ContainerStatus::Failed);
    assert_eq!(b.errors.len(), 1);
    assert!(b.errors[0].to_string().contains("container task aborted"));
    assert_eq!(report.count_errors(ErrorKind::Io), 1);
    assert!(report.summary().contains("b: failed"));
    assert_eq!(report.container("a").unwrap().downloaded, 1);

    let after = load_state(&dir);
    assert_eq!(after.containers["b"], before.containers["b"]);
    assert!(after.containers["a"].files.contains_key("new.txt"));
}

#[tokio::test]
async fn test_failed_fetch_is_retried_next_pass() {
    let dir = TempDir::new().unwrap();
    let store = FakeStore::new();
    store.put_object("docs", "good.txt", b"good", "2024-01-01T00:00:00Z");
    store.put_object("docs", "flaky.txt", b"flaky", "2024-01-01T00:00:00Z");
    store.fail_fetch("docs", "flaky.txt", true);
    let engine = engine(&store, dir.path(), scoped("docs"));

    let first = run(&engine).await;
    let docs = first.container("docs").unwrap();
    assert_eq!(docs.status, ContainerStatus::DoneWithErrors);
    assert_eq!(docs.downloaded, 1);
    assert_eq!(docs.failed, 1);
    assert_eq!(first.count_errors(ErrorKind::Fetch), 1);
    assert_eq!(first.errors().next().unwrap().key(), Some("flaky.txt"));
    assert!(!load_state(&dir).containers["docs"].files.contains_key("flaky.txt"));

    store.fail_fetch("docs", "flaky.txt", false);
    store.reset_counters();
    let second = run(&engine).await;
    assert!(second.is_success());
    assert_eq!(store.fetches(), 1);
    assert_eq!(std::fs::read(local_file(dir.path(), "docs", "flaky.txt")).unwrap(), b"flaky");
}

#[tokio::test]
async fn test_failed_refresh_keeps_old_copy() {
    let dir = TempDir::new().unwrap();
    let store = FakeStore::new();
    store.put_object("docs", "a.txt", b"old", "2024-01-01T00:00:00Z");
    let engine = engine(&store, dir.path(), scoped("docs"));
    run(&engine).await;
    let before = load_state(&dir);

    store.put_object("docs", "a.txt", b"new", "2024-01-02T00:00:00Z");
    store.fail_fetch("docs", "a.txt", true);
    let report = run(&engine).await;
    assert_eq!(report.total_failed(), 1);
    assert_eq!(std::fs::read(local_file(dir.path(), "docs", "a.txt")).unwrap(), b"old");
    assert_eq!(
        load_state(&dir).containers["docs"].files["a.txt"],
        before.containers["docs"].files["a.txt"]
    );

    store.fail_fetch("docs", "a.txt", false);
    let report = run(&engine).await;
    assert_eq!(report.total_downloaded(), 1);
    assert_eq!(std::fs::read(local_file(dir.path(), "docs", "a.txt")).unwrap(), b"new");
}

#[tokio::test]
async fn test_escaping_key_is_rejected() {
    let dir = TempDir::new().unwrap();
    let store = FakeStore::new();
    store.put_object("docs", "../escape.txt", b"evil", "2024-01-01T00:00:00Z");
    store.put_object("docs", "fine.txt", b"fine", "2024-01-01T00:00:00Z");
    let engine = engine(&store, dir.path(), scoped("docs"));

    let report = run(&engine).await;
    assert_eq!(report.count_errors(ErrorKind::InvalidKey), 1);
    assert_eq!(report.total_downloaded(), 1);
    assert!(!dir.path().join("data/escape.txt").exists());
    assert!(!dir.path().join("escape.txt").exists());
    assert!(local_file(dir.path(), "docs", "fine.txt").exists());
}

#[tokio::test]
async fn test_checksum_mismatch_is_not_committed() {
    let dir = TempDir::new().unwrap();
    let store = FakeStore::new();
    store.put_object("docs", "a.txt", b"content", "2024-01-01T00:00:00Z");
    store.corrupt_hash("docs", "a.txt");
    let engine = engine(&store, dir.path(), scoped("docs"));

    let report = run(&engine).await;
    assert_eq!(report.count_errors(ErrorKind::Materialize), 1);
    assert!(!local_file(dir.path(), "docs", "a.txt").exists());
    assert!(partial_files(dir.path()).is_empty());
}

#[tokio::test]
async fn test_unwritable_state_is_reported() {
    let dir = TempDir::new().unwrap();
    let store = FakeStore::new();
    store.put_object("docs", "a.txt", b"alpha", "2024-01-01T00:00:00Z");
    std::fs::write(dir.path().join("blocker"), b"a file, not a directory").unwrap();

    let source: Arc<dyn ObjectStore> = store.clone();
    let engine = SyncEngine::new(
        source,
        Materializer::new(dir.path().join("data")),
        StateStore::new(dir.path().join("blocker/sync_metadata.json")),
        scoped("docs"),
    )
    .unwrap();

    let report = engine.run_pass(&CancelSignal::new()).await;
    assert_eq!(report.status, PassStatus::DoneWithErrors);
    assert_eq!(report.container("docs").unwrap().status, ContainerStatus::Done);
    assert_eq!(
        report.state_error.as_ref().map(|e| e.kind()),
        Some(ErrorKind::StatePersistence)
    );
    assert!(local_file(dir.path(), "docs", "a.txt").exists());
}

#[tokio::test]
async fn test_opaque_hex_etag_is_not_treated_as_md5() {
    let dir = TempDir::new().unwrap();
    let store = FakeStore::new();
    // 32 hex digits, as S3 reports for SSE-KMS objects, but not the content's MD5
    let etag = "9b2cf535f27731c974343645a3985328";
    store.put_object("docs", "encrypted.bin", b"ciphertext-backed", "2024-01-01T00:00:00Z");
    store.set_etag("docs", "encrypted.bin", etag);
    let engine = engine(&store, dir.path(), scoped("docs"));

    let report = run(&engine).await;
    assert!(report.is_success(), "{}", report.summary());
    assert_eq!(report.total_downloaded(), 1);
    assert_eq!(
        std::fs::read(local_file(dir.path(), "docs", "encrypted.bin")).unwrap(),
        b"ciphertext-backed"
    );
    assert_eq!(load_state(&dir).containers["docs"].files["encrypted.bin"].hash, etag);

    // Nothing to redo on the next pass
    store.reset_counters();
    let report = run(&engine).await;
    assert!(report.is_success());
    assert_eq!(store.fetches(), 0);
}
