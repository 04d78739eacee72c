// Tests for backup and restore services

use std::sync::Arc;

use blobvault::archive::ArchiveVault;
use blobvault::fs::{ContainerScope, ObjectStore};
use blobvault::service::{BackupService, RestoreService};
use blobvault::sync::CancelSignal;
use chrono::Utc;
use opendal::{services, Operator};
use tempfile::TempDir;

use crate::fake_store::{engine, scoped, FakeStore};

fn fs_vault(root: &std::path::Path) -> ArchiveVault {
    let op = Operator::new(services::Fs::default().root(&root.to_string_lossy()))
        .unwrap()
        .finish();
    ArchiveVault::new(op, "backups")
}

fn seeded_source() -> Arc<FakeStore> {
    let store = FakeStore::new();
    store.put_object("videos", "a.mp4", b"first video", "2024-01-01T00:00:00Z");
    store.put_object("videos", "clips/b.mp4", b"second video", "2024-01-01T00:00:00Z");
    store.put_object("photos", "c.jpg", b"a photo", "2024-01-01T00:00:00Z");
    store
}

#[tokio::test]
async fn test_backup_archives_only_changed_containers() {
    let work = TempDir::new().unwrap();
    let vault_dir = TempDir::new().unwrap();
    let source = seeded_source();

    let service = BackupService::new(
        engine(&source, work.path(), scoped("ALL")),
        fs_vault(vault_dir.path()),
        work.path().join("tmp"),
        7,
    );

    let report = service.run_once(&CancelSignal::new()).await;
    assert!(report.is_success());
    let mut archived: Vec<_> = report.archived.iter().map(|a| a.container.as_str()).collect();
    archived.sort();
    assert_eq!(archived, vec!["photos", "videos"]);
    assert_eq!(fs_vault(vault_dir.path()).list().await.unwrap().len(), 2);

    // Nothing changed, nothing new to archive
    let report = service.run_once(&CancelSignal::new()).await;
    assert!(report.is_success());
    assert!(report.archived.is_empty());
    assert_eq!(report.pruned, 0);

    // Temporary archives do not accumulate
    let leftovers = std::fs::read_dir(work.path().join("tmp")).unwrap().count();
    assert_eq!(leftovers, 0);
}

#[tokio::test]
async fn test_restore_latest_archive_into_target() {
    let work = TempDir::new().unwrap();
    let vault_dir = TempDir::new().unwrap();
    let source = seeded_source();
    let backup = BackupService::new(
        engine(&source, work.path(), scoped("ALL")),
        fs_vault(vault_dir.path()),
        work.path().join("tmp"),
        0,
    );
    assert!(backup.run_once(&CancelSignal::new()).await.is_success());

    let target = FakeStore::new();
    target.put_object("videos", "unrelated.txt", b"keep me", "2024-01-01T00:00:00Z");
    let service = RestoreService::new(
        fs_vault(vault_dir.path()),
        target.clone() as Arc<dyn ObjectStore>,
        work.path().join("restore"),
    );

    let report = service
        .restore(&ContainerScope::Single("videos".to_string()), None, &CancelSignal::new())
        .await
        .unwrap();
    assert!(report.is_success());
    assert_eq!(report.restored.len(), 1);
    let stats = &report.restored[0];
    assert_eq!(stats.files, 2);
    assert_eq!(stats.bytes, 23);
    assert_eq!(target.object_data("videos", "a.mp4").unwrap(), b"first video");
    assert_eq!(target.object_data("videos", "clips/b.mp4").unwrap(), b"second video");
    assert_eq!(target.object_count("videos"), 3);
    assert_eq!(target.object_count("photos"), 0);

    // Work directories are cleaned up
    assert_eq!(std::fs::read_dir(work.path().join("restore")).unwrap().count(), 0);
}

#[tokio::test]
async fn test_restore_replacing_existing_content() {
    let work = TempDir::new().unwrap();
    let vault_dir = TempDir::new().unwrap();
    let source = seeded_source();
    let backup = BackupService::new(
        engine(&source, work.path(), scoped("ALL")),
        fs_vault(vault_dir.path()),
        work.path().join("tmp"),
        0,
    );
    backup.run_once(&CancelSignal::new()).await;

    let target = FakeStore::new();
    target.put_object("photos", "stale.jpg", b"old", "2024-01-01T00:00:00Z");
    let service = RestoreService::new(
        fs_vault(vault_dir.path()),
        target.clone() as Arc<dyn ObjectStore>,
        work.path().join("restore"),
    )
    .replace_existing(true);

    let today = Utc::now().date_naive();
    let report = service
        .restore(&ContainerScope::All, Some(today), &CancelSignal::new())
        .await
        .unwrap();
    assert!(report.is_success());
    assert_eq!(report.restored.len(), 2);
    assert!(target.object_data("photos", "stale.jpg").is_none());
    assert_eq!(target.object_data("photos", "c.jpg").unwrap(), b"a photo");
}

#[tokio::test]
async fn test_restore_without_archive_reports_failure() {
    let work = TempDir::new().unwrap();
    let vault_dir = TempDir::new().unwrap();
    let target = FakeStore::new();
    let service = RestoreService::new(
        fs_vault(vault_dir.path()),
        target as Arc<dyn ObjectStore>,
        work.path().join("restore"),
    );

    let report = service
        .restore(&ContainerScope::Single("ghost".to_string()), None, &CancelSignal::new())
        .await
        .unwrap();
    assert!(!report.is_success());
    assert_eq!(report.failures.len(), 1);
    assert_eq!(report.failures[0].0, "ghost");
}
