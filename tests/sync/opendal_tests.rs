// Tests for passes against a local OpenDAL store

use std::sync::Arc;

use blobvault::fs::{Materializer, ObjectStore, OpendalStore, RetryPolicy};
use blobvault::sync::{CancelSignal, StateStore, SyncEngine};
use tempfile::TempDir;

use crate::fake_store::scoped;

fn write(root: &std::path::Path, rel: &str, data: &[u8]) {
    let path = root.join(rel);
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    std::fs::write(path, data).unwrap();
}

#[tokio::test]
async fn test_mirror_local_store() {
    let remote = TempDir::new().unwrap();
    let local = TempDir::new().unwrap();
    write(remote.path(), "photos/2024/jan/1.jpg", b"jpeg-one");
    write(remote.path(), "photos/2024/feb/2.jpg", b"jpeg-two");
    write(remote.path(), "notes/todo.md", b"- backups");

    let store = OpendalStore::new_fs(&remote.path().to_string_lossy(), &RetryPolicy::default()).unwrap();
    let mut containers = store.list_containers().await.unwrap();
    containers.sort();
    assert_eq!(containers, vec!["notes".to_string(), "photos".to_string()]);

    let store: Arc<dyn ObjectStore> = Arc::new(store);
    let engine = SyncEngine::new(
        store,
        Materializer::new(local.path().join("mirror")),
        StateStore::new(local.path().join("state.json")),
        scoped("ALL"),
    )
    .unwrap();

    let report = engine.run_pass(&CancelSignal::new()).await;
    assert!(report.is_success(), "{}", report.summary());
    assert_eq!(report.total_downloaded(), 3);
    assert_eq!(
        std::fs::read(local.path().join("mirror/photos/2024/feb/2.jpg")).unwrap(),
        b"jpeg-two"
    );

    let report = engine.run_pass(&CancelSignal::new()).await;
    assert_eq!(report.total_downloaded(), 0);
    assert_eq!(report.total_skipped(), 3);

    std::fs::remove_file(remote.path().join("photos/2024/jan/1.jpg")).unwrap();
    let report = engine.run_pass(&CancelSignal::new()).await;
    assert_eq!(report.container("photos").unwrap().deleted, 1);
    assert!(!local.path().join("mirror/photos/2024/jan").exists());
}
