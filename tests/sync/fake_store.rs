// Instrumented in-memory object store
// Counts concurrent transfers and injects listing/fetch failures

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use base64::Engine;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::stream::{self, BoxStream, StreamExt};
use md5::{Digest, Md5};
use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use blobvault::fs::{BackendType, ObjectBody, ObjectStore, RemoteObject};
use blobvault::sync::{CancelSignal, PassReport, StateStore, SyncConfig, SyncEngine};
use blobvault::fs::Materializer;

#[derive(Clone)]
struct FakeObject {
    data: Bytes,
    last_modified: DateTime<Utc>,
    /// Opaque ETag reported instead of a Content-MD5.
    etag: Option<String>,
}

/// Decrements the in-flight counter when the transfer stream is dropped.
struct InFlight(Arc<AtomicUsize>);

impl Drop for InFlight {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[derive(Default)]
pub struct FakeStore {
    containers: Mutex<BTreeMap<String, BTreeMap<String, FakeObject>>>,
    failing_listings: Mutex<HashSet<String>>,
    panicking_listings: Mutex<HashSet<String>>,
    failing_fetches: Mutex<HashSet<(String, String)>>,
    wrong_hashes: Mutex<HashSet<(String, String)>>,
    in_flight: Arc<AtomicUsize>,
    max_in_flight: AtomicUsize,
    fetches: AtomicUsize,
    fetch_delay: Mutex<Duration>,
}

pub fn ts(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc)
}

pub fn md5_raw(data: &[u8]) -> [u8; 16] {
    Md5::digest(data).into()
}

impl FakeStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn put_object(&self, container: &str, key: &str, data: &[u8], modified: &str) {
        let object = FakeObject {
            data: Bytes::copy_from_slice(data),
            last_modified: ts(modified),
            etag: None,
        };
        self.containers
            .lock()
            .unwrap()
            .entry(container.to_string())
            .or_default()
            .insert(key.to_string(), object);
    }

    pub fn remove_object(&self, container: &str, key: &str) {
        if let Some(objects) = self.containers.lock().unwrap().get_mut(container) {
            objects.remove(key);
        }
    }

    pub fn object_data(&self, container: &str, key: &str) -> Option<Vec<u8>> {
        self.containers
            .lock()
            .unwrap()
            .get(container)
            .and_then(|objects| objects.get(key))
            .map(|o| o.data.to_vec())
    }

    pub fn object_count(&self, container: &str) -> usize {
        self.containers
            .lock()
            .unwrap()
            .get(container)
            .map(|objects| objects.len())
            .unwrap_or(0)
    }

    pub fn fail_listing(&self, container: &str, fail: bool) {
        let mut failing = self.failing_listings.lock().unwrap();
        if fail {
            failing.insert(container.to_string());
        } else {
            failing.remove(container);
        }
    }

    /// Make listing `container` panic inside the engine's task.
    pub fn panic_listing(&self, container: &str) {
        self.panicking_listings
            .lock()
            .unwrap()
            .insert(container.to_string());
    }

    pub fn fail_fetch(&self, container: &str, key: &str, fail: bool) {
        let mut failing = self.failing_fetches.lock().unwrap();
        let id = (container.to_string(), key.to_string());
        if fail {
            failing.insert(id);
        } else {
            failing.remove(&id);
        }
    }

    /// Report an ETag and no Content-MD5 for an object.
    pub fn set_etag(&self, container: &str, key: &str, etag: &str) {
        if let Some(object) = self
            .containers
            .lock()
            .unwrap()
            .get_mut(container)
            .and_then(|objects| objects.get_mut(key))
        {
            object.etag = Some(etag.to_string());
        }
    }

    /// Report a Content-MD5 that does not match the content.
    pub fn corrupt_hash(&self, container: &str, key: &str) {
        self.wrong_hashes
            .lock()
            .unwrap()
            .insert((container.to_string(), key.to_string()));
    }

    pub fn set_fetch_delay(&self, delay: Duration) {
        *self.fetch_delay.lock().unwrap() = delay;
    }

    pub fn fetches(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }

    pub fn max_concurrent_fetches(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    pub fn reset_counters(&self) {
        self.fetches.store(0, Ordering::SeqCst);
        self.max_in_flight.store(0, Ordering::SeqCst);
    }
}

#[async_trait]
impl ObjectStore for FakeStore {
    async fn list_containers(&self) -> Result<Vec<String>> {
        Ok(self.containers.lock().unwrap().keys().cloned().collect())
    }

    fn list_objects<'a>(&'a self, container: &'a str) -> BoxStream<'a, Result<RemoteObject>> {
        let panics = self.panicking_listings.lock().unwrap().contains(container);
        if panics {
            panic!("listing {} blew up", container);
        }
        if self.failing_listings.lock().unwrap().contains(container) {
            return stream::once(async move { Err(anyhow!("403 listing {} denied", container)) })
                .boxed();
        }

        let wrong = self.wrong_hashes.lock().unwrap().clone();
        let objects: Vec<Result<RemoteObject>> = self
            .containers
            .lock()
            .unwrap()
            .get(container)
            .map(|objects| {
                objects
                    .iter()
                    .map(|(key, o)| {
                        let listed = RemoteObject::new(container, key, Some(o.last_modified), o.data.len() as u64);
                        if let Some(etag) = &o.etag {
                            return Ok(listed.with_hash(etag.clone()));
                        }
                        let md5 = if wrong.contains(&(container.to_string(), key.clone())) {
                            md5_raw(b"something else")
                        } else {
                            md5_raw(&o.data)
                        };
                        Ok(listed
                            .with_hash(base64::engine::general_purpose::STANDARD.encode(md5))
                            .with_content_md5(md5))
                    })
                    .collect()
            })
            .unwrap_or_default();
        stream::iter(objects).boxed()
    }

    async fn fetch(&self, container: &str, key: &str) -> Result<ObjectBody> {
        let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        let guard = InFlight(self.in_flight.clone());
        self.max_in_flight.fetch_max(current, Ordering::SeqCst);
        self.fetches.fetch_add(1, Ordering::SeqCst);

        let delay = *self.fetch_delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        if self
            .failing_fetches
            .lock()
            .unwrap()
            .contains(&(container.to_string(), key.to_string()))
        {
            return Err(anyhow!("503 fetching {}/{}", container, key));
        }

        let data = self
            .containers
            .lock()
            .unwrap()
            .get(container)
            .and_then(|objects| objects.get(key))
            .map(|o| o.data.clone())
            .ok_or_else(|| anyhow!("404 {}/{}", container, key))?;

        let size = data.len() as u64;
        // Two chunks, so the writer sees a real stream
        let mid = data.len() / 2;
        let chunks: Vec<std::io::Result<Bytes>> = vec![Ok(data.slice(..mid)), Ok(data.slice(mid..))];
        let stream = stream::iter(chunks).map(move |chunk| {
            let _held = &guard;
            chunk
        });
        Ok(ObjectBody {
            stream: stream.boxed(),
            size: Some(size),
        })
    }

    async fn put_file(&self, container: &str, key: &str, local: &Path) -> Result<u64> {
        let data = tokio::fs::read(local).await?;
        let size = data.len() as u64;
        let object = FakeObject {
            data: Bytes::from(data),
            last_modified: Utc::now(),
            etag: None,
        };
        self.containers
            .lock()
            .unwrap()
            .entry(container.to_string())
            .or_default()
            .insert(key.to_string(), object);
        Ok(size)
    }

    async fn delete_prefix(&self, container: &str, prefix: &str) -> Result<()> {
        if let Some(objects) = self.containers.lock().unwrap().get_mut(container) {
            objects.retain(|key, _| !key.starts_with(prefix));
        }
        Ok(())
    }

    fn backend_type(&self) -> BackendType {
        BackendType::Memory
    }
}

/// Engine over `store` writing below `root`, state in `root/sync_metadata.json`.
pub fn engine(store: &Arc<FakeStore>, root: &Path, config: SyncConfig) -> SyncEngine {
    let store: Arc<dyn ObjectStore> = store.clone();
    SyncEngine::new(
        store,
        Materializer::new(root.join("data")),
        StateStore::new(root.join("sync_metadata.json")),
        config,
    )
    .unwrap()
}

pub fn scoped(container: &str) -> SyncConfig {
    SyncConfig {
        scope: blobvault::fs::ContainerScope::parse(container),
        ..Default::default()
    }
}

pub async fn run(engine: &SyncEngine) -> PassReport {
    engine.run_pass(&CancelSignal::new()).await
}

pub fn local_file(root: &Path, container: &str, key: &str) -> std::path::PathBuf {
    root.join("data").join(container).join(key)
}
