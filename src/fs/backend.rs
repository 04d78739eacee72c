use anyhow::Result;
use async_trait::async_trait;
use futures::stream::BoxStream;
use std::path::Path;

use crate::fs::types::{ObjectBody, RemoteObject};

/// Backend type information for display and identification
#[derive(Debug, Clone, PartialEq)]
pub enum BackendType {
    Azblob { account: String },
    S3 { bucket: String, region: String },
    Gcs { bucket: String },
    Gdrive { root: String },
    Fs { root: String },
    Memory,
}

impl BackendType {
    /// Get a short display name for the backend
    pub fn short_name(&self) -> &'static str {
        match self {
            BackendType::Azblob { .. } => "Azure",
            BackendType::S3 { .. } => "S3",
            BackendType::Gcs { .. } => "GCS",
            BackendType::Gdrive { .. } => "Google Drive",
            BackendType::Fs { .. } => "Local",
            BackendType::Memory => "Memory",
        }
    }
}

/// Remote blob store holding named containers of objects.
///
/// Implementations apply their own retry policy; an `Err` from any method
/// means retries were already exhausted.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    // ========== Enumeration ==========

    /// List the names of all containers visible to this store.
    async fn list_containers(&self) -> Result<Vec<String>>;

    /// Lazily list every object of a container.
    ///
    /// Pages are fetched as the stream is polled. A failed page ends the
    /// listing with an error; callers restart from the beginning.
    fn list_objects<'a>(&'a self, container: &'a str) -> BoxStream<'a, Result<RemoteObject>>;

    // ========== Transfer ==========

    /// Open a byte stream over one object.
    async fn fetch(&self, container: &str, key: &str) -> Result<ObjectBody>;

    /// Upload a local file as one object, streaming it from disk. Returns the byte count.
    async fn put_file(&self, container: &str, key: &str, local: &Path) -> Result<u64>;

    /// Delete every object under `prefix` (the whole container for "").
    async fn delete_prefix(&self, container: &str, prefix: &str) -> Result<()>;

    // ========== Backend Info ==========

    /// Get the backend type
    fn backend_type(&self) -> BackendType;

    /// Get display path for an object
    fn display_path(&self, container: &str, key: &str) -> String {
        format!("{}/{}", container, key)
    }
}
