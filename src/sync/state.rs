//! Durable record of what has been synchronized.
//!
//! The whole file is rewritten once per pass through a temporary sibling,
//! so a crash leaves the previous state intact.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::fs::local::write_atomic;
use crate::fs::types::RemoteObject;

/// Fingerprint of an object that was materialized locally.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncRecord {
    #[serde(default)]
    pub last_modified: Option<DateTime<Utc>>,
    #[serde(default, alias = "md5hash")]
    pub hash: String,
    #[serde(default)]
    pub size: u64,
}

impl From<&RemoteObject> for SyncRecord {
    fn from(obj: &RemoteObject) -> Self {
        Self {
            last_modified: obj.last_modified,
            hash: obj.content_hash.clone(),
            size: obj.size,
        }
    }
}

/// Synchronized objects of one container.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerSyncState {
    #[serde(default)]
    pub last_sync: Option<DateTime<Utc>>,
    #[serde(default)]
    pub files: BTreeMap<String, SyncRecord>,
}

impl ContainerSyncState {
    pub fn get(&self, key: &str) -> Option<&SyncRecord> {
        self.files.get(key)
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    pub fn total_size(&self) -> u64 {
        self.files.values().map(|r| r.size).sum()
    }
}

/// Top-level persisted structure.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncStateFile {
    #[serde(default)]
    pub last_sync: Option<DateTime<Utc>>,
    #[serde(default)]
    pub containers: BTreeMap<String, ContainerSyncState>,
}

impl SyncStateFile {
    /// Prior state for a container, empty if it was never synchronized.
    pub fn container(&self, name: &str) -> ContainerSyncState {
        self.containers.get(name).cloned().unwrap_or_default()
    }

    /// Replace a container's entry wholesale.
    pub fn replace_container(&mut self, name: &str, state: ContainerSyncState) {
        self.containers.insert(name.to_string(), state);
    }
}

/// Loads and saves the state file.
#[derive(Debug, Clone)]
pub struct StateStore {
    path: PathBuf,
}

impl StateStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the state file. A missing file is an empty state.
    pub async fn load(&self) -> Result<SyncStateFile> {
        let data = match tokio::fs::read(&self.path).await {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(SyncStateFile::default());
            }
            Err(e) => {
                return Err(e)
                    .with_context(|| format!("Failed to read sync state {}", self.path.display()));
            }
        };

        serde_json::from_slice(&data)
            .with_context(|| format!("Failed to parse sync state {}", self.path.display()))
    }

    /// Replace the state file atomically.
    pub async fn save(&self, state: &SyncStateFile) -> Result<()> {
        let data = serde_json::to_vec_pretty(state).context("Failed to encode sync state")?;
        write_atomic(&self.path, &data)
            .await
            .with_context(|| format!("Failed to save sync state {}", self.path.display()))
    }
}
