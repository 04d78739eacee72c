//! Secondary store holding packed container archives.

use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use futures::StreamExt;
use opendal::Operator;
use std::path::Path;
use tracing::{info, warn};

use crate::fs::local::write_stream_atomic;
use crate::fs::remote::{upload_file, UPLOAD_CHUNK};
use crate::sync::throttle::BandwidthLimiter;

const NAME_MARKER: &str = "_backup_";
const NAME_TIME_FORMAT: &str = "%Y%m%d_%H%M%S";
const EXTENSION: &str = ".tar.gz";

/// File name of the archive of `container` taken at `at`.
pub fn archive_name(container: &str, at: DateTime<Utc>) -> String {
    format!(
        "{}{}{}{}",
        container,
        NAME_MARKER,
        at.format(NAME_TIME_FORMAT),
        EXTENSION
    )
}

/// Split an archive file name into container and creation time.
pub fn parse_archive_name(name: &str) -> Option<(String, DateTime<Utc>)> {
    let stem = name.strip_suffix(EXTENSION)?;
    let (container, stamp) = stem.rsplit_once(NAME_MARKER)?;
    if container.is_empty() {
        return None;
    }
    let created = NaiveDateTime::parse_from_str(stamp, NAME_TIME_FORMAT).ok()?;
    Some((container.to_string(), created.and_utc()))
}

/// An archive stored in the vault.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveInfo {
    pub name: String,
    /// Full path inside the vault operator.
    pub path: String,
    pub container: String,
    pub created_at: DateTime<Utc>,
    pub size: u64,
}

/// Pick the archive created closest to the start of `date` (UTC).
pub fn closest_to_date(archives: &[ArchiveInfo], date: NaiveDate) -> Option<&ArchiveInfo> {
    let target = date.and_hms_opt(0, 0, 0)?.and_utc();
    archives
        .iter()
        .min_by_key(|a| (a.created_at - target).abs())
}

/// Archive storage over an OpenDAL operator, under an optional folder.
#[derive(Clone)]
pub struct ArchiveVault {
    op: Operator,
    folder: String,
}

impl ArchiveVault {
    pub fn new(op: Operator, folder: &str) -> Self {
        let folder = folder.trim_matches('/');
        let folder = if folder.is_empty() {
            String::new()
        } else {
            format!("{}/", folder)
        };
        Self { op, folder }
    }

    /// Vault rooted at a path prefix, e.g. a container directory of a store.
    pub fn with_prefix(op: Operator, prefix: &str, folder: &str) -> Self {
        let joined = format!("{}/{}", prefix.trim_matches('/'), folder.trim_matches('/'));
        Self::new(op, &joined)
    }

    pub fn folder(&self) -> &str {
        &self.folder
    }

    fn path_for(&self, name: &str) -> String {
        format!("{}{}", self.folder, name)
    }

    /// Upload a local archive of `container`, named after `at`.
    pub async fn upload(&self, local: &Path, container: &str, at: DateTime<Utc>) -> Result<ArchiveInfo> {
        let name = archive_name(container, at);
        let path = self.path_for(&name);

        let size = upload_file(&self.op, &path, local, UPLOAD_CHUNK)
            .await
            .with_context(|| format!("Failed to upload archive {}", local.display()))?;

        info!(
            "Uploaded {} ({})",
            path,
            humansize::format_size(size, humansize::BINARY)
        );
        Ok(ArchiveInfo {
            name,
            path,
            container: container.to_string(),
            created_at: at,
            size,
        })
    }

    /// Every recognizable archive, newest first. Foreign files are ignored.
    pub async fn list(&self) -> Result<Vec<ArchiveInfo>> {
        let dir = if self.folder.is_empty() { "/" } else { self.folder.as_str() };
        let entries = match self.op.list(dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == opendal::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e).with_context(|| format!("Failed to list archives in {}", dir)),
        };

        let mut archives = Vec::new();
        for entry in entries {
            if !entry.metadata().mode().is_file() {
                continue;
            }
            let name = entry.name().to_string();
            let Some((container, created_at)) = parse_archive_name(&name) else {
                continue;
            };
            let mut size = entry.metadata().content_length();
            if size == 0 {
                size = self
                    .op
                    .stat(entry.path())
                    .await
                    .map(|m| m.content_length())
                    .unwrap_or(0);
            }
            archives.push(ArchiveInfo {
                name,
                path: entry.path().to_string(),
                container,
                created_at,
                size,
            });
        }
        archives.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(a.name.cmp(&b.name)));
        Ok(archives)
    }

    /// Archives of one container, newest first.
    pub async fn list_container(&self, container: &str) -> Result<Vec<ArchiveInfo>> {
        let mut archives = self.list().await?;
        archives.retain(|a| a.container == container);
        Ok(archives)
    }

    pub async fn latest(&self, container: &str) -> Result<Option<ArchiveInfo>> {
        Ok(self.list_container(container).await?.into_iter().next())
    }

    /// Download an archive to `dest` atomically. Returns the byte count.
    pub async fn download(&self, archive: &ArchiveInfo, dest: &Path) -> Result<u64> {
        let reader = self
            .op
            .reader(&archive.path)
            .await
            .with_context(|| format!("Failed to open {}", archive.path))?;
        let stream = reader
            .into_bytes_stream(..)
            .await
            .with_context(|| format!("Failed to read {}", archive.path))?;

        let written = write_stream_atomic(stream.boxed(), dest, &BandwidthLimiter::unlimited(), None)
            .await
            .with_context(|| format!("Failed to download {}", archive.path))?;
        Ok(written.bytes_written)
    }

    /// Delete archives created before `now - retention_days`.
    ///
    /// A retention of 0 keeps everything. Individual delete failures are
    /// logged and skipped.
    pub async fn prune(&self, retention_days: u32, now: DateTime<Utc>) -> Result<Vec<ArchiveInfo>> {
        if retention_days == 0 {
            return Ok(Vec::new());
        }
        let cutoff = now - chrono::Duration::days(i64::from(retention_days));

        let mut removed = Vec::new();
        for archive in self.list().await? {
            if archive.created_at >= cutoff {
                continue;
            }
            match self.op.delete(&archive.path).await {
                Ok(()) => {
                    info!("Deleted expired archive {}", archive.name);
                    removed.push(archive);
                }
                Err(e) => warn!("Failed to delete expired archive {}: {}", archive.name, e),
            }
        }
        Ok(removed)
    }
}

impl std::fmt::Debug for ArchiveVault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ArchiveVault")
            .field("folder", &self.folder)
            .finish_non_exhaustive()
    }
}
