//! Restore containers from archives into a target store.

use anyhow::{Context, Result};
use chrono::NaiveDate;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{error, info, warn};

use crate::archive::{closest_to_date, unpack, ArchiveInfo, ArchiveVault};
use crate::fs::backend::ObjectStore;
use crate::fs::types::ContainerScope;
use crate::sync::CancelSignal;

/// Upload counters for one restored container.
#[derive(Debug, Clone, Default)]
pub struct UploadStats {
    pub container: String,
    pub archive: String,
    pub files: usize,
    pub bytes: u64,
    pub errors: Vec<String>,
    pub duration: Duration,
}

impl UploadStats {
    /// Average upload rate in bytes per second.
    pub fn rate(&self) -> u64 {
        let secs = self.duration.as_secs_f64();
        if secs <= 0.0 {
            return 0;
        }
        (self.bytes as f64 / secs) as u64
    }
}

/// Outcome of a restore run.
#[derive(Debug, Default)]
pub struct RestoreReport {
    pub restored: Vec<UploadStats>,
    /// Containers that could not be restored at all.
    pub failures: Vec<(String, String)>,
}

impl RestoreReport {
    pub fn is_success(&self) -> bool {
        self.failures.is_empty() && self.restored.iter().all(|s| s.errors.is_empty())
    }
}

pub struct RestoreService {
    vault: ArchiveVault,
    target: Arc<dyn ObjectStore>,
    temp_dir: PathBuf,
    replace_existing: bool,
    upload_concurrency: usize,
}

impl RestoreService {
    pub fn new(vault: ArchiveVault, target: Arc<dyn ObjectStore>, temp_dir: impl Into<PathBuf>) -> Self {
        Self {
            vault,
            target,
            temp_dir: temp_dir.into(),
            replace_existing: false,
            upload_concurrency: 10,
        }
    }

    /// Delete the container's current content before uploading.
    pub fn replace_existing(mut self, replace: bool) -> Self {
        self.replace_existing = replace;
        self
    }

    pub fn with_upload_concurrency(mut self, limit: usize) -> Self {
        self.upload_concurrency = limit.max(1);
        self
    }

    /// Restore the latest archive of each selected container, or the one
    /// closest to `date`. One container's failure does not stop the others.
    pub async fn restore(
        &self,
        scope: &ContainerScope,
        date: Option<NaiveDate>,
        cancel: &CancelSignal,
    ) -> Result<RestoreReport> {
        let archives = self.vault.list().await?;
        let mut by_container: BTreeMap<String, Vec<ArchiveInfo>> = BTreeMap::new();
        for archive in archives {
            by_container.entry(archive.container.clone()).or_default().push(archive);
        }
        if let ContainerScope::Single(name) = scope {
            by_container.retain(|container, _| container == name);
            by_container.entry(name.clone()).or_default();
        }

        let mut report = RestoreReport::default();
        for (container, archives) in by_container {
            if cancel.is_cancelled() {
                report.failures.push((container, "cancelled".to_string()));
                continue;
            }

            let chosen = match date {
                Some(date) => closest_to_date(&archives, date),
                None => archives.first(),
            };
            let Some(archive) = chosen else {
                warn!("No archive found for container {}", container);
                report
                    .failures
                    .push((container, "no archive found".to_string()));
                continue;
            };

            match self.restore_archive(&container, archive, cancel).await {
                Ok(stats) => report.restored.push(stats),
                Err(e) => {
                    error!("Failed to restore container {}: {:#}", container, e);
                    report.failures.push((container, format!("{:#}", e)));
                }
            }
        }
        Ok(report)
    }

    async fn restore_archive(
        &self,
        container: &str,
        archive: &ArchiveInfo,
        cancel: &CancelSignal,
    ) -> Result<UploadStats> {
        let started = Instant::now();
        info!(
            "Restoring {} from {} (created {}, {})",
            container,
            archive.name,
            archive.created_at.format("%Y-%m-%d %H:%M:%S"),
            humansize::format_size(archive.size, humansize::BINARY)
        );

        let work_dir = self.temp_dir.join(format!(
            "restore_{}_{}",
            container,
            uuid::Uuid::new_v4().simple()
        ));
        tokio::fs::create_dir_all(&work_dir)
            .await
            .with_context(|| format!("Failed to create {}", work_dir.display()))?;

        let result = self.restore_in(container, archive, &work_dir, cancel).await;

        if let Err(e) = tokio::fs::remove_dir_all(&work_dir).await {
            warn!("Failed to remove {}: {}", work_dir.display(), e);
        }

        let mut stats = result?;
        stats.duration = started.elapsed();
        info!(
            "Restored {}: {} files, {} at {}/s in {:.1}s",
            container,
            stats.files,
            humansize::format_size(stats.bytes, humansize::BINARY),
            humansize::format_size(stats.rate(), humansize::BINARY),
            stats.duration.as_secs_f64()
        );
        Ok(stats)
    }

    async fn restore_in(
        &self,
        container: &str,
        archive: &ArchiveInfo,
        work_dir: &Path,
        cancel: &CancelSignal,
    ) -> Result<UploadStats> {
        let archive_path = work_dir.join(&archive.name);
        self.vault.download(archive, &archive_path).await?;

        let extracted = work_dir.join("extracted");
        unpack(&archive_path, &extracted).await?;

        if self.replace_existing {
            info!("Clearing existing content of {}", container);
            self.target
                .delete_prefix(container, "")
                .await
                .with_context(|| format!("Failed to clear {}", container))?;
        }

        let mut stats = self.upload_tree(container, &extracted, cancel).await?;
        stats.archive = archive.name.clone();
        Ok(stats)
    }

    /// Upload every file below `root`, at most `upload_concurrency` at a time.
    async fn upload_tree(
        &self,
        container: &str,
        root: &Path,
        cancel: &CancelSignal,
    ) -> Result<UploadStats> {
        let files = {
            let root = root.to_path_buf();
            tokio::task::spawn_blocking(move || collect_files(&root))
                .await
                .context("File walk panicked")??
        };

        let semaphore = Arc::new(Semaphore::new(self.upload_concurrency));
        let mut tasks = JoinSet::new();
        let mut stats = UploadStats {
            container: container.to_string(),
            ..Default::default()
        };

        for (path, key) in files {
            let permit = tokio::select! {
                biased;
                _ = cancel.cancelled() => None,
                permit = semaphore.clone().acquire_owned() => permit.ok(),
            };
            let Some(permit) = permit else {
                stats.errors.push("cancelled before all files were uploaded".to_string());
                break;
            };

            let target = self.target.clone();
            let container = container.to_string();
            tasks.spawn(async move {
                let _permit = permit;
                let size = target.put_file(&container, &key, &path).await?;
                Ok::<_, anyhow::Error>((key, size))
            });
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(Ok((key, size))) => {
                    tracing::debug!("Uploaded {}/{}", container, key);
                    stats.files += 1;
                    stats.bytes += size;
                }
                Ok(Err(e)) => {
                    warn!("Upload to {} failed: {:#}", container, e);
                    stats.errors.push(format!("{:#}", e));
                }
                Err(e) => stats.errors.push(format!("upload task aborted: {}", e)),
            }
        }
        Ok(stats)
    }
}

/// Regular files below `root` with their slash-separated keys.
fn collect_files(root: &Path) -> Result<Vec<(PathBuf, String)>> {
    let mut files = Vec::new();
    for entry in jwalk::WalkDir::new(root).skip_hidden(false).follow_links(false) {
        let entry = entry.with_context(|| format!("Failed to walk {}", root.display()))?;
        if !entry.file_type().is_file() {
            continue;
        }
        let path = entry.path();
        let Ok(rel) = path.strip_prefix(root) else {
            continue;
        };
        let key: Vec<String> = rel
            .components()
            .map(|c| c.as_os_str().to_string_lossy().to_string())
            .collect();
        let key = key.join("/");
        files.push((path, key));
    }
    files.sort_by(|a, b| a.1.cmp(&b.1));
    Ok(files)
}
