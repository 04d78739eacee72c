//! Sync, then archive every container that changed.

use anyhow::Result;
use chrono::Utc;
use std::path::PathBuf;
use tracing::{error, info, warn};

use crate::archive::{archive_name, pack, ArchiveInfo, ArchiveVault, CompressionLevel};
use crate::sync::{CancelSignal, PassReport, SyncEngine};

/// Outcome of one backup run.
#[derive(Debug)]
pub struct BackupReport {
    pub pass: PassReport,
    pub archived: Vec<ArchiveInfo>,
    /// Containers whose archive could not be produced or uploaded.
    pub failures: Vec<(String, String)>,
    pub pruned: usize,
}

impl BackupReport {
    pub fn is_success(&self) -> bool {
        self.pass.is_success() && self.failures.is_empty()
    }
}

pub struct BackupService {
    engine: SyncEngine,
    vault: ArchiveVault,
    temp_dir: PathBuf,
    retention_days: u32,
    level: CompressionLevel,
}

impl BackupService {
    pub fn new(
        engine: SyncEngine,
        vault: ArchiveVault,
        temp_dir: impl Into<PathBuf>,
        retention_days: u32,
    ) -> Self {
        Self {
            engine,
            vault,
            temp_dir: temp_dir.into(),
            retention_days,
            level: CompressionLevel::default(),
        }
    }

    pub fn with_compression(mut self, level: CompressionLevel) -> Self {
        self.level = level;
        self
    }

    /// One sync pass, archive upload for changed containers, then retention.
    ///
    /// Archive failures are reported per container and never touch the
    /// sync state.
    pub async fn run_once(&self, cancel: &CancelSignal) -> BackupReport {
        let pass = self.engine.run_pass(cancel).await;

        let mut archived = Vec::new();
        let mut failures = Vec::new();
        for stats in &pass.containers {
            if !stats.status.finished() || !stats.changed() {
                continue;
            }
            if cancel.is_cancelled() {
                warn!("Cancelled, skipping archive of {}", stats.container);
                continue;
            }
            match self.archive_container(&stats.container).await {
                Ok(info) => archived.push(info),
                Err(e) => {
                    error!("Failed to archive {}: {:#}", stats.container, e);
                    failures.push((stats.container.clone(), format!("{:#}", e)));
                }
            }
        }

        let pruned = if cancel.is_cancelled() {
            0
        } else {
            match self.vault.prune(self.retention_days, Utc::now()).await {
                Ok(removed) => removed.len(),
                Err(e) => {
                    error!("Failed to clean up old archives: {:#}", e);
                    0
                }
            }
        };

        info!(
            "Backup finished: {} archives uploaded, {} failed, {} expired archives removed",
            archived.len(),
            failures.len(),
            pruned
        );
        BackupReport {
            pass,
            archived,
            failures,
            pruned,
        }
    }

    async fn archive_container(&self, container: &str) -> Result<ArchiveInfo> {
        let at = Utc::now();
        let source = self.engine.materializer().container_root(container);
        let local = self.temp_dir.join(archive_name(container, at));

        info!("Creating archive for {}", container);
        pack(&source, &local, self.level).await?;
        let uploaded = self.vault.upload(&local, container, at).await;

        if let Err(e) = tokio::fs::remove_file(&local).await {
            warn!("Failed to remove temporary archive {}: {}", local.display(), e);
        }
        uploaded
    }
}
