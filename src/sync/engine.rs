//! Sync engine for one-way incremental mirroring of remote containers.
//!
//! Drives each container through listing, diffing, fetching and
//! reconciliation, then persists the sync state once for the whole pass.

use anyhow::Result;
use chrono::{DateTime, Utc};
use futures::TryStreamExt;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::fs::backend::ObjectStore;
use crate::fs::local::Materializer;
use crate::fs::types::{ContainerScope, RemoteObject};
use crate::sync::cancel::CancelSignal;
use crate::sync::error::{ErrorKind, SyncError};
use crate::sync::resolver::resolve;
use crate::sync::scheduler::FetchScheduler;
use crate::sync::state::{ContainerSyncState, StateStore, SyncStateFile};
use crate::sync::throttle::{BandwidthLimit, BandwidthLimiter};

/// Sync configuration.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Which containers a pass covers.
    pub scope: ContainerScope,
    /// Concurrent fetches per container (N).
    pub fetch_concurrency: usize,
    /// Containers processed at once (M).
    pub container_concurrency: usize,
    /// Upper bound on N * M the store can safely serve.
    pub max_in_flight: usize,
    /// Bandwidth limit shared by every fetch of a pass.
    pub bandwidth_limit: BandwidthLimit,
    /// Verify downloads against store-reported MD5 hashes.
    pub verify: bool,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            scope: ContainerScope::All,
            fetch_concurrency: 10,
            container_concurrency: 5,
            max_in_flight: 50,
            bandwidth_limit: BandwidthLimit::unlimited(),
            verify: true,
        }
    }
}

impl SyncConfig {
    /// Check the two admission bounds against each other.
    pub fn validate(&self) -> Result<()> {
        if self.fetch_concurrency == 0 {
            anyhow::bail!("fetch concurrency must be at least 1");
        }
        if self.container_concurrency == 0 {
            anyhow::bail!("container concurrency must be at least 1");
        }
        let worst_case = self.fetch_concurrency.saturating_mul(self.container_concurrency);
        if worst_case > self.max_in_flight {
            anyhow::bail!(
                "{} fetches per container x {} containers = {} concurrent fetches, above the limit of {}",
                self.fetch_concurrency,
                self.container_concurrency,
                worst_case,
                self.max_in_flight
            );
        }
        if let ContainerScope::Single(name) = &self.scope {
            if name.trim().is_empty() {
                anyhow::bail!("container name must not be empty");
            }
        }
        Ok(())
    }
}

/// Current sync phase of a container.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncPhase {
    Listing,
    Diffing,
    Fetching,
    Reconciling,
    Complete,
}

/// Progress update for sync operations.
#[derive(Debug, Clone)]
pub struct SyncProgress {
    pub container: String,
    pub phase: SyncPhase,
}

/// Terminal state of one container's sub-pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerStatus {
    /// Every object is in sync.
    Done,
    /// Finished, but some objects failed.
    DoneWithErrors,
    /// Listing or local inventory failed; nothing was changed.
    Failed,
    /// Interrupted before finishing; prior state is kept.
    Cancelled,
}

impl ContainerStatus {
    /// Whether the container's state entry is replaced by this pass.
    pub fn finished(&self) -> bool {
        matches!(self, Self::Done | Self::DoneWithErrors)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Done => "done",
            Self::DoneWithErrors => "done with errors",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

/// Counters for one container, one pass.
#[derive(Debug, Clone)]
pub struct ContainerPassStats {
    pub container: String,
    pub status: ContainerStatus,
    /// Objects in the remote listing.
    pub seen: usize,
    pub downloaded: usize,
    /// Unchanged objects.
    pub skipped: usize,
    /// Local files removed because they vanished remotely.
    pub deleted: usize,
    pub failed: usize,
    pub bytes_downloaded: u64,
    pub errors: Vec<SyncError>,
    pub duration: Duration,
}

impl ContainerPassStats {
    fn new(container: &str) -> Self {
        Self {
            container: container.to_string(),
            status: ContainerStatus::Done,
            seen: 0,
            downloaded: 0,
            skipped: 0,
            deleted: 0,
            failed: 0,
            bytes_downloaded: 0,
            errors: Vec::new(),
            duration: Duration::ZERO,
        }
    }

    fn fail(mut self, err: SyncError) -> Self {
        error!("{}", err);
        self.status = ContainerStatus::Failed;
        self.errors.push(err);
        self
    }

    fn cancelled(mut self) -> Self {
        self.status = ContainerStatus::Cancelled;
        self.errors.push(SyncError::Cancelled {
            container: self.container.clone(),
        });
        self
    }

    /// Local content changed during this pass.
    pub fn changed(&self) -> bool {
        self.downloaded > 0 || self.deleted > 0
    }
}

/// Overall outcome of a pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PassStatus {
    Done,
    DoneWithErrors,
}

/// Result of a sync pass.
#[derive(Debug, Clone)]
pub struct PassReport {
    pub status: PassStatus,
    pub started_at: DateTime<Utc>,
    pub containers: Vec<ContainerPassStats>,
    /// Set when the state file could not be written.
    pub state_error: Option<SyncError>,
    pub duration: Duration,
}

impl PassReport {
    pub fn is_success(&self) -> bool {
        self.status == PassStatus::Done
    }

    pub fn container(&self, name: &str) -> Option<&ContainerPassStats> {
        self.containers.iter().find(|c| c.container == name)
    }

    /// Union of per-container errors, plus the persistence error if any.
    pub fn errors(&self) -> impl Iterator<Item = &SyncError> {
        self.containers
            .iter()
            .flat_map(|c| c.errors.iter())
            .chain(self.state_error.iter())
    }

    pub fn count_errors(&self, kind: ErrorKind) -> usize {
        self.errors().filter(|e| e.kind() == kind).count()
    }

    pub fn total_downloaded(&self) -> usize {
        self.containers.iter().map(|c| c.downloaded).sum()
    }

    pub fn total_skipped(&self) -> usize {
        self.containers.iter().map(|c| c.skipped).sum()
    }

    pub fn total_deleted(&self) -> usize {
        self.containers.iter().map(|c| c.deleted).sum()
    }

    pub fn total_failed(&self) -> usize {
        self.containers.iter().map(|c| c.failed).sum()
    }

    pub fn total_bytes(&self) -> u64 {
        self.containers.iter().map(|c| c.bytes_downloaded).sum()
    }

    /// Human-readable summary for the end of a pass.
    pub fn summary(&self) -> String {
        let succeeded = self
            .containers
            .iter()
            .filter(|c| c.status == ContainerStatus::Done)
            .count();
        let mut out = format!(
            "{} containers attempted, {} fully succeeded; {} downloaded ({}), {} skipped, {} deleted, {} failed in {:.1}s",
            self.containers.len(),
            succeeded,
            self.total_downloaded(),
            humansize::format_size(self.total_bytes(), humansize::BINARY),
            self.total_skipped(),
            self.total_deleted(),
            self.total_failed(),
            self.duration.as_secs_f64()
        );

        for c in self.containers.iter().filter(|c| c.status != ContainerStatus::Done) {
            out.push_str(&format!(
                "\n  {}: {} ({} errors)",
                c.container,
                c.status.as_str(),
                c.errors.len()
            ));
        }
        if let Some(err) = &self.state_error {
            out.push_str(&format!("\n  {}", err));
        }
        out
    }
}

/// Sync engine for orchestrating passes.
#[derive(Clone)]
pub struct SyncEngine {
    /// Remote side.
    store: Arc<dyn ObjectStore>,
    /// Local side.
    materializer: Materializer,
    /// Persisted fingerprints of the last pass.
    state: StateStore,
    config: SyncConfig,
    limiter: BandwidthLimiter,
    progress_tx: Option<tokio::sync::mpsc::Sender<SyncProgress>>,
}

impl SyncEngine {
    pub fn new(
        store: Arc<dyn ObjectStore>,
        materializer: Materializer,
        state: StateStore,
        config: SyncConfig,
    ) -> Result<Self> {
        config.validate()?;
        let limiter = BandwidthLimiter::new(config.bandwidth_limit);
        Ok(Self {
            store,
            materializer,
            state,
            config,
            limiter,
            progress_tx: None,
        })
    }

    /// Create a sync engine with progress reporting.
    pub fn with_progress(mut self, progress_tx: tokio::sync::mpsc::Sender<SyncProgress>) -> Self {
        self.progress_tx = Some(progress_tx);
        self
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn materializer(&self) -> &Materializer {
        &self.materializer
    }

    async fn send_progress(&self, container: &str, phase: SyncPhase) {
        if let Some(ref tx) = self.progress_tx {
            let _ = tx
                .send(SyncProgress {
                    container: container.to_string(),
                    phase,
                })
                .await;
        }
    }

    /// Run one full pass over the configured scope.
    ///
    /// Never fails as a whole: container-level failures are reported in
    /// the returned report and the remaining containers still run.
    pub async fn run_pass(&self, cancel: &CancelSignal) -> PassReport {
        let started_at = Utc::now();
        let started = Instant::now();
        info!(
            "Starting {} sync pass for {} ({} fetches per container, {} containers at once, {})",
            self.store.backend_type().short_name(),
            self.config.scope,
            self.config.fetch_concurrency,
            self.config.container_concurrency,
            self.limiter.limit()
        );

        let prior = match self.state.load().await {
            Ok(state) => state,
            Err(e) => {
                warn!("{:#}; starting from an empty state", e);
                SyncStateFile::default()
            }
        };

        let containers = match self.containers_in_scope().await {
            Ok(containers) => containers,
            Err(e) => {
                let stats = ContainerPassStats::new(&self.config.scope.to_string())
                    .fail(SyncError::listing(&self.config.scope.to_string(), &e));
                return PassReport {
                    status: PassStatus::DoneWithErrors,
                    started_at,
                    containers: vec![stats],
                    state_error: None,
                    duration: started.elapsed(),
                };
            }
        };

        let mut results = self.sync_containers(containers, &prior, cancel).await;
        results.sort_by(|a, b| a.0.container.cmp(&b.0.container));

        let mut next = prior;
        let mut containers = Vec::with_capacity(results.len());
        let mut staged_any = false;
        for (stats, staged) in results {
            if let Some(staged) = staged {
                next.replace_container(&stats.container, staged);
                staged_any = true;
            }
            containers.push(stats);
        }

        let mut state_error = None;
        if staged_any {
            next.last_sync = Some(Utc::now());
            if let Err(e) = self.state.save(&next).await {
                let err = SyncError::StatePersistence {
                    path: self.state.path().display().to_string(),
                    message: format!("{:#}", e),
                };
                error!("{}", err);
                state_error = Some(err);
            }
        }

        let all_done = containers.iter().all(|c| c.status == ContainerStatus::Done);
        let report = PassReport {
            status: if all_done && state_error.is_none() {
                PassStatus::Done
            } else {
                PassStatus::DoneWithErrors
            },
            started_at,
            containers,
            state_error,
            duration: started.elapsed(),
        };
        info!("Sync pass finished: {}", report.summary());
        report
    }

    async fn containers_in_scope(&self) -> Result<Vec<String>> {
        match &self.config.scope {
            ContainerScope::Single(name) => Ok(vec![name.clone()]),
            ContainerScope::All => {
                let containers = self.store.list_containers().await?;
                info!("Found {} containers", containers.len());
                Ok(containers)
            }
        }
    }

    /// Run container sub-passes, at most `container_concurrency` at a time.
    async fn sync_containers(
        &self,
        containers: Vec<String>,
        prior: &SyncStateFile,
        cancel: &CancelSignal,
    ) -> Vec<(ContainerPassStats, Option<ContainerSyncState>)> {
        let semaphore = Arc::new(Semaphore::new(self.config.container_concurrency));
        let mut tasks = JoinSet::new();
        let mut names_by_task = HashMap::new();
        let mut results = Vec::with_capacity(containers.len());

        for container in containers {
            let permit = tokio::select! {
                biased;
                _ = cancel.cancelled() => None,
                permit = semaphore.clone().acquire_owned() => permit.ok(),
            };
            let Some(permit) = permit else {
                results.push((ContainerPassStats::new(&container).cancelled(), None));
                continue;
            };

            let this = self.clone();
            let cancel = cancel.clone();
            let prior = prior.container(&container);
            let name = container.clone();
            let handle = tasks.spawn(async move {
                let _permit = permit;
                this.sync_container(container, prior, cancel).await
            });
            names_by_task.insert(handle.id(), name);
        }

        while let Some(joined) = tasks.join_next_with_id().await {
            match joined {
                Ok((_, result)) => results.push(result),
                // Nothing staged, so the prior state is kept
                Err(join_err) => {
                    let container = names_by_task.remove(&join_err.id()).unwrap_or_default();
                    let err = SyncError::Io {
                        container: container.clone(),
                        message: format!("container task aborted: {}", join_err),
                    };
                    results.push((ContainerPassStats::new(&container).fail(err), None));
                }
            }
        }
        results
    }

    /// One container: list, diff, fetch, reconcile, stage its new state.
    ///
    /// Returns `None` for the staged state when the container did not finish.
    async fn sync_container(
        &self,
        container: String,
        prior: ContainerSyncState,
        cancel: CancelSignal,
    ) -> (ContainerPassStats, Option<ContainerSyncState>) {
        let started = Instant::now();
        let mut stats = ContainerPassStats::new(&container);

        self.send_progress(&container, SyncPhase::Listing).await;
        info!("[{}] listing objects", container);
        let listing = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            listing = self.list_container(&container) => Some(listing),
        };
        let listing = match listing {
            None => return (stats.cancelled(), None),
            Some(Err(e)) => return (stats.fail(SyncError::listing(&container, &e)), None),
            Some(Ok(listing)) => listing,
        };
        stats.seen = listing.len();

        let local = {
            let materializer = self.materializer.clone();
            let name = container.clone();
            match tokio::task::spawn_blocking(move || materializer.inventory(&name)).await {
                Ok(Ok(local)) => local,
                Ok(Err(e)) => {
                    let err = SyncError::Io {
                        container: container.clone(),
                        message: format!("local inventory failed: {:#}", e),
                    };
                    return (stats.fail(err), None);
                }
                Err(e) => {
                    let err = SyncError::Io {
                        container: container.clone(),
                        message: format!("local inventory failed: {}", e),
                    };
                    return (stats.fail(err), None);
                }
            }
        };

        self.send_progress(&container, SyncPhase::Diffing).await;
        let changes = resolve(&container, listing, &prior, &local);
        info!(
            "[{}] {} objects listed: {} to fetch ({}), {} unchanged, {} stale, {} rejected",
            container,
            stats.seen,
            changes.must_fetch.len(),
            humansize::format_size(changes.fetch_bytes(), humansize::BINARY),
            changes.unchanged.len(),
            changes.stale.len(),
            changes.rejected.len()
        );
        stats.skipped = changes.unchanged.len();
        stats.failed += changes.rejected.len();
        for rejected in &changes.rejected {
            warn!("{}", rejected);
        }
        stats.errors.extend(changes.rejected);

        let mut next = ContainerSyncState {
            last_sync: Some(Utc::now()),
            files: changes.unchanged.into_iter().collect(),
        };

        self.send_progress(&container, SyncPhase::Fetching).await;
        let scheduler = FetchScheduler::new(
            self.store.clone(),
            self.materializer.clone(),
            self.config.fetch_concurrency,
            self.limiter.clone(),
        )
        .with_verification(self.config.verify);
        let outcome = scheduler.run(&container, changes.must_fetch, &cancel).await;

        stats.downloaded = outcome.fetched.len();
        stats.bytes_downloaded = outcome.bytes();
        stats.failed += outcome.failed.len();
        if outcome.cancelled {
            stats.duration = started.elapsed();
            warn!(
                "[{}] cancelled after {} downloads, {} not fetched",
                container,
                stats.downloaded,
                outcome.interrupted.len()
            );
            stats.errors.extend(outcome.failed);
            return (stats.cancelled(), None);
        }

        for fetched in outcome.fetched {
            next.files.insert(fetched.key, fetched.record);
        }
        for failed in outcome.failed {
            // A failed refresh keeps the old record while the old file is still there
            if let Some(key) = failed.key() {
                if let Some(record) = prior.get(key) {
                    if self.materializer.exists(&container, key) {
                        next.files.insert(key.to_string(), record.clone());
                    }
                }
            }
            stats.errors.push(failed);
        }

        self.send_progress(&container, SyncPhase::Reconciling).await;
        for key in changes.stale {
            if cancel.is_cancelled() {
                stats.duration = started.elapsed();
                return (stats.cancelled(), None);
            }
            match self.materializer.delete(&container, &key).await {
                Ok(true) => {
                    info!("[{}] deleted {} (removed remotely)", container, key);
                    stats.deleted += 1;
                }
                Ok(false) => debug!("[{}] {} was already gone", container, key),
                Err(e) => {
                    let err = SyncError::materialize(&container, &key, &e);
                    warn!("{}", err);
                    stats.failed += 1;
                    stats.errors.push(err);
                }
            }
        }

        stats.status = if stats.errors.is_empty() {
            ContainerStatus::Done
        } else {
            ContainerStatus::DoneWithErrors
        };
        stats.duration = started.elapsed();
        self.send_progress(&container, SyncPhase::Complete).await;
        debug!(
            "[{}] staged {} records in {:?}",
            container,
            next.len(),
            stats.duration
        );
        (stats, Some(next))
    }

    async fn list_container(&self, container: &str) -> Result<Vec<RemoteObject>> {
        self.store.list_objects(container).try_collect().await
    }
}
