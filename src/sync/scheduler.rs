//! Bounded-concurrency fetching for one container.
//!
//! Admission is a semaphore with `limit` permits, acquired before a task is
//! spawned. Every task hands its result back through the `JoinSet`; nothing
//! is shared between tasks except the store, the bandwidth bucket and the
//! cancellation signal.

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::fs::backend::ObjectStore;
use crate::fs::local::{BodyReadError, Materializer};
use crate::fs::types::RemoteObject;
use crate::sync::cancel::CancelSignal;
use crate::sync::error::SyncError;
use crate::sync::resolver::PlannedFetch;
use crate::sync::state::SyncRecord;
use crate::sync::throttle::BandwidthLimiter;

/// An object that is now on disk.
#[derive(Debug, Clone)]
pub struct FetchedObject {
    pub key: String,
    pub record: SyncRecord,
    pub bytes: u64,
}

/// Everything the scheduler learned about one container's must-fetch set.
#[derive(Debug, Default)]
pub struct FetchOutcome {
    pub fetched: Vec<FetchedObject>,
    pub failed: Vec<SyncError>,
    /// Keys that were never admitted or were interrupted by cancellation.
    pub interrupted: Vec<String>,
    pub cancelled: bool,
}

impl FetchOutcome {
    pub fn bytes(&self) -> u64 {
        self.fetched.iter().map(|f| f.bytes).sum()
    }
}

enum TaskResult {
    Done(FetchedObject),
    Failed(SyncError),
    Interrupted(String),
}

/// Runs fetch-and-materialize tasks, at most `limit` at a time.
#[derive(Clone)]
pub struct FetchScheduler {
    store: Arc<dyn ObjectStore>,
    materializer: Materializer,
    limit: usize,
    limiter: BandwidthLimiter,
    verify_checksums: bool,
}

impl FetchScheduler {
    pub fn new(
        store: Arc<dyn ObjectStore>,
        materializer: Materializer,
        limit: usize,
        limiter: BandwidthLimiter,
    ) -> Self {
        Self {
            store,
            materializer,
            limit: limit.max(1),
            limiter,
            verify_checksums: true,
        }
    }

    pub fn with_verification(mut self, verify: bool) -> Self {
        self.verify_checksums = verify;
        self
    }

    /// Fetch every planned object. Drains all tasks before returning.
    ///
    /// A failed object never stops its siblings. Cancellation stops
    /// admission and interrupts in-flight transfers; files already renamed
    /// into place stay on disk.
    pub async fn run(
        &self,
        container: &str,
        plan: Vec<PlannedFetch>,
        cancel: &CancelSignal,
    ) -> FetchOutcome {
        let semaphore = Arc::new(Semaphore::new(self.limit));
        let mut tasks = JoinSet::new();
        let mut keys_by_task = HashMap::new();
        let mut outcome = FetchOutcome::default();

        let mut pending = plan.into_iter();
        while let Some(planned) = pending.next() {
            let permit = tokio::select! {
                biased;
                _ = cancel.cancelled() => None,
                permit = semaphore.clone().acquire_owned() => permit.ok(),
            };
            let Some(permit) = permit else {
                outcome.cancelled = true;
                outcome.interrupted.push(planned.object.key);
                outcome.interrupted.extend(pending.by_ref().map(|p| p.object.key));
                break;
            };

            debug!(
                "[{}] fetching {} ({})",
                container,
                planned.object.key,
                planned.reason.as_str()
            );

            let key = planned.object.key.clone();
            let this = self.clone();
            let cancel = cancel.clone();
            let handle = tasks.spawn(async move {
                let _permit = permit;
                let key = planned.object.key.clone();
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => TaskResult::Interrupted(key),
                    result = this.fetch_one(&planned.object) => match result {
                        Ok(fetched) => TaskResult::Done(fetched),
                        Err(e) => TaskResult::Failed(e),
                    },
                }
            });
            keys_by_task.insert(handle.id(), key);
        }

        while let Some(joined) = tasks.join_next_with_id().await {
            match joined {
                Ok((_, TaskResult::Done(fetched))) => {
                    info!(
                        "[{}] downloaded {} ({})",
                        container,
                        fetched.key,
                        humansize::format_size(fetched.bytes, humansize::BINARY)
                    );
                    outcome.fetched.push(fetched);
                }
                Ok((_, TaskResult::Failed(err))) => {
                    warn!("{}", err);
                    outcome.failed.push(err);
                }
                Ok((_, TaskResult::Interrupted(key))) => {
                    outcome.cancelled = true;
                    outcome.interrupted.push(key);
                }
                Err(join_err) => {
                    let key = keys_by_task.remove(&join_err.id()).unwrap_or_default();
                    let err = SyncError::materialize(
                        container,
                        &key,
                        &anyhow::anyhow!("fetch task aborted: {}", join_err),
                    );
                    warn!("{}", err);
                    outcome.failed.push(err);
                }
            }
        }

        outcome
    }

    async fn fetch_one(&self, object: &RemoteObject) -> Result<FetchedObject, SyncError> {
        let container = object.container.as_str();
        let key = object.key.as_str();

        let dest = self
            .materializer
            .object_path(container, key)
            .map_err(|reason| SyncError::InvalidKey {
                container: container.to_string(),
                key: key.to_string(),
                reason,
            })?;

        let body = self
            .store
            .fetch(container, key)
            .await
            .map_err(|e| SyncError::fetch(container, key, &e))?;

        let expected = if self.verify_checksums {
            object.content_md5
        } else {
            None
        };

        let materialized = self
            .materializer
            .materialize(body.stream, &dest, &self.limiter, expected)
            .await
            .map_err(|e| {
                if e.downcast_ref::<BodyReadError>().is_some() {
                    SyncError::fetch(container, key, &e)
                } else {
                    SyncError::materialize(container, key, &e)
                }
            })?;

        let mut record = SyncRecord::from(object);
        if record.hash.is_empty() {
            record.hash = materialized.md5.clone();
        }
        record.size = materialized.bytes_written;

        Ok(FetchedObject {
            key: key.to_string(),
            record,
            bytes: materialized.bytes_written,
        })
    }
}
