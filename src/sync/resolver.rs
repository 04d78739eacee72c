//! Change-set resolution.
//!
//! Compares a frozen listing snapshot against the prior sync state and the
//! local inventory. Pure and synchronous: no I/O happens here.

use std::collections::HashSet;

use crate::fs::local::validate_key;
use crate::fs::types::RemoteObject;
use crate::sync::error::SyncError;
use crate::sync::state::{ContainerSyncState, SyncRecord};

/// Why an object has to be downloaded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchReason {
    /// No record in the prior state.
    New,
    /// Recorded, but the modification time moved.
    Modified,
    /// Recorded and unchanged, but the local file is gone.
    MissingLocally,
    /// The store did not report a modification time.
    NoTimestamp,
}

impl FetchReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::New => "new",
            Self::Modified => "modified",
            Self::MissingLocally => "missing locally",
            Self::NoTimestamp => "no timestamp",
        }
    }
}

/// An object that must be fetched, with the reason.
#[derive(Debug, Clone)]
pub struct PlannedFetch {
    pub object: RemoteObject,
    pub reason: FetchReason,
}

/// Outcome of diffing one container.
#[derive(Debug, Default)]
pub struct ChangeSet {
    /// Objects to download.
    pub must_fetch: Vec<PlannedFetch>,
    /// Objects whose prior record carries over unchanged.
    pub unchanged: Vec<(String, SyncRecord)>,
    /// Local keys absent from the remote listing.
    pub stale: Vec<String>,
    /// Remote keys that cannot be mapped onto the local tree.
    pub rejected: Vec<SyncError>,
}

impl ChangeSet {
    pub fn fetch_bytes(&self) -> u64 {
        self.must_fetch.iter().map(|p| p.object.size).sum()
    }

    pub fn is_noop(&self) -> bool {
        self.must_fetch.is_empty() && self.stale.is_empty()
    }
}

/// Classify every listed object of `container`.
///
/// Freshness is decided by modification time alone. A matching record whose
/// local file is missing from `local` is fetched again.
pub fn resolve(
    container: &str,
    listing: Vec<RemoteObject>,
    prior: &ContainerSyncState,
    local: &HashSet<String>,
) -> ChangeSet {
    let mut changes = ChangeSet::default();
    let mut remote_keys: HashSet<String> = HashSet::with_capacity(listing.len());

    for object in listing {
        remote_keys.insert(object.key.clone());

        if let Err(reason) = validate_key(&object.key) {
            changes.rejected.push(SyncError::InvalidKey {
                container: container.to_string(),
                key: object.key,
                reason,
            });
            continue;
        }

        let reason = match (prior.get(&object.key), object.last_modified) {
            (_, None) => Some(FetchReason::NoTimestamp),
            (None, Some(_)) => Some(FetchReason::New),
            (Some(record), Some(modified)) if record.last_modified != Some(modified) => {
                Some(FetchReason::Modified)
            }
            (Some(_), Some(_)) if !local.contains(&object.key) => {
                Some(FetchReason::MissingLocally)
            }
            (Some(_), Some(_)) => None,
        };

        match reason {
            Some(reason) => changes.must_fetch.push(PlannedFetch { object, reason }),
            None => {
                let record = SyncRecord::from(&object);
                changes.unchanged.push((object.key, record));
            }
        }
    }

    let mut stale: Vec<String> = local
        .iter()
        .filter(|key| !remote_keys.contains(key.as_str()))
        .cloned()
        .collect();
    stale.sort();
    changes.stale = stale;

    changes
}
