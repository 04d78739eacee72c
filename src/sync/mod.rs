//! Sync module
//!
//! One-way incremental mirroring of remote containers onto local disk:
//! change detection, bounded-concurrency fetching, stale cleanup and the
//! persisted sync state.

pub mod cancel;
pub mod engine;
pub mod error;
pub mod resolver;
pub mod scheduler;
pub mod state;
pub mod throttle;

pub use cancel::CancelSignal;
pub use engine::{
    ContainerPassStats, ContainerStatus, PassReport, PassStatus, SyncConfig, SyncEngine,
    SyncPhase, SyncProgress,
};
pub use error::{ErrorKind, SyncError};
pub use resolver::{resolve, ChangeSet, FetchReason};
pub use scheduler::{FetchOutcome, FetchScheduler};
pub use state::{ContainerSyncState, StateStore, SyncRecord, SyncStateFile};
pub use throttle::{BandwidthLimit, BandwidthLimiter};
