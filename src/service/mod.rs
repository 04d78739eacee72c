//! Services built on the sync engine and the archive vault.

pub mod backup;
pub mod restore;

pub use backup::{BackupReport, BackupService};
pub use restore::{RestoreReport, RestoreService, UploadStats};
