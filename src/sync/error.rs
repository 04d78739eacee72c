//! Error types for the sync engine.

use thiserror::Error;

use crate::fs::local::KeyRejection;

/// Coarse classification used for counting and reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Listing,
    Fetch,
    Materialize,
    InvalidKey,
    StatePersistence,
    Cancelled,
    Io,
}

/// Errors raised while synchronizing containers.
///
/// Store and filesystem failures arrive as `anyhow` chains and are kept
/// as their rendered message.
#[derive(Error, Debug, Clone)]
pub enum SyncError {
    /// The container could not be enumerated; nothing in it was touched.
    #[error("[{container}] listing failed: {message}")]
    Listing { container: String, message: String },

    /// One object could not be downloaded (retries exhausted).
    #[error("[{container}] fetch of {key} failed: {message}")]
    Fetch {
        container: String,
        key: String,
        message: String,
    },

    /// Downloaded bytes could not be written, verified or reconciled on disk.
    #[error("[{container}] materializing {key} failed: {message}")]
    Materialize {
        container: String,
        key: String,
        message: String,
    },

    /// The object key cannot be mapped safely below the container root.
    #[error("[{container}] rejected object key {key:?}: {reason}")]
    InvalidKey {
        container: String,
        key: String,
        reason: KeyRejection,
    },

    /// The sync state file could not be written.
    #[error("saving sync state to {path} failed: {message}")]
    StatePersistence { path: String, message: String },

    /// The pass was cancelled before the container finished.
    #[error("[{container}] sync cancelled")]
    Cancelled { container: String },

    /// Local inventory failed, or the container's task died.
    #[error("[{container}] {message}")]
    Io { container: String, message: String },
}

impl SyncError {
    pub fn listing(container: &str, err: &anyhow::Error) -> Self {
        Self::Listing {
            container: container.to_string(),
            message: format!("{:#}", err),
        }
    }

    pub fn fetch(container: &str, key: &str, err: &anyhow::Error) -> Self {
        Self::Fetch {
            container: container.to_string(),
            key: key.to_string(),
            message: format!("{:#}", err),
        }
    }

    pub fn materialize(container: &str, key: &str, err: &anyhow::Error) -> Self {
        Self::Materialize {
            container: container.to_string(),
            key: key.to_string(),
            message: format!("{:#}", err),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Listing { .. } => ErrorKind::Listing,
            Self::Fetch { .. } => ErrorKind::Fetch,
            Self::Materialize { .. } => ErrorKind::Materialize,
            Self::InvalidKey { .. } => ErrorKind::InvalidKey,
            Self::StatePersistence { .. } => ErrorKind::StatePersistence,
            Self::Cancelled { .. } => ErrorKind::Cancelled,
            Self::Io { .. } => ErrorKind::Io,
        }
    }

    /// The object key involved, when the error concerns a single object.
    pub fn key(&self) -> Option<&str> {
        match self {
            Self::Fetch { key, .. } | Self::Materialize { key, .. } | Self::InvalidKey { key, .. } => {
                Some(key)
            }
            _ => None,
        }
    }
}
