use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::stream::BoxStream;

/// Sentinel container name selecting every container of the store.
pub const ALL_CONTAINERS: &str = "ALL";

/// An object as reported by a listing call. Rebuilt on every pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteObject {
    pub container: String,
    pub key: String,
    pub last_modified: Option<DateTime<Utc>>,
    /// Content hash as supplied by the store, empty when it has none.
    /// May be an opaque ETag.
    pub content_hash: String,
    /// Store-asserted MD5 of the content (`Content-MD5`), used to verify downloads.
    pub content_md5: Option<[u8; 16]>,
    pub size: u64,
}

impl RemoteObject {
    pub fn new(container: &str, key: &str, last_modified: Option<DateTime<Utc>>, size: u64) -> Self {
        Self {
            container: container.to_string(),
            key: key.to_string(),
            last_modified,
            content_hash: String::new(),
            content_md5: None,
            size,
        }
    }

    pub fn with_hash(mut self, hash: impl Into<String>) -> Self {
        self.content_hash = hash.into();
        self
    }

    pub fn with_content_md5(mut self, md5: [u8; 16]) -> Self {
        self.content_md5 = Some(md5);
        self
    }

    pub fn format_size(&self) -> String {
        humansize::format_size(self.size, humansize::BINARY)
    }
}

/// Body of a fetched object.
pub struct ObjectBody {
    pub stream: BoxStream<'static, std::io::Result<Bytes>>,
    /// Size reported by the store before the transfer, if known.
    pub size: Option<u64>,
}

impl std::fmt::Debug for ObjectBody {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObjectBody").field("size", &self.size).finish_non_exhaustive()
    }
}

/// Which containers a pass covers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContainerScope {
    Single(String),
    All,
}

impl ContainerScope {
    pub fn parse(value: &str) -> Self {
        if value == ALL_CONTAINERS {
            Self::All
        } else {
            Self::Single(value.to_string())
        }
    }

    pub fn is_all(&self) -> bool {
        matches!(self, Self::All)
    }
}

impl std::fmt::Display for ContainerScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Single(name) => write!(f, "{}", name),
            Self::All => write!(f, "{}", ALL_CONTAINERS),
        }
    }
}
