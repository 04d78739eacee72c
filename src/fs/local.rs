//! Local side of a sync: where objects are materialized and found again.

use anyhow::{Context, Result};
use bytes::Bytes;
use futures::{Stream, StreamExt};
use md5::{Digest, Md5};
use std::collections::HashSet;
use std::path::{Component, Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

use crate::sync::throttle::BandwidthLimiter;

/// Suffix marking in-progress writes. Never a valid object key suffix.
pub const TEMP_SUFFIX: &str = ".blobvault-partial";

/// Why a remote key cannot be mapped onto the local tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyRejection {
    Empty,
    Absolute,
    Traversal,
    EmptySegment,
    InvalidCharacter,
    ReservedSuffix,
}

impl std::fmt::Display for KeyRejection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let reason = match self {
            Self::Empty => "key is empty",
            Self::Absolute => "key is an absolute path",
            Self::Traversal => "key contains a '.' or '..' segment",
            Self::EmptySegment => "key contains an empty path segment",
            Self::InvalidCharacter => "key contains a NUL byte or backslash",
            Self::ReservedSuffix => "key uses the reserved temporary-file suffix",
        };
        f.write_str(reason)
    }
}

/// Check that an object key maps onto a path strictly below its container root.
///
/// Keys are rejected, never rewritten: `a/../b` is an error rather than `b`.
pub fn validate_key(key: &str) -> Result<(), KeyRejection> {
    if key.is_empty() {
        return Err(KeyRejection::Empty);
    }
    if key.starts_with('/') {
        return Err(KeyRejection::Absolute);
    }
    if key.contains('\0') || key.contains('\\') {
        return Err(KeyRejection::InvalidCharacter);
    }
    for segment in key.split('/') {
        match segment {
            "" => return Err(KeyRejection::EmptySegment),
            "." | ".." => return Err(KeyRejection::Traversal),
            _ => {}
        }
    }
    // Catch anything the platform would still treat as a prefix or root
    if Path::new(key)
        .components()
        .any(|c| !matches!(c, Component::Normal(_)))
    {
        return Err(KeyRejection::Absolute);
    }
    // Checked last: a key rejected only for its suffix is still a safe path
    if key.ends_with(TEMP_SUFFIX) {
        return Err(KeyRejection::ReservedSuffix);
    }
    Ok(())
}

/// The object body stream failed mid-transfer.
#[derive(Debug, thiserror::Error)]
#[error("Failed to read object data")]
pub struct BodyReadError(#[source] pub std::io::Error);

/// Result of a successful materialization.
#[derive(Debug, Clone)]
pub struct Materialized {
    pub path: PathBuf,
    pub bytes_written: u64,
    /// Lowercase hex MD5 of the written content.
    pub md5: String,
}

/// Writes fetched objects below a root directory, one subdirectory per container.
#[derive(Debug, Clone)]
pub struct Materializer {
    root: PathBuf,
}

impl Materializer {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn container_root(&self, container: &str) -> PathBuf {
        self.root.join(container)
    }

    /// Local path for an object, after key validation.
    pub fn object_path(&self, container: &str, key: &str) -> Result<PathBuf, KeyRejection> {
        validate_key(container)?;
        if container.contains('/') {
            return Err(KeyRejection::Traversal);
        }
        validate_key(key)?;
        Ok(self.container_root(container).join(key))
    }

    /// Stream `body` into `dest` through a temporary sibling, then rename into place.
    ///
    /// `dest` is never observable half-written. On any error, including a
    /// digest that differs from `expected_md5`, the temporary file is removed
    /// and `dest` keeps its previous content.
    pub async fn materialize<S>(
        &self,
        body: S,
        dest: &Path,
        limiter: &BandwidthLimiter,
        expected_md5: Option<[u8; 16]>,
    ) -> Result<Materialized>
    where
        S: Stream<Item = std::io::Result<Bytes>> + Unpin,
    {
        write_stream_atomic(body, dest, limiter, expected_md5).await
    }

    /// Remove a local file that no longer exists remotely, then prune empty parents.
    ///
    /// Returns `false` when there was no file to remove.
    pub async fn delete(&self, container: &str, key: &str) -> Result<bool> {
        let path = match self.object_path(container, key) {
            Ok(path) => path,
            // Leftover of an interrupted write
            Err(KeyRejection::ReservedSuffix) => self.container_root(container).join(key),
            Err(reason) => anyhow::bail!("Refusing to delete {}: {}", key, reason),
        };
        match fs::remove_file(&path).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(false),
            Err(e) => {
                return Err(e).with_context(|| format!("Failed to delete {}", path.display()));
            }
        }

        let stop = self.container_root(container);
        let mut parent = path.parent().map(Path::to_path_buf);
        while let Some(dir) = parent {
            if dir == stop || !dir.starts_with(&stop) {
                break;
            }
            // Fails on non-empty directories, which ends the walk
            if fs::remove_dir(&dir).await.is_err() {
                break;
            }
            parent = dir.parent().map(Path::to_path_buf);
        }
        Ok(true)
    }

    /// Keys of every regular file currently stored for a container.
    ///
    /// Leftover temporary files are included under their on-disk name so
    /// they are reconciled as stale. Files whose path is not UTF-8 cannot be
    /// named by any object key; they are logged and left alone.
    pub fn inventory(&self, container: &str) -> Result<HashSet<String>> {
        let root = self.container_root(container);
        let mut keys = HashSet::new();
        if !root.exists() {
            return Ok(keys);
        }

        for entry in jwalk::WalkDir::new(&root).skip_hidden(false).follow_links(false) {
            let entry = entry.with_context(|| format!("Failed to walk {}", root.display()))?;
            if !entry.file_type().is_file() {
                continue;
            }
            let path = entry.path();
            let Ok(rel) = path.strip_prefix(&root) else {
                continue;
            };
            let segments: Option<Vec<&str>> =
                rel.components().map(|c| c.as_os_str().to_str()).collect();
            match segments {
                Some(segments) => {
                    keys.insert(segments.join("/"));
                }
                None => warn!(
                    "[{}] ignoring {}: file name is not valid UTF-8",
                    container,
                    path.display()
                ),
            }
        }
        Ok(keys)
    }

    /// Whether the object's file is present on disk.
    pub fn exists(&self, container: &str, key: &str) -> bool {
        self.object_path(container, key)
            .map(|p| p.is_file())
            .unwrap_or(false)
    }
}

/// Bytes of the final file name kept in a temp name.
const TEMP_STEM_MAX: usize = 32;

/// A unique temp path next to `dest`, for staging writes.
///
/// Only a short prefix of the final name is kept so the temp name stays
/// under `NAME_MAX` even when the final name is close to it.
pub(crate) fn temp_sibling(dest: &Path) -> PathBuf {
    let name = dest
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let mut end = name.len().min(TEMP_STEM_MAX);
    while !name.is_char_boundary(end) {
        end -= 1;
    }
    dest.with_file_name(format!(
        "{}.{}{}",
        &name[..end],
        uuid::Uuid::new_v4().simple(),
        TEMP_SUFFIX
    ))
}

/// Write-to-temp, fsync, rename.
struct AtomicWriter {
    final_path: PathBuf,
    temp_path: PathBuf,
    file: Option<fs::File>,
    hasher: Md5,
    bytes_written: u64,
}

impl AtomicWriter {
    async fn create(dest: &Path) -> Result<Self> {
        let temp_path = temp_sibling(dest);

        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent)
                .await
                .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
        }

        let file = fs::File::create(&temp_path)
            .await
            .with_context(|| format!("Failed to create temp file: {}", temp_path.display()))?;

        Ok(Self {
            final_path: dest.to_path_buf(),
            temp_path,
            file: Some(file),
            hasher: Md5::new(),
            bytes_written: 0,
        })
    }

    async fn copy_from<S>(&mut self, mut body: S, limiter: &BandwidthLimiter) -> Result<()>
    where
        S: Stream<Item = std::io::Result<Bytes>> + Unpin,
    {
        let file = self
            .file
            .as_mut()
            .context("Writer already finalized")?;
        while let Some(chunk) = body.next().await {
            let chunk = chunk.map_err(BodyReadError)?;
            limiter.acquire(chunk.len()).await;
            file.write_all(&chunk)
                .await
                .with_context(|| format!("Failed to write {}", self.temp_path.display()))?;
            self.hasher.update(&chunk);
            self.bytes_written += chunk.len() as u64;
        }
        Ok(())
    }

    fn digest(&self) -> [u8; 16] {
        let mut out = [0u8; 16];
        out.copy_from_slice(&self.hasher.clone().finalize());
        out
    }

    async fn commit(mut self) -> Result<Materialized> {
        let mut file = self.file.take().context("Writer already finalized")?;
        let staged: Result<()> = async {
            file.flush().await?;
            file.sync_all().await?;
            drop(file);
            fs::rename(&self.temp_path, &self.final_path).await?;
            Ok(())
        }
        .await;

        if let Err(e) = staged {
            self.remove_temp().await;
            return Err(e.context(format!("Failed to commit {}", self.final_path.display())));
        }

        sync_parent_dir(&self.final_path).await;

        let md5 = to_hex(&self.digest());
        debug!(
            "Committed {} ({} bytes)",
            self.final_path.display(),
            self.bytes_written
        );

        Ok(Materialized {
            path: std::mem::take(&mut self.final_path),
            bytes_written: self.bytes_written,
            md5,
        })
    }

    async fn abort(mut self) {
        self.file.take();
        self.remove_temp().await;
    }

    async fn remove_temp(&self) {
        if let Err(e) = fs::remove_file(&self.temp_path).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(
                    "Failed to cleanup temp file {}: {}",
                    self.temp_path.display(),
                    e
                );
            }
        }
    }
}

impl Drop for AtomicWriter {
    fn drop(&mut self) {
        // Dropped mid-transfer, e.g. by cancellation
        if self.file.take().is_some() {
            let _ = std::fs::remove_file(&self.temp_path);
        }
    }
}

/// Persist the rename itself. Best effort.
#[cfg(unix)]
async fn sync_parent_dir(path: &Path) {
    if let Some(parent) = path.parent() {
        if let Ok(dir) = fs::File::open(parent).await {
            let _ = dir.sync_all().await;
        }
    }
}

#[cfg(not(unix))]
async fn sync_parent_dir(_path: &Path) {}

/// Stream `body` into `dest` with crash-safe replace semantics.
pub async fn write_stream_atomic<S>(
    body: S,
    dest: &Path,
    limiter: &BandwidthLimiter,
    expected_md5: Option<[u8; 16]>,
) -> Result<Materialized>
where
    S: Stream<Item = std::io::Result<Bytes>> + Unpin,
{
    let mut writer = AtomicWriter::create(dest).await?;
    if let Err(e) = writer.copy_from(body, limiter).await {
        writer.abort().await;
        return Err(e);
    }

    if let Some(expected) = expected_md5 {
        let actual = writer.digest();
        if actual != expected {
            writer.abort().await;
            anyhow::bail!(
                "Checksum mismatch for {}: store reported {}, received {}",
                dest.display(),
                to_hex(&expected),
                to_hex(&actual)
            );
        }
    }

    writer.commit().await
}

/// Decode a store-reported content hash as an MD5 digest.
///
/// Accepts base64 (Azure `Content-MD5`) and hex (S3 single-part ETag).
/// Anything else, such as a multipart ETag, yields `None`.
pub fn parse_md5(hash: &str) -> Option<[u8; 16]> {
    use base64::Engine;

    let hash = hash.trim().trim_matches('"');
    if hash.len() == 32 && hash.bytes().all(|b| b.is_ascii_hexdigit()) {
        let mut out = [0u8; 16];
        for (i, byte) in out.iter_mut().enumerate() {
            *byte = u8::from_str_radix(&hash[i * 2..i * 2 + 2], 16).ok()?;
        }
        return Some(out);
    }

    let decoded = base64::engine::general_purpose::STANDARD.decode(hash).ok()?;
    decoded.try_into().ok()
}

fn to_hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

/// Atomically replace `dest` with `data` (used for small metadata files).
pub async fn write_atomic(dest: &Path, data: &[u8]) -> Result<()> {
    let body = futures::stream::iter(vec![Ok(Bytes::copy_from_slice(data))]);
    write_stream_atomic(body, dest, &BandwidthLimiter::unlimited(), None)
        .await
        .map(|_| ())
}
