//! Tar + gzip archiver for container directories.
//!
//! Both directions are all-or-nothing: archives are written to a temporary
//! sibling and renamed, extractions happen in a scratch directory that is
//! renamed onto the destination.

use anyhow::{bail, Context, Result};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression as GzipCompression;
use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::{Component, Path, PathBuf};
use tracing::{debug, info};

use crate::fs::local::{temp_sibling, TEMP_SUFFIX};

/// Compression level (1-9, where 1 is fastest-lowest and 9 is slowest-highest).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompressionLevel(u8);

impl Default for CompressionLevel {
    fn default() -> Self {
        Self(6)
    }
}

impl CompressionLevel {
    /// Create a new compression level (clamped to 1-9).
    pub fn new(level: u8) -> Self {
        Self(level.clamp(1, 9))
    }

    pub fn value(&self) -> u8 {
        self.0
    }
}

/// What went into an archive.
#[derive(Debug, Clone)]
pub struct PackSummary {
    pub archive: PathBuf,
    pub files: usize,
    /// Uncompressed payload size.
    pub bytes: u64,
    pub archive_size: u64,
}

/// What came out of an archive.
#[derive(Debug, Clone, Default)]
pub struct UnpackSummary {
    pub files: usize,
    pub bytes: u64,
}

/// Pack every regular file below `source` into a `.tar.gz` at `archive`.
///
/// Entry names are relative to `source`. Temporary download files are skipped.
pub async fn pack(source: &Path, archive: &Path, level: CompressionLevel) -> Result<PackSummary> {
    let source = source.to_path_buf();
    let archive = archive.to_path_buf();
    tokio::task::spawn_blocking(move || pack_blocking(&source, &archive, level))
        .await
        .context("Archive task panicked")?
}

/// Extract `archive` into `dest`, which must not exist yet.
pub async fn unpack(archive: &Path, dest: &Path) -> Result<UnpackSummary> {
    let archive = archive.to_path_buf();
    let dest = dest.to_path_buf();
    tokio::task::spawn_blocking(move || unpack_blocking(&archive, &dest))
        .await
        .context("Extraction task panicked")?
}

fn pack_blocking(source: &Path, archive: &Path, level: CompressionLevel) -> Result<PackSummary> {
    if !source.is_dir() {
        bail!("Nothing to archive: {} is not a directory", source.display());
    }
    if let Some(parent) = archive.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
    }

    let temp = temp_sibling(archive);
    let result = write_archive(source, &temp, level).and_then(|(files, bytes)| {
        std::fs::rename(&temp, archive)
            .with_context(|| format!("Failed to move archive into {}", archive.display()))?;
        Ok((files, bytes))
    });

    let (files, bytes) = match result {
        Ok(counts) => counts,
        Err(e) => {
            let _ = std::fs::remove_file(&temp);
            return Err(e);
        }
    };

    let archive_size = std::fs::metadata(archive).map(|m| m.len()).unwrap_or(0);
    info!(
        "Packed {} files ({}) from {} into {} ({})",
        files,
        humansize::format_size(bytes, humansize::BINARY),
        source.display(),
        archive.display(),
        humansize::format_size(archive_size, humansize::BINARY)
    );

    Ok(PackSummary {
        archive: archive.to_path_buf(),
        files,
        bytes,
        archive_size,
    })
}

fn write_archive(source: &Path, temp: &Path, level: CompressionLevel) -> Result<(usize, u64)> {
    let file = File::create(temp)
        .with_context(|| format!("Failed to create archive: {}", temp.display()))?;
    let encoder = GzEncoder::new(
        BufWriter::new(file),
        GzipCompression::new(level.value() as u32),
    );
    let mut builder = tar::Builder::new(encoder);
    builder.follow_symlinks(false);

    let mut entries: Vec<(PathBuf, PathBuf)> = Vec::new();
    for entry in jwalk::WalkDir::new(source).skip_hidden(false).follow_links(false) {
        let entry = entry.with_context(|| format!("Failed to walk {}", source.display()))?;
        if !entry.file_type().is_file() {
            continue;
        }
        let path = entry.path();
        if path.to_string_lossy().ends_with(TEMP_SUFFIX) {
            continue;
        }
        let rel = path
            .strip_prefix(source)
            .with_context(|| format!("{} escapes {}", path.display(), source.display()))?
            .to_path_buf();
        entries.push((path, rel));
    }
    entries.sort_by(|a, b| a.1.cmp(&b.1));

    let mut bytes = 0u64;
    for (path, rel) in &entries {
        let mut file =
            File::open(path).with_context(|| format!("Failed to open {}", path.display()))?;
        bytes += file.metadata().map(|m| m.len()).unwrap_or(0);
        builder
            .append_file(rel, &mut file)
            .with_context(|| format!("Failed to archive {}", path.display()))?;
    }

    let encoder = builder.into_inner().context("Failed to finish tar stream")?;
    let mut writer = encoder.finish().context("Failed to finish gzip stream")?;
    writer.flush()?;
    let file = writer
        .into_inner()
        .map_err(|e| e.into_error())
        .context("Failed to flush archive")?;
    file.sync_all().context("Failed to sync archive")?;

    Ok((entries.len(), bytes))
}

/// Entry path below the destination, or an error when it would escape it.
fn safe_entry_path(entry_path: &Path) -> Result<PathBuf> {
    let mut out = PathBuf::new();
    for component in entry_path.components() {
        match component {
            Component::Normal(part) => out.push(part),
            Component::CurDir => {}
            _ => bail!("Archive entry escapes destination: {}", entry_path.display()),
        }
    }
    if out.as_os_str().is_empty() {
        bail!("Archive entry has an empty path");
    }
    Ok(out)
}

fn unpack_blocking(archive: &Path, dest: &Path) -> Result<UnpackSummary> {
    if dest.exists() {
        bail!("Extraction target already exists: {}", dest.display());
    }
    if let Some(parent) = dest.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
    }

    let scratch = temp_sibling(dest);
    let result = extract_into(archive, &scratch).and_then(|summary| {
        std::fs::rename(&scratch, dest)
            .with_context(|| format!("Failed to move extraction into {}", dest.display()))?;
        Ok(summary)
    });

    if result.is_err() {
        let _ = std::fs::remove_dir_all(&scratch);
    }
    result
}

fn extract_into(archive: &Path, scratch: &Path) -> Result<UnpackSummary> {
    std::fs::create_dir_all(scratch)
        .with_context(|| format!("Failed to create directory: {}", scratch.display()))?;

    let file = File::open(archive)
        .with_context(|| format!("Failed to open archive: {}", archive.display()))?;
    let mut tar = tar::Archive::new(GzDecoder::new(BufReader::new(file)));

    let mut summary = UnpackSummary::default();
    for entry in tar.entries().context("Failed to read archive")? {
        let mut entry = entry.context("Corrupt archive entry")?;
        let entry_path = entry.path().context("Invalid entry path")?.into_owned();
        let rel = safe_entry_path(&entry_path)?;
        let target = scratch.join(&rel);

        match entry.header().entry_type() {
            tar::EntryType::Directory => {
                std::fs::create_dir_all(&target)
                    .with_context(|| format!("Failed to create {}", target.display()))?;
            }
            tar::EntryType::Regular | tar::EntryType::Continuous => {
                if let Some(parent) = target.parent() {
                    std::fs::create_dir_all(parent)
                        .with_context(|| format!("Failed to create {}", parent.display()))?;
                }
                entry
                    .unpack(&target)
                    .with_context(|| format!("Failed to extract {}", rel.display()))?;
                summary.files += 1;
                summary.bytes += entry.size();
            }
            other => {
                debug!("Skipping {:?} entry {}", other, entry_path.display());
            }
        }
    }
    Ok(summary)
}
