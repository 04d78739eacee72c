//! Archive module
//!
//! Packing container directories into `.tar.gz` archives and keeping them
//! in a secondary store with time-stamped names and retention.

pub mod pack;
pub mod vault;

pub use pack::{pack, unpack, CompressionLevel, PackSummary, UnpackSummary};
pub use vault::{archive_name, closest_to_date, parse_archive_name, ArchiveInfo, ArchiveVault};
