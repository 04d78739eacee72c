// Library module for blobvault
// Re-exports modules for use in integration tests and the binary

pub mod archive;
pub mod config;
pub mod fs;
pub mod service;
pub mod sync;
