// Test entry point for sync engine integration tests
// All pass-level tests run against an instrumented in-memory store

mod fake_store;

mod archive_tests;
mod failure_tests;
mod opendal_tests;
