pub mod backend;
pub mod local;
pub mod remote;
pub mod types;

pub use backend::{BackendType, ObjectStore};
pub use local::Materializer;
pub use remote::{GdriveAuth, OpendalStore, RetryPolicy};
pub use types::*;
