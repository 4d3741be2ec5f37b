//! bucketsync - directory sync for object storage
//!
//! Mirrors one bucket prefix onto another with server-side copies, optional
//! removal of extraneous objects and a per-object failure report.

pub mod error;
pub mod storage;
pub mod sync;
pub mod types;

pub use error::{BucketSyncError, Result};
pub use storage::{BackendConfig, ObjectStorageClient};
pub use sync::{SyncEngine, SyncRequest};
pub use types::*;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
