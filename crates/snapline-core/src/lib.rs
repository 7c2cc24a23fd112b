//! Snapline Core - transactional snapshot commits for versioned tables
//!
//! This library commits change sets to a table stored as immutable files on
//! an object store, with:
//!
//! - Optimistic concurrency via a create-if-absent metadata pointer swap
//! - Conflict detection and idempotent replay of already-applied commits
//! - Safe schema and partition spec evolution
//! - Snapshot retention and orphan file cleanup
//! - Tag-guarded synchronization with an external catalog, resumable
//!   through a commit journal

pub mod catalog;
pub mod config;
pub mod error;
pub mod maintenance;
pub mod metrics;
pub mod model;
pub mod table;
pub mod txlog;

// Re-export commonly used types
pub use config::Config;
pub use error::{CatalogError, CommitError, SchemaError, TransactionLogError};
pub use error::{Error, ErrorKind, Result};
