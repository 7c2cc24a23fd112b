//! External catalog synchronization.
//!
//! - `ExternalCatalog`: tag-guarded dataset records
//! - `InMemoryCatalog`: in-process implementation
//! - `CatalogSynchronizer`: read tag, conditional write, bounded retry

mod client;
mod memory;
mod synchronizer;

pub use client::{DatasetRecord, DatasetState, DatasetStats, ExternalCatalog};
pub use memory::InMemoryCatalog;
pub use synchronizer::{CatalogSynchronizer, RetryPolicy, SyncOutcome, SyncReport};
