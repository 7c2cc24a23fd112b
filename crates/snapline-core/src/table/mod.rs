//! Table storage and the commit protocol.
//!
//! This module provides:
//! - `TableStore`: metadata, manifest and data file access over `object_store`
//! - `SchemaReconciler`: safe schema merging and partition spec edits
//! - `ConflictDetector`: PROCEED / SKIP / REJECT classification
//! - `CommitTransaction`: the two-phase commit state machine
//! - `CommitCoordinator`: transaction, journal, retention and catalog wiring

mod conflict;
mod coordinator;
mod schema_reconciler;
mod storage;
mod transaction;

pub use conflict::{ConflictDetector, ConflictPolicies, ConflictPolicy, Decision, InterveningCommit};
pub use coordinator::{
    CommitCoordinator, CommitCoordinatorBuilder, CommitReport, CoordinatorStats,
};
pub use schema_reconciler::{EvolvedPartitionSpec, ReconciledSchema, SchemaReconciler, TypePromotion};
pub use storage::{StoredFile, TableStore, DATA_DIR, METADATA_DIR, VERSION_HINT};
pub use transaction::{CommitOptions, CommitOutcome, CommitTransaction, TransactionState};
