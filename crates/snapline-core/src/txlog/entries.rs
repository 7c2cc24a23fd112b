//! Commit journal entry types.
//!
//! Each entry records one step between the storage-level commit and the
//! external catalog update, so that an interrupted propagation can be
//! resumed after a crash.

use crate::model::CommitKind;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A published snapshot whose catalog update has not been confirmed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingSync {
    /// Catalog dataset path
    pub dataset: String,
    /// Table location
    pub table_location: String,
    /// Snapshot to propagate
    pub snapshot_id: i64,
    /// Kind of the commit that produced the snapshot
    pub kind: CommitKind,
}

/// A commit journal entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum TransactionEntry {
    /// A new snapshot was published at the storage layer
    CommitPublished {
        /// Catalog dataset path
        dataset: String,
        /// Table location
        table_location: String,
        /// New snapshot id
        snapshot_id: i64,
        /// Parent snapshot id
        parent_snapshot_id: Option<i64>,
        /// Commit kind
        kind: CommitKind,
        /// Metadata version that was swapped in
        metadata_version: u64,
        /// Files added by the commit
        added_files: u64,
        /// Files deleted by the commit
        deleted_files: u64,
        /// Timestamp
        timestamp: DateTime<Utc>,
    },

    /// The change set was already applied
    CommitSkipped {
        /// Catalog dataset path
        dataset: String,
        /// Snapshot that already contains the change set
        applied_in: i64,
        /// Commit kind
        kind: CommitKind,
        /// Timestamp
        timestamp: DateTime<Utc>,
    },

    /// The catalog now points at the snapshot
    CatalogSynced {
        /// Catalog dataset path
        dataset: String,
        /// Snapshot the catalog points at
        snapshot_id: i64,
        /// Tag returned by the catalog
        tag: String,
        /// Attempts used
        attempts: u32,
        /// Timestamp
        timestamp: DateTime<Utc>,
    },

    /// Catalog synchronization gave up
    CatalogSyncFailed {
        /// Catalog dataset path
        dataset: String,
        /// Snapshot that could not be propagated
        snapshot_id: i64,
        /// Error message
        error_message: String,
        /// Attempts used
        attempts: u32,
        /// Timestamp
        timestamp: DateTime<Utc>,
    },

    /// A retention pass removed snapshots
    SnapshotsExpired {
        /// Table location
        table_location: String,
        /// Expired snapshot ids
        snapshot_ids: Vec<i64>,
        /// Expirable snapshots left for a later pass
        deferred: usize,
        /// Timestamp
        timestamp: DateTime<Utc>,
    },

    /// Unreferenced files were deleted
    OrphansRemoved {
        /// Table location
        table_location: String,
        /// Files deleted
        files_deleted: usize,
        /// Files that failed to delete
        failed: usize,
        /// Timestamp
        timestamp: DateTime<Utc>,
    },

    /// Checkpoint marker
    Checkpoint {
        /// Checkpoint identifier
        checkpoint_id: String,
        /// Last published snapshot at checkpoint
        last_snapshot_id: Option<i64>,
        /// Unconfirmed catalog updates at checkpoint
        pending_syncs: Vec<PendingSync>,
        /// Number of entries since last checkpoint
        entries_since_last: u64,
        /// Timestamp
        timestamp: DateTime<Utc>,
    },
}

impl TransactionEntry {
    /// Get the timestamp of this entry.
    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            TransactionEntry::CommitPublished { timestamp, .. }
            | TransactionEntry::CommitSkipped { timestamp, .. }
            | TransactionEntry::CatalogSynced { timestamp, .. }
            | TransactionEntry::CatalogSyncFailed { timestamp, .. }
            | TransactionEntry::SnapshotsExpired { timestamp, .. }
            | TransactionEntry::OrphansRemoved { timestamp, .. }
            | TransactionEntry::Checkpoint { timestamp, .. } => *timestamp,
        }
    }

    /// Get the dataset path if this entry has one.
    pub fn dataset(&self) -> Option<&str> {
        match self {
            TransactionEntry::CommitPublished { dataset, .. }
            | TransactionEntry::CommitSkipped { dataset, .. }
            | TransactionEntry::CatalogSynced { dataset, .. }
            | TransactionEntry::CatalogSyncFailed { dataset, .. } => Some(dataset),
            _ => None,
        }
    }

    /// Get the snapshot ID if this entry has one.
    pub fn snapshot_id(&self) -> Option<i64> {
        match self {
            TransactionEntry::CommitPublished { snapshot_id, .. }
            | TransactionEntry::CatalogSynced { snapshot_id, .. }
            | TransactionEntry::CatalogSyncFailed { snapshot_id, .. } => Some(*snapshot_id),
            TransactionEntry::CommitSkipped { applied_in, .. } => Some(*applied_in),
            TransactionEntry::Checkpoint {
                last_snapshot_id, ..
            } => *last_snapshot_id,
            _ => None,
        }
    }

    /// Check if this is a checkpoint entry.
    pub fn is_checkpoint(&self) -> bool {
        matches!(self, TransactionEntry::Checkpoint { .. })
    }

    /// Check if this is a published commit entry.
    pub fn is_commit_published(&self) -> bool {
        matches!(self, TransactionEntry::CommitPublished { .. })
    }

    /// Check if this is a successful catalog sync entry.
    pub fn is_catalog_synced(&self) -> bool {
        matches!(self, TransactionEntry::CatalogSynced { .. })
    }
}
