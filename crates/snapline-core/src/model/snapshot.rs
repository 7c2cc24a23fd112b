//! Snapshots and commit kinds.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// The kind of change a commit represents.
///
/// The kind only influences conflict tie-breaking and post-commit catalog
/// behavior; every kind runs through the same commit state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CommitKind {
    /// Append newly discovered files to the table
    IncrementalRefresh,
    /// Refresh a subset of partitions
    PartialRefresh,
    /// Row-level insert/update/delete
    Dml,
    /// Replace the full file listing
    FullRefresh,
}

impl CommitKind {
    /// All commit kinds.
    pub const ALL: [CommitKind; 4] = [
        CommitKind::IncrementalRefresh,
        CommitKind::PartialRefresh,
        CommitKind::Dml,
        CommitKind::FullRefresh,
    ];

    /// Stable label used in summaries, logs and config.
    pub fn as_str(&self) -> &'static str {
        match self {
            CommitKind::IncrementalRefresh => "incremental-refresh",
            CommitKind::PartialRefresh => "partial-refresh",
            CommitKind::Dml => "dml",
            CommitKind::FullRefresh => "full-refresh",
        }
    }

    /// Whether the catalog should receive the table schema after a commit.
    ///
    /// DML never changes the schema, so only the snapshot pointer is mirrored.
    pub fn syncs_schema(&self) -> bool {
        !matches!(self, CommitKind::Dml)
    }
}

impl fmt::Display for CommitKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Operation summary of a snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotSummary {
    /// Kind of commit that produced the snapshot
    pub operation: CommitKind,
    /// Number of added files
    pub added_files: u64,
    /// Number of deleted files
    pub deleted_files: u64,
    /// Number of added records
    pub added_records: u64,
    /// Number of deleted records
    pub deleted_records: u64,
    /// Total data files in the snapshot
    pub total_files: u64,
    /// Total records in the snapshot
    pub total_records: u64,
}

impl SnapshotSummary {
    /// An empty summary for the given operation.
    pub fn empty(operation: CommitKind) -> Self {
        Self {
            operation,
            added_files: 0,
            deleted_files: 0,
            added_records: 0,
            deleted_records: 0,
            total_files: 0,
            total_records: 0,
        }
    }
}

/// An immutable version of the table contents.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    /// Snapshot id, monotonically assigned
    pub snapshot_id: i64,
    /// Parent snapshot, none for the first snapshot
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_snapshot_id: Option<i64>,
    /// Sequence number
    pub sequence_number: i64,
    /// Wall-clock commit time
    pub timestamp: DateTime<Utc>,
    /// Manifest list location
    pub manifest_list: String,
    /// Partition statistics file location
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub partition_stats: Option<String>,
    /// Schema the snapshot was written with
    pub schema_id: i32,
    /// Operation summary
    pub summary: SnapshotSummary,
}

impl Snapshot {
    /// Age of the snapshot relative to `now`, in milliseconds.
    pub fn age_ms(&self, now: DateTime<Utc>) -> i64 {
        (now - self.timestamp).num_milliseconds()
    }

    /// Metadata files owned by this snapshot: manifest list and stats file.
    pub fn metadata_files(&self) -> impl Iterator<Item = &str> {
        std::iter::once(self.manifest_list.as_str()).chain(self.partition_stats.as_deref())
    }
}
