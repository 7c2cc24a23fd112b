//! Versioned table metadata.
//!
//! `TableMetadata` is copy-on-write: every update returns a new value with
//! the next metadata version, which is then published through the storage
//! pointer swap.

use super::partition::PartitionSpec;
use super::schema::Schema;
use super::snapshot::Snapshot;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::str::FromStr;
use uuid::Uuid;

/// Current metadata format version.
pub const FORMAT_VERSION: u8 = 1;

/// One entry in the history of current-snapshot changes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotLogEntry {
    /// Snapshot that became current
    pub snapshot_id: i64,
    /// When it became current
    pub timestamp: DateTime<Utc>,
}

/// Table metadata stored in one versioned metadata file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableMetadata {
    /// Metadata format version
    pub format_version: u8,
    /// Table UUID
    pub table_uuid: Uuid,
    /// Table root location
    pub location: String,
    /// Version of the metadata file holding this value
    pub metadata_version: u64,
    /// Highest sequence number assigned
    pub last_sequence_number: i64,
    /// Highest snapshot id ever assigned
    pub last_snapshot_id: i64,
    /// Highest column id ever assigned
    pub last_column_id: i32,
    /// Last modification time
    pub last_updated: DateTime<Utc>,
    /// Current schema
    pub schema: Schema,
    /// Current partition spec
    pub partition_spec: PartitionSpec,
    /// Table properties
    #[serde(default)]
    pub properties: BTreeMap<String, String>,
    /// Current snapshot
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_snapshot_id: Option<i64>,
    /// Retained snapshots, oldest first
    #[serde(default)]
    pub snapshots: Vec<Snapshot>,
    /// History of current-snapshot changes
    #[serde(default)]
    pub snapshot_log: Vec<SnapshotLogEntry>,
}

impl TableMetadata {
    /// Metadata for a new, empty table.
    pub fn new(
        location: impl Into<String>,
        schema: Schema,
        partition_spec: PartitionSpec,
        properties: BTreeMap<String, String>,
    ) -> Self {
        let last_column_id = schema.highest_field_id();
        Self {
            format_version: FORMAT_VERSION,
            table_uuid: Uuid::new_v4(),
            location: location.into(),
            metadata_version: 1,
            last_sequence_number: 0,
            last_snapshot_id: 0,
            last_column_id,
            last_updated: Utc::now(),
            schema,
            partition_spec,
            properties,
            current_snapshot_id: None,
            snapshots: Vec::new(),
            snapshot_log: Vec::new(),
        }
    }

    /// The current snapshot, if any.
    pub fn current_snapshot(&self) -> Option<&Snapshot> {
        self.current_snapshot_id.and_then(|id| self.snapshot(id))
    }

    /// Look up a snapshot by id.
    pub fn snapshot(&self, snapshot_id: i64) -> Option<&Snapshot> {
        self.snapshots.iter().find(|s| s.snapshot_id == snapshot_id)
    }

    /// Walk the parent chain starting at `from`, newest first.
    ///
    /// The walk stops at the first snapshot whose parent is absent or no
    /// longer retained.
    pub fn ancestors(&self, from: Option<i64>) -> Vec<&Snapshot> {
        let mut chain = Vec::new();
        let mut next = from;
        while let Some(id) = next {
            match self.snapshot(id) {
                Some(snapshot) => {
                    chain.push(snapshot);
                    next = snapshot.parent_snapshot_id;
                }
                None => break,
            }
        }
        chain
    }

    /// Next snapshot id to assign.
    pub fn next_snapshot_id(&self) -> i64 {
        self.last_snapshot_id + 1
    }

    /// Next sequence number to assign.
    pub fn next_sequence_number(&self) -> i64 {
        self.last_sequence_number + 1
    }

    /// Parse a table property.
    pub fn property<T: FromStr>(&self, key: &str) -> Option<T> {
        self.properties.get(key).and_then(|v| v.parse().ok())
    }

    /// New metadata with `snapshot` as the current snapshot.
    pub fn with_snapshot(
        &self,
        snapshot: Snapshot,
        schema: Option<Schema>,
        partition_spec: Option<PartitionSpec>,
    ) -> Self {
        let mut next = self.next_version();
        if let Some(schema) = schema {
            next.last_column_id = next.last_column_id.max(schema.highest_field_id());
            next.schema = schema;
        }
        if let Some(spec) = partition_spec {
            next.partition_spec = spec;
        }
        next.last_sequence_number = next.last_sequence_number.max(snapshot.sequence_number);
        next.last_snapshot_id = next.last_snapshot_id.max(snapshot.snapshot_id);
        next.current_snapshot_id = Some(snapshot.snapshot_id);
        next.snapshot_log.push(SnapshotLogEntry {
            snapshot_id: snapshot.snapshot_id,
            timestamp: snapshot.timestamp,
        });
        next.snapshots.push(snapshot);
        next
    }

    /// New metadata with the given snapshots removed.
    ///
    /// The current snapshot is never removed.
    pub fn without_snapshots(&self, expired: &HashSet<i64>) -> Self {
        let mut next = self.next_version();
        let current = self.current_snapshot_id;
        next.snapshots
            .retain(|s| Some(s.snapshot_id) == current || !expired.contains(&s.snapshot_id));
        next.snapshot_log
            .retain(|e| Some(e.snapshot_id) == current || !expired.contains(&e.snapshot_id));
        next
    }

    /// New metadata with the given properties set.
    pub fn with_properties(&self, properties: BTreeMap<String, String>) -> Self {
        let mut next = self.next_version();
        next.properties.extend(properties);
        next
    }

    fn next_version(&self) -> Self {
        let mut next = self.clone();
        next.metadata_version = self.metadata_version + 1;
        next.last_updated = Utc::now();
        next
    }
}
