//! Table data model.
//!
//! Immutable value types for data files, manifests, snapshots and table
//! metadata, plus the per-attempt [`ChangeSet`] accumulator. Nothing in this
//! module performs I/O.

mod change_set;
mod data_file;
mod manifest;
mod partition;
mod partition_stats;
mod schema;
mod snapshot;
mod table_metadata;

pub use change_set::ChangeSet;
pub use data_file::{DataFile, DeleteTarget, FileIdentity};
pub use manifest::{EntryStatus, Manifest, ManifestEntry, ManifestFile, ManifestList};
pub use partition::{PartitionField, PartitionSpec, PartitionSpecUpdate, Transform};
pub use partition_stats::{PartitionStats, PartitionStatsEntry};
pub use schema::{Field, FieldType, ListType, MapType, PrimitiveType, Schema, StructType};
pub use snapshot::{CommitKind, Snapshot, SnapshotSummary};
pub use table_metadata::{SnapshotLogEntry, TableMetadata, FORMAT_VERSION};
