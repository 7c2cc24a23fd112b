//! Per-partition statistics written alongside each snapshot.

use super::data_file::DataFile;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Aggregates for one partition tuple.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionStatsEntry {
    /// Live data files in the partition
    pub file_count: u64,
    /// Records across those files
    pub record_count: u64,
    /// Bytes across those files
    pub total_size_bytes: u64,
}

/// Partition statistics of one snapshot, keyed by `k=v/k=v`.
///
/// The unpartitioned tuple is keyed by the empty string.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionStats {
    /// Snapshot the statistics describe
    pub snapshot_id: i64,
    /// Per-partition aggregates
    pub partitions: BTreeMap<String, PartitionStatsEntry>,
}

impl PartitionStats {
    /// Aggregate statistics over the live files of a snapshot.
    pub fn collect<'a>(snapshot_id: i64, files: impl IntoIterator<Item = &'a DataFile>) -> Self {
        let mut partitions: BTreeMap<String, PartitionStatsEntry> = BTreeMap::new();
        for file in files {
            let entry = partitions.entry(file.partition_key()).or_default();
            entry.file_count += 1;
            entry.record_count += file.record_count;
            entry.total_size_bytes += file.file_size_bytes;
        }
        Self {
            snapshot_id,
            partitions,
        }
    }

    /// Total live files across all partitions.
    pub fn total_files(&self) -> u64 {
        self.partitions.values().map(|p| p.file_count).sum()
    }

    /// Total records across all partitions.
    pub fn total_records(&self) -> u64 {
        self.partitions.values().map(|p| p.record_count).sum()
    }
}
