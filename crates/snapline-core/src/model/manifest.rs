//! Manifests and manifest lists.
//!
//! The same [`Manifest`] type is used for manifests handed in by upstream
//! writers (only `Added` / `Deleted` entries) and for manifests written by the
//! commit engine, which additionally carry `Existing` entries for files that
//! were carried over from an earlier snapshot.

use super::data_file::DataFile;
use crate::{CommitError, Result};
use serde::{Deserialize, Serialize};

/// Status of a manifest entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryStatus {
    /// File added by the snapshot that wrote the manifest
    Added,
    /// File carried over from an earlier snapshot
    Existing,
    /// File removed by the snapshot that wrote the manifest
    Deleted,
}

/// A single file entry in a manifest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestEntry {
    /// Entry status
    pub status: EntryStatus,
    /// Snapshot that added (or deleted) the file
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snapshot_id: Option<i64>,
    /// Data sequence number of the file
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sequence_number: Option<i64>,
    /// The data file
    pub file: DataFile,
}

impl ManifestEntry {
    /// Whether this entry is readable in the snapshot that owns the manifest.
    pub fn is_live(&self) -> bool {
        self.status != EntryStatus::Deleted
    }
}

/// An ordered, appendable list of file entries.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    /// Sequence number the manifest was written with
    pub sequence_number: i64,
    /// Snapshot the manifest was written against (upstream) or by (engine)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snapshot_id: Option<i64>,
    /// Entries in write order
    pub entries: Vec<ManifestEntry>,
}

impl Manifest {
    /// Create an empty manifest.
    pub fn new(snapshot_id: Option<i64>, sequence_number: i64) -> Self {
        Self {
            sequence_number,
            snapshot_id,
            entries: Vec::new(),
        }
    }

    /// Append a file-add entry.
    pub fn add(&mut self, file: DataFile) -> &mut Self {
        self.entries.push(ManifestEntry {
            status: EntryStatus::Added,
            snapshot_id: self.snapshot_id,
            sequence_number: Some(self.sequence_number),
            file,
        });
        self
    }

    /// Append a file-delete entry.
    pub fn delete(&mut self, file: DataFile) -> &mut Self {
        self.entries.push(ManifestEntry {
            status: EntryStatus::Deleted,
            snapshot_id: self.snapshot_id,
            sequence_number: Some(self.sequence_number),
            file,
        });
        self
    }

    /// Append a prepared entry.
    pub fn push(&mut self, entry: ManifestEntry) {
        self.entries.push(entry);
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the manifest has no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entries that are readable through this manifest.
    pub fn live_entries(&self) -> impl Iterator<Item = &ManifestEntry> {
        self.entries.iter().filter(|e| e.is_live())
    }

    /// Files with the given status.
    pub fn files_with_status(&self, status: EntryStatus) -> impl Iterator<Item = &DataFile> {
        self.entries
            .iter()
            .filter(move |e| e.status == status)
            .map(|e| &e.file)
    }

    /// Validate a manifest supplied by an upstream writer.
    ///
    /// Upstream manifests may only add or delete files; `Existing` entries are
    /// produced exclusively by the commit engine.
    pub fn validate_upstream(&self) -> Result<()> {
        for entry in &self.entries {
            if entry.status == EntryStatus::Existing {
                return Err(CommitError::InvalidChange(format!(
                    "upstream manifest carries an existing entry for {}",
                    entry.file.path
                ))
                .into());
            }
            entry.file.validate()?;
        }
        Ok(())
    }
}

/// Summary of a manifest written to storage, as recorded in a manifest list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestFile {
    /// Manifest location
    pub path: String,
    /// Snapshot that wrote the manifest
    pub added_snapshot_id: i64,
    /// Sequence number the manifest was written with
    pub sequence_number: i64,
    /// Number of `Added` entries
    pub added_files_count: u64,
    /// Number of `Existing` entries
    pub existing_files_count: u64,
    /// Number of `Deleted` entries
    pub deleted_files_count: u64,
    /// Rows in `Added` entries
    pub added_rows_count: u64,
    /// Rows in `Existing` entries
    pub existing_rows_count: u64,
    /// Rows in `Deleted` entries
    pub deleted_rows_count: u64,
}

impl ManifestFile {
    /// Describe a manifest about to be written at `path`.
    pub fn describe(path: impl Into<String>, manifest: &Manifest, added_snapshot_id: i64) -> Self {
        let mut summary = Self {
            path: path.into(),
            added_snapshot_id,
            sequence_number: manifest.sequence_number,
            added_files_count: 0,
            existing_files_count: 0,
            deleted_files_count: 0,
            added_rows_count: 0,
            existing_rows_count: 0,
            deleted_rows_count: 0,
        };

        for entry in &manifest.entries {
            let rows = entry.file.record_count;
            match entry.status {
                EntryStatus::Added => {
                    summary.added_files_count += 1;
                    summary.added_rows_count += rows;
                }
                EntryStatus::Existing => {
                    summary.existing_files_count += 1;
                    summary.existing_rows_count += rows;
                }
                EntryStatus::Deleted => {
                    summary.deleted_files_count += 1;
                    summary.deleted_rows_count += rows;
                }
            }
        }

        summary
    }

    /// Number of files readable through this manifest.
    pub fn live_files_count(&self) -> u64 {
        self.added_files_count + self.existing_files_count
    }
}

/// The list of manifests making up one snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestList {
    /// Snapshot this list belongs to
    pub snapshot_id: i64,
    /// Parent snapshot
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_snapshot_id: Option<i64>,
    /// Manifests in the snapshot
    pub manifests: Vec<ManifestFile>,
}
