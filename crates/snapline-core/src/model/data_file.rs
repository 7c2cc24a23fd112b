//! Data files and delete targets.

use crate::{CommitError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// An immutable data file tracked by the table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataFile {
    /// File path in storage
    pub path: String,
    /// Version token embedded by the storage path scheme, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version_token: Option<String>,
    /// File size in bytes
    pub file_size_bytes: u64,
    /// Number of records in the file
    pub record_count: u64,
    /// Partition values keyed by partition field name
    #[serde(default)]
    pub partition: BTreeMap<String, String>,
    /// Partition spec the file was written with
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub spec_id: Option<i32>,
}

impl DataFile {
    /// Create a data file with no partition values.
    pub fn new(path: impl Into<String>, file_size_bytes: u64, record_count: u64) -> Self {
        Self {
            path: path.into(),
            version_token: None,
            file_size_bytes,
            record_count,
            partition: BTreeMap::new(),
            spec_id: None,
        }
    }

    /// Set a partition value.
    pub fn with_partition(mut self, field: impl Into<String>, value: impl Into<String>) -> Self {
        self.partition.insert(field.into(), value.into());
        self
    }

    /// Set the partition spec id.
    pub fn with_spec_id(mut self, spec_id: i32) -> Self {
        self.spec_id = Some(spec_id);
        self
    }

    /// Set the storage version token.
    pub fn with_version_token(mut self, token: impl Into<String>) -> Self {
        self.version_token = Some(token.into());
        self
    }

    /// Identity of this file: path plus version token when present.
    pub fn identity(&self) -> FileIdentity {
        FileIdentity::new(&self.path, self.version_token.as_deref())
    }

    /// Render the partition tuple as `k=v/k=v`, or empty when unpartitioned.
    pub fn partition_key(&self) -> String {
        self.partition
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect::<Vec<_>>()
            .join("/")
    }

    /// Validate that the file carries usable metadata.
    pub fn validate(&self) -> Result<()> {
        if self.path.trim().is_empty() {
            return Err(CommitError::InvalidChange("data file path is empty".into()).into());
        }
        if matches!(self.version_token.as_deref(), Some(t) if t.is_empty()) {
            return Err(CommitError::InvalidChange(format!(
                "data file {} has an empty version token",
                self.path
            ))
            .into());
        }
        Ok(())
    }
}

/// Identity of a data file.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct FileIdentity(String);

impl FileIdentity {
    /// Build an identity from a path and optional version token.
    pub fn new(path: &str, version_token: Option<&str>) -> Self {
        match version_token {
            Some(token) => Self(format!("{}#{}", path, token)),
            None => Self(path.to_string()),
        }
    }

    /// The path component of this identity.
    pub fn path(&self) -> &str {
        self.0.split_once('#').map(|(p, _)| p).unwrap_or(&self.0)
    }

    /// The full identity string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for FileIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Target of a logical delete.
///
/// Path-only deletes cannot be size- or partition-validated until they are
/// applied against the live table state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DeleteTarget {
    /// A fully described data file
    File(DataFile),
    /// A bare path
    Path { path: String },
}

impl DeleteTarget {
    /// Path of the file being deleted.
    pub fn path(&self) -> &str {
        match self {
            DeleteTarget::File(file) => &file.path,
            DeleteTarget::Path { path } => path,
        }
    }

    /// Full file metadata, when the caller supplied it.
    pub fn data_file(&self) -> Option<&DataFile> {
        match self {
            DeleteTarget::File(file) => Some(file),
            DeleteTarget::Path { .. } => None,
        }
    }

    /// Validate the target shape.
    pub fn validate(&self) -> Result<()> {
        match self {
            DeleteTarget::File(file) => file.validate().map_err(|_| {
                CommitError::InvalidDelete {
                    path: file.path.clone(),
                    reason: "data file metadata is incomplete".into(),
                }
                .into()
            }),
            DeleteTarget::Path { path } if path.trim().is_empty() => {
                Err(CommitError::InvalidDelete {
                    path: path.clone(),
                    reason: "path is empty".into(),
                }
                .into())
            }
            DeleteTarget::Path { .. } => Ok(()),
        }
    }

    /// Check a full-metadata delete against the live entry it removes.
    pub fn check_against(&self, live: &DataFile) -> Result<()> {
        let Some(file) = self.data_file() else {
            return Ok(());
        };
        let mismatch = if file.file_size_bytes != live.file_size_bytes {
            Some(format!(
                "size {} does not match live size {}",
                file.file_size_bytes, live.file_size_bytes
            ))
        } else if file.record_count != live.record_count {
            Some(format!(
                "record count {} does not match live count {}",
                file.record_count, live.record_count
            ))
        } else if file.partition != live.partition {
            Some(format!(
                "partition {} does not match live partition {}",
                file.partition_key(),
                live.partition_key()
            ))
        } else {
            None
        };

        match mismatch {
            Some(reason) => Err(CommitError::InvalidDelete {
                path: file.path.clone(),
                reason,
            }
            .into()),
            None => Ok(()),
        }
    }
}

impl From<DataFile> for DeleteTarget {
    fn from(file: DataFile) -> Self {
        DeleteTarget::File(file)
    }
}

impl From<&str> for DeleteTarget {
    fn from(path: &str) -> Self {
        DeleteTarget::Path {
            path: path.to_string(),
        }
    }
}

impl From<String> for DeleteTarget {
    fn from(path: String) -> Self {
        DeleteTarget::Path { path }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_with_version_token() {
        let plain = DataFile::new("data/a.parquet", 10, 1);
        assert_eq!(plain.identity().as_str(), "data/a.parquet");

        let versioned = plain.clone().with_version_token("v7");
        assert_eq!(versioned.identity().as_str(), "data/a.parquet#v7");
        assert_eq!(versioned.identity().path(), "data/a.parquet");
        assert_ne!(plain.identity(), versioned.identity());
    }

    #[test]
    fn test_partition_key() {
        let file = DataFile::new("data/a.parquet", 10, 1)
            .with_partition("region", "eu")
            .with_partition("day", "2024-01-01");
        assert_eq!(file.partition_key(), "day=2024-01-01/region=eu");
    }

    #[test]
    fn test_delete_target_validation() {
        assert!(DeleteTarget::from("data/a.parquet").validate().is_ok());
        assert!(DeleteTarget::from("  ").validate().is_err());
        assert!(DeleteTarget::from(DataFile::new("", 1, 1)).validate().is_err());
    }

    #[test]
    fn test_check_against_live_entry() {
        let live = DataFile::new("data/a.parquet", 100, 10).with_partition("day", "1");

        assert!(DeleteTarget::from("data/a.parquet").check_against(&live).is_ok());
        assert!(DeleteTarget::from(live.clone()).check_against(&live).is_ok());

        let wrong_size = DataFile::new("data/a.parquet", 99, 10).with_partition("day", "1");
        let err = DeleteTarget::from(wrong_size).check_against(&live).unwrap_err();
        assert!(err.is_validation());
        assert!(err.to_string().contains("size 99"));
    }
}
