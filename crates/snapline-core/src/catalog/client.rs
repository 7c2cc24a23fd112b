//! External catalog interface.
//!
//! The catalog holds a mirror of each dataset's snapshot pointer and schema,
//! guarded by an opaque version tag. Writes are conditioned on the tag the
//! writer last read.

use crate::model::{Schema, Snapshot, TableMetadata};
use crate::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Dataset-level statistics mirrored into the catalog.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatasetStats {
    /// Live data files
    pub file_count: u64,
    /// Live records
    pub record_count: u64,
}

/// What the catalog currently stores for a dataset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatasetRecord {
    /// Dataset path
    pub path: String,
    /// Version tag guarding updates
    pub tag: String,
    /// Schema the catalog advertises
    pub schema: Option<Schema>,
    /// Snapshot the catalog points at
    pub snapshot_id: Option<i64>,
    /// Table metadata location
    pub metadata_location: Option<String>,
    /// Dataset statistics
    pub stats: DatasetStats,
}

/// The state to mirror into the catalog.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatasetState {
    /// Snapshot to point at
    pub snapshot_id: i64,
    /// Table metadata location
    pub metadata_location: String,
    /// Schema to advertise; `None` leaves the catalog schema untouched
    pub schema: Option<Schema>,
    /// Dataset statistics
    pub stats: DatasetStats,
}

impl DatasetState {
    /// Build the state for a published snapshot.
    pub fn from_snapshot(
        metadata: &TableMetadata,
        snapshot: &Snapshot,
        metadata_location: impl Into<String>,
        include_schema: bool,
    ) -> Self {
        Self {
            snapshot_id: snapshot.snapshot_id,
            metadata_location: metadata_location.into(),
            schema: include_schema.then(|| metadata.schema.clone()),
            stats: DatasetStats {
                file_count: snapshot.summary.total_files,
                record_count: snapshot.summary.total_records,
            },
        }
    }
}

/// Operations the commit engine needs from an external catalog.
///
/// Implementations report a stale tag as [`crate::CatalogError::TagMismatch`],
/// a retryable network failure as [`crate::CatalogError::Transport`] and a
/// cancelled request as [`crate::CatalogError::Aborted`].
#[async_trait]
pub trait ExternalCatalog: Send + Sync {
    /// Read the dataset record.
    ///
    /// Returns [`crate::CatalogError::DatasetNotFound`] for an unregistered
    /// dataset.
    async fn get_dataset(&self, path: &str) -> Result<DatasetRecord>;

    /// Write `state` if the dataset tag still equals `expected_tag`.
    ///
    /// `expected_tag == None` registers the dataset and fails if it already
    /// exists. Returns the new tag.
    async fn update_dataset(
        &self,
        path: &str,
        expected_tag: Option<&str>,
        state: &DatasetState,
    ) -> Result<String>;

    /// Catalog name for logs.
    fn name(&self) -> &str;
}
