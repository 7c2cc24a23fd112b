//! In-process catalog.

use super::client::{DatasetRecord, DatasetState, ExternalCatalog};
use crate::{CatalogError, Result};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::debug;

/// A catalog kept in memory, with tags drawn from a process-wide counter.
#[derive(Debug, Default)]
pub struct InMemoryCatalog {
    datasets: RwLock<HashMap<String, DatasetRecord>>,
    next_tag: AtomicU64,
}

impl InMemoryCatalog {
    /// Create an empty catalog.
    pub fn new() -> Self {
        Self::default()
    }

    /// Current record of a dataset, if registered.
    pub fn dataset(&self, path: &str) -> Option<DatasetRecord> {
        self.datasets.read().get(path).cloned()
    }

    /// Number of registered datasets.
    pub fn len(&self) -> usize {
        self.datasets.read().len()
    }

    /// Whether no dataset is registered.
    pub fn is_empty(&self) -> bool {
        self.datasets.read().is_empty()
    }

    fn new_tag(&self) -> String {
        format!("t{}", self.next_tag.fetch_add(1, Ordering::SeqCst) + 1)
    }
}

#[async_trait]
impl ExternalCatalog for InMemoryCatalog {
    async fn get_dataset(&self, path: &str) -> Result<DatasetRecord> {
        self.dataset(path)
            .ok_or_else(|| CatalogError::DatasetNotFound(path.to_string()).into())
    }

    async fn update_dataset(
        &self,
        path: &str,
        expected_tag: Option<&str>,
        state: &DatasetState,
    ) -> Result<String> {
        let mut datasets = self.datasets.write();
        let actual = datasets.get(path).map(|r| r.tag.clone());

        if actual.as_deref() != expected_tag {
            return Err(CatalogError::TagMismatch {
                dataset: path.to_string(),
                expected: expected_tag.map(str::to_string),
                actual,
            }
            .into());
        }

        let tag = self.new_tag();
        let previous_schema = datasets.get(path).and_then(|r| r.schema.clone());
        datasets.insert(
            path.to_string(),
            DatasetRecord {
                path: path.to_string(),
                tag: tag.clone(),
                schema: state.schema.clone().or(previous_schema),
                snapshot_id: Some(state.snapshot_id),
                metadata_location: Some(state.metadata_location.clone()),
                stats: state.stats.clone(),
            },
        );

        debug!(dataset = %path, tag = %tag, snapshot_id = state.snapshot_id, "Dataset updated");
        Ok(tag)
    }

    fn name(&self) -> &str {
        "memory"
    }
}
