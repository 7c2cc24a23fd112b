//! Per-attempt accumulator of file-level changes.

use super::data_file::{DataFile, DeleteTarget, FileIdentity};
use super::manifest::{EntryStatus, Manifest};
use super::partition::PartitionSpecUpdate;
use super::schema::Schema;
use crate::Result;
use std::collections::{BTreeSet, HashSet};

/// Pending adds, deletes and structural edits for one commit attempt.
///
/// A file that is both added and deleted in the same change set resolves as
/// deleted.
#[derive(Debug, Clone, Default)]
pub struct ChangeSet {
    adds: Vec<DataFile>,
    add_ids: HashSet<FileIdentity>,
    deletes: Vec<DeleteTarget>,
    schema: Option<Schema>,
    partition_updates: Vec<PartitionSpecUpdate>,
    manifests_merged: usize,
}

impl ChangeSet {
    /// Create an empty change set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Merge a whole upstream manifest.
    ///
    /// The manifest is validated before any entry is applied, so a rejected
    /// manifest leaves the change set untouched.
    pub fn merge(&mut self, manifest: Manifest) -> Result<()> {
        manifest.validate_upstream()?;
        for entry in manifest.entries {
            match entry.status {
                EntryStatus::Added => self.push_add(entry.file),
                EntryStatus::Deleted => self.deletes.push(DeleteTarget::File(entry.file)),
                EntryStatus::Existing => {}
            }
        }
        self.manifests_merged += 1;
        Ok(())
    }

    /// Add a single data file.
    pub fn add(&mut self, file: DataFile) -> Result<()> {
        file.validate()?;
        self.push_add(file);
        Ok(())
    }

    /// Queue a logical delete.
    pub fn delete(&mut self, target: impl Into<DeleteTarget>) -> Result<()> {
        let target = target.into();
        target.validate()?;
        self.deletes.push(target);
        Ok(())
    }

    /// Record the schema observed by the upstream producer.
    pub fn set_schema(&mut self, schema: Schema) {
        self.schema = Some(schema);
    }

    /// Queue a partition spec edit.
    pub fn update_partition_spec(&mut self, update: PartitionSpecUpdate) {
        self.partition_updates.push(update);
    }

    fn push_add(&mut self, file: DataFile) {
        if self.add_ids.insert(file.identity()) {
            self.adds.push(file);
        }
    }

    /// Files to add after delete-wins resolution, in insertion order.
    pub fn effective_adds(&self) -> Vec<&DataFile> {
        let deleted = self.delete_paths();
        self.adds
            .iter()
            .filter(|f| !deleted.contains(f.path.as_str()))
            .collect()
    }

    /// Paths of files to add after delete-wins resolution.
    pub fn effective_add_paths(&self) -> BTreeSet<String> {
        self.effective_adds()
            .into_iter()
            .map(|f| f.path.clone())
            .collect()
    }

    /// Every queued delete target.
    pub fn deletes(&self) -> &[DeleteTarget] {
        &self.deletes
    }

    /// Paths of every queued delete.
    pub fn delete_paths(&self) -> BTreeSet<&str> {
        self.deletes.iter().map(|d| d.path()).collect()
    }

    /// Paths that were both added and deleted in this change set.
    pub fn cancelled_paths(&self) -> BTreeSet<&str> {
        let deleted = self.delete_paths();
        self.adds
            .iter()
            .map(|f| f.path.as_str())
            .filter(|p| deleted.contains(p))
            .collect()
    }

    /// Observed schema, if any.
    pub fn schema(&self) -> Option<&Schema> {
        self.schema.as_ref()
    }

    /// Queued partition spec edits.
    pub fn partition_updates(&self) -> &[PartitionSpecUpdate] {
        &self.partition_updates
    }

    /// Number of manifests merged so far.
    pub fn manifests_merged(&self) -> usize {
        self.manifests_merged
    }

    /// Whether there are no file changes.
    pub fn has_file_changes(&self) -> bool {
        !self.adds.is_empty() || !self.deletes.is_empty()
    }

    /// Whether there is nothing at all to commit.
    pub fn is_empty(&self) -> bool {
        !self.has_file_changes() && self.schema.is_none() && self.partition_updates.is_empty()
    }
}
