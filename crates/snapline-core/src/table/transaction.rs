//! Commit transaction state machine.
//!
//! ```text
//! Initial -> Accumulating -> Validating -> Committing -> Published
//!                                 |
//!                                 +-> Skipped
//! Failed is reachable from every state.
//! ```
//!
//! `commit()` runs the two phases back to back: `perform_updates()` detects
//! conflicts and writes manifests, the manifest list, partition statistics
//! and the next metadata file content; `end_transaction()` publishes that
//! metadata with a create-if-absent swap. A lost swap sends the transaction
//! back to conflict detection against the new current snapshot.

use super::conflict::{ConflictDetector, ConflictPolicies, Decision, InterveningCommit};
use super::schema_reconciler::SchemaReconciler;
use super::storage::TableStore;
use crate::config::Config;
use crate::model::{
    ChangeSet, CommitKind, DataFile, DeleteTarget, EntryStatus, Manifest, ManifestEntry,
    ManifestFile, ManifestList, PartitionSpecUpdate, PartitionStats, Schema, Snapshot,
    SnapshotSummary, TableMetadata,
};
use crate::{CommitError, Error, Result};
use chrono::Utc;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Commit transaction lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    /// Created, no base bound
    Initial,
    /// Base bound, accepting changes
    Accumulating,
    /// Changes frozen, conflict detection pending
    Validating,
    /// New metadata prepared, publish pending
    Committing,
    /// New snapshot published
    Published,
    /// Nothing was written
    Skipped,
    /// Terminal failure
    Failed,
}

impl fmt::Display for TransactionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TransactionState::Initial => "initial",
            TransactionState::Accumulating => "accumulating",
            TransactionState::Validating => "validating",
            TransactionState::Committing => "committing",
            TransactionState::Published => "published",
            TransactionState::Skipped => "skipped",
            TransactionState::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Result of a commit.
#[derive(Debug, Clone, PartialEq)]
pub enum CommitOutcome {
    /// A new snapshot was published
    Committed(Snapshot),
    /// The change set was already applied by an earlier commit
    Skipped {
        /// Snapshot that already contains the change set
        applied_in: i64,
        /// Current snapshot of the table
        current: Option<i64>,
    },
    /// The change set was empty
    NothingToCommit,
}

impl CommitOutcome {
    /// Whether a new snapshot was published.
    pub fn is_table_updated(&self) -> bool {
        matches!(self, CommitOutcome::Committed(_))
    }

    /// The new snapshot, if one was published.
    pub fn snapshot(&self) -> Option<&Snapshot> {
        match self {
            CommitOutcome::Committed(snapshot) => Some(snapshot),
            _ => None,
        }
    }
}

/// Commit retry and conflict settings.
#[derive(Debug, Clone)]
pub struct CommitOptions {
    /// Retries after a lost metadata swap
    pub max_cas_retries: u32,
    /// Base delay for exponential backoff (milliseconds)
    pub base_delay_ms: u64,
    /// Maximum delay for exponential backoff (milliseconds)
    pub max_delay_ms: u64,
    /// Commit kind to conflict policy mapping
    pub policies: ConflictPolicies,
}

impl Default for CommitOptions {
    fn default() -> Self {
        Self {
            max_cas_retries: 1,
            base_delay_ms: 50,
            max_delay_ms: 2000,
            policies: ConflictPolicies::default(),
        }
    }
}

impl From<&Config> for CommitOptions {
    fn from(config: &Config) -> Self {
        Self {
            max_cas_retries: config.commit.max_cas_retries,
            base_delay_ms: config.commit.retry_base_delay_ms,
            max_delay_ms: config.commit.retry_max_delay_ms,
            policies: config.conflict.clone(),
        }
    }
}

/// Everything `end_transaction()` needs to publish.
#[derive(Debug, Clone)]
struct PreparedCommit {
    metadata: TableMetadata,
    snapshot: Snapshot,
    written_files: Vec<String>,
}

/// Result of preparing against one metadata version.
enum Prepared {
    Ready(PreparedCommit),
    Finished(CommitOutcome),
}

/// A single commit of a change set against a base snapshot.
pub struct CommitTransaction {
    store: TableStore,
    kind: CommitKind,
    options: CommitOptions,
    detector: ConflictDetector,
    state: TransactionState,
    base_snapshot_id: Option<i64>,
    changes: ChangeSet,
    prepared: Option<PreparedCommit>,
    outcome: Option<CommitOutcome>,
    attempts: u32,
    missing_deletes: usize,
    published_version: Option<u64>,
}

impl CommitTransaction {
    /// Create a transaction in the `Initial` state.
    pub fn new(store: TableStore, kind: CommitKind, options: CommitOptions) -> Self {
        let detector = ConflictDetector::new(options.policies.clone());
        Self {
            store,
            kind,
            options,
            detector,
            state: TransactionState::Initial,
            base_snapshot_id: None,
            changes: ChangeSet::new(),
            prepared: None,
            outcome: None,
            attempts: 0,
            missing_deletes: 0,
            published_version: None,
        }
    }

    /// Bind the base snapshot. No storage access.
    pub fn begin(&mut self, base_snapshot_id: Option<i64>) -> Result<()> {
        self.expect_state(TransactionState::Initial, "begin")?;
        self.base_snapshot_id = base_snapshot_id;
        self.state = TransactionState::Accumulating;
        debug!(base = ?base_snapshot_id, kind = %self.kind, "Transaction begun");
        Ok(())
    }

    /// Bind the table's current snapshot as the base.
    pub async fn begin_at_current(&mut self) -> Result<Option<i64>> {
        self.expect_state(TransactionState::Initial, "begin")?;
        let base = self.store.load_metadata().await?.current_snapshot_id;
        self.begin(base)?;
        Ok(base)
    }

    /// Merge an upstream manifest into the change set.
    pub fn consume(&mut self, manifest: Manifest) -> Result<()> {
        self.expect_state(TransactionState::Accumulating, "consume")?;
        self.changes.merge(manifest)
    }

    /// Queue a logical delete.
    pub fn consume_delete(&mut self, target: impl Into<DeleteTarget>) -> Result<()> {
        self.expect_state(TransactionState::Accumulating, "consume_delete")?;
        self.changes.delete(target)
    }

    /// Add a single data file.
    pub fn consume_file(&mut self, file: DataFile) -> Result<()> {
        self.expect_state(TransactionState::Accumulating, "consume_file")?;
        self.changes.add(file)
    }

    /// Record the schema observed upstream.
    pub fn set_schema(&mut self, schema: Schema) -> Result<()> {
        self.expect_state(TransactionState::Accumulating, "set_schema")?;
        self.changes.set_schema(schema);
        Ok(())
    }

    /// Queue a partition spec edit.
    pub fn update_partition_spec(&mut self, update: PartitionSpecUpdate) -> Result<()> {
        self.expect_state(TransactionState::Accumulating, "update_partition_spec")?;
        self.changes.update_partition_spec(update);
        Ok(())
    }

    /// Commit the accumulated changes.
    ///
    /// A lost metadata swap is retried from conflict detection up to
    /// `max_cas_retries` times.
    pub async fn commit(&mut self) -> Result<CommitOutcome> {
        self.begin_transaction()?;

        loop {
            if let Some(outcome) = self.perform_updates().await? {
                return Ok(outcome);
            }

            match self.end_transaction().await {
                Ok(outcome) => return Ok(outcome),
                Err(Error::Commit(CommitError::CasConflict { expected, actual }))
                    if self.attempts <= self.options.max_cas_retries =>
                {
                    let delay = self.calculate_backoff(self.attempts);
                    debug!(
                        expected = expected,
                        actual = actual,
                        retry = self.attempts,
                        delay_ms = delay.as_millis() as u64,
                        "Lost metadata swap, retrying from conflict detection"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(Error::Commit(CommitError::CasConflict { expected, actual })) => {
                    warn!(
                        expected = expected,
                        actual = actual,
                        attempts = self.attempts,
                        "Lost metadata swap: max retries exceeded"
                    );
                    self.state = TransactionState::Failed;
                    return Err(CommitError::RetriesExhausted {
                        attempts: self.attempts,
                        base: self.base_snapshot_id,
                    }
                    .into());
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Freeze the change set.
    pub fn begin_transaction(&mut self) -> Result<()> {
        self.expect_state(TransactionState::Accumulating, "begin_transaction")?;
        self.state = TransactionState::Validating;
        Ok(())
    }

    /// Detect conflicts and write every file of the new snapshot except the
    /// metadata file.
    ///
    /// Returns `Some(outcome)` when the transaction finished without needing
    /// a publish (skipped or nothing to commit).
    pub async fn perform_updates(&mut self) -> Result<Option<CommitOutcome>> {
        self.expect_state(TransactionState::Validating, "perform_updates")?;
        self.attempts += 1;

        let result = match self.store.load_metadata().await {
            Ok(metadata) => self.prepare(&metadata).await,
            Err(e) => Err(e),
        };

        match result {
            Ok(Prepared::Ready(prepared)) => {
                self.prepared = Some(prepared);
                self.state = TransactionState::Committing;
                Ok(None)
            }
            Ok(Prepared::Finished(outcome)) => {
                self.state = TransactionState::Skipped;
                self.outcome = Some(outcome.clone());
                Ok(Some(outcome))
            }
            Err(e) => {
                self.state = TransactionState::Failed;
                Err(e)
            }
        }
    }

    /// Publish the prepared metadata.
    ///
    /// On a lost swap the prepared files are removed, the transaction returns
    /// to `Validating` and [`CommitError::CasConflict`] is returned.
    pub async fn end_transaction(&mut self) -> Result<CommitOutcome> {
        self.expect_state(TransactionState::Committing, "end_transaction")?;
        let Some(prepared) = self.prepared.take() else {
            return Err(self.invalid_state("end_transaction"));
        };

        match self.store.publish_metadata(&prepared.metadata).await {
            Ok(()) => {
                info!(
                    snapshot_id = prepared.snapshot.snapshot_id,
                    parent = ?prepared.snapshot.parent_snapshot_id,
                    kind = %self.kind,
                    added_files = prepared.snapshot.summary.added_files,
                    deleted_files = prepared.snapshot.summary.deleted_files,
                    metadata_version = prepared.metadata.metadata_version,
                    attempts = self.attempts,
                    "Snapshot published"
                );
                self.published_version = Some(prepared.metadata.metadata_version);
                let outcome = CommitOutcome::Committed(prepared.snapshot);
                self.state = TransactionState::Published;
                self.outcome = Some(outcome.clone());
                Ok(outcome)
            }
            Err(e @ Error::Commit(CommitError::CasConflict { .. })) => {
                self.discard(&prepared.written_files).await;
                self.state = TransactionState::Validating;
                Err(e)
            }
            Err(e) => {
                self.discard(&prepared.written_files).await;
                self.state = TransactionState::Failed;
                Err(e)
            }
        }
    }

    /// Whether a new snapshot was published.
    pub fn is_table_updated(&self) -> bool {
        self.state == TransactionState::Published
    }

    /// Metadata version swapped in by a successful publish.
    pub fn published_version(&self) -> Option<u64> {
        self.published_version
    }

    /// Current state.
    pub fn state(&self) -> TransactionState {
        self.state
    }

    /// Commit kind.
    pub fn kind(&self) -> CommitKind {
        self.kind
    }

    /// Base snapshot.
    pub fn base_snapshot_id(&self) -> Option<i64> {
        self.base_snapshot_id
    }

    /// Accumulated changes.
    pub fn changes(&self) -> &ChangeSet {
        &self.changes
    }

    /// Final outcome, once finished.
    pub fn outcome(&self) -> Option<&CommitOutcome> {
        self.outcome.as_ref()
    }

    /// Number of prepare attempts so far.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Deletes in the last attempt whose path was not live in the table.
    pub fn missing_deletes(&self) -> usize {
        self.missing_deletes
    }

    // ===== Preparation =====

    async fn prepare(&mut self, metadata: &TableMetadata) -> Result<Prepared> {
        if self.changes.is_empty() {
            debug!("Change set is empty, nothing to commit");
            return Ok(Prepared::Finished(CommitOutcome::NothingToCommit));
        }

        let base = self.base_snapshot_id;
        let current = metadata.current_snapshot_id;
        let intervening = self.load_intervening(metadata).await?;

        let decision = self.detector.classify(
            base,
            current,
            &self.changes,
            self.kind,
            intervening.as_deref(),
        );

        match decision {
            Decision::Proceed => {}
            Decision::Skip { applied_in } => {
                info!(
                    base = ?base,
                    current = ?current,
                    applied_in = applied_in,
                    kind = %self.kind,
                    "Change set already applied, skipping"
                );
                return Ok(Prepared::Finished(CommitOutcome::Skipped {
                    applied_in,
                    current,
                }));
            }
            Decision::Reject {
                reason,
                conflicting_paths,
            } => {
                warn!(
                    base = ?base,
                    current = ?current,
                    kind = %self.kind,
                    conflicting = conflicting_paths.len(),
                    reason = %reason,
                    "Change set rejected"
                );
                return Err(match (intervening, base) {
                    (None, Some(base)) => CommitError::BaseSnapshotNotInHistory(base),
                    _ => CommitError::ConcurrentModification {
                        base,
                        current,
                        conflicting_paths,
                        reason,
                    },
                }
                .into());
            }
        }

        self.build_snapshot(metadata).await
    }

    /// Commits after the base snapshot, newest first.
    ///
    /// `None` when the base is not an ancestor of the current snapshot.
    async fn load_intervening(
        &self,
        metadata: &TableMetadata,
    ) -> Result<Option<Vec<InterveningCommit>>> {
        let base = self.base_snapshot_id;
        if base == metadata.current_snapshot_id {
            return Ok(Some(Vec::new()));
        }

        let mut commits = Vec::new();
        for snapshot in metadata.ancestors(metadata.current_snapshot_id) {
            if Some(snapshot.snapshot_id) == base {
                return Ok(Some(commits));
            }
            commits.push(self.load_commit_changes(snapshot).await?);
        }

        // An empty base predates every retained snapshot.
        Ok(base.is_none().then_some(commits))
    }

    async fn load_commit_changes(&self, snapshot: &Snapshot) -> Result<InterveningCommit> {
        let list = self.store.read_manifest_list(&snapshot.manifest_list).await?;
        let mut commit = InterveningCommit {
            snapshot_id: snapshot.snapshot_id,
            kind: snapshot.summary.operation,
            added_paths: BTreeSet::new(),
            deleted_paths: BTreeSet::new(),
        };

        for manifest_file in list
            .manifests
            .iter()
            .filter(|m| m.added_snapshot_id == snapshot.snapshot_id)
        {
            let manifest = self.store.read_manifest(&manifest_file.path).await?;
            for entry in &manifest.entries {
                if entry.snapshot_id != Some(snapshot.snapshot_id) {
                    continue;
                }
                match entry.status {
                    EntryStatus::Added => {
                        commit.added_paths.insert(entry.file.path.clone());
                    }
                    EntryStatus::Deleted => {
                        commit.deleted_paths.insert(entry.file.path.clone());
                    }
                    EntryStatus::Existing => {}
                }
            }
        }

        Ok(commit)
    }

    async fn build_snapshot(&mut self, metadata: &TableMetadata) -> Result<Prepared> {
        let snapshot_id = metadata.next_snapshot_id();
        let sequence_number = metadata.next_sequence_number();

        // Schema and partition spec
        let (schema, schema_changed) = match self.changes.schema() {
            Some(observed) => {
                let reconciled = SchemaReconciler::reconcile_with_last_id(
                    &metadata.schema,
                    observed,
                    metadata.last_column_id,
                )?;
                (reconciled.schema, reconciled.changed)
            }
            None => (metadata.schema.clone(), false),
        };
        let evolved = SchemaReconciler::evolve_partition_spec(
            &metadata.partition_spec,
            &schema,
            self.changes.partition_updates(),
        )?;

        // Index delete targets by path
        let mut targets: BTreeMap<&str, Vec<&DeleteTarget>> = BTreeMap::new();
        for target in self.changes.deletes() {
            targets.entry(target.path()).or_default().push(target);
        }

        let current_manifests = match metadata.current_snapshot() {
            Some(snapshot) => {
                self.store
                    .read_manifest_list(&snapshot.manifest_list)
                    .await?
                    .manifests
            }
            None => Vec::new(),
        };

        let mut written_files = Vec::new();
        let result = self
            .write_snapshot_files(
                metadata,
                snapshot_id,
                sequence_number,
                current_manifests,
                &targets,
                &mut written_files,
            )
            .await;

        let (manifests, live_files, removed, added, missing) = match result {
            Ok(parts) => parts,
            Err(e) => {
                self.discard(&written_files).await;
                return Err(e);
            }
        };
        self.missing_deletes = missing;

        if added.is_empty() && removed.is_empty() && !schema_changed && !evolved.changed {
            self.discard(&written_files).await;
            debug!("No effective changes, nothing to commit");
            return Ok(Prepared::Finished(CommitOutcome::NothingToCommit));
        }

        let finish = async {
            let list = ManifestList {
                snapshot_id,
                parent_snapshot_id: metadata.current_snapshot_id,
                manifests,
            };
            let list_path = self.store.write_manifest_list(&list).await?;
            written_files.push(list_path.clone());

            let stats = PartitionStats::collect(snapshot_id, &live_files);
            let stats_path = self.store.write_partition_stats(&stats).await?;
            written_files.push(stats_path.clone());

            let summary = SnapshotSummary {
                operation: self.kind,
                added_files: added.len() as u64,
                deleted_files: removed.len() as u64,
                added_records: added.iter().map(|f| f.record_count).sum(),
                deleted_records: removed.iter().map(|f| f.record_count).sum(),
                total_files: stats.total_files(),
                total_records: stats.total_records(),
            };

            Ok::<_, Error>(Snapshot {
                snapshot_id,
                parent_snapshot_id: metadata.current_snapshot_id,
                sequence_number,
                timestamp: Utc::now(),
                manifest_list: list_path,
                partition_stats: Some(stats_path),
                schema_id: schema.schema_id,
                summary,
            })
        }
        .await;

        let snapshot = match finish {
            Ok(snapshot) => snapshot,
            Err(e) => {
                self.discard(&written_files).await;
                return Err(e);
            }
        };

        let next = metadata.with_snapshot(
            snapshot.clone(),
            schema_changed.then_some(schema),
            evolved.changed.then_some(evolved.spec),
        );

        debug!(
            snapshot_id = snapshot_id,
            files_written = written_files.len(),
            missing_deletes = missing,
            "Prepared snapshot"
        );

        Ok(Prepared::Ready(PreparedCommit {
            metadata: next,
            snapshot,
            written_files,
        }))
    }

    /// Rewrite manifests touched by deletes and write the manifest of added
    /// files.
    ///
    /// Returns the manifest list entries, the live files of the new
    /// snapshot, removed files, added files and the number of deletes that
    /// matched nothing.
    #[allow(clippy::type_complexity)]
    async fn write_snapshot_files(
        &self,
        metadata: &TableMetadata,
        snapshot_id: i64,
        sequence_number: i64,
        current_manifests: Vec<ManifestFile>,
        targets: &BTreeMap<&str, Vec<&DeleteTarget>>,
        written_files: &mut Vec<String>,
    ) -> Result<(
        Vec<ManifestFile>,
        Vec<DataFile>,
        Vec<DataFile>,
        Vec<DataFile>,
        usize,
    )> {
        let mut manifests = Vec::new();
        let mut live_files = Vec::new();
        let mut removed = Vec::new();
        let mut matched: BTreeSet<String> = BTreeSet::new();

        for manifest_file in current_manifests {
            if manifest_file.live_files_count() == 0 {
                continue;
            }
            let manifest = self.store.read_manifest(&manifest_file.path).await?;
            let touched = manifest
                .live_entries()
                .any(|e| targets.contains_key(e.file.path.as_str()));

            if !touched {
                live_files.extend(manifest.live_entries().map(|e| e.file.clone()));
                manifests.push(manifest_file);
                continue;
            }

            let mut rewritten = Manifest::new(Some(snapshot_id), sequence_number);
            for entry in manifest.entries.into_iter().filter(|e| e.is_live()) {
                match targets.get(entry.file.path.as_str()) {
                    Some(requested) => {
                        for target in requested {
                            target.check_against(&entry.file)?;
                        }
                        matched.insert(entry.file.path.clone());
                        removed.push(entry.file.clone());
                        rewritten.push(ManifestEntry {
                            status: EntryStatus::Deleted,
                            snapshot_id: Some(snapshot_id),
                            sequence_number: entry.sequence_number,
                            file: entry.file,
                        });
                    }
                    None => {
                        live_files.push(entry.file.clone());
                        rewritten.push(ManifestEntry {
                            status: EntryStatus::Existing,
                            ..entry
                        });
                    }
                }
            }

            let path = self
                .store
                .write_manifest(snapshot_id, manifests.len(), &rewritten)
                .await?;
            written_files.push(path.clone());
            debug!(
                original = %manifest_file.path,
                rewritten = %path,
                "Rewrote manifest with deleted entries"
            );
            manifests.push(ManifestFile::describe(path, &rewritten, snapshot_id));
        }

        let cancelled = self.changes.cancelled_paths();
        let mut missing = 0;
        for path in targets.keys() {
            if matched.contains(*path) {
                continue;
            }
            if cancelled.contains(path) {
                debug!(path = %path, "Delete cancels an add in the same change set");
            } else {
                warn!(
                    path = %path,
                    current = ?metadata.current_snapshot_id,
                    "Delete target is not live in the table, ignoring"
                );
                missing += 1;
            }
        }

        // A path is live at most once. Re-adding an identical live file is a
        // no-op; re-adding the path with different metadata is rejected.
        let live_by_path: BTreeMap<&str, &DataFile> =
            live_files.iter().map(|f| (f.path.as_str(), f)).collect();
        let mut added: Vec<DataFile> = Vec::new();
        for file in self.changes.effective_adds() {
            match live_by_path.get(file.path.as_str()) {
                Some(live) if *live == file => {
                    debug!(path = %file.path, "File already live, not re-adding");
                }
                Some(_) => {
                    return Err(CommitError::InvalidChange(format!(
                        "{} is already live with different metadata",
                        file.path
                    ))
                    .into());
                }
                None => added.push(file.clone()),
            }
        }

        if !added.is_empty() {
            let mut manifest = Manifest::new(Some(snapshot_id), sequence_number);
            for file in &added {
                manifest.add(file.clone());
            }
            let path = self
                .store
                .write_manifest(snapshot_id, manifests.len(), &manifest)
                .await?;
            written_files.push(path.clone());
            live_files.extend(added.iter().cloned());
            manifests.push(ManifestFile::describe(path, &manifest, snapshot_id));
        }

        Ok((manifests, live_files, removed, added, missing))
    }

    /// Best-effort removal of files written by an attempt that will never
    /// be published.
    async fn discard(&self, files: &[String]) {
        for path in files {
            if let Err(e) = self.store.delete(path).await {
                debug!(path = %path, error = %e, "Failed to remove unpublished file");
            }
        }
    }

    fn calculate_backoff(&self, retry: u32) -> Duration {
        let delay_ms = self.options.base_delay_ms * 2_u64.pow(retry.saturating_sub(1));
        Duration::from_millis(delay_ms.min(self.options.max_delay_ms))
    }

    fn expect_state(&self, expected: TransactionState, operation: &str) -> Result<()> {
        if self.state == expected {
            Ok(())
        } else {
            Err(self.invalid_state(operation))
        }
    }

    fn invalid_state(&self, operation: &str) -> Error {
        CommitError::InvalidState {
            state: self.state.to_string(),
            operation: operation.to_string(),
        }
        .into()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Field, PartitionSpec, PrimitiveType, Transform};
    use crate::ErrorKind;

    async fn new_table() -> TableStore {
        let store = TableStore::open("memory://tx").unwrap();
        let metadata = TableMetadata::new(
            "memory://tx",
            Schema::new(
                0,
                vec![
                    Field::required(1, "id", PrimitiveType::Long),
                    Field::optional(2, "region", PrimitiveType::String),
                ],
            ),
            PartitionSpec::unpartitioned(),
            BTreeMap::new(),
        );
        store.create_table(&metadata).await.unwrap();
        store
    }

    fn file(path: &str) -> DataFile {
        DataFile::new(path, 100, 10)
    }

    async fn commit_files(
        store: &TableStore,
        base: Option<i64>,
        kind: CommitKind,
        paths: &[&str],
    ) -> Result<CommitOutcome> {
        let mut tx = CommitTransaction::new(store.clone(), kind, CommitOptions::default());
        tx.begin(base)?;
        let mut manifest = Manifest::new(base, 0);
        for path in paths {
            manifest.add(file(path));
        }
        tx.consume(manifest)?;
        tx.commit().await
    }

    async fn live_paths(store: &TableStore) -> BTreeSet<String> {
        let metadata = store.load_metadata().await.unwrap();
        let Some(snapshot) = metadata.current_snapshot() else {
            return BTreeSet::new();
        };
        let list = store.read_manifest_list(&snapshot.manifest_list).await.unwrap();
        let mut paths = BTreeSet::new();
        for mf in list.manifests {
            let manifest = store.read_manifest(&mf.path).await.unwrap();
            paths.extend(manifest.live_entries().map(|e| e.file.path.clone()));
        }
        paths
    }

    #[tokio::test]
    async fn test_first_commit_creates_snapshot() {
        let store = new_table().await;
        let outcome = commit_files(&store, None, CommitKind::IncrementalRefresh, &["f1", "f2"])
            .await
            .unwrap();

        let snapshot = outcome.snapshot().unwrap();
        assert_eq!(snapshot.snapshot_id, 1);
        assert_eq!(snapshot.parent_snapshot_id, None);
        assert_eq!(snapshot.summary.added_files, 2);
        assert_eq!(snapshot.summary.total_records, 20);
        assert!(snapshot.partition_stats.is_some());
        assert_eq!(live_paths(&store).await.len(), 2);
    }

    #[tokio::test]
    async fn test_state_transitions() {
        let store = new_table().await;
        let mut tx =
            CommitTransaction::new(store.clone(), CommitKind::Dml, CommitOptions::default());
        assert_eq!(tx.state(), TransactionState::Initial);
        assert!(tx.consume_file(file("f1")).is_err());

        tx.begin(None).unwrap();
        assert_eq!(tx.state(), TransactionState::Accumulating);
        tx.consume_file(file("f1")).unwrap();

        tx.begin_transaction().unwrap();
        assert!(tx.perform_updates().await.unwrap().is_none());
        assert_eq!(tx.state(), TransactionState::Committing);
        assert!(!tx.is_table_updated());

        // Prepared but unpublished: the table is unchanged.
        assert_eq!(store.load_metadata().await.unwrap().current_snapshot_id, None);

        let outcome = tx.end_transaction().await.unwrap();
        assert!(outcome.is_table_updated());
        assert!(tx.is_table_updated());
        assert_eq!(tx.state(), TransactionState::Published);

        let err = tx.consume_file(file("f2")).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
    }

    #[tokio::test]
    async fn test_empty_change_set_is_nothing_to_commit() {
        let store = new_table().await;
        let mut tx = CommitTransaction::new(
            store.clone(),
            CommitKind::IncrementalRefresh,
            CommitOptions::default(),
        );
        tx.begin(None).unwrap();
        let outcome = tx.commit().await.unwrap();
        assert_eq!(outcome, CommitOutcome::NothingToCommit);
        assert!(!tx.is_table_updated());
        assert_eq!(store.current_version().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_identical_schema_is_nothing_to_commit() {
        let store = new_table().await;
        let schema = store.load_metadata().await.unwrap().schema;
        let mut tx =
            CommitTransaction::new(store.clone(), CommitKind::FullRefresh, CommitOptions::default());
        tx.begin(None).unwrap();
        tx.set_schema(schema).unwrap();
        assert_eq!(tx.commit().await.unwrap(), CommitOutcome::NothingToCommit);
    }

    #[tokio::test]
    async fn test_repeat_commit_skips_without_writes() {
        let store = new_table().await;
        commit_files(&store, None, CommitKind::IncrementalRefresh, &["f1", "f2"])
            .await
            .unwrap();
        let files_before = store.list(None).await.unwrap().len();

        let outcome = commit_files(&store, None, CommitKind::IncrementalRefresh, &["f1", "f2"])
            .await
            .unwrap();
        assert_eq!(
            outcome,
            CommitOutcome::Skipped {
                applied_in: 1,
                current: Some(1)
            }
        );
        assert!(!outcome.is_table_updated());
        assert_eq!(store.list(None).await.unwrap().len(), files_before);
    }

    #[tokio::test]
    async fn test_delete_rewrites_manifest() {
        let store = new_table().await;
        commit_files(&store, None, CommitKind::IncrementalRefresh, &["f1", "f2", "f3"])
            .await
            .unwrap();

        let mut tx = CommitTransaction::new(store.clone(), CommitKind::Dml, CommitOptions::default());
        tx.begin(Some(1)).unwrap();
        tx.consume_delete(file("f2")).unwrap();
        tx.consume_delete("missing.parquet").unwrap();
        let outcome = tx.commit().await.unwrap();

        let snapshot = outcome.snapshot().unwrap();
        assert_eq!(snapshot.summary.deleted_files, 1);
        assert_eq!(snapshot.summary.total_files, 2);
        assert_eq!(tx.missing_deletes(), 1);

        let list = store.read_manifest_list(&snapshot.manifest_list).await.unwrap();
        assert_eq!(list.manifests.len(), 1);
        let summary = &list.manifests[0];
        assert_eq!(summary.existing_files_count, 2);
        assert_eq!(summary.deleted_files_count, 1);
        assert_eq!(summary.added_files_count, 0);

        let live: Vec<_> = live_paths(&store).await.into_iter().collect();
        assert_eq!(live, vec!["f1".to_string(), "f3".to_string()]);
    }

    #[tokio::test]
    async fn test_readding_live_file_keeps_single_entry() {
        let store = new_table().await;
        commit_files(&store, None, CommitKind::IncrementalRefresh, &["f1"])
            .await
            .unwrap();

        // Same base as current: nothing new to publish.
        let outcome = commit_files(&store, Some(1), CommitKind::IncrementalRefresh, &["f1"])
            .await
            .unwrap();
        assert_eq!(outcome, CommitOutcome::NothingToCommit);
        assert_eq!(store.load_metadata().await.unwrap().snapshots.len(), 1);

        // Only the new file is added alongside the already live one.
        let outcome = commit_files(&store, Some(1), CommitKind::Dml, &["f1", "f2"])
            .await
            .unwrap();
        let snapshot = outcome.snapshot().unwrap();
        assert_eq!(snapshot.summary.added_files, 1);
        assert_eq!(snapshot.summary.total_files, 2);
        assert_eq!(snapshot.summary.total_records, 20);

        let mut tx = CommitTransaction::new(store.clone(), CommitKind::Dml, CommitOptions::default());
        tx.begin(Some(2)).unwrap();
        tx.consume_delete("f1").unwrap();
        let snapshot = tx.commit().await.unwrap().snapshot().cloned().unwrap();
        assert_eq!(snapshot.summary.deleted_files, 1);
        assert_eq!(snapshot.summary.total_files, 1);
        let live: Vec<_> = live_paths(&store).await.into_iter().collect();
        assert_eq!(live, vec!["f2".to_string()]);
    }

    #[tokio::test]
    async fn test_readding_live_path_with_other_metadata_rejected() {
        let store = new_table().await;
        commit_files(&store, None, CommitKind::IncrementalRefresh, &["f1"])
            .await
            .unwrap();

        let mut tx = CommitTransaction::new(store.clone(), CommitKind::Dml, CommitOptions::default());
        tx.begin(Some(1)).unwrap();
        tx.consume_file(DataFile::new("f1", 999, 99)).unwrap();
        let err = tx.commit().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
        assert_eq!(store.load_metadata().await.unwrap().snapshots.len(), 1);
    }

    #[tokio::test]
    async fn test_full_metadata_delete_mismatch_is_validation() {
        let store = new_table().await;
        commit_files(&store, None, CommitKind::IncrementalRefresh, &["f1"])
            .await
            .unwrap();

        let mut tx = CommitTransaction::new(store.clone(), CommitKind::Dml, CommitOptions::default());
        tx.begin(Some(1)).unwrap();
        tx.consume_delete(DataFile::new("f1", 999, 10)).unwrap();
        let err = tx.commit().await.unwrap_err();

        assert!(err.is_validation());
        assert_eq!(tx.state(), TransactionState::Failed);
        // Nothing half-written is left behind.
        assert_eq!(store.current_version().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_stale_base_with_overlap_is_rejected() {
        let store = new_table().await;
        commit_files(&store, None, CommitKind::Dml, &["f1"]).await.unwrap();

        let err = commit_files(&store, None, CommitKind::Dml, &["f1"])
            .await
            .unwrap_err();
        assert!(err.is_concurrent_modification());
        assert!(err.to_string().contains("f1"));
    }

    #[tokio::test]
    async fn test_unknown_base_is_rejected() {
        let store = new_table().await;
        commit_files(&store, None, CommitKind::Dml, &["f1"]).await.unwrap();

        let err = commit_files(&store, Some(77), CommitKind::Dml, &["f2"])
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            Error::Commit(CommitError::BaseSnapshotNotInHistory(77))
        ));
    }

    #[tokio::test]
    async fn test_lost_swap_retries_from_conflict_detection() {
        let store = new_table().await;

        let mut tx = CommitTransaction::new(
            store.clone(),
            CommitKind::IncrementalRefresh,
            CommitOptions::default(),
        );
        tx.begin(None).unwrap();
        tx.consume_file(file("b1")).unwrap();
        tx.begin_transaction().unwrap();
        assert!(tx.perform_updates().await.unwrap().is_none());

        // Another writer wins version 2 while this one is prepared.
        commit_files(&store, None, CommitKind::IncrementalRefresh, &["a1"])
            .await
            .unwrap();

        let err = tx.end_transaction().await.unwrap_err();
        assert!(err.is_concurrent_modification());
        assert_eq!(tx.state(), TransactionState::Validating);

        assert!(tx.perform_updates().await.unwrap().is_none());
        let outcome = tx.end_transaction().await.unwrap();
        assert_eq!(outcome.snapshot().unwrap().parent_snapshot_id, Some(1));

        let live: Vec<_> = live_paths(&store).await.into_iter().collect();
        assert_eq!(live, vec!["a1".to_string(), "b1".to_string()]);
    }

    #[tokio::test]
    async fn test_schema_and_partition_changes_are_published() {
        let store = new_table().await;
        let mut tx = CommitTransaction::new(
            store.clone(),
            CommitKind::FullRefresh,
            CommitOptions::default(),
        );
        tx.begin(None).unwrap();
        tx.set_schema(Schema::new(
            0,
            vec![
                Field::required(1, "id", PrimitiveType::Long),
                Field::optional(2, "region", PrimitiveType::String),
                Field::optional(9, "ts", PrimitiveType::Timestamp),
            ],
        ))
        .unwrap();
        tx.update_partition_spec(PartitionSpecUpdate::AddField {
            source_name: "ts".into(),
            name: None,
            transform: Transform::Day,
        })
        .unwrap();
        let outcome = tx.commit().await.unwrap();
        assert!(outcome.is_table_updated());

        let metadata = store.load_metadata().await.unwrap();
        assert_eq!(metadata.schema.schema_id, 1);
        assert_eq!(metadata.schema.fields[2].id, 3);
        assert_eq!(metadata.last_column_id, 3);
        assert_eq!(metadata.partition_spec.fields[0].name, "ts_day");
        assert_eq!(outcome.snapshot().unwrap().schema_id, 1);
    }

    #[tokio::test]
    async fn test_partition_edit_error_fails_transaction() {
        let store = new_table().await;
        let mut tx = CommitTransaction::new(
            store.clone(),
            CommitKind::FullRefresh,
            CommitOptions::default(),
        );
        tx.begin(None).unwrap();
        tx.update_partition_spec(PartitionSpecUpdate::ReplaceTransform {
            name: "never".into(),
            transform: Transform::Hour,
        })
        .unwrap();
        let err = tx.commit().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UnsupportedOperation);
        assert_eq!(tx.state(), TransactionState::Failed);
    }
}
