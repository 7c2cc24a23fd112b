//! Snapshot expiration.
//!
//! ## Expiration Strategy
//!
//! 1. **Partition**: walk from the current snapshot backward; a snapshot is
//!    valid when it is current, among the N most recent, or newer than the
//!    age cutoff. Snapshots off the current ancestry are judged by age alone.
//! 2. **Cap**: expire at most `max_snapshots_to_expire_per_pass`, oldest
//!    first, and defer the rest.
//! 3. **Reference sets**: files reachable from valid snapshots versus files
//!    reachable from expired ones.
//! 4. **Publish**: metadata without the expired snapshots, through the same
//!    create-if-absent swap commits use. A commit published mid-pass makes
//!    the pass recompute.
//! 5. **Delete**: orphan data files and manifests first, then manifest lists
//!    and statistics files. Per-file failures are logged and skipped.

use crate::config::RetentionConfig;
use crate::model::{Snapshot, TableMetadata};
use crate::table::TableStore;
use crate::txlog::{TransactionEntry, TransactionLog};
use crate::{CommitError, Error, Result};
use chrono::{DateTime, Utc};
use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Publish attempts before a pass gives up to concurrent commits.
const MAX_PUBLISH_ATTEMPTS: u32 = 3;

/// Which snapshots a pass keeps and which it expires.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RetentionPlan {
    /// Snapshots kept, including deferred ones
    pub valid: Vec<i64>,
    /// Snapshots to expire, oldest first
    pub expired: Vec<i64>,
    /// Expirable snapshots left for a later pass
    pub deferred: usize,
}

/// Files reachable from a set of snapshots.
#[derive(Debug, Clone, Default)]
struct ReferenceSet {
    data_files: BTreeSet<String>,
    manifests: BTreeSet<String>,
    metadata_files: BTreeSet<String>,
}

impl ReferenceSet {
    fn contains(&self, path: &str) -> bool {
        self.data_files.contains(path)
            || self.manifests.contains(path)
            || self.metadata_files.contains(path)
    }
}

/// Result of a retention pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RetentionResult {
    /// Expired snapshot ids, oldest first
    pub expired_snapshot_ids: Vec<i64>,
    /// Expirable snapshots left for a later pass
    pub deferred: usize,
    /// Snapshots retained after the pass
    pub valid_snapshot_count: usize,
    /// Files no longer referenced by any retained snapshot
    pub orphan_files: Vec<String>,
    /// Orphan files deleted
    pub files_deleted: usize,
    /// Orphan files that failed to delete
    pub failed_deletions: usize,
    /// Metadata version published by the pass
    pub metadata_version: Option<u64>,
}

impl RetentionResult {
    /// Whether the pass expired anything.
    pub fn expired_any(&self) -> bool {
        !self.expired_snapshot_ids.is_empty()
    }
}

/// Expires old snapshots and reclaims the files only they referenced.
pub struct RetentionManager {
    store: TableStore,
    config: RetentionConfig,
    txlog: Option<Arc<TransactionLog>>,
}

impl RetentionManager {
    /// Create a retention manager.
    pub fn new(store: TableStore, config: RetentionConfig) -> Self {
        Self {
            store,
            config,
            txlog: None,
        }
    }

    /// Record passes in the commit journal.
    pub fn with_txlog(mut self, txlog: Arc<TransactionLog>) -> Self {
        self.txlog = Some(txlog);
        self
    }

    /// Run a pass against the current time.
    pub async fn run(&self) -> Result<RetentionResult> {
        self.run_at(Utc::now()).await
    }

    /// Run a pass, judging snapshot age relative to `now`.
    pub async fn run_at(&self, now: DateTime<Utc>) -> Result<RetentionResult> {
        let metadata = self.store.load_metadata().await?;
        self.run_from(metadata, now).await
    }

    /// Run a pass planned from `metadata`, reloading the table after every
    /// lost publish.
    async fn run_from(
        &self,
        mut metadata: TableMetadata,
        now: DateTime<Utc>,
    ) -> Result<RetentionResult> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let config = self.config.with_table_properties(&metadata.properties);
            let plan = Self::plan(&metadata, &config, now);

            debug!(
                location = %self.store.location(),
                valid = plan.valid.len(),
                expired = plan.expired.len(),
                deferred = plan.deferred,
                "Retention plan computed"
            );

            if plan.expired.is_empty() {
                return Ok(RetentionResult {
                    deferred: plan.deferred,
                    valid_snapshot_count: plan.valid.len(),
                    ..Default::default()
                });
            }

            match self.expire(&metadata, &plan).await {
                Err(Error::Commit(CommitError::CasConflict { expected, actual }))
                    if attempt < MAX_PUBLISH_ATTEMPTS =>
                {
                    debug!(
                        expected = expected,
                        actual = actual,
                        attempt = attempt,
                        "Table changed during retention pass, recomputing"
                    );
                }
                other => return other,
            }
            metadata = self.store.load_metadata().await?;
        }
    }

    /// Partition the snapshots of `metadata` into valid and expired.
    pub fn plan(
        metadata: &TableMetadata,
        config: &RetentionConfig,
        now: DateTime<Utc>,
    ) -> RetentionPlan {
        let max_age_ms = i64::try_from(config.max_snapshot_age_ms).unwrap_or(i64::MAX);
        let is_young = |s: &Snapshot| s.age_ms(now) < max_age_ms;

        let ancestry = metadata.ancestors(metadata.current_snapshot_id);
        let on_ancestry: HashSet<i64> = ancestry.iter().map(|s| s.snapshot_id).collect();

        let mut valid = Vec::new();
        let mut expirable: Vec<&Snapshot> = Vec::new();

        for (position, snapshot) in ancestry.iter().enumerate() {
            let keep = position == 0 || position < config.min_snapshots_to_keep || is_young(snapshot);
            if keep {
                valid.push(snapshot.snapshot_id);
            } else {
                expirable.push(snapshot);
            }
        }

        for snapshot in metadata
            .snapshots
            .iter()
            .filter(|s| !on_ancestry.contains(&s.snapshot_id))
        {
            if is_young(snapshot) {
                valid.push(snapshot.snapshot_id);
            } else {
                expirable.push(snapshot);
            }
        }

        expirable.sort_by_key(|s| (s.timestamp, s.snapshot_id));
        let cap = config.max_snapshots_to_expire_per_pass;
        let deferred = expirable.len().saturating_sub(cap);
        let expired: Vec<i64> = expirable.iter().take(cap).map(|s| s.snapshot_id).collect();
        valid.extend(expirable.iter().skip(cap).map(|s| s.snapshot_id));

        RetentionPlan {
            valid,
            expired,
            deferred,
        }
    }

    async fn expire(&self, metadata: &TableMetadata, plan: &RetentionPlan) -> Result<RetentionResult> {
        // Valid references first: a missing manifest list here aborts the pass
        // before anything is published or deleted.
        let mut valid_refs = ReferenceSet::default();
        for id in &plan.valid {
            if let Some(snapshot) = metadata.snapshot(*id) {
                self.collect_references(snapshot, &mut valid_refs, true).await?;
            }
        }

        let mut expired_refs = ReferenceSet::default();
        for id in &plan.expired {
            if let Some(snapshot) = metadata.snapshot(*id) {
                self.collect_references(snapshot, &mut expired_refs, false).await?;
            }
        }

        let orphan_data: Vec<String> = expired_refs
            .data_files
            .iter()
            .chain(expired_refs.manifests.iter())
            .filter(|p| !valid_refs.contains(p))
            .cloned()
            .collect();
        let orphan_metadata: Vec<String> = expired_refs
            .metadata_files
            .iter()
            .filter(|p| !valid_refs.contains(p))
            .cloned()
            .collect();

        let expired_set: HashSet<i64> = plan.expired.iter().copied().collect();
        let next = metadata.without_snapshots(&expired_set);
        self.store.publish_metadata(&next).await?;

        info!(
            location = %self.store.location(),
            expired = plan.expired.len(),
            deferred = plan.deferred,
            valid = plan.valid.len(),
            metadata_version = next.metadata_version,
            "Published metadata without expired snapshots"
        );

        let mut files_deleted = 0;
        let mut failed_deletions = 0;
        for path in orphan_data.iter().chain(orphan_metadata.iter()) {
            match self.store.delete(path).await {
                Ok(()) => {
                    files_deleted += 1;
                    debug!(path = %path, "Deleted orphan file");
                }
                Err(Error::NotFound(_)) => {
                    debug!(path = %path, "Orphan file already gone");
                }
                Err(e) => {
                    failed_deletions += 1;
                    warn!(path = %path, error = %e, "Failed to delete orphan file, continuing");
                }
            }
        }

        if let Some(txlog) = &self.txlog {
            txlog.append(TransactionEntry::SnapshotsExpired {
                table_location: self.store.location().to_string(),
                snapshot_ids: plan.expired.clone(),
                deferred: plan.deferred,
                timestamp: Utc::now(),
            })?;
            txlog.append(TransactionEntry::OrphansRemoved {
                table_location: self.store.location().to_string(),
                files_deleted,
                failed: failed_deletions,
                timestamp: Utc::now(),
            })?;
        }

        let orphan_files: Vec<String> = orphan_data.into_iter().chain(orphan_metadata).collect();

        info!(
            orphan_files = orphan_files.len(),
            files_deleted = files_deleted,
            failed = failed_deletions,
            "Retention pass completed"
        );

        Ok(RetentionResult {
            expired_snapshot_ids: plan.expired.clone(),
            deferred: plan.deferred,
            valid_snapshot_count: plan.valid.len(),
            orphan_files,
            files_deleted,
            failed_deletions,
            metadata_version: Some(next.metadata_version),
        })
    }

    /// Add the files reachable from `snapshot` to `refs`.
    ///
    /// For a valid snapshot every file must be readable. For an expired one a
    /// missing manifest list or manifest means it was already reclaimed.
    async fn collect_references(
        &self,
        snapshot: &Snapshot,
        refs: &mut ReferenceSet,
        must_exist: bool,
    ) -> Result<()> {
        refs.metadata_files
            .extend(snapshot.metadata_files().map(str::to_string));

        let list = match self.store.read_manifest_list(&snapshot.manifest_list).await {
            Ok(list) => list,
            Err(Error::NotFound(path)) if !must_exist => {
                debug!(
                    snapshot_id = snapshot.snapshot_id,
                    path = %path,
                    "Manifest list of expired snapshot already reclaimed"
                );
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        for manifest_file in list.manifests {
            let manifest = match self.store.read_manifest(&manifest_file.path).await {
                Ok(manifest) => manifest,
                Err(Error::NotFound(_)) if !must_exist => continue,
                Err(e) => return Err(e),
            };
            refs.data_files
                .extend(manifest.live_entries().map(|e| e.file.path.clone()));
            refs.manifests.insert(manifest_file.path);
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{CommitKind, DataFile, SnapshotSummary};
    use crate::table::{CommitOptions, CommitTransaction};
    use chrono::Duration;

    fn snapshot(id: i64, parent: Option<i64>, timestamp: DateTime<Utc>) -> Snapshot {
        Snapshot {
            snapshot_id: id,
            parent_snapshot_id: parent,
            sequence_number: id,
            timestamp,
            manifest_list: format!("metadata/snap-{id}.json"),
            partition_stats: None,
            schema_id: 0,
            summary: SnapshotSummary::empty(CommitKind::IncrementalRefresh),
        }
    }

    /// A linear history of `count` snapshots, one minute apart, ending at
    /// `now`.
    fn history(count: i64, now: DateTime<Utc>) -> TableMetadata {
        let mut metadata = TableMetadata::new(
            "memory://plan",
            crate::model::Schema::empty(),
            crate::model::PartitionSpec::unpartitioned(),
            Default::default(),
        );
        for id in 1..=count {
            let parent = (id > 1).then_some(id - 1);
            let ts = now - Duration::minutes(count - id);
            metadata = metadata.with_snapshot(snapshot(id, parent, ts), None, None);
        }
        metadata
    }

    fn config(max_age_ms: u64, min_keep: usize, per_pass: usize) -> RetentionConfig {
        RetentionConfig {
            max_snapshot_age_ms: max_age_ms,
            min_snapshots_to_keep: min_keep,
            max_snapshots_to_expire_per_pass: per_pass,
            ..Default::default()
        }
    }

    #[test]
    fn test_plan_age_cutoff_and_cap() {
        let now = Utc::now();
        let metadata = history(42, now);

        // The 20 most recent snapshots are younger than 19.5 minutes.
        let plan = RetentionManager::plan(&metadata, &config(19 * 60_000 + 30_000, 1, 15), now);

        assert_eq!(plan.expired.len(), 15);
        assert_eq!(plan.expired, (1..=15).collect::<Vec<_>>());
        assert_eq!(plan.deferred, 7);
        assert_eq!(plan.valid.len(), 27);
    }

    #[test]
    fn test_plan_keeps_minimum_and_current() {
        let now = Utc::now();
        let metadata = history(5, now);

        let plan = RetentionManager::plan(&metadata, &config(0, 2, 100), now + Duration::hours(1));
        assert_eq!(plan.expired, vec![1, 2, 3]);
        assert_eq!(plan.valid, vec![5, 4]);

        // Even a zero minimum keeps the current snapshot.
        let plan = RetentionManager::plan(&metadata, &config(0, 0, 100), now + Duration::hours(1));
        assert_eq!(plan.valid, vec![5]);
    }

    #[test]
    fn test_plan_judges_off_ancestry_snapshots_by_age() {
        let now = Utc::now();
        let mut metadata = history(3, now);
        // A branch off snapshot 1 that is not reachable from current.
        metadata
            .snapshots
            .push(snapshot(10, Some(1), now - Duration::minutes(30)));
        metadata
            .snapshots
            .push(snapshot(11, Some(1), now - Duration::seconds(5)));

        let plan = RetentionManager::plan(&metadata, &config(60_000, 10, 100), now);
        assert_eq!(plan.expired, vec![10]);
        assert!(plan.valid.contains(&11));
        assert!(plan.valid.contains(&1));
    }

    async fn table_with_commits(location: &str, count: usize) -> TableStore {
        let store = TableStore::open(location).unwrap();
        let metadata = TableMetadata::new(
            location,
            crate::model::Schema::empty(),
            crate::model::PartitionSpec::unpartitioned(),
            Default::default(),
        );
        store.create_table(&metadata).await.unwrap();
        for i in 0..count {
            append_file(&store, &format!("data/{i}.parquet")).await;
        }
        store
    }

    async fn append_file(store: &TableStore, path: &str) {
        store.write_bytes(path, "rows").await.unwrap();
        let mut tx = CommitTransaction::new(
            store.clone(),
            CommitKind::IncrementalRefresh,
            CommitOptions::default(),
        );
        tx.begin_at_current().await.unwrap();
        tx.consume_file(DataFile::new(path, 4, 1)).unwrap();
        assert!(tx.commit().await.unwrap().is_table_updated());
    }

    #[tokio::test]
    async fn test_commit_during_pass_forces_replan() {
        let store = table_with_commits("memory://retention-race", 3).await;
        let stale = store.load_metadata().await.unwrap();

        // Lands after the pass loaded its metadata.
        append_file(&store, "data/late.parquet").await;

        let manager = RetentionManager::new(store.clone(), config(0, 1, 100));
        let later = Utc::now() + Duration::hours(1);
        let result = manager.run_from(stale, later).await.unwrap();

        // The replanned pass sees snapshot 4 and expires everything before it.
        assert_eq!(result.expired_snapshot_ids, vec![1, 2, 3]);
        assert_eq!(result.valid_snapshot_count, 1);
        assert_eq!(result.failed_deletions, 0);

        let metadata = store.load_metadata().await.unwrap();
        assert_eq!(metadata.current_snapshot_id, Some(4));
        assert_eq!(metadata.snapshots.len(), 1);
        assert_eq!(result.metadata_version, Some(metadata.metadata_version));
        for path in ["data/0.parquet", "data/2.parquet", "data/late.parquet"] {
            assert!(store.exists(path).await.unwrap());
        }
    }

    #[tokio::test]
    async fn test_missing_manifest_list_of_expired_snapshot_is_reclaimed() {
        let store = table_with_commits("memory://retention-reclaimed", 3).await;
        let metadata = store.load_metadata().await.unwrap();
        let gone = metadata.snapshot(1).unwrap().manifest_list.clone();
        store.delete(&gone).await.unwrap();

        let manager = RetentionManager::new(store.clone(), config(0, 1, 100));
        let result = manager
            .run_at(Utc::now() + Duration::hours(1))
            .await
            .unwrap();

        assert_eq!(result.expired_snapshot_ids, vec![1, 2]);
        assert_eq!(result.failed_deletions, 0);
        assert!(result.orphan_files.contains(&gone));
        assert_eq!(store.load_metadata().await.unwrap().snapshots.len(), 1);
        assert!(store.exists("data/0.parquet").await.unwrap());
    }

    #[tokio::test]
    async fn test_missing_manifest_list_of_valid_snapshot_aborts() {
        let store = table_with_commits("memory://retention-broken", 3).await;
        let metadata = store.load_metadata().await.unwrap();
        let current_list = metadata.current_snapshot().unwrap().manifest_list.clone();
        store.delete(&current_list).await.unwrap();

        let manager = RetentionManager::new(store.clone(), config(0, 1, 100));
        let err = manager
            .run_at(Utc::now() + Duration::hours(1))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
        assert_eq!(store.load_metadata().await.unwrap().snapshots.len(), 3);
    }
}
