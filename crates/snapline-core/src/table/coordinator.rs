//! Commit coordinator.
//!
//! Drives one table's commits end to end:
//!
//! 1. Commit the transaction (conflict detection, CAS publish, retries)
//! 2. Journal the outcome
//! 3. Optionally run a retention pass
//! 4. Propagate the resulting metadata to the external catalog
//! 5. Record metrics
//!
//! A failed catalog update never undoes the storage commit. The snapshot
//! stays pending in the journal and [`CommitCoordinator::resume_pending_syncs`]
//! picks it up later.

use super::storage::TableStore;
use super::transaction::{CommitOptions, CommitOutcome, CommitTransaction};
use crate::catalog::{CatalogSynchronizer, DatasetState, RetryPolicy, SyncOutcome, SyncReport};
use crate::config::Config;
use crate::maintenance::{RetentionManager, RetentionResult};
use crate::metrics::CommitMetrics;
use crate::model::{CommitKind, Snapshot, TableMetadata};
use crate::txlog::{PendingSync, TransactionEntry, TransactionLog};
use crate::{CatalogError, Error, Result};
use chrono::Utc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

/// Counters kept by a coordinator.
#[derive(Debug, Default)]
pub struct CoordinatorStats {
    /// Snapshots published
    pub commits_published: AtomicU64,
    /// Commits whose change set was already applied
    pub commits_skipped: AtomicU64,
    /// Commits that failed
    pub commits_failed: AtomicU64,
    /// Lost metadata swaps
    pub cas_conflicts: AtomicU64,
    /// Catalog synchronizations that gave up
    pub sync_failures: AtomicU64,
    /// Pending catalog updates resumed from the journal
    pub syncs_resumed: AtomicU64,
}

impl CoordinatorStats {
    /// Fraction of finished commits that did not fail.
    pub fn success_rate(&self) -> f64 {
        let ok = self.commits_published.load(Ordering::Relaxed)
            + self.commits_skipped.load(Ordering::Relaxed);
        let failed = self.commits_failed.load(Ordering::Relaxed);
        if ok + failed == 0 {
            1.0
        } else {
            ok as f64 / (ok + failed) as f64
        }
    }
}

/// Everything that happened during a coordinated commit.
#[derive(Debug)]
pub struct CommitReport {
    /// Result of the storage-level commit
    pub outcome: CommitOutcome,
    /// Metadata version swapped in, when a snapshot was published
    pub metadata_version: Option<u64>,
    /// Catalog update, when a catalog is configured and the update succeeded
    pub sync: Option<SyncReport>,
    /// Catalog update failure; the snapshot stays published
    pub sync_error: Option<Error>,
    /// Journal append failure after the publish
    pub journal_error: Option<Error>,
    /// Post-commit retention pass, when enabled
    pub retention: Option<RetentionResult>,
}

impl CommitReport {
    fn new(outcome: CommitOutcome) -> Self {
        Self {
            outcome,
            metadata_version: None,
            sync: None,
            sync_error: None,
            journal_error: None,
            retention: None,
        }
    }

    /// The published snapshot id, if any.
    pub fn snapshot_id(&self) -> Option<i64> {
        self.outcome.snapshot().map(|s| s.snapshot_id)
    }

    /// Whether the catalog is known to reflect this commit.
    pub fn is_synced(&self) -> bool {
        self.sync_error.is_none()
    }
}

/// Commits to one table and mirrors the results into a catalog.
pub struct CommitCoordinator {
    store: TableStore,
    config: Config,
    dataset: String,
    synchronizer: Option<CatalogSynchronizer>,
    txlog: Option<Arc<TransactionLog>>,
    metrics: Arc<CommitMetrics>,
    stats: CoordinatorStats,
}

impl CommitCoordinator {
    /// Create a coordinator without catalog or journal.
    pub fn new(store: TableStore, config: Config) -> Self {
        let dataset = config.table.dataset_path().to_string();
        Self {
            store,
            config,
            dataset,
            synchronizer: None,
            txlog: None,
            metrics: Arc::new(CommitMetrics::new()),
            stats: CoordinatorStats::default(),
        }
    }

    /// Start a transaction against this coordinator's table.
    pub fn new_transaction(&self, kind: CommitKind) -> CommitTransaction {
        CommitTransaction::new(self.store.clone(), kind, CommitOptions::from(&self.config))
    }

    /// Commit `tx` and propagate the result.
    ///
    /// Errors from the storage commit are returned as is. Once a snapshot is
    /// published the call succeeds; later failures are reported in the
    /// [`CommitReport`].
    pub async fn commit(&self, tx: &mut CommitTransaction) -> Result<CommitReport> {
        let started = Instant::now();
        let kind = tx.kind();

        let outcome = match tx.commit().await {
            Ok(outcome) => outcome,
            Err(e) => {
                self.stats.commits_failed.fetch_add(1, Ordering::Relaxed);
                if e.is_concurrent_modification() {
                    self.record_conflicts(u64::from(tx.attempts().max(1)));
                }
                self.metrics.record_error(e.kind().into());
                warn!(
                    dataset = %self.dataset,
                    kind = %kind,
                    base = ?tx.base_snapshot_id(),
                    attempts = tx.attempts(),
                    error = %e,
                    "Commit failed"
                );
                return Err(e);
            }
        };

        self.record_conflicts(u64::from(tx.attempts().saturating_sub(1)));
        let mut report = CommitReport::new(outcome.clone());

        match outcome {
            CommitOutcome::Committed(snapshot) => {
                self.stats.commits_published.fetch_add(1, Ordering::Relaxed);
                self.metrics.record_commit(started.elapsed());

                let version = match tx.published_version() {
                    Some(version) => Ok(version),
                    None => self.store.current_version().await,
                };
                match version {
                    Ok(version) => {
                        report.metadata_version = Some(version);
                        self.after_publish(&mut report, &snapshot, version, kind).await;
                    }
                    Err(e) => {
                        warn!(
                            dataset = %self.dataset,
                            snapshot_id = snapshot.snapshot_id,
                            error = %e,
                            "Could not resolve published metadata version"
                        );
                        report.sync_error = Some(e);
                    }
                }
            }
            CommitOutcome::Skipped { applied_in, .. } => {
                self.stats.commits_skipped.fetch_add(1, Ordering::Relaxed);
                self.metrics.record_skipped();
                let entry = TransactionEntry::CommitSkipped {
                    dataset: self.dataset.clone(),
                    applied_in,
                    kind,
                    timestamp: Utc::now(),
                };
                if let Err(e) = self.journal(entry) {
                    self.metrics.record_error(e.kind().into());
                    warn!(applied_in = applied_in, error = %e, "Failed to journal skipped commit");
                    report.journal_error = Some(e);
                }
            }
            CommitOutcome::NothingToCommit => {
                debug!(dataset = %self.dataset, kind = %kind, "Nothing to commit");
            }
        }

        Ok(report)
    }

    /// Propagate snapshots the journal still lists as unsynchronized.
    ///
    /// Each pending dataset of this table is pointed at the table's current
    /// snapshot, which contains every earlier one. Returns the successful
    /// reports; failures are journaled and logged.
    pub async fn resume_pending_syncs(&self) -> Result<Vec<SyncReport>> {
        let (Some(txlog), Some(_)) = (&self.txlog, &self.synchronizer) else {
            return Ok(Vec::new());
        };

        let state = txlog.state();
        if !state.needs_resume() {
            debug!("No pending catalog updates");
            return Ok(Vec::new());
        }
        info!(recovery = ?state.summary(), "Resuming pending catalog updates");

        let mut reports = Vec::new();
        for pending in state.pending() {
            if pending.table_location != self.store.location() {
                debug!(
                    dataset = %pending.dataset,
                    table_location = %pending.table_location,
                    "Pending update belongs to another table, skipping"
                );
                continue;
            }
            match self.resume_one(&pending).await {
                Ok(Some(report)) => {
                    self.stats.syncs_resumed.fetch_add(1, Ordering::Relaxed);
                    reports.push(report);
                }
                Ok(None) => {}
                Err(e) => warn!(
                    dataset = %pending.dataset,
                    snapshot_id = pending.snapshot_id,
                    error = %e,
                    "Resumed catalog update failed"
                ),
            }
        }
        Ok(reports)
    }

    async fn resume_one(&self, pending: &PendingSync) -> Result<Option<SyncReport>> {
        let version = self.store.current_version().await?;
        let metadata = self.store.read_metadata_version(version).await?;
        let Some(snapshot) = metadata.current_snapshot() else {
            return Ok(None);
        };
        let kind = if snapshot.snapshot_id == pending.snapshot_id {
            pending.kind
        } else {
            snapshot.summary.operation
        };
        self.sync_dataset(&pending.dataset, &metadata, snapshot, version, kind)
            .await
    }

    /// Journal, expire and propagate a published snapshot.
    ///
    /// Failures land in `report`; the snapshot stays published either way.
    async fn after_publish(
        &self,
        report: &mut CommitReport,
        snapshot: &Snapshot,
        version: u64,
        kind: CommitKind,
    ) {
        let entry = TransactionEntry::CommitPublished {
            dataset: self.dataset.clone(),
            table_location: self.store.location().to_string(),
            snapshot_id: snapshot.snapshot_id,
            parent_snapshot_id: snapshot.parent_snapshot_id,
            kind,
            metadata_version: version,
            added_files: snapshot.summary.added_files,
            deleted_files: snapshot.summary.deleted_files,
            timestamp: Utc::now(),
        };
        if let Err(e) = self.journal(entry) {
            self.metrics.record_error(e.kind().into());
            warn!(
                snapshot_id = snapshot.snapshot_id,
                error = %e,
                "Failed to journal published snapshot"
            );
            report.journal_error = Some(e);
        }

        if self.config.retention.expire_after_commit {
            report.retention = self.run_retention().await;
        }
        let expired = report
            .retention
            .as_ref()
            .is_some_and(RetentionResult::expired_any);

        match self.sync_published(snapshot, version, kind, expired).await {
            Ok(sync) => report.sync = sync,
            Err(e) => report.sync_error = Some(e),
        }
    }

    /// Sync the published metadata, or the table's current metadata when
    /// retention rewrote it after the publish.
    async fn sync_published(
        &self,
        snapshot: &Snapshot,
        version: u64,
        kind: CommitKind,
        reload: bool,
    ) -> Result<Option<SyncReport>> {
        let version = if reload {
            self.store.current_version().await?
        } else {
            version
        };
        let metadata = self.store.read_metadata_version(version).await?;
        self.metrics.set_snapshots_total(metadata.snapshots.len());

        match metadata.current_snapshot() {
            Some(current) if current.snapshot_id != snapshot.snapshot_id => {
                let kind = current.summary.operation;
                self.sync_dataset(&self.dataset, &metadata, current, version, kind)
                    .await
            }
            _ => {
                self.sync_dataset(&self.dataset, &metadata, snapshot, version, kind)
                    .await
            }
        }
    }

    async fn sync_dataset(
        &self,
        dataset: &str,
        metadata: &TableMetadata,
        snapshot: &Snapshot,
        version: u64,
        kind: CommitKind,
    ) -> Result<Option<SyncReport>> {
        let Some(synchronizer) = &self.synchronizer else {
            return Ok(None);
        };

        let policy = RetryPolicy::from(
            &self
                .config
                .catalog_sync
                .with_table_properties(&metadata.properties),
        );
        let state = DatasetState::from_snapshot(
            metadata,
            snapshot,
            self.metadata_location(version),
            kind.syncs_schema(),
        );

        match synchronizer.with_policy(policy).sync(dataset, &state).await {
            Ok(report) => {
                self.metrics.record_sync_retries(report.retries());
                self.journal_or_warn(TransactionEntry::CatalogSynced {
                    dataset: dataset.to_string(),
                    snapshot_id: match report.outcome {
                        SyncOutcome::Superseded {
                            catalog_snapshot_id,
                        } => catalog_snapshot_id,
                        _ => report.snapshot_id,
                    },
                    tag: report.tag().unwrap_or_default().to_string(),
                    attempts: report.attempts,
                    timestamp: Utc::now(),
                });
                Ok(Some(report))
            }
            Err(e) => {
                self.stats.sync_failures.fetch_add(1, Ordering::Relaxed);
                self.metrics.record_sync_failure();
                self.metrics.record_error(e.kind().into());
                let attempts = match &e {
                    Error::Catalog(CatalogError::SyncExhausted { attempts, .. }) => {
                        *attempts
                    }
                    _ => 1,
                };
                self.metrics.record_sync_retries(attempts.saturating_sub(1));
                warn!(
                    dataset = %dataset,
                    snapshot_id = snapshot.snapshot_id,
                    error = %e,
                    "Catalog update failed, snapshot stays published"
                );
                self.journal_or_warn(TransactionEntry::CatalogSyncFailed {
                    dataset: dataset.to_string(),
                    snapshot_id: snapshot.snapshot_id,
                    error_message: e.to_string(),
                    attempts,
                    timestamp: Utc::now(),
                });
                Err(e)
            }
        }
    }

    /// Run a retention pass with this coordinator's settings.
    pub async fn expire_snapshots(&self) -> Result<RetentionResult> {
        let mut manager = RetentionManager::new(self.store.clone(), self.config.retention.clone());
        if let Some(txlog) = &self.txlog {
            manager = manager.with_txlog(Arc::clone(txlog));
        }
        let result = manager.run().await?;
        self.metrics.record_expired(result.expired_snapshot_ids.len());
        self.metrics.record_files_deleted(result.files_deleted);
        self.metrics.set_snapshots_total(result.valid_snapshot_count);
        Ok(result)
    }

    async fn run_retention(&self) -> Option<RetentionResult> {
        match self.expire_snapshots().await {
            Ok(result) => Some(result),
            Err(e) => {
                self.metrics.record_error(e.kind().into());
                warn!(error = %e, "Post-commit retention failed");
                None
            }
        }
    }

    fn record_conflicts(&self, count: u64) {
        if count > 0 {
            self.stats.cas_conflicts.fetch_add(count, Ordering::Relaxed);
            self.metrics.record_conflicts(count);
        }
    }

    fn journal(&self, entry: TransactionEntry) -> Result<()> {
        match &self.txlog {
            Some(txlog) => txlog.append(entry),
            None => Ok(()),
        }
    }

    /// Journal an entry whose loss only costs a redundant resume later.
    fn journal_or_warn(&self, entry: TransactionEntry) {
        if let Err(e) = self.journal(entry) {
            self.metrics.record_error(e.kind().into());
            warn!(error = %e, "Failed to journal catalog update");
        }
    }

    fn metadata_location(&self, version: u64) -> String {
        format!(
            "{}/{}",
            self.store.location().trim_end_matches('/'),
            TableStore::metadata_path(version)
        )
    }

    /// Table store.
    pub fn store(&self) -> &TableStore {
        &self.store
    }

    /// Configuration in effect.
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Catalog dataset path.
    pub fn dataset(&self) -> &str {
        &self.dataset
    }

    /// Metrics.
    pub fn metrics(&self) -> &Arc<CommitMetrics> {
        &self.metrics
    }

    /// Counters.
    pub fn stats(&self) -> &CoordinatorStats {
        &self.stats
    }

    /// Commit journal, when configured.
    pub fn txlog(&self) -> Option<&Arc<TransactionLog>> {
        self.txlog.as_ref()
    }
}

/// Builder for [`CommitCoordinator`].
pub struct CommitCoordinatorBuilder {
    store: Option<TableStore>,
    config: Option<Config>,
    dataset: Option<String>,
    synchronizer: Option<CatalogSynchronizer>,
    txlog: Option<Arc<TransactionLog>>,
    metrics: Option<Arc<CommitMetrics>>,
}

impl CommitCoordinatorBuilder {
    /// Create a new builder.
    pub fn new() -> Self {
        Self {
            store: None,
            config: None,
            dataset: None,
            synchronizer: None,
            txlog: None,
            metrics: None,
        }
    }

    /// Set the table store.
    pub fn store(mut self, store: TableStore) -> Self {
        self.store = Some(store);
        self
    }

    /// Set the configuration.
    pub fn config(mut self, config: Config) -> Self {
        self.config = Some(config);
        self
    }

    /// Override the catalog dataset path from the configuration.
    pub fn dataset(mut self, dataset: impl Into<String>) -> Self {
        self.dataset = Some(dataset.into());
        self
    }

    /// Mirror commits into a catalog.
    pub fn synchronizer(mut self, synchronizer: CatalogSynchronizer) -> Self {
        self.synchronizer = Some(synchronizer);
        self
    }

    /// Set the commit journal.
    pub fn txlog(mut self, txlog: Arc<TransactionLog>) -> Self {
        self.txlog = Some(txlog);
        self
    }

    /// Share a metrics instance.
    pub fn metrics(mut self, metrics: Arc<CommitMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Build the coordinator.
    pub fn build(self) -> Result<CommitCoordinator> {
        let config = self
            .config
            .ok_or_else(|| Error::Config("CommitCoordinator requires a config".to_string()))?;
        config.validate()?;
        let store = match self.store {
            Some(store) => store,
            None => TableStore::open(&config.table.location)?,
        };

        let mut coordinator = CommitCoordinator::new(store, config);
        if let Some(dataset) = self.dataset {
            coordinator.dataset = dataset;
        }
        coordinator.synchronizer = self.synchronizer;
        coordinator.txlog = self.txlog;
        if let Some(metrics) = self.metrics {
            coordinator.metrics = metrics;
        }
        Ok(coordinator)
    }
}

impl Default for CommitCoordinatorBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{DatasetRecord, ExternalCatalog, InMemoryCatalog};
    use crate::config::TransactionLogConfig;
    use crate::model::{DataFile, Field, PartitionSpec, PrimitiveType, Schema};
    use async_trait::async_trait;
    use std::collections::BTreeMap;
    use std::sync::atomic::AtomicBool;
    use tempfile::TempDir;

    fn schema() -> Schema {
        Schema::new(
            0,
            vec![
                Field::required(1, "id", PrimitiveType::Long),
                Field::optional(2, "name", PrimitiveType::String),
            ],
        )
    }

    async fn create_table(location: &str) -> TableStore {
        let store = TableStore::open(location).unwrap();
        let metadata = TableMetadata::new(
            location,
            schema(),
            PartitionSpec::unpartitioned(),
            BTreeMap::new(),
        );
        store.create_table(&metadata).await.unwrap();
        store
    }

    fn test_config(location: &str) -> Config {
        let mut config = Config::for_location(location);
        config.table.dataset_path = Some("warehouse/events".to_string());
        config.commit.retry_base_delay_ms = 1;
        config.catalog_sync.retry_base_delay_ms = 1;
        config
    }

    fn journal(dir: &TempDir) -> Arc<TransactionLog> {
        Arc::new(
            TransactionLog::open(TransactionLogConfig {
                enabled: true,
                log_dir: dir.path().to_path_buf(),
                ..Default::default()
            })
            .unwrap(),
        )
    }

    /// Catalog that can be switched to fail every request.
    struct SwitchableCatalog {
        inner: InMemoryCatalog,
        down: AtomicBool,
    }

    impl SwitchableCatalog {
        fn new() -> Self {
            Self {
                inner: InMemoryCatalog::new(),
                down: AtomicBool::new(false),
            }
        }

        fn set_down(&self, down: bool) {
            self.down.store(down, Ordering::SeqCst);
        }

        fn check(&self) -> Result<()> {
            if self.down.load(Ordering::SeqCst) {
                return Err(CatalogError::Transport("connection refused".into()).into());
            }
            Ok(())
        }
    }

    #[async_trait]
    impl ExternalCatalog for SwitchableCatalog {
        async fn get_dataset(&self, path: &str) -> Result<DatasetRecord> {
            self.check()?;
            self.inner.get_dataset(path).await
        }

        async fn update_dataset(
            &self,
            path: &str,
            expected_tag: Option<&str>,
            state: &DatasetState,
        ) -> Result<String> {
            self.check()?;
            self.inner.update_dataset(path, expected_tag, state).await
        }

        fn name(&self) -> &str {
            "switchable"
        }
    }

    #[tokio::test]
    async fn test_commit_publishes_and_syncs() {
        let location = "memory://coordinator-sync";
        let store = create_table(location).await;
        let catalog = Arc::new(InMemoryCatalog::new());
        let dir = TempDir::new().unwrap();

        let coordinator = CommitCoordinatorBuilder::new()
            .store(store.clone())
            .config(test_config(location))
            .synchronizer(CatalogSynchronizer::new(catalog.clone(), RetryPolicy::default()))
            .txlog(journal(&dir))
            .build()
            .unwrap();

        let mut tx = coordinator.new_transaction(CommitKind::IncrementalRefresh);
        tx.begin_at_current().await.unwrap();
        tx.consume_file(DataFile::new("data/a.parquet", 100, 10)).unwrap();
        tx.set_schema(schema()).unwrap();
        let report = coordinator.commit(&mut tx).await.unwrap();

        let snapshot_id = report.snapshot_id().unwrap();
        assert!(report.is_synced());
        assert_eq!(report.metadata_version, Some(2));
        assert!(matches!(
            report.sync.as_ref().unwrap().outcome,
            SyncOutcome::Updated { .. }
        ));

        let record = catalog.dataset("warehouse/events").unwrap();
        assert_eq!(record.snapshot_id, Some(snapshot_id));
        assert_eq!(record.stats.file_count, 1);
        assert!(record.schema.is_some());
        assert!(record
            .metadata_location
            .unwrap()
            .ends_with("metadata/v00000000000000000002.metadata.json"));

        assert_eq!(coordinator.metrics().commits_total(), 1);
        assert_eq!(coordinator.metrics().snapshots_total(), 1);
        assert!(!coordinator.txlog().unwrap().state().needs_resume());
    }

    #[tokio::test]
    async fn test_skipped_commit_is_counted() {
        let location = "memory://coordinator-skip";
        let store = create_table(location).await;
        let coordinator = CommitCoordinator::new(store, test_config(location));

        for expected_published in [true, false] {
            let mut tx = coordinator.new_transaction(CommitKind::IncrementalRefresh);
            tx.begin(None).unwrap();
            tx.consume_file(DataFile::new("data/a.parquet", 100, 10)).unwrap();
            let report = coordinator.commit(&mut tx).await.unwrap();
            assert_eq!(report.outcome.is_table_updated(), expected_published);
        }

        assert_eq!(coordinator.stats().commits_published.load(Ordering::Relaxed), 1);
        assert_eq!(coordinator.stats().commits_skipped.load(Ordering::Relaxed), 1);
        assert_eq!(coordinator.metrics().commits_skipped_total(), 1);
    }

    #[tokio::test]
    async fn test_sync_failure_keeps_commit_and_resumes() {
        let location = "memory://coordinator-resume";
        let store = create_table(location).await;
        let catalog = Arc::new(SwitchableCatalog::new());
        let dir = TempDir::new().unwrap();
        let txlog = journal(&dir);

        let coordinator = CommitCoordinatorBuilder::new()
            .store(store.clone())
            .config(test_config(location))
            .synchronizer(CatalogSynchronizer::new(catalog.clone(), RetryPolicy::default()))
            .txlog(Arc::clone(&txlog))
            .build()
            .unwrap();

        catalog.set_down(true);
        let mut tx = coordinator.new_transaction(CommitKind::Dml);
        tx.begin_at_current().await.unwrap();
        tx.consume_file(DataFile::new("data/a.parquet", 100, 10)).unwrap();
        let report = coordinator.commit(&mut tx).await.unwrap();

        let snapshot_id = report.snapshot_id().unwrap();
        let err = report.sync_error.as_ref().unwrap();
        assert!(err.is_concurrent_modification());
        assert_eq!(
            store.load_metadata().await.unwrap().current_snapshot_id,
            Some(snapshot_id)
        );
        assert_eq!(coordinator.metrics().catalog_sync_failures_total(), 1);
        assert_eq!(coordinator.metrics().catalog_sync_retries_total(), 2);

        let pending = txlog.state().pending();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].snapshot_id, snapshot_id);

        catalog.set_down(false);
        let reports = coordinator.resume_pending_syncs().await.unwrap();
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].snapshot_id, snapshot_id);
        assert!(!txlog.state().needs_resume());

        // DML commits leave the catalog schema alone.
        let record = catalog.inner.dataset("warehouse/events").unwrap();
        assert_eq!(record.snapshot_id, Some(snapshot_id));
        assert!(record.schema.is_none());
    }

    #[tokio::test]
    async fn test_retention_after_commit() {
        let location = "memory://coordinator-retention";
        let store = create_table(location).await;
        let mut config = test_config(location);
        config.retention.expire_after_commit = true;
        config.retention.max_snapshot_age_ms = 0;
        config.retention.min_snapshots_to_keep = 2;
        let coordinator = CommitCoordinator::new(store.clone(), config);

        for i in 0..4 {
            let mut tx = coordinator.new_transaction(CommitKind::IncrementalRefresh);
            tx.begin_at_current().await.unwrap();
            tx.consume_file(DataFile::new(format!("data/{i}.parquet"), 100, 10))
                .unwrap();
            let report = coordinator.commit(&mut tx).await.unwrap();
            assert!(report.retention.is_some());
        }

        let metadata = store.load_metadata().await.unwrap();
        assert_eq!(metadata.snapshots.len(), 2);
        assert_eq!(coordinator.metrics().snapshots_expired_total(), 2);
        assert_eq!(coordinator.metrics().snapshots_total(), 2);
    }

    #[tokio::test]
    async fn test_catalog_follows_metadata_rewritten_by_retention() {
        let location = "memory://coordinator-retention-sync";
        let store = create_table(location).await;
        let catalog = Arc::new(InMemoryCatalog::new());
        let mut config = test_config(location);
        config.retention.expire_after_commit = true;
        config.retention.max_snapshot_age_ms = 0;
        config.retention.min_snapshots_to_keep = 2;

        let coordinator = CommitCoordinatorBuilder::new()
            .store(store.clone())
            .config(config)
            .synchronizer(CatalogSynchronizer::new(catalog.clone(), RetryPolicy::default()))
            .build()
            .unwrap();

        let mut last = None;
        for i in 0..3 {
            let mut tx = coordinator.new_transaction(CommitKind::IncrementalRefresh);
            tx.begin_at_current().await.unwrap();
            tx.consume_file(DataFile::new(format!("data/{i}.parquet"), 100, 10))
                .unwrap();
            last = Some(coordinator.commit(&mut tx).await.unwrap());
        }
        let report = last.unwrap();
        assert!(report.retention.as_ref().unwrap().expired_any());
        assert!(report.is_synced());

        // The catalog points at the metadata written by retention, which
        // no longer lists the expired snapshot.
        let current = store.current_version().await.unwrap();
        assert!(current > report.metadata_version.unwrap());
        let record = catalog.dataset("warehouse/events").unwrap();
        assert!(record
            .metadata_location
            .unwrap()
            .ends_with(&TableStore::metadata_path(current)));
        assert_eq!(record.snapshot_id, report.snapshot_id());
        assert_eq!(store.load_metadata().await.unwrap().snapshots.len(), 2);
    }

    #[tokio::test]
    async fn test_journal_failure_after_publish_is_reported() {
        let location = "memory://coordinator-journal-down";
        let store = create_table(location).await;
        let catalog = Arc::new(InMemoryCatalog::new());
        let dir = TempDir::new().unwrap();
        let log_dir = dir.path().join("txlog");
        let txlog = Arc::new(
            TransactionLog::open(TransactionLogConfig {
                enabled: true,
                log_dir: log_dir.clone(),
                checkpoint_interval_entries: 1,
                ..Default::default()
            })
            .unwrap(),
        );

        let coordinator = CommitCoordinatorBuilder::new()
            .store(store.clone())
            .config(test_config(location))
            .synchronizer(CatalogSynchronizer::new(catalog.clone(), RetryPolicy::default()))
            .txlog(txlog)
            .build()
            .unwrap();

        // Rotation at the next checkpoint can no longer create a file.
        std::fs::remove_dir_all(&log_dir).unwrap();

        let mut tx = coordinator.new_transaction(CommitKind::Dml);
        tx.begin_at_current().await.unwrap();
        tx.consume_file(DataFile::new("data/a.parquet", 100, 10)).unwrap();
        let report = coordinator.commit(&mut tx).await.unwrap();

        let snapshot_id = report.snapshot_id().unwrap();
        assert!(report.journal_error.is_some());
        assert!(report.sync_error.is_none());
        assert_eq!(
            store.load_metadata().await.unwrap().current_snapshot_id,
            Some(snapshot_id)
        );
        let record = catalog.dataset("warehouse/events").unwrap();
        assert_eq!(record.snapshot_id, Some(snapshot_id));
        assert_eq!(coordinator.stats().commits_failed.load(Ordering::Relaxed), 0);
    }

    #[tokio::test]
    async fn test_failed_commit_is_counted() {
        let location = "memory://coordinator-fail";
        let store = create_table(location).await;
        let coordinator = CommitCoordinator::new(store, test_config(location));

        let mut tx = coordinator.new_transaction(CommitKind::Dml);
        tx.begin(None).unwrap();
        tx.consume_file(DataFile::new("data/a.parquet", 1, 1)).unwrap();
        coordinator.commit(&mut tx).await.unwrap();

        let mut tx = coordinator.new_transaction(CommitKind::Dml);
        tx.begin(Some(77)).unwrap();
        tx.consume_file(DataFile::new("data/b.parquet", 1, 1)).unwrap();
        let err = coordinator.commit(&mut tx).await.unwrap_err();

        assert!(err.is_concurrent_modification());
        assert_eq!(coordinator.stats().commits_failed.load(Ordering::Relaxed), 1);
        assert_eq!(coordinator.stats().success_rate(), 0.5);
        assert_eq!(coordinator.metrics().commit_conflicts_total(), 1);
        assert_eq!(
            coordinator
                .metrics()
                .errors_by_type(crate::metrics::ErrorType::ConcurrentModification),
            1
        );
    }

    #[test]
    fn test_builder_requires_config() {
        let result = CommitCoordinatorBuilder::new().build();
        assert!(matches!(result, Err(Error::Config(_))));
    }
}
