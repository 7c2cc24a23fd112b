//! Integration tests for snapline-core.
//!
//! Every test runs against `object_store::memory::InMemory` or a temporary
//! local directory, so nothing external is required.
//!
//! Run with: cargo test --test integration_tests

use snapline_core::catalog::{CatalogSynchronizer, InMemoryCatalog, RetryPolicy};
use snapline_core::config::{Config, RetentionConfig, TransactionLogConfig};
use snapline_core::maintenance::{OrphanSweeper, RetentionManager};
use snapline_core::model::{
    CommitKind, DataFile, Field, Manifest, PartitionSpec, PrimitiveType, Schema, TableMetadata,
};
use snapline_core::table::{
    CommitCoordinatorBuilder, CommitOptions, CommitOutcome, CommitTransaction, SchemaReconciler,
    TableStore,
};
use snapline_core::txlog::TransactionLog;
use snapline_core::ErrorKind;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tempfile::TempDir;

fn table_schema() -> Schema {
    Schema::new(
        0,
        vec![
            Field::required(1, "id", PrimitiveType::Int),
            Field::optional(2, "payload", PrimitiveType::String),
        ],
    )
}

async fn new_table(location: &str) -> TableStore {
    let store = TableStore::open(location).unwrap();
    store
        .create_table(&TableMetadata::new(
            location,
            table_schema(),
            PartitionSpec::unpartitioned(),
            BTreeMap::new(),
        ))
        .await
        .unwrap();
    store
}

fn options() -> CommitOptions {
    CommitOptions {
        base_delay_ms: 1,
        max_delay_ms: 5,
        ..Default::default()
    }
}

fn data_file(path: &str) -> DataFile {
    DataFile::new(path, 100, 10)
}

/// Build a transaction on `base` that adds `paths` as one upstream manifest.
fn adding(store: &TableStore, base: Option<i64>, paths: &[&str]) -> CommitTransaction {
    let mut tx = CommitTransaction::new(store.clone(), CommitKind::IncrementalRefresh, options());
    tx.begin(base).unwrap();
    let mut manifest = Manifest::new(base, 0);
    for path in paths {
        manifest.add(data_file(path));
    }
    tx.consume(manifest).unwrap();
    tx
}

/// Live data file paths of a snapshot.
async fn live_files(store: &TableStore, snapshot_id: Option<i64>) -> BTreeSet<String> {
    let metadata = store.load_metadata().await.unwrap();
    let Some(snapshot) = snapshot_id.and_then(|id| metadata.snapshot(id)) else {
        return BTreeSet::new();
    };
    let list = store.read_manifest_list(&snapshot.manifest_list).await.unwrap();
    let mut paths = BTreeSet::new();
    for manifest_file in list.manifests {
        let manifest = store.read_manifest(&manifest_file.path).await.unwrap();
        paths.extend(manifest.live_entries().map(|e| e.file.path.clone()));
    }
    paths
}

/// Every file a snapshot needs: data, manifests, manifest list, stats.
async fn reachable_files(store: &TableStore, metadata: &TableMetadata, id: i64) -> BTreeSet<String> {
    let snapshot = metadata.snapshot(id).unwrap();
    let mut paths: BTreeSet<String> = snapshot.metadata_files().map(str::to_string).collect();
    let list = store.read_manifest_list(&snapshot.manifest_list).await.unwrap();
    for manifest_file in list.manifests {
        let manifest = store.read_manifest(&manifest_file.path).await.unwrap();
        paths.extend(manifest.live_entries().map(|e| e.file.path.clone()));
        paths.insert(manifest_file.path);
    }
    paths
}

fn set(paths: &[&str]) -> BTreeSet<String> {
    paths.iter().map(|p| p.to_string()).collect()
}

mod commit_properties {
    use super::*;

    #[tokio::test]
    async fn test_idempotent_refresh() {
        let store = new_table("memory://idempotent").await;

        let first = adding(&store, None, &["data/f1", "data/f2"])
            .commit()
            .await
            .unwrap();
        let snapshot_id = first.snapshot().unwrap().snapshot_id;
        let files_before = store.list(None).await.unwrap();
        let version_before = store.current_version().await.unwrap();

        let second = adding(&store, None, &["data/f1", "data/f2"])
            .commit()
            .await
            .unwrap();

        assert_eq!(
            second,
            CommitOutcome::Skipped {
                applied_in: snapshot_id,
                current: Some(snapshot_id)
            }
        );
        assert_eq!(store.current_version().await.unwrap(), version_before);
        assert_eq!(store.list(None).await.unwrap().len(), files_before.len());
        assert_eq!(store.load_metadata().await.unwrap().snapshots.len(), 1);
    }

    #[tokio::test]
    async fn test_no_lost_updates() {
        let store = new_table("memory://no-lost-updates").await;

        let mut t1 = adding(&store, None, &["data/a1", "data/a2"]);
        let mut t2 = adding(&store, None, &["data/b1"]);
        let (r1, r2) = tokio::join!(t1.commit(), t2.commit());

        assert!(r1.unwrap().is_table_updated());
        assert!(r2.unwrap().is_table_updated());
        assert!(t1.attempts() + t2.attempts() <= 3);

        let metadata = store.load_metadata().await.unwrap();
        assert_eq!(metadata.snapshots.len(), 2);
        assert_eq!(
            live_files(&store, metadata.current_snapshot_id).await,
            set(&["data/a1", "data/a2", "data/b1"])
        );
    }

    #[tokio::test]
    async fn test_no_spurious_conflict() {
        let store = new_table("memory://no-spurious-conflict").await;

        let mut t1 = adding(&store, None, &["data/f1", "data/f2"]);
        let mut t2 = adding(&store, None, &["data/f1", "data/f2"]);
        let (r1, r2) = tokio::join!(t1.commit(), t2.commit());
        let outcomes = [r1.unwrap(), r2.unwrap()];

        let published = outcomes.iter().filter(|o| o.is_table_updated()).count();
        let skipped = outcomes
            .iter()
            .filter(|o| matches!(o, CommitOutcome::Skipped { .. }))
            .count();
        assert_eq!(published, 1);
        assert_eq!(skipped, 1);
        assert_eq!(store.load_metadata().await.unwrap().snapshots.len(), 1);
    }

    #[tokio::test]
    async fn test_three_transaction_scenario() {
        let store = new_table("memory://s0-s1-s2").await;
        // S0: the empty table.
        let s0 = store.load_metadata().await.unwrap().current_snapshot_id;
        assert_eq!(live_files(&store, s0).await.len(), 0);

        let mut a = adding(&store, s0, &["data/f1", "data/f2"]);
        let mut b = adding(&store, s0, &["data/f3"]);
        let mut c = adding(&store, s0, &["data/f1", "data/f2"]);

        let s1 = a.commit().await.unwrap().snapshot().unwrap().snapshot_id;
        assert_eq!(live_files(&store, Some(s1)).await, set(&["data/f1", "data/f2"]));

        let s2 = b.commit().await.unwrap().snapshot().unwrap().clone();
        assert_eq!(s2.parent_snapshot_id, Some(s1));
        assert_eq!(
            live_files(&store, Some(s2.snapshot_id)).await,
            set(&["data/f1", "data/f2", "data/f3"])
        );

        let outcome = c.commit().await.unwrap();
        assert!(matches!(outcome, CommitOutcome::Skipped { applied_in, .. } if applied_in == s1));
        assert_eq!(
            store.load_metadata().await.unwrap().current_snapshot_id,
            Some(s2.snapshot_id)
        );
    }

    #[tokio::test]
    async fn test_overlapping_delete_is_concurrent_modification() {
        let store = new_table("memory://overlap").await;
        let s1 = adding(&store, None, &["data/f1"])
            .commit()
            .await
            .unwrap()
            .snapshot()
            .unwrap()
            .snapshot_id;

        // Two deletes of the same file from the same base.
        let mut d1 = CommitTransaction::new(store.clone(), CommitKind::Dml, options());
        d1.begin(Some(s1)).unwrap();
        d1.consume_delete(data_file("data/f1")).unwrap();
        d1.consume_file(data_file("data/g1")).unwrap();
        d1.commit().await.unwrap();

        let mut d2 = CommitTransaction::new(store.clone(), CommitKind::Dml, options());
        d2.begin(Some(s1)).unwrap();
        d2.consume_delete(data_file("data/f1")).unwrap();
        d2.consume_file(data_file("data/g2")).unwrap();
        let err = d2.commit().await.unwrap_err();

        assert_eq!(err.kind(), ErrorKind::ConcurrentModification);
        assert!(err.to_string().contains("data/f1"));
    }
}

mod schema_properties {
    use super::*;

    #[test]
    fn test_reconcile_round_trip() {
        let schema = table_schema();
        let reconciled = SchemaReconciler::reconcile(&schema, &schema).unwrap();
        assert!(!reconciled.changed);
        assert_eq!(reconciled.schema, schema);

        let widened = Schema::new(
            0,
            vec![
                Field::required(1, "id", PrimitiveType::Long),
                Field::optional(2, "payload", PrimitiveType::String),
            ],
        );
        let step = SchemaReconciler::reconcile(&schema, &widened).unwrap();
        assert!(step.changed);
        assert_eq!(step.promoted.len(), 1);

        let err = SchemaReconciler::reconcile(&step.schema, &schema).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
    }

    #[tokio::test]
    async fn test_schema_evolution_is_published() {
        let store = new_table("memory://schema-evolution").await;
        let observed = Schema::new(
            0,
            vec![
                Field::required(1, "id", PrimitiveType::Long),
                Field::optional(2, "payload", PrimitiveType::String),
                Field::optional(3, "source.region", PrimitiveType::String),
            ],
        );

        let mut tx = adding(&store, None, &["data/f1"]);
        tx.set_schema(observed).unwrap();
        tx.commit().await.unwrap();

        let metadata = store.load_metadata().await.unwrap();
        assert_eq!(metadata.schema.schema_id, 1);
        assert!(metadata.schema.field_by_name("source.region").is_some());
        assert_eq!(
            metadata.current_snapshot().unwrap().schema_id,
            metadata.schema.schema_id
        );
    }
}

mod retention {
    use super::*;

    /// Publish `count` snapshots where snapshot `i` holds only `data/f{i}`.
    async fn rolling_history(store: &TableStore, count: usize) {
        for i in 1..=count {
            let path = format!("data/f{i}");
            store.write_bytes(&path, "rows").await.unwrap();

            let mut tx = CommitTransaction::new(store.clone(), CommitKind::Dml, options());
            tx.begin_at_current().await.unwrap();
            if i > 1 {
                tx.consume_delete(data_file(&format!("data/f{}", i - 1)))
                    .unwrap();
            }
            tx.consume_file(data_file(&path)).unwrap();
            assert!(tx.commit().await.unwrap().is_table_updated());
        }
    }

    #[tokio::test]
    async fn test_forty_two_snapshots_fifteen_per_pass() {
        let store = new_table("memory://retention-42").await;
        rolling_history(&store, 42).await;
        assert_eq!(store.load_metadata().await.unwrap().snapshots.len(), 42);

        let config = RetentionConfig {
            max_snapshot_age_ms: 0,
            min_snapshots_to_keep: 20,
            max_snapshots_to_expire_per_pass: 15,
            ..Default::default()
        };
        let result = RetentionManager::new(store.clone(), config)
            .run()
            .await
            .unwrap();

        assert_eq!(result.expired_snapshot_ids.len(), 15);
        assert_eq!(result.valid_snapshot_count, 27);
        assert_eq!(result.deferred, 7);
        assert_eq!(result.failed_deletions, 0);

        // Oldest first.
        let expired: Vec<i64> = (1..=15).collect();
        assert_eq!(result.expired_snapshot_ids, expired);

        let metadata = store.load_metadata().await.unwrap();
        assert_eq!(metadata.snapshots.len(), 27);

        let mut retained = BTreeSet::new();
        for snapshot in &metadata.snapshots {
            retained.extend(reachable_files(&store, &metadata, snapshot.snapshot_id).await);
        }
        for orphan in &result.orphan_files {
            assert!(!retained.contains(orphan), "{orphan} is still referenced");
        }
        for path in &retained {
            if path.starts_with("data/") || path.starts_with("metadata/") {
                assert!(store.exists(path).await.unwrap(), "{path} was deleted");
            }
        }

        for i in 1..=15 {
            assert!(!store.exists(&format!("data/f{i}")).await.unwrap());
        }
        assert!(store.exists("data/f16").await.unwrap());
    }

    #[tokio::test]
    async fn test_deferred_snapshots_expire_on_next_pass() {
        let store = new_table("memory://retention-deferred").await;
        rolling_history(&store, 10).await;

        let config = RetentionConfig {
            max_snapshot_age_ms: 0,
            min_snapshots_to_keep: 2,
            max_snapshots_to_expire_per_pass: 5,
            ..Default::default()
        };
        let manager = RetentionManager::new(store.clone(), config);

        let first = manager.run().await.unwrap();
        assert_eq!(first.expired_snapshot_ids.len(), 5);
        assert_eq!(first.deferred, 3);

        let second = manager.run().await.unwrap();
        assert_eq!(second.expired_snapshot_ids.len(), 3);
        assert_eq!(second.deferred, 0);
        assert_eq!(second.valid_snapshot_count, 2);

        let third = manager.run().await.unwrap();
        assert!(!third.expired_any());
    }

    #[tokio::test]
    async fn test_retention_and_sweep_on_local_filesystem() {
        let dir = TempDir::new().unwrap();
        let location = dir.path().join("table");
        let store = new_table(location.to_str().unwrap()).await;
        rolling_history(&store, 4).await;
        store.write_bytes("data/abandoned", "rows").await.unwrap();

        let config = RetentionConfig {
            max_snapshot_age_ms: 0,
            min_snapshots_to_keep: 1,
            ..Default::default()
        };
        let result = RetentionManager::new(store.clone(), config)
            .run()
            .await
            .unwrap();
        assert_eq!(result.expired_snapshot_ids.len(), 3);
        assert!(result.files_deleted >= 3);

        let later = chrono::Utc::now() + chrono::Duration::hours(1);
        let sweep = OrphanSweeper::new(store.clone(), 60_000)
            .run_at(later)
            .await
            .unwrap();
        assert_eq!(sweep.summary.data_files, 1);
        assert!(!store.exists("data/abandoned").await.unwrap());
        assert!(store.exists("data/f4").await.unwrap());

        let metadata = store.load_metadata().await.unwrap();
        assert_eq!(live_files(&store, metadata.current_snapshot_id).await, set(&["data/f4"]));
    }
}

mod catalog_sync {
    use super::*;

    fn journal_config(dir: &TempDir) -> TransactionLogConfig {
        TransactionLogConfig {
            enabled: true,
            log_dir: dir.path().to_path_buf(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_crash_between_commit_and_catalog_update_resumes() {
        let location = "memory://crash-resume";
        let store = new_table(location).await;
        let catalog = Arc::new(InMemoryCatalog::new());
        let dir = TempDir::new().unwrap();
        let mut config = Config::for_location(location);
        config.table.dataset_path = Some("db/events".to_string());

        // A coordinator without a catalog stands in for a process that died
        // after the storage commit.
        let snapshot_id = {
            let txlog = Arc::new(TransactionLog::open(journal_config(&dir)).unwrap());
            let coordinator = CommitCoordinatorBuilder::new()
                .store(store.clone())
                .config(config.clone())
                .txlog(txlog)
                .build()
                .unwrap();
            let mut tx = coordinator.new_transaction(CommitKind::FullRefresh);
            tx.begin_at_current().await.unwrap();
            tx.consume_file(data_file("data/f1")).unwrap();
            coordinator.commit(&mut tx).await.unwrap().snapshot_id().unwrap()
        };
        assert!(catalog.dataset("db/events").is_none());

        let txlog = Arc::new(TransactionLog::open(journal_config(&dir)).unwrap());
        assert!(txlog.state().needs_resume());

        let coordinator = CommitCoordinatorBuilder::new()
            .store(store.clone())
            .config(config)
            .synchronizer(CatalogSynchronizer::new(catalog.clone(), RetryPolicy::default()))
            .txlog(Arc::clone(&txlog))
            .build()
            .unwrap();
        let reports = coordinator.resume_pending_syncs().await.unwrap();

        assert_eq!(reports.len(), 1);
        let record = catalog.dataset("db/events").unwrap();
        assert_eq!(record.snapshot_id, Some(snapshot_id));
        assert_eq!(record.schema.as_ref(), Some(&table_schema()));
        assert!(!txlog.state().needs_resume());

        // Resuming again is a no-op.
        assert!(coordinator.resume_pending_syncs().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_sync_disabled_retry_gives_up_after_one_attempt() {
        let location = "memory://sync-disabled";
        let store = new_table(location).await;
        let catalog = Arc::new(InMemoryCatalog::new());
        let mut config = Config::for_location(location);
        config.catalog_sync.retry_enabled = false;

        let coordinator = CommitCoordinatorBuilder::new()
            .store(store.clone())
            .config(config)
            .synchronizer(CatalogSynchronizer::new(catalog.clone(), RetryPolicy::default()))
            .build()
            .unwrap();

        let mut tx = coordinator.new_transaction(CommitKind::IncrementalRefresh);
        tx.begin_at_current().await.unwrap();
        tx.consume_file(data_file("data/f1")).unwrap();
        let report = coordinator.commit(&mut tx).await.unwrap();

        let sync = report.sync.unwrap();
        assert_eq!(sync.attempts, 1);
        assert_eq!(
            catalog.dataset("default").unwrap().snapshot_id,
            report.outcome.snapshot().map(|s| s.snapshot_id)
        );
    }
}
