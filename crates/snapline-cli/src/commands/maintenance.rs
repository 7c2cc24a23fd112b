//! Maintenance command implementations.

use anyhow::Result;
use snapline_core::maintenance::{OrphanSweeper, RetentionManager};
use snapline_core::table::{CommitCoordinatorBuilder, TableStore};
use snapline_core::txlog::TransactionLog;
use snapline_core::Config;
use std::sync::Arc;
use tracing::info;

fn open_txlog(config: &Config) -> Result<Option<Arc<TransactionLog>>> {
    if !config.transaction_log.enabled {
        return Ok(None);
    }
    Ok(Some(Arc::new(TransactionLog::open(
        config.transaction_log.clone(),
    )?)))
}

/// Expire old snapshots.
pub async fn expire_snapshots(config: Config, dry_run: bool) -> Result<()> {
    let store = TableStore::open(&config.table.location)?;
    let metadata = store.load_metadata().await?;
    let retention = config.retention.with_table_properties(&metadata.properties);

    info!(
        location = %config.table.location,
        max_snapshot_age_ms = retention.max_snapshot_age_ms,
        min_snapshots_to_keep = retention.min_snapshots_to_keep,
        max_per_pass = retention.max_snapshots_to_expire_per_pass,
        dry_run = dry_run,
        "Expiring old snapshots"
    );

    println!("Expiring old snapshots...");
    println!("  Table: {}", config.table.name);
    println!("  Max snapshot age: {} ms", retention.max_snapshot_age_ms);
    println!("  Min snapshots to keep: {}", retention.min_snapshots_to_keep);
    println!(
        "  Max snapshots per pass: {}",
        retention.max_snapshots_to_expire_per_pass
    );
    println!();

    if dry_run {
        let plan = RetentionManager::plan(&metadata, &retention, chrono::Utc::now());
        println!("Dry run:");
        println!("  Would expire: {}", plan.expired.len());
        println!("  Deferred: {}", plan.deferred);
        println!("  Would retain: {}", plan.valid.len());
        if !plan.expired.is_empty() {
            println!("\nSnapshot IDs:");
            for id in &plan.expired {
                println!("  - {}", id);
            }
        }
        return Ok(());
    }

    let mut builder = CommitCoordinatorBuilder::new().store(store);
    if let Some(txlog) = open_txlog(&config)? {
        builder = builder.txlog(txlog);
    }
    let coordinator = builder.config(config).build()?;
    let result = coordinator.expire_snapshots().await?;

    println!("Expiration completed:");
    println!("  Snapshots expired: {}", result.expired_snapshot_ids.len());
    println!("  Snapshots deferred: {}", result.deferred);
    println!("  Snapshots retained: {}", result.valid_snapshot_count);
    println!("  Orphan files: {}", result.orphan_files.len());
    println!("  Files deleted: {}", result.files_deleted);
    if result.failed_deletions > 0 {
        println!("  Failed deletions: {}", result.failed_deletions);
    }

    if !result.expired_snapshot_ids.is_empty() {
        println!("\nExpired snapshot IDs:");
        for id in &result.expired_snapshot_ids {
            println!("  - {}", id);
        }
    }

    Ok(())
}

/// Clean up orphan files.
pub async fn clean_orphans(config: Config, older_than_ms: Option<u64>, dry_run: bool) -> Result<()> {
    let older_than_ms = older_than_ms.unwrap_or(config.retention.orphan_older_than_ms);
    info!(
        location = %config.table.location,
        older_than_ms = older_than_ms,
        dry_run = dry_run,
        "Cleaning orphan files"
    );

    println!("Cleaning orphan files...");
    println!("  Table: {}", config.table.name);
    println!("  Older than: {} ms (safety buffer)", older_than_ms);
    println!();

    let store = TableStore::open(&config.table.location)?;
    let mut sweeper = OrphanSweeper::new(store, older_than_ms).dry_run(dry_run);
    if let Some(txlog) = open_txlog(&config)? {
        sweeper = sweeper.with_txlog(txlog);
    }
    let result = sweeper.run().await?;

    if dry_run {
        println!("Dry run: {} orphan files found", result.orphans.len());
    } else {
        println!("Orphan cleanup completed:");
        println!("  Files deleted: {}", result.files_deleted);
        println!(
            "  Bytes freed: {} ({:.2} MB)",
            result.bytes_freed,
            result.bytes_freed as f64 / 1024.0 / 1024.0
        );
    }
    println!("  Data files: {}", result.summary.data_files);
    println!("  Manifests: {}", result.summary.manifests);
    println!("  Manifest lists: {}", result.summary.manifest_lists);
    println!("  Statistics files: {}", result.summary.statistics);
    println!("  Other: {}", result.summary.unknown);

    if !result.orphans.is_empty() {
        println!("\nFiles:");
        for orphan in &result.orphans {
            println!("  - {} ({} bytes)", orphan.path, orphan.size_bytes);
        }
    }
    if !result.failed_deletions.is_empty() {
        println!("\nFailed:");
        for (path, error) in &result.failed_deletions {
            println!("  - {}: {}", path, error);
        }
    }

    Ok(())
}
