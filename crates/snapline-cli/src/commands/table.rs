//! Table command implementations: init, commit, history, validate.

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use snapline_core::model::{
    CommitKind, DataFile, DeleteTarget, PartitionSpec, PartitionSpecUpdate, Schema, TableMetadata,
};
use snapline_core::table::{CommitCoordinatorBuilder, CommitOutcome, SchemaReconciler, TableStore};
use snapline_core::txlog::TransactionLog;
use snapline_core::Config;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use tracing::info;

/// A change set read from a JSON file.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ChangeSetFile {
    /// Commit kind
    pub kind: CommitKind,
    /// Base snapshot; the table's current snapshot when absent
    #[serde(default)]
    pub base_snapshot_id: Option<i64>,
    /// Files to add
    #[serde(default)]
    pub add: Vec<DataFile>,
    /// Files to delete
    #[serde(default)]
    pub delete: Vec<DeleteTarget>,
    /// Observed schema to reconcile
    #[serde(default)]
    pub schema: Option<Schema>,
    /// Partition spec edits
    #[serde(default)]
    pub partition_updates: Vec<PartitionSpecUpdate>,
}

impl ChangeSetFile {
    /// Read and parse a change-set file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading change set {}", path.display()))?;
        serde_json::from_str(&content)
            .with_context(|| format!("parsing change set {}", path.display()))
    }
}

/// Create a table.
pub async fn init(
    config: Config,
    schema_path: &Path,
    properties: BTreeMap<String, String>,
) -> Result<()> {
    let content = std::fs::read_to_string(schema_path)
        .with_context(|| format!("reading schema {}", schema_path.display()))?;
    let schema: Schema = serde_json::from_str(&content)
        .with_context(|| format!("parsing schema {}", schema_path.display()))?;

    let location = config.table.location.clone();
    info!(location = %location, columns = schema.fields.len(), "Creating table");

    let store = TableStore::open(&location)?;
    let metadata = TableMetadata::new(&location, schema, PartitionSpec::unpartitioned(), properties);
    store.create_table(&metadata).await?;

    println!("Created table {}", config.table.name);
    println!("  Location: {}", location);
    println!("  Table UUID: {}", metadata.table_uuid);
    println!("  Columns: {}", metadata.schema.fields.len());
    for (key, value) in &metadata.properties {
        println!("  {} = {}", key, value);
    }

    Ok(())
}

/// Apply a change-set file.
pub async fn commit(config: Config, changes_path: &Path) -> Result<()> {
    let changes = ChangeSetFile::load(changes_path)?;

    let mut builder = CommitCoordinatorBuilder::new();
    if config.transaction_log.enabled {
        let txlog = TransactionLog::open(config.transaction_log.clone())?;
        builder = builder.txlog(Arc::new(txlog));
    }
    let coordinator = builder.config(config).build()?;

    let mut tx = coordinator.new_transaction(changes.kind);
    let base = match changes.base_snapshot_id {
        Some(base) => {
            tx.begin(Some(base))?;
            Some(base)
        }
        None => tx.begin_at_current().await?,
    };
    for file in changes.add {
        tx.consume_file(file)?;
    }
    for target in changes.delete {
        tx.consume_delete(target)?;
    }
    if let Some(schema) = changes.schema {
        tx.set_schema(schema)?;
    }
    for update in changes.partition_updates {
        tx.update_partition_spec(update)?;
    }

    info!(kind = %changes.kind, base = ?base, "Committing change set");
    let report = coordinator.commit(&mut tx).await?;

    match &report.outcome {
        CommitOutcome::Committed(snapshot) => {
            println!("Committed snapshot {}", snapshot.snapshot_id);
            println!("  Parent: {}", display_id(snapshot.parent_snapshot_id));
            println!("  Kind: {}", snapshot.summary.operation);
            println!("  Added files: {}", snapshot.summary.added_files);
            println!("  Deleted files: {}", snapshot.summary.deleted_files);
            println!("  Total files: {}", snapshot.summary.total_files);
            println!("  Total records: {}", snapshot.summary.total_records);
            println!("  Attempts: {}", tx.attempts());
            if tx.missing_deletes() > 0 {
                println!("  Deletes of files not in the table: {}", tx.missing_deletes());
            }
        }
        CommitOutcome::Skipped {
            applied_in,
            current,
        } => {
            println!("Skipped: change set already applied in snapshot {}", applied_in);
            println!("  Current snapshot: {}", display_id(*current));
        }
        CommitOutcome::NothingToCommit => {
            println!("Nothing to commit");
        }
    }

    if let Some(retention) = &report.retention {
        println!(
            "  Expired snapshots: {} ({} deferred)",
            retention.expired_snapshot_ids.len(),
            retention.deferred
        );
    }

    Ok(())
}

/// Print snapshot history, newest first.
pub async fn history(config: Config, json: bool) -> Result<()> {
    let store = TableStore::open(&config.table.location)?;
    let metadata = store.load_metadata().await?;

    let mut snapshots: Vec<_> = metadata.snapshots.iter().collect();
    snapshots.sort_by_key(|s| std::cmp::Reverse(s.snapshot_id));

    if json {
        println!("{}", serde_json::to_string_pretty(&snapshots)?);
        return Ok(());
    }

    println!(
        "Table {} (metadata version {}, {} snapshots)",
        config.table.name,
        metadata.metadata_version,
        snapshots.len()
    );
    println!();
    println!(
        "  {:>1} {:>8} {:>8}  {:<20}  {:<25} {:>7} {:>7} {:>9}",
        "", "SNAPSHOT", "PARENT", "KIND", "TIMESTAMP", "ADDED", "DELETED", "FILES"
    );
    for snapshot in snapshots {
        let marker = if metadata.current_snapshot_id == Some(snapshot.snapshot_id) {
            "*"
        } else {
            ""
        };
        println!(
            "  {:>1} {:>8} {:>8}  {:<20}  {:<25} {:>7} {:>7} {:>9}",
            marker,
            snapshot.snapshot_id,
            display_id(snapshot.parent_snapshot_id),
            snapshot.summary.operation.as_str(),
            snapshot.timestamp.format("%Y-%m-%d %H:%M:%S%.3f"),
            snapshot.summary.added_files,
            snapshot.summary.deleted_files,
            snapshot.summary.total_files,
        );
    }

    Ok(())
}

/// Validate the configuration and, when the table exists, its metadata.
pub async fn validate(config: Config) -> Result<()> {
    config.validate()?;
    println!("Configuration is valid");

    let store = TableStore::open(&config.table.location)?;
    if !store.table_exists().await? {
        println!("No table at {}", config.table.location);
        return Ok(());
    }

    let metadata = store.load_metadata().await?;
    SchemaReconciler::validate_partition_spec(&metadata.partition_spec, &metadata.schema)?;

    let mut manifests = 0;
    let mut live_files = 0;
    for snapshot in &metadata.snapshots {
        let list = store
            .read_manifest_list(&snapshot.manifest_list)
            .await
            .with_context(|| format!("snapshot {}", snapshot.snapshot_id))?;
        for manifest_file in &list.manifests {
            let manifest = store
                .read_manifest(&manifest_file.path)
                .await
                .with_context(|| format!("snapshot {}", snapshot.snapshot_id))?;
            manifests += 1;
            if metadata.current_snapshot_id == Some(snapshot.snapshot_id) {
                live_files += manifest.live_entries().count();
            }
        }
    }

    if let Some(current) = metadata.current_snapshot() {
        if current.summary.total_files != live_files as u64 {
            bail!(
                "snapshot {} summary lists {} files but its manifests hold {}",
                current.snapshot_id,
                current.summary.total_files,
                live_files
            );
        }
    }

    println!("Table is valid");
    println!("  Metadata version: {}", metadata.metadata_version);
    println!("  Snapshots: {}", metadata.snapshots.len());
    println!("  Manifests read: {}", manifests);
    println!("  Live files: {}", live_files);
    Ok(())
}

fn display_id(id: Option<i64>) -> String {
    id.map(|id| id.to_string()).unwrap_or_else(|| "-".to_string())
}
