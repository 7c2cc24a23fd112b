//! Orphan file sweep.
//!
//! Removes files under the table location that no retained snapshot and no
//! metadata version references, typically left behind by failed or
//! abandoned commits:
//!
//! 1. **List files**: everything under the table root
//! 2. **Get referenced**: every file reachable from a retained snapshot, plus
//!    every metadata version file and the version hint
//! 3. **Find orphans**: unreferenced files older than the safety window
//! 4. **Delete**: per-file failures are logged and skipped

use crate::model::TableMetadata;
use crate::table::{StoredFile, TableStore, DATA_DIR, VERSION_HINT};
use crate::txlog::{TransactionEntry, TransactionLog};
use crate::{Error, Result};
use chrono::{DateTime, Duration, Utc};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Information about a potential orphan file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrphanCandidate {
    /// Path relative to the table root
    pub path: String,
    /// File size in bytes
    pub size_bytes: u64,
    /// Last modification time
    pub modified_at: DateTime<Utc>,
    /// File type
    pub file_type: OrphanFileType,
}

/// Types of files that can become orphaned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrphanFileType {
    /// Data file
    DataFile,
    /// Manifest
    Manifest,
    /// Manifest list
    ManifestList,
    /// Partition statistics
    Statistics,
    /// Table metadata or version hint
    Metadata,
    /// Unknown file type
    Unknown,
}

impl OrphanFileType {
    /// Classify a path relative to the table root.
    pub fn classify(path: &str) -> Self {
        let name = path.rsplit('/').next().unwrap_or(path);
        if path.starts_with(DATA_DIR) && path[DATA_DIR.len()..].starts_with('/') {
            OrphanFileType::DataFile
        } else if name.ends_with(".manifest.json") {
            OrphanFileType::Manifest
        } else if name.starts_with("snap-") {
            OrphanFileType::ManifestList
        } else if name.starts_with("stats-") {
            OrphanFileType::Statistics
        } else if path == VERSION_HINT || TableStore::parse_metadata_version(path).is_some() {
            OrphanFileType::Metadata
        } else {
            OrphanFileType::Unknown
        }
    }
}

/// Orphans grouped by file type.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OrphanSummary {
    /// Data files
    pub data_files: usize,
    /// Bytes in data files
    pub data_file_bytes: u64,
    /// Manifests
    pub manifests: usize,
    /// Manifest lists
    pub manifest_lists: usize,
    /// Statistics files
    pub statistics: usize,
    /// Unknown files
    pub unknown: usize,
}

/// Result of an orphan sweep.
#[derive(Debug, Clone, Default)]
pub struct OrphanSweepResult {
    /// Orphans found
    pub orphans: Vec<OrphanCandidate>,
    /// Files deleted
    pub files_deleted: usize,
    /// Bytes freed
    pub bytes_freed: u64,
    /// Files that failed to delete
    pub failed_deletions: Vec<(String, String)>,
    /// Orphans grouped by type
    pub summary: OrphanSummary,
}

/// Deletes unreferenced files older than a safety window.
pub struct OrphanSweeper {
    store: TableStore,
    older_than_ms: u64,
    dry_run: bool,
    txlog: Option<Arc<TransactionLog>>,
}

impl OrphanSweeper {
    /// Create a sweeper that only touches files older than `older_than_ms`.
    pub fn new(store: TableStore, older_than_ms: u64) -> Self {
        Self {
            store,
            older_than_ms,
            dry_run: false,
            txlog: None,
        }
    }

    /// Report orphans without deleting them.
    pub fn dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    /// Record sweeps in the commit journal.
    pub fn with_txlog(mut self, txlog: Arc<TransactionLog>) -> Self {
        self.txlog = Some(txlog);
        self
    }

    /// Sweep against the current time.
    pub async fn run(&self) -> Result<OrphanSweepResult> {
        self.run_at(Utc::now()).await
    }

    /// Sweep, treating files modified before `now - older_than` as eligible.
    pub async fn run_at(&self, now: DateTime<Utc>) -> Result<OrphanSweepResult> {
        let metadata = self.store.load_metadata().await?;
        let referenced = self.build_referenced_files(&metadata).await?;
        let all_files = self.store.list(None).await?;
        let window = Duration::milliseconds(i64::try_from(self.older_than_ms).unwrap_or(i64::MAX / 2));
        let cutoff = now
            .checked_sub_signed(window)
            .unwrap_or(DateTime::<Utc>::MIN_UTC);

        let orphans = Self::find_orphans(&all_files, &referenced, cutoff);
        let summary = Self::group_by_type(&orphans);

        debug!(
            location = %self.store.location(),
            total_files = all_files.len(),
            referenced = referenced.len(),
            orphans = orphans.len(),
            "Orphan scan complete"
        );

        let mut result = OrphanSweepResult {
            summary,
            ..Default::default()
        };

        if self.dry_run {
            info!(orphans = orphans.len(), "Dry run, no files deleted");
            result.orphans = orphans;
            return Ok(result);
        }

        for orphan in &orphans {
            match self.store.delete(&orphan.path).await {
                Ok(()) | Err(Error::NotFound(_)) => {
                    result.files_deleted += 1;
                    result.bytes_freed += orphan.size_bytes;
                    debug!(
                        path = %orphan.path,
                        size_bytes = orphan.size_bytes,
                        file_type = ?orphan.file_type,
                        "Deleted orphan file"
                    );
                }
                Err(e) => {
                    warn!(path = %orphan.path, error = %e, "Failed to delete orphan file, continuing");
                    result
                        .failed_deletions
                        .push((orphan.path.clone(), e.to_string()));
                }
            }
        }
        result.orphans = orphans;

        if let Some(txlog) = &self.txlog {
            txlog.append(TransactionEntry::OrphansRemoved {
                table_location: self.store.location().to_string(),
                files_deleted: result.files_deleted,
                failed: result.failed_deletions.len(),
                timestamp: Utc::now(),
            })?;
        }

        info!(
            files_deleted = result.files_deleted,
            bytes_freed = result.bytes_freed,
            failed = result.failed_deletions.len(),
            "Orphan file cleanup completed"
        );

        Ok(result)
    }

    /// Every path reachable from the retained snapshots and metadata.
    ///
    /// A retained snapshot whose manifest list or manifest cannot be read
    /// aborts the sweep.
    async fn build_referenced_files(&self, metadata: &TableMetadata) -> Result<HashSet<String>> {
        let mut referenced: HashSet<String> = HashSet::new();
        referenced.insert(VERSION_HINT.to_string());
        for version in self.store.list_metadata_versions().await? {
            referenced.insert(TableStore::metadata_path(version));
        }

        for snapshot in &metadata.snapshots {
            referenced.extend(snapshot.metadata_files().map(str::to_string));
            let list = self.store.read_manifest_list(&snapshot.manifest_list).await?;
            for manifest_file in list.manifests {
                let manifest = self.store.read_manifest(&manifest_file.path).await?;
                referenced.extend(manifest.live_entries().map(|e| e.file.path.clone()));
                referenced.insert(manifest_file.path);
            }
        }

        Ok(referenced)
    }

    /// Unreferenced files modified before `cutoff`.
    pub fn find_orphans(
        all_files: &[StoredFile],
        referenced: &HashSet<String>,
        cutoff: DateTime<Utc>,
    ) -> Vec<OrphanCandidate> {
        all_files
            .iter()
            .filter(|f| !referenced.contains(&f.path) && f.last_modified < cutoff)
            .map(|f| OrphanCandidate {
                path: f.path.clone(),
                size_bytes: f.size_bytes,
                modified_at: f.last_modified,
                file_type: OrphanFileType::classify(&f.path),
            })
            .collect()
    }

    /// Group orphans by file type for reporting.
    pub fn group_by_type(orphans: &[OrphanCandidate]) -> OrphanSummary {
        let mut summary = OrphanSummary::default();
        for orphan in orphans {
            match orphan.file_type {
                OrphanFileType::DataFile => {
                    summary.data_files += 1;
                    summary.data_file_bytes += orphan.size_bytes;
                }
                OrphanFileType::Manifest => summary.manifests += 1,
                OrphanFileType::ManifestList => summary.manifest_lists += 1,
                OrphanFileType::Statistics => summary.statistics += 1,
                OrphanFileType::Metadata | OrphanFileType::Unknown => summary.unknown += 1,
            }
        }
        summary
    }
}
