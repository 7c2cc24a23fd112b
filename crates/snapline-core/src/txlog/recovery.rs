//! Crash recovery from the commit journal.
//!
//! A crash between the storage-level commit and the catalog update leaves a
//! `CommitPublished` entry without a later `CatalogSynced` entry for the same
//! dataset. Recovery finds those so catalog propagation can be resumed.

use super::entries::{PendingSync, TransactionEntry};
use super::log::TransactionLog;
use crate::Result;
use std::collections::BTreeMap;
use tracing::{info, warn};

/// State recovered from the journal.
#[derive(Debug, Clone, Default)]
pub struct RecoveryState {
    /// Last published snapshot recorded
    pub last_snapshot_id: Option<i64>,

    /// Newest unconfirmed catalog update per dataset
    pub pending_syncs: BTreeMap<String, PendingSync>,

    /// Last snapshot confirmed in the catalog per dataset
    pub synced: BTreeMap<String, i64>,

    /// Commits published
    pub commits_published: u64,

    /// Commits skipped as already applied
    pub commits_skipped: u64,

    /// Failed catalog synchronizations
    pub failed_syncs: u64,

    /// Snapshots expired by retention
    pub snapshots_expired: u64,

    /// Orphan files removed
    pub orphans_removed: u64,

    /// Total entries processed
    pub entries_processed: u64,
}

impl RecoveryState {
    /// Recover state from a journal.
    pub fn recover_from(txlog: &TransactionLog) -> Result<Self> {
        info!("Starting recovery from transaction log");

        let mut state = RecoveryState::default();
        for entry in txlog.read_all_entries()? {
            state.apply(entry);
        }

        for pending in state.pending_syncs.values() {
            warn!(
                dataset = %pending.dataset,
                snapshot_id = pending.snapshot_id,
                kind = %pending.kind,
                "Published snapshot was never confirmed in the catalog"
            );
        }

        info!(
            entries = state.entries_processed,
            last_snapshot = ?state.last_snapshot_id,
            pending_syncs = state.pending_syncs.len(),
            "Recovery complete"
        );

        Ok(state)
    }

    /// Fold one entry into the state.
    pub fn apply(&mut self, entry: TransactionEntry) {
        self.entries_processed += 1;

        match entry {
            TransactionEntry::CommitPublished {
                dataset,
                table_location,
                snapshot_id,
                kind,
                ..
            } => {
                self.commits_published += 1;
                self.last_snapshot_id = Some(snapshot_id);

                let already_synced = self
                    .synced
                    .get(&dataset)
                    .map(|synced| *synced >= snapshot_id)
                    .unwrap_or(false);
                let newer_pending = self
                    .pending_syncs
                    .get(&dataset)
                    .map(|p| p.snapshot_id > snapshot_id)
                    .unwrap_or(false);

                if !already_synced && !newer_pending {
                    self.pending_syncs.insert(
                        dataset.clone(),
                        PendingSync {
                            dataset,
                            table_location,
                            snapshot_id,
                            kind,
                        },
                    );
                }
            }

            TransactionEntry::CommitSkipped { .. } => {
                self.commits_skipped += 1;
            }

            TransactionEntry::CatalogSynced {
                dataset,
                snapshot_id,
                ..
            } => {
                let covered = self
                    .pending_syncs
                    .get(&dataset)
                    .map(|p| p.snapshot_id <= snapshot_id)
                    .unwrap_or(false);
                if covered {
                    self.pending_syncs.remove(&dataset);
                }
                let synced = self.synced.entry(dataset).or_insert(snapshot_id);
                *synced = (*synced).max(snapshot_id);
            }

            TransactionEntry::CatalogSyncFailed { .. } => {
                self.failed_syncs += 1;
            }

            TransactionEntry::SnapshotsExpired { snapshot_ids, .. } => {
                self.snapshots_expired += snapshot_ids.len() as u64;
            }

            TransactionEntry::OrphansRemoved { files_deleted, .. } => {
                self.orphans_removed += files_deleted as u64;
            }

            TransactionEntry::Checkpoint {
                last_snapshot_id,
                pending_syncs,
                ..
            } => {
                if last_snapshot_id.is_some() {
                    self.last_snapshot_id = last_snapshot_id;
                }
                self.pending_syncs = pending_syncs
                    .into_iter()
                    .map(|p| (p.dataset.clone(), p))
                    .collect();
            }
        }
    }

    /// Whether some published snapshot still has to reach the catalog.
    pub fn needs_resume(&self) -> bool {
        !self.pending_syncs.is_empty()
    }

    /// Unconfirmed catalog updates, ordered by dataset.
    pub fn pending(&self) -> Vec<PendingSync> {
        self.pending_syncs.values().cloned().collect()
    }

    /// Get a summary of the recovery state for logging.
    pub fn summary(&self) -> RecoverySummary {
        RecoverySummary {
            entries_processed: self.entries_processed,
            last_snapshot_id: self.last_snapshot_id,
            pending_sync_count: self.pending_syncs.len(),
            commits_published: self.commits_published,
            commits_skipped: self.commits_skipped,
            failed_syncs: self.failed_syncs,
        }
    }
}

/// Summary of recovery state for logging/reporting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecoverySummary {
    /// Number of journal entries processed
    pub entries_processed: u64,
    /// Last published snapshot
    pub last_snapshot_id: Option<i64>,
    /// Unconfirmed catalog updates
    pub pending_sync_count: usize,
    /// Commits published
    pub commits_published: u64,
    /// Commits skipped
    pub commits_skipped: u64,
    /// Failed catalog synchronizations
    pub failed_syncs: u64,
}
