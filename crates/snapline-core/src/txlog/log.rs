//! Append-only commit journal.

use super::entries::TransactionEntry;
use super::recovery::RecoveryState;
use crate::config::TransactionLogConfig;
use crate::{Error, Result, TransactionLogError};
use chrono::Utc;
use parking_lot::Mutex;
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, info, warn};
use uuid::Uuid;

const LOG_PREFIX: &str = "journal-";
const LOG_EXTENSION: &str = "jsonl";

/// Append-only JSON-lines journal with checkpointing and rotation.
///
/// Files are named so that lexical order is creation order. A checkpoint is
/// written as the first entry of a freshly rotated file and carries every
/// unconfirmed catalog update, so older files can be removed without losing
/// recovery state.
pub struct TransactionLog {
    config: TransactionLogConfig,
    current_file: Mutex<BufWriter<File>>,
    current_path: Mutex<PathBuf>,
    entries_since_checkpoint: AtomicU64,
    state: Mutex<RecoveryState>,
}

impl TransactionLog {
    /// Open the journal directory and start a new journal file.
    ///
    /// Existing files are replayed so checkpoints keep tracking updates
    /// recorded before the restart.
    pub fn open(config: TransactionLogConfig) -> Result<Self> {
        fs::create_dir_all(&config.log_dir).map_err(|e| {
            write_failed(format!("Failed to create log directory: {}", e))
        })?;

        let mut state = RecoveryState::default();
        for entry in read_entries(&config.log_dir)? {
            state.apply(entry);
        }

        let log_path = new_log_path(&config.log_dir);
        let file = open_append(&log_path)?;

        info!(
            path = %log_path.display(),
            replayed = state.entries_processed,
            pending_syncs = state.pending_syncs.len(),
            "Transaction log opened"
        );

        Ok(Self {
            config,
            current_file: Mutex::new(BufWriter::new(file)),
            current_path: Mutex::new(log_path),
            entries_since_checkpoint: AtomicU64::new(0),
            state: Mutex::new(state),
        })
    }

    /// Append an entry to the journal.
    pub fn append(&self, entry: TransactionEntry) -> Result<()> {
        let json = serde_json::to_string(&entry)?;

        {
            let mut file = self.current_file.lock();
            writeln!(file, "{}", json)
                .map_err(|e| write_failed(e.to_string()))?;
            file.flush().map_err(|e| write_failed(e.to_string()))?;
        }

        self.state.lock().apply(entry);

        let count = self.entries_since_checkpoint.fetch_add(1, Ordering::SeqCst) + 1;
        if count >= self.config.checkpoint_interval_entries as u64 {
            self.create_checkpoint()?;
        }

        Ok(())
    }

    /// Rotate, then record the tracked state as the first entry of the new
    /// file.
    fn create_checkpoint(&self) -> Result<()> {
        let checkpoint_id = Uuid::new_v4().to_string();
        let entries_count = self.entries_since_checkpoint.load(Ordering::SeqCst);

        self.rotate_log_file()?;

        let checkpoint_entry = {
            let state = self.state.lock();
            TransactionEntry::Checkpoint {
                checkpoint_id: checkpoint_id.clone(),
                last_snapshot_id: state.last_snapshot_id,
                pending_syncs: state.pending_syncs.values().cloned().collect(),
                entries_since_last: entries_count,
                timestamp: Utc::now(),
            }
        };

        let json = serde_json::to_string(&checkpoint_entry)?;
        {
            let mut file = self.current_file.lock();
            writeln!(file, "{}", json).map_err(|e| {
                Error::TransactionLog(TransactionLogError::CheckpointFailed(e.to_string()))
            })?;
            file.flush().map_err(|e| {
                Error::TransactionLog(TransactionLogError::CheckpointFailed(e.to_string()))
            })?;
        }

        self.entries_since_checkpoint.store(0, Ordering::SeqCst);
        self.cleanup_old_files()?;

        info!(
            checkpoint_id = %checkpoint_id,
            entries = entries_count,
            "Transaction log checkpoint created"
        );

        Ok(())
    }

    fn rotate_log_file(&self) -> Result<()> {
        let new_path = new_log_path(&self.config.log_dir);
        let new_file = open_append(&new_path)?;

        let mut current_file = self.current_file.lock();
        let mut current_path = self.current_path.lock();

        current_file
            .flush()
            .map_err(|e| write_failed(format!("Failed to flush before rotation: {}", e)))?;
        current_file
            .get_ref()
            .sync_all()
            .map_err(|e| write_failed(format!("Failed to fsync before rotation: {}", e)))?;

        let old_path = std::mem::replace(&mut *current_path, new_path);
        *current_file = BufWriter::new(new_file);

        debug!(old_path = %old_path.display(), "Transaction log rotated to new file");
        Ok(())
    }

    fn cleanup_old_files(&self) -> Result<()> {
        let mut log_files = list_log_files(&self.config.log_dir)?;
        let current_path = self.current_path.lock().clone();
        let keep = self.config.max_log_files.max(1);

        while log_files.len() > keep {
            let path = log_files.remove(0);
            if path == current_path {
                break;
            }
            match fs::remove_file(&path) {
                Ok(()) => debug!(path = %path.display(), "Removed old transaction log file"),
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Failed to remove old log file")
                }
            }
        }

        Ok(())
    }

    /// Read all entries from all journal files, oldest first.
    pub fn read_all_entries(&self) -> Result<Vec<TransactionEntry>> {
        self.current_file
            .lock()
            .flush()
            .map_err(|e| write_failed(e.to_string()))?;
        let entries = read_entries(&self.config.log_dir)?;
        debug!(entries = entries.len(), "Read transaction log entries");
        Ok(entries)
    }

    /// Snapshot of the tracked state.
    pub fn state(&self) -> RecoveryState {
        self.state.lock().clone()
    }

    /// Get the path to the current log file.
    pub fn current_path(&self) -> PathBuf {
        self.current_path.lock().clone()
    }

    /// Get the number of entries since last checkpoint.
    pub fn entries_since_checkpoint(&self) -> u64 {
        self.entries_since_checkpoint.load(Ordering::SeqCst)
    }

    /// Force a checkpoint immediately.
    pub fn force_checkpoint(&self) -> Result<()> {
        if self.entries_since_checkpoint() == 0 {
            debug!("No entries to checkpoint, skipping");
            return Ok(());
        }
        self.create_checkpoint()
    }

    /// Sync all pending writes to disk.
    pub fn sync(&self) -> Result<()> {
        let mut file = self.current_file.lock();
        file.flush()
            .map_err(|e| write_failed(format!("Failed to flush: {}", e)))?;
        file.get_ref()
            .sync_all()
            .map_err(|e| write_failed(format!("Failed to sync: {}", e)))?;
        Ok(())
    }
}

fn write_failed(message: String) -> Error {
    Error::TransactionLog(TransactionLogError::WriteFailed(message))
}

fn new_log_path(dir: &Path) -> PathBuf {
    let nanos = Utc::now().timestamp_nanos_opt().unwrap_or_default();
    let suffix = Uuid::new_v4().simple().to_string();
    dir.join(format!(
        "{LOG_PREFIX}{nanos:020}-{}.{LOG_EXTENSION}",
        &suffix[..8]
    ))
}

fn open_append(path: &Path) -> Result<File> {
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|e| write_failed(format!("Failed to open log file: {}", e)))
}

fn list_log_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut files: Vec<PathBuf> = fs::read_dir(dir)
        .map_err(|e| {
            Error::TransactionLog(TransactionLogError::RecoveryFailed(format!(
                "Failed to read log directory: {}",
                e
            )))
        })?
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| {
            p.extension().map(|ext| ext == LOG_EXTENSION).unwrap_or(false)
                && p.file_name()
                    .and_then(|n| n.to_str())
                    .map(|n| n.starts_with(LOG_PREFIX))
                    .unwrap_or(false)
        })
        .collect();
    files.sort();
    Ok(files)
}

fn read_entries(dir: &Path) -> Result<Vec<TransactionEntry>> {
    let mut entries = Vec::new();

    for path in list_log_files(dir)? {
        let file = File::open(&path).map_err(|e| {
            Error::TransactionLog(TransactionLogError::RecoveryFailed(format!(
                "Failed to open log file {}: {}",
                path.display(),
                e
            )))
        })?;

        for (line_num, line) in BufReader::new(file).lines().enumerate() {
            let line = line.map_err(|e| {
                Error::TransactionLog(TransactionLogError::Corrupted {
                    line: line_num as u64 + 1,
                    message: e.to_string(),
                })
            })?;
            if line.trim().is_empty() {
                continue;
            }
            let entry: TransactionEntry = serde_json::from_str(&line).map_err(|e| {
                Error::TransactionLog(TransactionLogError::Corrupted {
                    line: line_num as u64 + 1,
                    message: format!("JSON parse error in {}: {}", path.display(), e),
                })
            })?;
            entries.push(entry);
        }
    }

    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::CommitKind;
    use tempfile::TempDir;

    fn create_test_config(checkpoint_interval_entries: usize) -> (TransactionLogConfig, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let config = TransactionLogConfig {
            enabled: true,
            log_dir: temp_dir.path().to_path_buf(),
            checkpoint_interval_entries,
            max_log_files: 2,
        };
        (config, temp_dir)
    }

    fn published(snapshot_id: i64) -> TransactionEntry {
        TransactionEntry::CommitPublished {
            dataset: "events".into(),
            table_location: "memory://events".into(),
            snapshot_id,
            parent_snapshot_id: None,
            kind: CommitKind::IncrementalRefresh,
            metadata_version: snapshot_id as u64 + 1,
            added_files: 1,
            deleted_files: 0,
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn test_transaction_log_append() {
        let (config, _temp_dir) = create_test_config(100);
        let log = TransactionLog::open(config).unwrap();

        log.append(published(1)).unwrap();

        let entries = log.read_all_entries().unwrap();
        assert_eq!(entries.len(), 1);
        assert!(entries[0].is_commit_published());
        assert_eq!(log.state().pending_syncs.len(), 1);
    }

    #[test]
    fn test_checkpoint_rotates_and_keeps_pending_state() {
        let (config, temp_dir) = create_test_config(3);
        let log = TransactionLog::open(config.clone()).unwrap();

        for id in 1..=7 {
            log.append(published(id)).unwrap();
        }

        let files = list_log_files(temp_dir.path()).unwrap();
        assert!(files.len() <= 2);

        // The oldest files are gone, yet the latest pending update survives
        // through the checkpoint.
        drop(log);
        let reopened = TransactionLog::open(config).unwrap();
        let state = reopened.state();
        assert_eq!(state.last_snapshot_id, Some(7));
        assert_eq!(state.pending_syncs["events"].snapshot_id, 7);
    }

    #[test]
    fn test_force_checkpoint() {
        let (config, _temp_dir) = create_test_config(1000);
        let log = TransactionLog::open(config).unwrap();

        log.force_checkpoint().unwrap();
        assert!(log.read_all_entries().unwrap().is_empty());

        log.append(published(3)).unwrap();
        log.force_checkpoint().unwrap();
        assert_eq!(log.entries_since_checkpoint(), 0);

        let entries = log.read_all_entries().unwrap();
        assert!(entries.last().unwrap().is_checkpoint());
        log.sync().unwrap();
    }

    #[test]
    fn test_corrupted_line_is_reported() {
        let (config, temp_dir) = create_test_config(1000);
        fs::write(
            temp_dir.path().join("journal-00000000000000000001-aaaaaaaa.jsonl"),
            "{not json}\n",
        )
        .unwrap();

        let err = TransactionLog::open(config).err().unwrap();
        assert!(matches!(
            err,
            Error::TransactionLog(TransactionLogError::Corrupted { line: 1, .. })
        ));
    }
}
