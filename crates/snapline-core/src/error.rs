//! Error types for the snapline commit engine.
//!
//! Uses hierarchical domain-specific errors following the thiserror pattern.
//! Every error maps onto one of the caller-facing [`ErrorKind`]s so that
//! callers can decide whether to retry from a fresh base snapshot, change
//! their request, or escalate.

use thiserror::Error;

/// Result type alias for snapline operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Caller-facing failure classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// A conflicting or unresolvable race; retry from a fresh base snapshot.
    ConcurrentModification,
    /// The request itself is invalid and must change before retrying.
    Validation,
    /// The requested structural change has no defined semantics.
    UnsupportedOperation,
    /// Storage, I/O, serialization or configuration failure.
    Infrastructure,
}

impl ErrorKind {
    /// Stable label used in logs and metrics.
    pub fn as_label(&self) -> &'static str {
        match self {
            ErrorKind::ConcurrentModification => "concurrent_modification",
            ErrorKind::Validation => "validation",
            ErrorKind::UnsupportedOperation => "unsupported_operation",
            ErrorKind::Infrastructure => "infrastructure",
        }
    }
}

/// Top-level error type for snapline.
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Commit protocol error
    #[error("Commit error: {0}")]
    Commit(#[from] CommitError),

    /// Schema or partition spec reconciliation error
    #[error("Schema error: {0}")]
    Schema(#[from] SchemaError),

    /// External catalog error
    #[error("Catalog error: {0}")]
    Catalog(#[from] CatalogError),

    /// Commit journal error
    #[error("Transaction log error: {0}")]
    TransactionLog(#[from] TransactionLogError),

    /// Object storage error
    #[error("Storage error: {0}")]
    Storage(String),

    /// A required object is missing from storage
    #[error("Not found: {0}")]
    NotFound(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl Error {
    /// Classify this error for the caller.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Commit(e) => e.kind(),
            Error::Schema(e) => e.kind(),
            Error::Catalog(e) => e.kind(),
            Error::Config(_)
            | Error::TransactionLog(_)
            | Error::Storage(_)
            | Error::NotFound(_)
            | Error::Io(_)
            | Error::Serialization(_) => ErrorKind::Infrastructure,
        }
    }

    /// Whether this error reports a lost race.
    pub fn is_concurrent_modification(&self) -> bool {
        self.kind() == ErrorKind::ConcurrentModification
    }

    /// Whether this error reports an invalid request.
    pub fn is_validation(&self) -> bool {
        self.kind() == ErrorKind::Validation
    }
}

/// Commit protocol errors.
#[derive(Error, Debug)]
pub enum CommitError {
    /// Conflict detection rejected the change set
    #[error(
        "Concurrent modification: base snapshot {base:?}, current snapshot {current:?}: {reason} (conflicting files: {conflicting_paths:?})"
    )]
    ConcurrentModification {
        base: Option<i64>,
        current: Option<i64>,
        conflicting_paths: Vec<String>,
        reason: String,
    },

    /// The metadata pointer moved between read and swap
    #[error("CAS conflict: expected metadata version {expected}, found {actual}")]
    CasConflict { expected: u64, actual: u64 },

    /// CAS retries exhausted
    #[error("Commit retries exhausted after {attempts} attempts (base snapshot {base:?})")]
    RetriesExhausted { attempts: u32, base: Option<i64> },

    /// The base snapshot is no longer part of the table history
    #[error("Base snapshot {0} is not an ancestor of the current snapshot")]
    BaseSnapshotNotInHistory(i64),

    /// Operation not allowed in the current transaction state
    #[error("Invalid transaction state: cannot {operation} while {state}")]
    InvalidState { state: String, operation: String },

    /// A delete target is malformed or disagrees with the live entry
    #[error("Invalid delete of {path}: {reason}")]
    InvalidDelete { path: String, reason: String },

    /// A manifest or data file failed validation
    #[error("Invalid change: {0}")]
    InvalidChange(String),
}

impl CommitError {
    /// Classify this error for the caller.
    pub fn kind(&self) -> ErrorKind {
        match self {
            CommitError::ConcurrentModification { .. }
            | CommitError::CasConflict { .. }
            | CommitError::RetriesExhausted { .. }
            | CommitError::BaseSnapshotNotInHistory(_) => ErrorKind::ConcurrentModification,
            CommitError::InvalidState { .. }
            | CommitError::InvalidDelete { .. }
            | CommitError::InvalidChange(_) => ErrorKind::Validation,
        }
    }
}

/// Schema and partition spec reconciliation errors.
#[derive(Error, Debug)]
pub enum SchemaError {
    /// Type change that is not a safe widening
    #[error("Incompatible type change for {field}: {existing} -> {observed}")]
    IncompatibleType {
        field: String,
        existing: String,
        observed: String,
    },

    /// Optional field made required
    #[error("Field {field} cannot change from optional to required")]
    NullabilityTightened { field: String },

    /// Partition field does not exist in the partition spec
    #[error("Partition field {field} is not part of the partition spec")]
    PartitionFieldMissing { field: String },

    /// Partition source column does not exist in the schema
    #[error("Partition source column {column} does not exist in the schema")]
    PartitionSourceMissing { column: String },

    /// Structural change with no defined semantics
    #[error("Unsupported partition change for {field}: {reason}")]
    UnsupportedPartitionChange { field: String, reason: String },
}

impl SchemaError {
    /// Classify this error for the caller.
    pub fn kind(&self) -> ErrorKind {
        match self {
            SchemaError::UnsupportedPartitionChange { .. } => ErrorKind::UnsupportedOperation,
            _ => ErrorKind::Validation,
        }
    }
}

/// External catalog errors.
#[derive(Error, Debug)]
pub enum CatalogError {
    /// The dataset tag changed since it was read
    #[error("Tag mismatch for {dataset}: expected {expected:?}, found {actual:?}")]
    TagMismatch {
        dataset: String,
        expected: Option<String>,
        actual: Option<String>,
    },

    /// Dataset not registered in the catalog
    #[error("Dataset not found: {0}")]
    DatasetNotFound(String),

    /// Retryable transport failure
    #[error("Catalog transport error: {0}")]
    Transport(String),

    /// Transport-level abort, not retried
    #[error("Catalog request aborted: {0}")]
    Aborted(String),

    /// Synchronization gave up
    #[error(
        "Catalog sync of {dataset} to snapshot {snapshot_id:?} failed after {attempts} attempts: {last_error}"
    )]
    SyncExhausted {
        dataset: String,
        snapshot_id: Option<i64>,
        attempts: u32,
        last_error: String,
    },
}

impl CatalogError {
    /// Classify this error for the caller.
    ///
    /// Lost tag races, exhausted retries and aborts are indistinguishable from
    /// a lost race from the caller's point of view.
    pub fn kind(&self) -> ErrorKind {
        match self {
            CatalogError::TagMismatch { .. }
            | CatalogError::Aborted(_)
            | CatalogError::SyncExhausted { .. } => ErrorKind::ConcurrentModification,
            CatalogError::DatasetNotFound(_) | CatalogError::Transport(_) => {
                ErrorKind::Infrastructure
            }
        }
    }

    /// Whether the synchronizer may retry after this error.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            CatalogError::TagMismatch { .. } | CatalogError::Transport(_)
        )
    }
}

/// Commit journal errors.
#[derive(Error, Debug)]
pub enum TransactionLogError {
    /// Log corrupted
    #[error("Log corrupted at line {line}: {message}")]
    Corrupted { line: u64, message: String },

    /// Entry write failed
    #[error("Entry write failed: {0}")]
    WriteFailed(String),

    /// Checkpoint failed
    #[error("Checkpoint failed: {0}")]
    CheckpointFailed(String),

    /// Reading the log back failed
    #[error("Recovery failed: {0}")]
    RecoveryFailed(String),
}

// Conversion implementations for external error types

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

impl From<toml::de::Error> for Error {
    fn from(err: toml::de::Error) -> Self {
        Error::Config(err.to_string())
    }
}

impl From<object_store::Error> for Error {
    fn from(err: object_store::Error) -> Self {
        match err {
            object_store::Error::NotFound { path, .. } => Error::NotFound(path),
            other => Error::Storage(other.to_string()),
        }
    }
}
