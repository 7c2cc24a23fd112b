//! Commit journal for resumable catalog propagation.
//!
//! The journal provides:
//! - Append-only JSON-lines logging of commits, syncs and maintenance
//! - Checkpointing that carries unconfirmed catalog updates
//! - Log rotation and cleanup
//! - Recovery of published snapshots that never reached the catalog

mod entries;
mod log;
mod recovery;

pub use entries::{PendingSync, TransactionEntry};
pub use log::TransactionLog;
pub use recovery::{RecoveryState, RecoverySummary};
