//! Table maintenance.
//!
//! - **Retention**: expire old snapshots and reclaim the files only they
//!   referenced
//! - **Orphan sweep**: delete files no retained snapshot or metadata version
//!   references

mod orphan;
mod retention;

pub use orphan::{OrphanCandidate, OrphanFileType, OrphanSummary, OrphanSweepResult, OrphanSweeper};
pub use retention::{RetentionManager, RetentionPlan, RetentionResult};
