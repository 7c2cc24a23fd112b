//! Conflict detection between a change set and commits that landed after
//! its base snapshot.
//!
//! The detector is pure: the caller loads the intervening commits (current
//! snapshot back to, excluding, the base) and the detector only compares
//! file sets.

use crate::model::{ChangeSet, CommitKind};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use tracing::debug;

/// How a commit kind resolves a race with intervening commits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConflictPolicy {
    /// Skip when an intervening commit of the same kind already applied the
    /// same files; otherwise behave like `ProceedIfDisjoint`.
    SkipIfApplied,
    /// Proceed when no intervening commit touched the same files.
    ProceedIfDisjoint,
    /// Reject on any intervening commit.
    RejectOnRace,
}

impl fmt::Display for ConflictPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConflictPolicy::SkipIfApplied => f.write_str("skip-if-applied"),
            ConflictPolicy::ProceedIfDisjoint => f.write_str("proceed-if-disjoint"),
            ConflictPolicy::RejectOnRace => f.write_str("reject-on-race"),
        }
    }
}

fn default_refresh_policy() -> ConflictPolicy {
    ConflictPolicy::SkipIfApplied
}

fn default_dml_policy() -> ConflictPolicy {
    ConflictPolicy::ProceedIfDisjoint
}

fn default_partial_refresh_policy() -> ConflictPolicy {
    ConflictPolicy::RejectOnRace
}

/// Commit kind to conflict policy mapping.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConflictPolicies {
    /// Policy for incremental refresh
    #[serde(default = "default_refresh_policy")]
    pub incremental_refresh: ConflictPolicy,

    /// Policy for partial refresh
    #[serde(default = "default_partial_refresh_policy")]
    pub partial_refresh: ConflictPolicy,

    /// Policy for DML
    #[serde(default = "default_dml_policy")]
    pub dml: ConflictPolicy,

    /// Policy for full refresh
    #[serde(default = "default_refresh_policy")]
    pub full_refresh: ConflictPolicy,
}

impl Default for ConflictPolicies {
    fn default() -> Self {
        Self {
            incremental_refresh: default_refresh_policy(),
            partial_refresh: default_partial_refresh_policy(),
            dml: default_dml_policy(),
            full_refresh: default_refresh_policy(),
        }
    }
}

impl ConflictPolicies {
    /// Policy for a commit kind.
    pub fn for_kind(&self, kind: CommitKind) -> ConflictPolicy {
        match kind {
            CommitKind::IncrementalRefresh => self.incremental_refresh,
            CommitKind::PartialRefresh => self.partial_refresh,
            CommitKind::Dml => self.dml,
            CommitKind::FullRefresh => self.full_refresh,
        }
    }
}

/// File changes of one commit between the base and the current snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterveningCommit {
    /// Snapshot produced by the commit
    pub snapshot_id: i64,
    /// Kind of the commit
    pub kind: CommitKind,
    /// Paths of files it added
    pub added_paths: BTreeSet<String>,
    /// Paths of files it deleted
    pub deleted_paths: BTreeSet<String>,
}

impl InterveningCommit {
    fn touches(&self, path: &str) -> bool {
        self.added_paths.contains(path) || self.deleted_paths.contains(path)
    }
}

/// Outcome of conflict detection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    /// Apply the change set on top of the current snapshot
    Proceed,
    /// The change set was already applied
    Skip {
        /// Snapshot that already contains the change set
        applied_in: i64,
    },
    /// The change set conflicts with the current state
    Reject {
        /// Why the change set was rejected
        reason: String,
        /// Paths touched by both sides
        conflicting_paths: Vec<String>,
    },
}

/// Classifies a change set against intervening commits.
#[derive(Debug, Clone, Default)]
pub struct ConflictDetector {
    policies: ConflictPolicies,
}

impl ConflictDetector {
    /// Create a detector with the given policies.
    pub fn new(policies: ConflictPolicies) -> Self {
        Self { policies }
    }

    /// Configured policies.
    pub fn policies(&self) -> &ConflictPolicies {
        &self.policies
    }

    /// Classify `changes` of `kind`, opened against `base`, now that the
    /// table is at `current`.
    ///
    /// `intervening` is `None` when `base` is not an ancestor of `current`;
    /// otherwise it lists the commits after `base`, newest first.
    pub fn classify(
        &self,
        base: Option<i64>,
        current: Option<i64>,
        changes: &ChangeSet,
        kind: CommitKind,
        intervening: Option<&[InterveningCommit]>,
    ) -> Decision {
        if base == current {
            return Decision::Proceed;
        }

        let Some(intervening) = intervening else {
            return Decision::Reject {
                reason: format!("base snapshot {:?} is no longer in the table history", base),
                conflicting_paths: Vec::new(),
            };
        };

        let policy = self.policies.for_kind(kind);
        debug!(
            base = ?base,
            current = ?current,
            kind = %kind,
            policy = %policy,
            intervening = intervening.len(),
            "Classifying change set"
        );

        if policy == ConflictPolicy::RejectOnRace && !intervening.is_empty() {
            return Decision::Reject {
                reason: format!(
                    "{} does not tolerate concurrent commits ({} landed since base)",
                    kind,
                    intervening.len()
                ),
                conflicting_paths: Vec::new(),
            };
        }

        let adds = changes.effective_add_paths();
        let deletes: BTreeSet<String> = changes
            .delete_paths()
            .into_iter()
            .map(str::to_string)
            .collect();

        if policy == ConflictPolicy::SkipIfApplied && changes.has_file_changes() {
            if let Some(applied_in) = Self::applied_in(kind, &adds, &deletes, intervening) {
                return Decision::Skip { applied_in };
            }
        }

        let conflicting_paths: Vec<String> = adds
            .iter()
            .chain(deletes.iter())
            .filter(|path| intervening.iter().any(|c| c.touches(path)))
            .cloned()
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();

        if conflicting_paths.is_empty() {
            Decision::Proceed
        } else {
            Decision::Reject {
                reason: format!(
                    "{} file(s) were changed by concurrent commits",
                    conflicting_paths.len()
                ),
                conflicting_paths,
            }
        }
    }

    /// The snapshot that already applied `adds` and `deletes`, if any.
    ///
    /// A single commit of the same kind that covers the whole change set
    /// wins. Otherwise the change set may be spread over several commits of
    /// that kind, and the newest contributing one is reported.
    fn applied_in(
        kind: CommitKind,
        adds: &BTreeSet<String>,
        deletes: &BTreeSet<String>,
        intervening: &[InterveningCommit],
    ) -> Option<i64> {
        let same_kind: Vec<&InterveningCommit> =
            intervening.iter().filter(|c| c.kind == kind).collect();

        if let Some(commit) = same_kind.iter().find(|c| {
            adds.is_subset(&c.added_paths) && deletes.is_subset(&c.deleted_paths)
        }) {
            return Some(commit.snapshot_id);
        }

        let covered = adds
            .iter()
            .all(|p| same_kind.iter().any(|c| c.added_paths.contains(p)))
            && deletes
                .iter()
                .all(|p| same_kind.iter().any(|c| c.deleted_paths.contains(p)));
        if !covered {
            return None;
        }

        same_kind
            .iter()
            .filter(|c| {
                adds.iter().any(|p| c.added_paths.contains(p))
                    || deletes.iter().any(|p| c.deleted_paths.contains(p))
            })
            .map(|c| c.snapshot_id)
            .max()
    }
}
