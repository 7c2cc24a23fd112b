//! Tag-conditioned catalog synchronization with bounded retry.
//!
//! Synchronization never undoes the storage-level commit. When it gives up,
//! the snapshot stays published and the caller can resume later.

use super::client::{DatasetState, ExternalCatalog};
use crate::config::CatalogSyncConfig;
use crate::{CatalogError, Error, Result};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Retry policy for catalog synchronization.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retry on tag mismatch and transport failures
    pub enabled: bool,
    /// Attempts per synchronization, including the first
    pub max_attempts: u32,
    /// Base delay for exponential backoff (milliseconds)
    pub base_delay_ms: u64,
    /// Maximum delay for exponential backoff (milliseconds)
    pub max_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&CatalogSyncConfig::default())
    }
}

impl From<&CatalogSyncConfig> for RetryPolicy {
    fn from(config: &CatalogSyncConfig) -> Self {
        Self {
            enabled: config.retry_enabled,
            max_attempts: config.max_attempts,
            base_delay_ms: config.retry_base_delay_ms,
            max_delay_ms: config.retry_max_delay_ms,
        }
    }
}

impl RetryPolicy {
    /// A policy that tries exactly once.
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::default()
        }
    }

    /// Attempts allowed by this policy.
    pub fn attempts(&self) -> u32 {
        if self.enabled {
            self.max_attempts.max(1)
        } else {
            1
        }
    }

    /// Delay before retry number `retry` (1-based).
    pub fn backoff(&self, retry: u32) -> Duration {
        let delay_ms = self.base_delay_ms * 2_u64.pow(retry.saturating_sub(1).min(20));
        Duration::from_millis(delay_ms.min(self.max_delay_ms))
    }
}

/// What a synchronization did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncOutcome {
    /// The catalog now points at the snapshot
    Updated {
        /// New dataset tag
        tag: String,
    },
    /// The catalog already pointed at the snapshot
    AlreadyCurrent,
    /// The catalog points at a newer snapshot and was left alone
    Superseded {
        /// Snapshot the catalog points at
        catalog_snapshot_id: i64,
    },
}

/// Result of a successful synchronization.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncReport {
    /// Dataset path
    pub dataset: String,
    /// Snapshot that was synchronized
    pub snapshot_id: i64,
    /// Attempts used
    pub attempts: u32,
    /// What happened
    pub outcome: SyncOutcome,
}

impl SyncReport {
    /// Tag the catalog holds after the sync, when it was written.
    pub fn tag(&self) -> Option<&str> {
        match &self.outcome {
            SyncOutcome::Updated { tag } => Some(tag),
            _ => None,
        }
    }

    /// Retries used beyond the first attempt.
    pub fn retries(&self) -> u32 {
        self.attempts.saturating_sub(1)
    }
}

/// Mirrors published snapshots into an external catalog.
pub struct CatalogSynchronizer {
    catalog: Arc<dyn ExternalCatalog>,
    policy: RetryPolicy,
}

impl CatalogSynchronizer {
    /// Create a synchronizer.
    pub fn new(catalog: Arc<dyn ExternalCatalog>, policy: RetryPolicy) -> Self {
        Self { catalog, policy }
    }

    /// Retry policy in effect.
    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Same catalog, different policy.
    pub fn with_policy(&self, policy: RetryPolicy) -> Self {
        Self {
            catalog: Arc::clone(&self.catalog),
            policy,
        }
    }

    /// Point `dataset` at `state`.
    ///
    /// Reads the tag, writes conditioned on it, and on a tag mismatch or
    /// transport failure re-reads and retries within the policy. A transport
    /// abort is returned immediately. Exhaustion surfaces as
    /// [`CatalogError::SyncExhausted`].
    pub async fn sync(&self, dataset: &str, state: &DatasetState) -> Result<SyncReport> {
        let max_attempts = self.policy.attempts();
        let mut last_error = String::new();

        for attempt in 1..=max_attempts {
            if attempt > 1 {
                let delay = self.policy.backoff(attempt - 1);
                debug!(
                    dataset = %dataset,
                    attempt = attempt,
                    delay_ms = delay.as_millis() as u64,
                    "Retrying catalog sync"
                );
                tokio::time::sleep(delay).await;
            }

            let expected_tag = match self.catalog.get_dataset(dataset).await {
                Ok(record) => match record.snapshot_id {
                    Some(id) if id == state.snapshot_id => {
                        debug!(dataset = %dataset, snapshot_id = id, "Catalog already current");
                        return Ok(self.report(dataset, state, attempt, SyncOutcome::AlreadyCurrent));
                    }
                    Some(id) if id > state.snapshot_id => {
                        info!(
                            dataset = %dataset,
                            snapshot_id = state.snapshot_id,
                            catalog_snapshot_id = id,
                            "Catalog already points at a newer snapshot"
                        );
                        return Ok(self.report(
                            dataset,
                            state,
                            attempt,
                            SyncOutcome::Superseded {
                                catalog_snapshot_id: id,
                            },
                        ));
                    }
                    _ => Some(record.tag),
                },
                Err(Error::Catalog(CatalogError::DatasetNotFound(_))) => None,
                Err(Error::Catalog(e)) if e.is_retryable() => {
                    warn!(dataset = %dataset, attempt = attempt, error = %e, "Catalog read failed");
                    last_error = e.to_string();
                    continue;
                }
                Err(e) => return Err(self.terminal(dataset, e)),
            };

            match self
                .catalog
                .update_dataset(dataset, expected_tag.as_deref(), state)
                .await
            {
                Ok(tag) => {
                    info!(
                        catalog = %self.catalog.name(),
                        dataset = %dataset,
                        snapshot_id = state.snapshot_id,
                        tag = %tag,
                        attempts = attempt,
                        "Catalog synchronized"
                    );
                    return Ok(self.report(dataset, state, attempt, SyncOutcome::Updated { tag }));
                }
                Err(Error::Catalog(e)) if e.is_retryable() => {
                    warn!(dataset = %dataset, attempt = attempt, error = %e, "Catalog update failed");
                    last_error = e.to_string();
                }
                Err(e) => return Err(self.terminal(dataset, e)),
            }
        }

        warn!(
            dataset = %dataset,
            snapshot_id = state.snapshot_id,
            attempts = max_attempts,
            retry_enabled = self.policy.enabled,
            "Catalog sync retries exhausted"
        );
        Err(CatalogError::SyncExhausted {
            dataset: dataset.to_string(),
            snapshot_id: Some(state.snapshot_id),
            attempts: max_attempts,
            last_error,
        }
        .into())
    }

    fn report(&self, dataset: &str, state: &DatasetState, attempts: u32, outcome: SyncOutcome) -> SyncReport {
        SyncReport {
            dataset: dataset.to_string(),
            snapshot_id: state.snapshot_id,
            attempts,
            outcome,
        }
    }

    fn terminal(&self, dataset: &str, error: Error) -> Error {
        warn!(dataset = %dataset, error = %error, "Catalog sync aborted");
        error
    }
}
