//! Prometheus metrics export.

use crate::{Error, ErrorKind, Result};
use prometheus::{
    Encoder, Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
    TextEncoder,
};
use std::time::Duration;

/// Commit duration bucket boundaries in seconds.
const COMMIT_DURATION_BUCKETS: [f64; 8] = [0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 10.0];

/// Error labels for `snapline_errors_total`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorType {
    /// Lost storage or catalog races
    ConcurrentModification,
    /// Rejected requests
    Validation,
    /// Structural changes without defined semantics
    UnsupportedOperation,
    /// Storage, I/O and configuration failures
    Infrastructure,
}

impl ErrorType {
    /// Get the label value for Prometheus export.
    pub fn as_label(&self) -> &'static str {
        self.kind().as_label()
    }

    fn kind(&self) -> ErrorKind {
        match self {
            ErrorType::ConcurrentModification => ErrorKind::ConcurrentModification,
            ErrorType::Validation => ErrorKind::Validation,
            ErrorType::UnsupportedOperation => ErrorKind::UnsupportedOperation,
            ErrorType::Infrastructure => ErrorKind::Infrastructure,
        }
    }
}

impl From<ErrorKind> for ErrorType {
    fn from(kind: ErrorKind) -> Self {
        match kind {
            ErrorKind::ConcurrentModification => ErrorType::ConcurrentModification,
            ErrorKind::Validation => ErrorType::Validation,
            ErrorKind::UnsupportedOperation => ErrorType::UnsupportedOperation,
            ErrorKind::Infrastructure => ErrorType::Infrastructure,
        }
    }
}

/// Counters, gauges and histograms for commits, retention and catalog sync.
///
/// Every collector lives in its own [`Registry`]; two instances never share
/// counts.
pub struct CommitMetrics {
    registry: Registry,

    // === COUNTERS ===
    commits_total: IntCounter,
    commits_skipped_total: IntCounter,
    commit_conflicts_total: IntCounter,
    snapshots_expired_total: IntCounter,
    orphan_files_deleted_total: IntCounter,
    catalog_sync_retries_total: IntCounter,
    catalog_sync_failures_total: IntCounter,
    errors_total: IntCounterVec,

    // === GAUGES ===
    snapshots_total: IntGauge,

    // === HISTOGRAMS ===
    commit_duration_seconds: Histogram,
}

impl CommitMetrics {
    /// Create metrics with the default `snapline` prefix.
    pub fn new() -> Self {
        Self::build("snapline").expect("default metric names are valid")
    }

    /// Create metrics whose names start with `prefix`.
    ///
    /// Fails when `prefix` is not a valid Prometheus metric name prefix.
    pub fn with_prefix(prefix: &str) -> Result<Self> {
        Self::build(prefix).map_err(|e| Error::Config(format!("metrics prefix {prefix:?}: {e}")))
    }

    fn build(prefix: &str) -> prometheus::Result<Self> {
        let registry = Registry::new();

        let counter = |name: &str, help: &str| -> prometheus::Result<IntCounter> {
            let counter = IntCounter::new(format!("{prefix}_{name}"), help)?;
            registry.register(Box::new(counter.clone()))?;
            Ok(counter)
        };

        let commits_total = counter("commits_total", "Snapshots published by commits")?;
        let commits_skipped_total = counter(
            "commits_skipped_total",
            "Commits skipped because the change set was already applied",
        )?;
        let commit_conflicts_total = counter(
            "commit_conflicts_total",
            "Lost metadata pointer swaps and rejected change sets",
        )?;
        let snapshots_expired_total =
            counter("snapshots_expired_total", "Snapshots removed by retention")?;
        let orphan_files_deleted_total = counter(
            "orphan_files_deleted_total",
            "Files deleted by retention and orphan sweeps",
        )?;
        let catalog_sync_retries_total = counter(
            "catalog_sync_retries_total",
            "Catalog update attempts beyond the first",
        )?;
        let catalog_sync_failures_total = counter(
            "catalog_sync_failures_total",
            "Catalog synchronizations that gave up",
        )?;

        let errors_total = IntCounterVec::new(
            Opts::new(format!("{prefix}_errors_total"), "Errors by kind"),
            &["kind"],
        )?;
        registry.register(Box::new(errors_total.clone()))?;

        let snapshots_total = IntGauge::new(
            format!("{prefix}_snapshots_total"),
            "Snapshots currently retained in table metadata",
        )?;
        registry.register(Box::new(snapshots_total.clone()))?;

        let commit_duration_seconds = Histogram::with_opts(
            HistogramOpts::new(
                format!("{prefix}_commit_duration_seconds"),
                "Wall time of commit() including CAS retries",
            )
            .buckets(COMMIT_DURATION_BUCKETS.to_vec()),
        )?;
        registry.register(Box::new(commit_duration_seconds.clone()))?;

        Ok(Self {
            registry,
            commits_total,
            commits_skipped_total,
            commit_conflicts_total,
            snapshots_expired_total,
            orphan_files_deleted_total,
            catalog_sync_retries_total,
            catalog_sync_failures_total,
            errors_total,
            snapshots_total,
            commit_duration_seconds,
        })
    }

    // === RECORDING ===

    /// Record a published snapshot.
    pub fn record_commit(&self, duration: Duration) {
        self.commits_total.inc();
        self.commit_duration_seconds.observe(duration.as_secs_f64());
    }

    /// Record a commit that found its change set already applied.
    pub fn record_skipped(&self) {
        self.commits_skipped_total.inc();
    }

    /// Record lost pointer swaps or a rejected change set.
    pub fn record_conflicts(&self, count: u64) {
        self.commit_conflicts_total.inc_by(count);
    }

    /// Record snapshots removed by a retention pass.
    pub fn record_expired(&self, snapshots: usize) {
        self.snapshots_expired_total.inc_by(snapshots as u64);
    }

    /// Record files deleted by retention or an orphan sweep.
    pub fn record_files_deleted(&self, files: usize) {
        self.orphan_files_deleted_total.inc_by(files as u64);
    }

    /// Record catalog update retries.
    pub fn record_sync_retries(&self, retries: u32) {
        self.catalog_sync_retries_total.inc_by(u64::from(retries));
    }

    /// Record a catalog synchronization that gave up.
    pub fn record_sync_failure(&self) {
        self.catalog_sync_failures_total.inc();
    }

    /// Record an error under its kind label.
    pub fn record_error(&self, error_type: ErrorType) {
        self.errors_total
            .with_label_values(&[error_type.as_label()])
            .inc();
    }

    /// Update the retained snapshot count.
    pub fn set_snapshots_total(&self, count: usize) {
        self.snapshots_total
            .set(i64::try_from(count).unwrap_or(i64::MAX));
    }

    // === GETTERS ===

    /// Snapshots published.
    pub fn commits_total(&self) -> u64 {
        self.commits_total.get()
    }

    /// Commits skipped as already applied.
    pub fn commits_skipped_total(&self) -> u64 {
        self.commits_skipped_total.get()
    }

    /// Conflicts observed.
    pub fn commit_conflicts_total(&self) -> u64 {
        self.commit_conflicts_total.get()
    }

    /// Snapshots expired.
    pub fn snapshots_expired_total(&self) -> u64 {
        self.snapshots_expired_total.get()
    }

    /// Files deleted by maintenance.
    pub fn orphan_files_deleted_total(&self) -> u64 {
        self.orphan_files_deleted_total.get()
    }

    /// Catalog retries.
    pub fn catalog_sync_retries_total(&self) -> u64 {
        self.catalog_sync_retries_total.get()
    }

    /// Catalog sync failures.
    pub fn catalog_sync_failures_total(&self) -> u64 {
        self.catalog_sync_failures_total.get()
    }

    /// Errors recorded under `error_type`.
    pub fn errors_by_type(&self, error_type: ErrorType) -> u64 {
        self.errors_total
            .with_label_values(&[error_type.as_label()])
            .get()
    }

    /// Retained snapshot count.
    pub fn snapshots_total(&self) -> i64 {
        self.snapshots_total.get()
    }

    /// Number of commit duration observations.
    pub fn commit_duration_count(&self) -> u64 {
        self.commit_duration_seconds.get_sample_count()
    }

    /// The registry holding every collector.
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Export metrics in Prometheus text exposition format.
    ///
    /// # Example
    ///
    /// ```
    /// use snapline_core::metrics::CommitMetrics;
    ///
    /// let metrics = CommitMetrics::new();
    /// metrics.record_skipped();
    /// let text = metrics.export_prometheus_text();
    /// assert!(text.contains("snapline_commits_skipped_total 1"));
    /// ```
    pub fn export_prometheus_text(&self) -> String {
        let mut buffer = Vec::with_capacity(4096);
        if let Err(e) = TextEncoder::new().encode(&self.registry.gather(), &mut buffer) {
            tracing::warn!(error = %e, "Failed to encode metrics");
            return String::new();
        }
        String::from_utf8(buffer).unwrap_or_default()
    }
}

impl Default for CommitMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for CommitMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommitMetrics")
            .field("commits_total", &self.commits_total())
            .field("snapshots_total", &self.snapshots_total())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters() {
        let metrics = CommitMetrics::new();

        metrics.record_commit(Duration::from_millis(20));
        metrics.record_commit(Duration::from_millis(300));
        assert_eq!(metrics.commits_total(), 2);
        assert_eq!(metrics.commit_duration_count(), 2);

        metrics.record_skipped();
        metrics.record_conflicts(3);
        metrics.record_expired(15);
        metrics.record_files_deleted(40);
        metrics.record_sync_retries(2);
        metrics.record_sync_failure();

        assert_eq!(metrics.commits_skipped_total(), 1);
        assert_eq!(metrics.commit_conflicts_total(), 3);
        assert_eq!(metrics.snapshots_expired_total(), 15);
        assert_eq!(metrics.orphan_files_deleted_total(), 40);
        assert_eq!(metrics.catalog_sync_retries_total(), 2);
        assert_eq!(metrics.catalog_sync_failures_total(), 1);
    }

    #[test]
    fn test_gauge_and_errors() {
        let metrics = CommitMetrics::default();
        metrics.set_snapshots_total(27);
        assert_eq!(metrics.snapshots_total(), 27);
        metrics.set_snapshots_total(12);
        assert_eq!(metrics.snapshots_total(), 12);

        metrics.record_error(ErrorKind::ConcurrentModification.into());
        metrics.record_error(ErrorType::ConcurrentModification);
        metrics.record_error(ErrorType::Validation);
        assert_eq!(metrics.errors_by_type(ErrorType::ConcurrentModification), 2);
        assert_eq!(metrics.errors_by_type(ErrorType::Validation), 1);
        assert_eq!(metrics.errors_by_type(ErrorType::Infrastructure), 0);
    }

    #[test]
    fn test_prometheus_text_export() {
        let metrics = CommitMetrics::new();
        metrics.record_commit(Duration::from_millis(40));
        metrics.set_snapshots_total(3);
        metrics.record_error(ErrorType::Infrastructure);

        let text = metrics.export_prometheus_text();
        assert!(text.contains("# TYPE snapline_commits_total counter"));
        assert!(text.contains("snapline_commits_total 1"));
        assert!(text.contains("# TYPE snapline_snapshots_total gauge"));
        assert!(text.contains("snapline_snapshots_total 3"));
        assert!(text.contains("snapline_errors_total{kind=\"infrastructure\"} 1"));
        assert!(text.contains("snapline_commit_duration_seconds_bucket{le=\"0.05\"} 1"));
        assert!(text.contains("snapline_commit_duration_seconds_count 1"));
    }

    #[test]
    fn test_prometheus_text_export_with_prefix() {
        let metrics = CommitMetrics::with_prefix("lake").unwrap();
        metrics.record_expired(4);
        let text = metrics.export_prometheus_text();
        assert!(text.contains("lake_snapshots_expired_total 4"));
        assert!(!text.contains("snapline_"));

        assert!(CommitMetrics::with_prefix("not a prefix").is_err());
    }

    #[test]
    fn test_independent_registries() {
        let a = CommitMetrics::new();
        let b = CommitMetrics::new();
        a.record_skipped();
        assert_eq!(a.commits_skipped_total(), 1);
        assert_eq!(b.commits_skipped_total(), 0);
    }
}
