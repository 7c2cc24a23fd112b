//! Commit engine metrics.

mod prometheus;

pub use self::prometheus::{CommitMetrics, ErrorType};
