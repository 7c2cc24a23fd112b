//! Partition specs and partition spec edits.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Partition transforms.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Transform {
    /// Identity transform
    Identity,
    /// Year transform
    Year,
    /// Month transform
    Month,
    /// Day transform
    Day,
    /// Hour transform
    Hour,
    /// Bucket transform
    Bucket {
        /// Number of buckets
        num_buckets: u32,
    },
    /// Truncate transform
    Truncate {
        /// Truncation width
        width: u32,
    },
}

impl fmt::Display for Transform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Transform::Identity => f.write_str("identity"),
            Transform::Year => f.write_str("year"),
            Transform::Month => f.write_str("month"),
            Transform::Day => f.write_str("day"),
            Transform::Hour => f.write_str("hour"),
            Transform::Bucket { num_buckets } => write!(f, "bucket[{}]", num_buckets),
            Transform::Truncate { width } => write!(f, "truncate[{}]", width),
        }
    }
}

/// One field of a partition spec.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionField {
    /// Source column name
    pub source_name: String,
    /// Partition field name
    pub name: String,
    /// Transform applied to the source column
    pub transform: Transform,
}

/// A versioned partition spec.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionSpec {
    /// Spec id
    pub spec_id: i32,
    /// Partition fields
    pub fields: Vec<PartitionField>,
}

impl PartitionSpec {
    /// An unpartitioned spec.
    pub fn unpartitioned() -> Self {
        Self::default()
    }

    /// Find a partition field by name.
    pub fn field(&self, name: &str) -> Option<&PartitionField> {
        self.fields.iter().find(|f| f.name == name)
    }

    /// Whether the partition spec has no fields.
    pub fn is_unpartitioned(&self) -> bool {
        self.fields.is_empty()
    }
}

/// A requested partition spec edit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum PartitionSpecUpdate {
    /// Partition by a new field
    AddField {
        /// Source column name
        source_name: String,
        /// Partition field name; derived from source and transform when absent
        #[serde(default)]
        name: Option<String>,
        /// Transform to apply
        transform: Transform,
    },
    /// Stop partitioning by a field
    RemoveField {
        /// Partition field name
        name: String,
    },
    /// Change the transform of an existing partition field
    ReplaceTransform {
        /// Partition field name
        name: String,
        /// New transform
        transform: Transform,
    },
}

impl PartitionSpecUpdate {
    /// Default partition field name for a source column and transform.
    pub fn default_field_name(source_name: &str, transform: &Transform) -> String {
        match transform {
            Transform::Identity => source_name.to_string(),
            Transform::Year => format!("{}_year", source_name),
            Transform::Month => format!("{}_month", source_name),
            Transform::Day => format!("{}_day", source_name),
            Transform::Hour => format!("{}_hour", source_name),
            Transform::Bucket { .. } => format!("{}_bucket", source_name),
            Transform::Truncate { .. } => format!("{}_trunc", source_name),
        }
    }
}
