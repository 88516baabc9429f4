//! Storage metadata consumed read-only by the merge core.
//!
//! These objects are normally produced by the DDL layer; the merge core
//! never mutates them. Projections carry their own nested metadata, one
//! level deep.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::value::{AggregateFunc, DataType, Value};

/// Physical column description.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ColumnDesc {
    pub name: String,
    pub data_type: DataType,
    /// Explicit default; falls back to the type default when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
    /// Combine function for partial-aggregate state columns. Consulted by
    /// the Aggregating merge discipline.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aggregate_fn: Option<AggregateFunc>,
}

impl ColumnDesc {
    pub fn new(name: impl Into<String>, data_type: DataType) -> Self {
        Self {
            name: name.into(),
            data_type,
            default: None,
            aggregate_fn: None,
        }
    }

    pub fn default_value(&self) -> Value {
        self.default
            .clone()
            .unwrap_or_else(|| Value::default_of(self.data_type))
    }
}

/// A skipping-index description; only its required columns matter to the
/// merge (they are forced into the merging set for the vertical algorithm).
#[derive(Clone, Debug)]
pub struct SecondaryIndexDesc {
    pub name: String,
    pub columns: Vec<String>,
}

/// An approximate-nearest-neighbor index over one vector column.
#[derive(Clone, Debug)]
pub struct VectorIndexDesc {
    pub name: String,
    pub column: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProjectionKind {
    Plain,
    Aggregate,
}

/// A materialized sub-part description. Projections cannot contain
/// projections; their metadata must have an empty `projections` list.
#[derive(Clone, Debug)]
pub struct ProjectionDesc {
    pub name: String,
    pub kind: ProjectionKind,
    pub metadata: Arc<StorageMetadata>,
}

/// `expiry(row) = row[column] + delta_seconds`, compared against the merge
/// timestamp. The column holds seconds since epoch.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TtlExpression {
    pub column: String,
    pub delta_seconds: u64,
}

impl TtlExpression {
    /// Expiry timestamp for one row, `None` when the base cell is null.
    pub fn evaluate(&self, base: &Value) -> Option<u64> {
        base.as_u64().map(|ts| ts.saturating_add(self.delta_seconds))
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct TtlDescription {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub row_ttl: Option<TtlExpression>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub column_ttls: BTreeMap<String, TtlExpression>,
}

impl TtlDescription {
    pub fn has_any(&self) -> bool {
        self.row_ttl.is_some() || !self.column_ttls.is_empty()
    }
}

/// Row-collapsing discipline applied by the k-way merge.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MergeMode {
    Ordinary,
    Collapsing,
    Replacing,
    Summing,
    Aggregating,
    VersionedCollapsing,
    Graphite,
}

/// Graphite retention step: rows older than `age` seconds are bucketed to
/// `precision` seconds.
#[derive(Clone, Debug)]
pub struct GraphiteRetention {
    pub age: u64,
    pub precision: u64,
}

/// One rollup rule; `regexp = None` matches every path.
#[derive(Clone, Debug)]
pub struct GraphitePattern {
    pub regexp: Option<String>,
    pub function: AggregateFunc,
    pub retentions: Vec<GraphiteRetention>,
}

#[derive(Clone, Debug)]
pub struct GraphiteParams {
    pub path_column: String,
    pub time_column: String,
    pub value_column: String,
    pub version_column: String,
    pub patterns: Vec<GraphitePattern>,
}

/// Mode plus the columns the mode consumes.
#[derive(Clone, Debug)]
pub struct MergingParams {
    pub mode: MergeMode,
    pub sign_column: Option<String>,
    pub version_column: Option<String>,
    pub is_deleted_column: Option<String>,
    pub columns_to_sum: Vec<String>,
    pub graphite: Option<GraphiteParams>,
}

impl MergingParams {
    pub fn ordinary() -> Self {
        Self {
            mode: MergeMode::Ordinary,
            sign_column: None,
            version_column: None,
            is_deleted_column: None,
            columns_to_sum: Vec::new(),
            graphite: None,
        }
    }

    pub fn with_mode(mode: MergeMode) -> Self {
        Self {
            mode,
            ..Self::ordinary()
        }
    }
}

/// A read-only snapshot of everything the merge needs to know about the
/// table: columns, ordering, TTLs, indexes and projections.
#[derive(Clone, Debug, Default)]
pub struct StorageMetadata {
    pub columns: Vec<ColumnDesc>,
    /// Sort-key column names, in comparison order.
    pub sort_key: Vec<String>,
    pub partition_key: Vec<String>,
    pub ttl: TtlDescription,
    pub secondary_indices: Vec<SecondaryIndexDesc>,
    pub vector_indices: Vec<VectorIndexDesc>,
    pub projections: Vec<ProjectionDesc>,
}

impl StorageMetadata {
    pub fn column(&self, name: &str) -> Option<&ColumnDesc> {
        self.columns.iter().find(|c| c.name == name)
    }

    pub fn physical_column_names(&self) -> Vec<String> {
        self.columns.iter().map(|c| c.name.clone()).collect()
    }

    pub fn has_any_ttl(&self) -> bool {
        self.ttl.has_any()
    }

    pub fn has_sorting_key(&self) -> bool {
        !self.sort_key.is_empty()
    }
}
