//! Store configuration.
//!
//! One validated structure built at store initialization. Invalid
//! combinations are rejected up front instead of surfacing on first use.

use serde::{Deserialize, Serialize};

use crate::error::{Result, StoreError};

/// Top-level store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    pub vector: VectorConfig,
    pub cluster: ClusterConfig,
    pub db: DbConfig,
}

/// Vector shape and declared value bounds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VectorConfig {
    /// Fixed dimension enforced on every inserted or queried vector.
    pub size: usize,
    /// Advisory declared upper bound, stored but not enforced.
    pub max: f32,
    /// Advisory declared lower bound, stored but not enforced.
    pub min: f32,
}

/// Clustering thresholds and physical partitioning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterConfig {
    /// Threshold in `[0, 1]` deciding cluster join vs. new-cluster creation,
    /// and drift-triggered reassignment during centroid maintenance.
    pub max_distance: f32,
    /// Number of physical shards; a cluster lives on shard
    /// `cluster_id % partition`.
    pub partition: usize,
}

/// Logical namespace for the backing tables.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DbConfig {
    pub table: String,
}

impl StoreConfig {
    /// Reject invalid combinations at construction time.
    pub fn validate(&self) -> Result<()> {
        if self.vector.size == 0 {
            return Err(StoreError::InvalidConfig(
                "vector.size must be at least 1".into(),
            ));
        }
        if self.vector.max <= self.vector.min {
            return Err(StoreError::InvalidConfig(format!(
                "vector.max ({}) must exceed vector.min ({})",
                self.vector.max, self.vector.min
            )));
        }
        if !(0.0..=1.0).contains(&self.cluster.max_distance) {
            return Err(StoreError::InvalidConfig(format!(
                "cluster.max_distance ({}) must lie in [0, 1]",
                self.cluster.max_distance
            )));
        }
        if self.cluster.partition == 0 {
            return Err(StoreError::InvalidConfig(
                "cluster.partition must be at least 1".into(),
            ));
        }
        if self.db.table.is_empty()
            || !self
                .db
                .table
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_')
        {
            return Err(StoreError::InvalidConfig(format!(
                "db.table '{}' must be a non-empty identifier",
                self.db.table
            )));
        }
        Ok(())
    }

    /// Name of the shard-0 cluster index table.
    pub fn index_table(&self) -> String {
        format!("{}_index", self.db.table)
    }

    /// Name of the per-shard vector record table.
    pub fn vector_table(&self) -> String {
        format!("{}_vector", self.db.table)
    }
}
