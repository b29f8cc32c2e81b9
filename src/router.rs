//! Deterministic shard routing.
//!
//! A cluster's records live on the physical partition
//! `cluster_id % partition`. Shard 0 is reserved to additionally hold the
//! global cluster index table (one centroid row per cluster); every shard
//! holds a vector-record table. Shard instances are opened lazily through
//! the configured factory and their schemas are ensured exactly once.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::config::StoreConfig;
use crate::error::StorageError;
use crate::storage::{Column, ColumnKind, ShardFactory, TableStore};

/// Vector-record table layout, present on every shard.
pub const VECTOR_COLUMNS: &[Column] = &[
    Column::new("id", ColumnKind::PrimaryKey),
    Column::new("cluster_id", ColumnKind::Integer),
    Column::new("vector", ColumnKind::Text),
    Column::new("payload", ColumnKind::Text),
];

/// Cluster index table layout, present on shard 0 only.
pub const INDEX_COLUMNS: &[Column] = &[
    Column::new("cluster_id", ColumnKind::PrimaryKey),
    Column::new("vector", ColumnKind::Text),
];

pub struct ShardRouter {
    partitions: usize,
    index_table: String,
    vector_table: String,
    factory: ShardFactory,
    shards: Mutex<HashMap<usize, Arc<dyn TableStore>>>,
}

impl ShardRouter {
    pub fn new(config: &StoreConfig, factory: ShardFactory) -> Self {
        Self {
            partitions: config.cluster.partition,
            index_table: config.index_table(),
            vector_table: config.vector_table(),
            factory,
            shards: Mutex::new(HashMap::new()),
        }
    }

    #[inline]
    pub fn partitions(&self) -> usize {
        self.partitions
    }

    pub fn index_table(&self) -> &str {
        &self.index_table
    }

    pub fn vector_table(&self) -> &str {
        &self.vector_table
    }

    /// The physical partition holding a cluster's records.
    #[inline]
    pub fn shard_index(&self, cluster_id: u32) -> usize {
        cluster_id as usize % self.partitions
    }

    /// Backing instance for a cluster's shard.
    pub fn shard_for(&self, cluster_id: u32) -> Result<Arc<dyn TableStore>, StorageError> {
        self.open(self.shard_index(cluster_id))
    }

    /// The reserved shard holding the global cluster index.
    pub fn index_shard(&self) -> Result<Arc<dyn TableStore>, StorageError> {
        self.open(0)
    }

    fn open(&self, index: usize) -> Result<Arc<dyn TableStore>, StorageError> {
        let mut shards = self.shards.lock();
        if let Some(store) = shards.get(&index) {
            return Ok(store.clone());
        }

        let store = (self.factory)(index)?;
        store.ensure_schema(&self.vector_table, VECTOR_COLUMNS)?;
        if index == 0 {
            store.ensure_schema(&self.index_table, INDEX_COLUMNS)?;
        }
        tracing::debug!(shard = index, "opened shard");

        shards.insert(index, store.clone());
        Ok(store)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ClusterConfig, DbConfig, VectorConfig};
    use crate::storage::MemoryStore;

    fn config(partition: usize) -> StoreConfig {
        StoreConfig {
            vector: VectorConfig {
                size: 2,
                max: 1.0,
                min: -1.0,
            },
            cluster: ClusterConfig {
                max_distance: 0.4,
                partition,
            },
            db: DbConfig {
                table: "test".into(),
            },
        }
    }

    #[test]
    fn test_shard_index_is_modulo() {
        let router = ShardRouter::new(&config(3), MemoryStore::factory());
        assert_eq!(router.shard_index(0), 0);
        assert_eq!(router.shard_index(1), 1);
        assert_eq!(router.shard_index(2), 2);
        assert_eq!(router.shard_index(7), 1);
    }

    #[test]
    fn test_open_ensures_schemas() {
        let router = ShardRouter::new(&config(2), MemoryStore::factory());

        // Non-reserved shard: vector table only.
        let shard = router.shard_for(1).unwrap();
        assert!(shard.select_all("test_vector").unwrap().is_empty());
        assert!(shard.select_all("test_index").is_err());

        // Reserved shard 0 also carries the index table.
        let index_shard = router.index_shard().unwrap();
        assert!(index_shard.select_all("test_index").unwrap().is_empty());
    }

    #[test]
    fn test_open_caches_instances() {
        let router = ShardRouter::new(&config(2), MemoryStore::factory());
        let first = router.shard_for(0).unwrap();
        let second = router.index_shard().unwrap();
        assert!(Arc::ptr_eq(&first, &second));
    }
}
