//! In-memory centroid cache.
//!
//! Maps cluster id to its current centroid. Loaded wholesale from the
//! shard-0 index table on first access, updated incrementally afterwards,
//! never evicted. An already-loaded cache is not refreshed from storage
//! behind the caller's back (single-writer assumption); `invalidate`
//! forces the next access to reload.
//!
//! Cluster ids are assigned monotonically and never reused, so the
//! ascending-id iteration of the map doubles as insertion order, which
//! fixes the assignment tie-break.

use std::collections::BTreeMap;

use parking_lot::RwLock;
use serde_json::{json, Value};

use crate::error::{Result, StorageError};
use crate::router::ShardRouter;
use crate::storage::Row;
use crate::vector::Vector;

pub struct CentroidCache {
    /// `None` until the first load (or after `invalidate`).
    inner: RwLock<Option<BTreeMap<u32, Vector>>>,
    value_max: f32,
    value_min: f32,
}

impl CentroidCache {
    pub fn new(value_max: f32, value_min: f32) -> Self {
        Self {
            inner: RwLock::new(None),
            value_max,
            value_min,
        }
    }

    /// Full reload from the persisted cluster index when unloaded.
    pub fn ensure_loaded(&self, router: &ShardRouter) -> Result<()> {
        if self.inner.read().is_some() {
            return Ok(());
        }
        let mut guard = self.inner.write();
        if guard.is_none() {
            *guard = Some(self.load(router)?);
        }
        Ok(())
    }

    /// All `(cluster_id, centroid)` pairs in ascending id order.
    pub fn list_all(&self, router: &ShardRouter) -> Result<Vec<(u32, Vector)>> {
        self.ensure_loaded(router)?;
        let guard = self.inner.read();
        let map = guard.as_ref().expect("cache loaded above");
        Ok(map.iter().map(|(id, v)| (*id, v.clone())).collect())
    }

    pub fn get(&self, router: &ShardRouter, cluster_id: u32) -> Result<Option<Vector>> {
        self.ensure_loaded(router)?;
        let guard = self.inner.read();
        Ok(guard
            .as_ref()
            .expect("cache loaded above")
            .get(&cluster_id)
            .cloned())
    }

    /// Number of known clusters.
    pub fn count(&self, router: &ShardRouter) -> Result<usize> {
        self.ensure_loaded(router)?;
        Ok(self.inner.read().as_ref().expect("cache loaded above").len())
    }

    /// O(1) in-memory update. Does not persist; callers persist before or
    /// alongside this call so cache and store cannot diverge on failure.
    ///
    /// A not-yet-loaded cache is left untouched: the next access reloads
    /// from storage, which already holds the persisted value.
    pub fn upsert(&self, cluster_id: u32, centroid: Vector) {
        let mut guard = self.inner.write();
        match guard.as_mut() {
            Some(map) => {
                map.insert(cluster_id, centroid);
            }
            None => {
                tracing::debug!(cluster_id, "upsert before first load, deferring to reload");
            }
        }
    }

    /// Allocate a new cluster for `centroid`.
    ///
    /// The id is the current cluster count (monotonic while clusters are
    /// never removed). The centroid row is persisted to the shard-0 index
    /// table before the in-memory insert, all under the write lock so
    /// concurrent allocations cannot collide on an id.
    pub fn allocate(&self, router: &ShardRouter, centroid: &Vector) -> Result<u32> {
        let mut guard = self.inner.write();
        if guard.is_none() {
            *guard = Some(self.load(router)?);
        }
        let map = guard.as_mut().expect("cache loaded above");

        let cluster_id = map.len() as u32;
        let mut row = Row::new();
        row.insert("cluster_id".into(), json!(cluster_id));
        row.insert("vector".into(), json!(centroid.encode()?));
        router.index_shard()?.insert(router.index_table(), row)?;

        map.insert(cluster_id, centroid.clone());
        Ok(cluster_id)
    }

    /// Drop the in-memory map; the next access performs a full reload.
    pub fn invalidate(&self) {
        *self.inner.write() = None;
    }

    fn load(&self, router: &ShardRouter) -> Result<BTreeMap<u32, Vector>> {
        let table = router.index_table();
        let rows = router.index_shard()?.select_all(table)?;
        let mut map = BTreeMap::new();
        for row in rows {
            let cluster_id = row
                .get("cluster_id")
                .and_then(Value::as_i64)
                .ok_or_else(|| StorageError::MissingColumn {
                    table: table.to_string(),
                    column: "cluster_id".to_string(),
                })? as u32;
            let encoded = row
                .get("vector")
                .and_then(Value::as_str)
                .ok_or_else(|| StorageError::MissingColumn {
                    table: table.to_string(),
                    column: "vector".to_string(),
                })?;
            let centroid = Vector::decode(encoded, self.value_max, self.value_min)?;
            map.insert(cluster_id, centroid);
        }
        tracing::debug!(clusters = map.len(), "loaded centroid cache");
        Ok(map)
    }
}
