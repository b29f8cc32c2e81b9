//! The clustering store engine.
//!
//! Ties together cluster assignment, shard routing, the centroid cache
//! and background centroid maintenance behind the public [`ClusterStore`]
//! surface: `make_vector`, `insert` and `query`.
//!
//! One routine decides cluster membership for both inserts and queries,
//! so a query vector far from every existing centroid creates a new,
//! initially empty cluster as a side effect. That is preserved, documented
//! behavior of the assignment path, not an accident.

use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};

use crate::cache::CentroidCache;
use crate::config::StoreConfig;
use crate::error::{Result, StorageError, StoreError};
use crate::maintenance::Maintenance;
use crate::router::ShardRouter;
use crate::storage::{Row, ShardFactory};
use crate::vector::Vector;

/// Default number of results returned by a query.
pub const DEFAULT_QUERY_LIMIT: usize = 10;

/// One ranked query result.
#[derive(Debug, Clone)]
pub struct QueryMatch {
    pub payload: String,
    pub distance: f32,
    pub vector: Vector,
}

/// A snapshot of store shape and maintenance backlog.
#[derive(Debug, Clone)]
pub struct StoreStats {
    pub clusters: usize,
    pub pending_maintenance: usize,
    pub partitions: usize,
}

/// A persisted vector record decoded from its shard.
pub(crate) struct MemberRecord {
    pub(crate) id: i64,
    pub(crate) vector: Vector,
    pub(crate) payload: String,
}

pub(crate) struct StoreInner {
    pub(crate) config: StoreConfig,
    pub(crate) router: ShardRouter,
    pub(crate) cache: CentroidCache,
}

impl StoreInner {
    /// Nearest qualifying cluster for a vector, or a freshly allocated one.
    ///
    /// Linear scan over the cached centroids: a cluster qualifies when its
    /// distance is strictly below the configured maximum AND strictly below
    /// the best seen so far, so ties go to the lowest cluster id. When no
    /// cluster qualifies, a new cluster is created with the vector itself
    /// as centroid.
    pub(crate) fn assign(&self, vector: &Vector) -> Result<u32> {
        let clusters = self.cache.list_all(&self.router)?;

        let mut best: Option<(u32, f32)> = None;
        for (cluster_id, centroid) in &clusters {
            let distance = vector.distance(centroid)?;
            if distance < self.config.cluster.max_distance
                && best.map_or(true, |(_, nearest)| distance < nearest)
            {
                best = Some((*cluster_id, distance));
            }
        }

        if let Some((cluster_id, _)) = best {
            return Ok(cluster_id);
        }

        let cluster_id = self.cache.allocate(&self.router, vector)?;
        tracing::debug!(cluster_id, "created cluster");
        Ok(cluster_id)
    }

    /// Write a vector record into its cluster's shard, returning the
    /// generated record id.
    pub(crate) fn insert_record(
        &self,
        cluster_id: u32,
        vector: &Vector,
        payload: &str,
    ) -> Result<i64> {
        let shard = self.router.shard_for(cluster_id)?;
        let mut row = Row::new();
        row.insert("cluster_id".into(), json!(cluster_id));
        row.insert("vector".into(), json!(vector.encode()?));
        row.insert("payload".into(), json!(payload));
        Ok(shard.insert(self.router.vector_table(), row)?)
    }

    /// All records currently belonging to a cluster, decoded.
    pub(crate) fn cluster_members(&self, cluster_id: u32) -> Result<Vec<MemberRecord>> {
        let table = self.router.vector_table();
        let rows = self
            .router
            .shard_for(cluster_id)?
            .select_where(table, "cluster_id", &json!(cluster_id))?;

        let mut members = Vec::with_capacity(rows.len());
        for row in rows {
            members.push(self.decode_record(&row)?);
        }
        Ok(members)
    }

    fn decode_record(&self, row: &Row) -> Result<MemberRecord> {
        let table = self.router.vector_table();
        let missing = |column: &str| StorageError::MissingColumn {
            table: table.to_string(),
            column: column.to_string(),
        };

        let id = row
            .get("id")
            .and_then(Value::as_i64)
            .ok_or_else(|| missing("id"))?;
        let encoded = row
            .get("vector")
            .and_then(Value::as_str)
            .ok_or_else(|| missing("vector"))?;
        let payload = row
            .get("payload")
            .and_then(Value::as_str)
            .ok_or_else(|| missing("payload"))?;

        Ok(MemberRecord {
            id,
            vector: Vector::decode(encoded, self.config.vector.max, self.config.vector.min)?,
            payload: payload.to_string(),
        })
    }

    fn check_dimension(&self, vector: &Vector) -> Result<()> {
        if vector.dim() != self.config.vector.size {
            return Err(StoreError::DimensionMismatch {
                expected: self.config.vector.size,
                actual: vector.dim(),
            });
        }
        Ok(())
    }
}

/// A cluster-routed vector similarity store.
///
/// Inserted vectors are grouped into clusters by the normalized cosine
/// distance threshold; each cluster's records live on the shard
/// `cluster_id % partition`, and queries scan only the nearest cluster.
/// Centroid upkeep runs on a background worker: `insert` returns before
/// rebalancing finishes, so cluster membership may be transiently
/// inconsistent until the maintenance queue drains.
pub struct ClusterStore {
    inner: Arc<StoreInner>,
    maintenance: Maintenance,
}

impl ClusterStore {
    /// Validate the configuration and open the store over the given shard
    /// factory. Spawns the maintenance worker.
    pub fn open(config: StoreConfig, factory: ShardFactory) -> Result<Self> {
        config.validate()?;
        let router = ShardRouter::new(&config, factory);
        let cache = CentroidCache::new(config.vector.max, config.vector.min);
        let inner = Arc::new(StoreInner {
            config,
            router,
            cache,
        });
        let maintenance = Maintenance::start(inner.clone());
        Ok(Self { inner, maintenance })
    }

    pub fn config(&self) -> &StoreConfig {
        &self.inner.config
    }

    /// Build a vector from raw values, enforcing the configured dimension
    /// and attaching the declared bounds.
    pub fn make_vector(&self, values: Vec<f32>) -> Result<Vector> {
        if values.len() != self.inner.config.vector.size {
            return Err(StoreError::DimensionMismatch {
                expected: self.inner.config.vector.size,
                actual: values.len(),
            });
        }
        Ok(Vector::new(
            values,
            self.inner.config.vector.max,
            self.inner.config.vector.min,
        ))
    }

    /// Insert a payload under its vector. Returns the cluster id the
    /// record was routed to; centroid maintenance for that cluster runs in
    /// the background after this call returns.
    pub fn insert(&self, payload: &str, vector: &Vector) -> Result<u32> {
        self.inner.check_dimension(vector)?;
        let cluster_id = self.inner.assign(vector)?;
        self.inner.insert_record(cluster_id, vector, payload)?;
        self.maintenance.schedule(cluster_id);
        tracing::debug!(cluster_id, "inserted record");
        Ok(cluster_id)
    }

    /// Nearest-neighbor query: route to the nearest cluster, scan its
    /// records, rank ascending by distance, truncate to `limit`.
    ///
    /// Routing reuses the assignment path, so querying a vector far from
    /// every cluster creates a new empty cluster and yields no results.
    pub fn query(&self, vector: &Vector, limit: usize) -> Result<Vec<QueryMatch>> {
        self.inner.check_dimension(vector)?;
        let cluster_id = self.inner.assign(vector)?;

        let members = self.inner.cluster_members(cluster_id)?;
        let mut matches = Vec::with_capacity(members.len());
        for member in members {
            matches.push(QueryMatch {
                distance: vector.distance(&member.vector)?,
                payload: member.payload,
                vector: member.vector,
            });
        }

        matches.sort_by(|a, b| a.distance.total_cmp(&b.distance));
        matches.truncate(limit);
        Ok(matches)
    }

    pub fn stats(&self) -> Result<StoreStats> {
        Ok(StoreStats {
            clusters: self.inner.cache.count(&self.inner.router)?,
            pending_maintenance: self.maintenance.pending(),
            partitions: self.inner.router.partitions(),
        })
    }

    /// Block until background maintenance drains or the timeout elapses.
    /// Returns whether the store settled.
    pub fn wait_settled(&self, timeout: Duration) -> bool {
        self.maintenance.wait_settled(timeout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ClusterConfig, DbConfig, VectorConfig};
    use crate::storage::MemoryStore;

    fn open(max_distance: f32, partition: usize) -> ClusterStore {
        let config = StoreConfig {
            vector: VectorConfig {
                size: 2,
                max: 1.0,
                min: -1.0,
            },
            cluster: ClusterConfig {
                max_distance,
                partition,
            },
            db: DbConfig {
                table: "test".into(),
            },
        };
        ClusterStore::open(config, MemoryStore::factory()).unwrap()
    }

    fn at_angle(degrees: f32) -> Vec<f32> {
        let radians = degrees.to_radians();
        vec![radians.cos(), radians.sin()]
    }

    #[test]
    fn test_make_vector_enforces_dimension() {
        let store = open(0.4, 2);
        assert!(store.make_vector(vec![1.0, 0.0]).is_ok());
        assert!(matches!(
            store.make_vector(vec![1.0, 0.0, 0.0]),
            Err(StoreError::DimensionMismatch {
                expected: 2,
                actual: 3
            })
        ));
    }

    #[test]
    fn test_assign_reuses_nearby_cluster() {
        let store = open(0.4, 2);
        let first = store.make_vector(at_angle(0.0)).unwrap();
        let nearby = store.make_vector(at_angle(5.0)).unwrap();

        assert_eq!(store.inner.assign(&first).unwrap(), 0);
        assert_eq!(store.inner.assign(&nearby).unwrap(), 0);
    }

    #[test]
    fn test_assign_creates_cluster_beyond_threshold() {
        let store = open(0.1, 2);
        let east = store.make_vector(at_angle(0.0)).unwrap();
        let north = store.make_vector(at_angle(90.0)).unwrap();

        assert_eq!(store.inner.assign(&east).unwrap(), 0);
        // Orthogonal distance is 0.5 > 0.1.
        assert_eq!(store.inner.assign(&north).unwrap(), 1);
    }

    #[test]
    fn test_assign_tie_breaks_toward_lowest_id() {
        let store = open(0.2, 2);
        // Mirrored around the x axis: 0.5 apart from each other (no join),
        // 0.146 from the axis itself.
        let up = at_angle(45.0);
        let down = vec![up[0], -up[1]];
        let plus = store.make_vector(up).unwrap();
        let minus = store.make_vector(down).unwrap();
        assert_eq!(store.inner.assign(&plus).unwrap(), 0);
        assert_eq!(store.inner.assign(&minus).unwrap(), 1);

        // Exactly equidistant from both centroids; the scan keeps the
        // first strict improvement, so cluster 0 wins.
        let middle = store.make_vector(at_angle(0.0)).unwrap();
        assert_eq!(store.inner.assign(&middle).unwrap(), 0);
    }

    #[test]
    fn test_insert_returns_before_settling_and_stats_see_it() {
        let store = open(0.4, 2);
        let v = store.make_vector(at_angle(0.0)).unwrap();
        store.insert("a", &v).unwrap();

        assert!(store.wait_settled(Duration::from_secs(5)));
        let stats = store.stats().unwrap();
        assert_eq!(stats.clusters, 1);
        assert_eq!(stats.pending_maintenance, 0);
        assert_eq!(stats.partitions, 2);
    }

    #[test]
    fn test_query_rejects_wrong_dimension() {
        let store = open(0.4, 2);
        let bad = Vector::new(vec![1.0, 0.0, 0.0], 1.0, -1.0);
        assert!(store.query(&bad, 10).is_err());
        assert!(store.insert("x", &bad).is_err());
    }
}
