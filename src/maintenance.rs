//! Background centroid maintenance.
//!
//! The source of truth for a cluster is its member set; the centroid must
//! track the member mean, and members drifting past the distance threshold
//! must be reassigned. Reassignment changes two memberships, which
//! invalidates two centroids, which can cascade. Instead of unbounded
//! recursion this is modeled as an explicit work queue consumed by one
//! dedicated worker thread: inserts enqueue and return immediately
//! (fire-and-forget), a per-cluster dedup guard collapses duplicate work,
//! and a depth cap bounds the cascade.
//!
//! Cluster state is transiently inconsistent between an insert returning
//! and its maintenance task draining; `wait_settled` makes that window
//! observable.

use std::collections::HashSet;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam_channel::{unbounded, Sender};
use parking_lot::{Condvar, Mutex};
use serde_json::json;

use crate::engine::StoreInner;
use crate::error::Result;
use crate::storage::Row;
use crate::vector::Vector;

/// Maximum cascade depth before a rebalance task is dropped. A centroid
/// that keeps drifting past the threshold on every recomputation would
/// otherwise recurse forever.
const MAX_REBALANCE_DEPTH: u32 = 16;

enum Task {
    Recompute { cluster_id: u32, depth: u32 },
    Shutdown,
}

#[derive(Default)]
struct QueueInner {
    /// Cluster ids currently sitting in the channel (dedup guard).
    queued: HashSet<u32>,
    /// Queued plus in-flight tasks; zero means settled.
    pending: usize,
}

struct QueueState {
    inner: Mutex<QueueInner>,
    settled: Condvar,
}

pub(crate) struct Maintenance {
    tx: Sender<Task>,
    state: Arc<QueueState>,
    worker: Option<JoinHandle<()>>,
}

impl Maintenance {
    pub(crate) fn start(store: Arc<StoreInner>) -> Self {
        let (tx, rx) = unbounded::<Task>();
        let state = Arc::new(QueueState {
            inner: Mutex::new(QueueInner::default()),
            settled: Condvar::new(),
        });

        let worker_state = state.clone();
        let worker_tx = tx.clone();
        let worker = std::thread::Builder::new()
            .name("cumulus-maintenance".to_string())
            .spawn(move || {
                while let Ok(task) = rx.recv() {
                    let (cluster_id, depth) = match task {
                        Task::Recompute { cluster_id, depth } => (cluster_id, depth),
                        Task::Shutdown => break,
                    };
                    {
                        let mut inner = worker_state.inner.lock();
                        inner.queued.remove(&cluster_id);
                    }

                    if let Err(err) =
                        recompute_centroid(&store, &worker_state, &worker_tx, cluster_id, depth)
                    {
                        tracing::warn!(cluster_id, "centroid maintenance failed: {err}");
                    }

                    let mut inner = worker_state.inner.lock();
                    inner.pending -= 1;
                    if inner.pending == 0 {
                        worker_state.settled.notify_all();
                    }
                }
            })
            .expect("spawning maintenance worker");

        Self {
            tx,
            state,
            worker: Some(worker),
        }
    }

    /// Enqueue a recompute for a cluster. Never blocks on the work itself.
    pub(crate) fn schedule(&self, cluster_id: u32) {
        enqueue(&self.tx, &self.state, cluster_id, 0);
    }

    /// Queued plus in-flight task count.
    pub(crate) fn pending(&self) -> usize {
        self.state.inner.lock().pending
    }

    /// Block until the queue drains or the timeout elapses. Returns
    /// whether the store settled.
    pub(crate) fn wait_settled(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut inner = self.state.inner.lock();
        while inner.pending > 0 {
            if self
                .state
                .settled
                .wait_until(&mut inner, deadline)
                .timed_out()
            {
                return inner.pending == 0;
            }
        }
        true
    }
}

impl Drop for Maintenance {
    fn drop(&mut self) {
        let _ = self.tx.send(Task::Shutdown);
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

fn enqueue(tx: &Sender<Task>, state: &QueueState, cluster_id: u32, depth: u32) {
    if depth >= MAX_REBALANCE_DEPTH {
        tracing::warn!(
            cluster_id,
            depth,
            "rebalance cascade hit depth cap, dropping task"
        );
        return;
    }

    {
        let mut inner = state.inner.lock();
        if !inner.queued.insert(cluster_id) {
            return;
        }
        inner.pending += 1;
    }
    if tx.send(Task::Recompute { cluster_id, depth }).is_err() {
        // Worker already shut down; roll the accounting back.
        let mut inner = state.inner.lock();
        inner.queued.remove(&cluster_id);
        inner.pending -= 1;
    }
}

/// One maintenance pass over a cluster.
///
/// Recomputes the centroid as the member mean, persists it, refreshes the
/// cache, and relocates every member that drifted past the threshold,
/// re-enqueuing both affected clusters.
fn recompute_centroid(
    store: &StoreInner,
    state: &QueueState,
    tx: &Sender<Task>,
    cluster_id: u32,
    depth: u32,
) -> Result<()> {
    let members = store.cluster_members(cluster_id)?;
    if members.is_empty() {
        // Orphaned cluster: nothing to average, the empty cluster stays.
        tracing::debug!(cluster_id, "skipping recompute of empty cluster");
        return Ok(());
    }

    let vectors: Vec<Vector> = members.iter().map(|m| m.vector.clone()).collect();
    let centroid = Vector::mean(&vectors).expect("non-empty member set");

    let mut patch = Row::new();
    patch.insert("vector".into(), json!(centroid.encode()?));
    store.router.index_shard()?.update_where(
        store.router.index_table(),
        "cluster_id",
        &json!(cluster_id),
        patch,
    )?;
    store.cache.upsert(cluster_id, centroid.clone());

    let max_distance = store.config.cluster.max_distance;
    let shard = store.router.shard_for(cluster_id)?;
    let mut moved = 0usize;
    for member in &members {
        let distance = centroid.distance(&member.vector)?;
        if distance <= max_distance {
            continue;
        }

        let target = store.assign(&member.vector)?;
        shard.delete_where(store.router.vector_table(), "id", &json!(member.id))?;
        store.insert_record(target, &member.vector, &member.payload)?;
        tracing::debug!(
            from = cluster_id,
            to = target,
            distance,
            "reassigned drifted member"
        );
        enqueue(tx, state, target, depth + 1);
        moved += 1;
    }

    if moved > 0 {
        // Membership shrank, the mean moved again.
        enqueue(tx, state, cluster_id, depth + 1);
        tracing::debug!(cluster_id, moved, "cluster lost drifted members");
    }

    Ok(())
}
