//! Gauges for the executor pools owned by the cache manager.

use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

/// Live counters of one executor pool.
#[derive(Debug, Default)]
pub struct PoolMetrics {
    active: AtomicI64,
    queued: AtomicI64,
    completed: AtomicU64,
    rejected: AtomicU64,
}

impl PoolMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn task_queued(&self) {
        self.queued.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn task_started(&self) {
        self.queued.fetch_sub(1, Ordering::Relaxed);
        self.active.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn task_finished(&self) {
        self.active.fetch_sub(1, Ordering::Relaxed);
        self.completed.fetch_add(1, Ordering::Relaxed);
    }

    /// A queued task that was dropped before it ran (pool shut down).
    pub(crate) fn task_abandoned(&self) {
        self.queued.fetch_sub(1, Ordering::Relaxed);
    }

    pub(crate) fn task_rejected(&self) {
        self.rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> PoolMetricsSnapshot {
        PoolMetricsSnapshot {
            active: self.active.load(Ordering::Relaxed).max(0) as u64,
            queued: self.queued.load(Ordering::Relaxed).max(0) as u64,
            completed: self.completed.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PoolMetricsSnapshot {
    pub active: u64,
    pub queued: u64,
    pub completed: u64,
    pub rejected: u64,
}

/// Named pool gauges, keyed by the pool's real name (e.g. `NotCheckpointFileListingExecutor`).
#[derive(Debug, Default)]
pub struct MetricRegistry {
    pools: RwLock<BTreeMap<String, Arc<PoolMetrics>>>,
}

impl MetricRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a pool's gauges. Re-registering a name replaces the old gauges.
    pub fn register_pool(&self, name: &str, metrics: Arc<PoolMetrics>) {
        let mut pools = self.pools.write().unwrap_or_else(|e| e.into_inner());
        if pools.insert(name.to_string(), metrics).is_some() {
            tracing::debug!(pool = %name, "Replaced pool metrics registration");
        }
    }

    pub fn pool(&self, name: &str) -> Option<PoolMetricsSnapshot> {
        let pools = self.pools.read().unwrap_or_else(|e| e.into_inner());
        pools.get(name).map(|m| m.snapshot())
    }

    pub fn snapshot(&self) -> BTreeMap<String, PoolMetricsSnapshot> {
        let pools = self.pools.read().unwrap_or_else(|e| e.into_inner());
        pools
            .iter()
            .map(|(name, m)| (name.clone(), m.snapshot()))
            .collect()
    }
}
