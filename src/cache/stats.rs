use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Point-in-time statistics of one cache.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub hit_count: u64,
    pub miss_count: u64,
    pub load_success_count: u64,
    pub load_failure_count: u64,
    pub total_load_time_nanos: u64,
    pub eviction_count: u64,
}

impl CacheStats {
    pub fn request_count(&self) -> u64 {
        self.hit_count + self.miss_count
    }

    /// Fraction of reads that hit; 1.0 when nothing was read.
    pub fn hit_rate(&self) -> f64 {
        match self.request_count() {
            0 => 1.0,
            requests => self.hit_count as f64 / requests as f64,
        }
    }

    pub fn load_count(&self) -> u64 {
        self.load_success_count + self.load_failure_count
    }

    /// Mean nanoseconds spent per load, successful or not.
    pub fn average_load_penalty(&self) -> f64 {
        match self.load_count() {
            0 => 0.0,
            loads => self.total_load_time_nanos as f64 / loads as f64,
        }
    }
}

#[derive(Debug, Default)]
pub(crate) struct StatsCounter {
    hits: AtomicU64,
    misses: AtomicU64,
    load_successes: AtomicU64,
    load_failures: AtomicU64,
    total_load_time_nanos: AtomicU64,
    evictions: AtomicU64,
}

impl StatsCounter {
    pub(crate) fn record_hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_load(&self, elapsed: Duration, success: bool) {
        let counter = if success {
            &self.load_successes
        } else {
            &self.load_failures
        };
        counter.fetch_add(1, Ordering::Relaxed);
        self.total_load_time_nanos
            .fetch_add(elapsed.as_nanos() as u64, Ordering::Relaxed);
    }

    pub(crate) fn record_eviction(&self) {
        self.evictions.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self) -> CacheStats {
        CacheStats {
            hit_count: self.hits.load(Ordering::Relaxed),
            miss_count: self.misses.load(Ordering::Relaxed),
            load_success_count: self.load_successes.load(Ordering::Relaxed),
            load_failure_count: self.load_failures.load(Ordering::Relaxed),
            total_load_time_nanos: self.total_load_time_nanos.load(Ordering::Relaxed),
            eviction_count: self.evictions.load(Ordering::Relaxed),
        }
    }
}

/// Render cache statistics as the string map shown to operators.
pub fn get_cache_stats(stats: &CacheStats, estimated_size: u64) -> BTreeMap<String, String> {
    let mut map = BTreeMap::new();
    map.insert("hit_ratio".to_string(), format!("{:?}", stats.hit_rate()));
    map.insert("hit_count".to_string(), stats.hit_count.to_string());
    map.insert("read_count".to_string(), stats.request_count().to_string());
    map.insert("eviction_count".to_string(), stats.eviction_count.to_string());
    map.insert(
        "average_load_penalty".to_string(),
        format!("{:?}", stats.average_load_penalty()),
    );
    map.insert("estimated_size".to_string(), estimated_size.to_string());
    map
}
