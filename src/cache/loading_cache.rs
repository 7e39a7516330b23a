//! Keyed cache with load-on-miss, background refresh and explicit invalidation.
//!
//! Misses are loaded in the caller's task; concurrent misses on one key share
//! a single load. Entries older than `refresh_after_write` keep being served
//! while a reload runs on the cache's executor pool.
//!
//! Every load registers a ticket for its key before calling the loader. An
//! invalidation marks the tickets of the keys it matches as stale under the
//! entry lock, and a stale ticket never installs its value. A read that
//! follows an invalidation therefore never observes a value fetched before
//! it, while loads of unrelated keys are unaffected.

use super::stats::{get_cache_stats, CacheStats, StatsCounter};
use super::MetaCacheError;
use crate::executor::ExecutorPool;
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use lru::LruCache;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt::{self, Debug};
use std::future::Future;
use std::hash::Hash;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

pub trait CacheKey: Hash + Eq + Clone + Debug + Send + Sync + 'static {}
impl<T> CacheKey for T where T: Hash + Eq + Clone + Debug + Send + Sync + 'static {}

pub trait CacheValue: Clone + Send + Sync + 'static {}
impl<T> CacheValue for T where T: Clone + Send + Sync + 'static {}

/// Why an entry left the cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemovalCause {
    Explicit,
    Replaced,
    Expired,
    Size,
}

impl RemovalCause {
    pub fn was_evicted(self) -> bool {
        matches!(self, RemovalCause::Expired | RemovalCause::Size)
    }
}

/// Called after an entry is removed, outside the cache's lock.
pub type RemovalListener<K, V> = Arc<dyn Fn(&K, &V, RemovalCause) + Send + Sync>;

/// Computes the value of one key.
#[async_trait]
pub trait CacheLoader<K, V>: Send + Sync {
    async fn load(&self, key: &K) -> Result<V>;
}

struct FnLoader<F>(F);

#[async_trait]
impl<K, V, F, Fut> CacheLoader<K, V> for FnLoader<F>
where
    K: CacheKey,
    V: Send + 'static,
    F: Fn(K) -> Fut + Send + Sync,
    Fut: Future<Output = Result<V>> + Send,
{
    async fn load(&self, key: &K) -> Result<V> {
        (self.0)(key.clone()).await
    }
}

/// Wrap an async closure as a [`CacheLoader`].
pub fn loader_fn<K, V, F, Fut>(f: F) -> Arc<dyn CacheLoader<K, V>>
where
    K: CacheKey,
    V: Send + 'static,
    F: Fn(K) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<V>> + Send + 'static,
{
    Arc::new(FnLoader(f))
}

/// Construction parameters of a [`LoadingCache`].
pub struct CacheSpec<K, V> {
    name: String,
    max_size: usize,
    expire_after_access: Option<Duration>,
    refresh_after_write: Option<Duration>,
    executor: Option<Arc<ExecutorPool>>,
    removal_listener: Option<RemovalListener<K, V>>,
}

impl<K: CacheKey, V: CacheValue> CacheSpec<K, V> {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            max_size: 0,
            expire_after_access: None,
            refresh_after_write: None,
            executor: None,
            removal_listener: None,
        }
    }

    /// Bound the entry count; 0 means unbounded.
    pub fn max_size(mut self, max_size: usize) -> Self {
        self.max_size = max_size;
        self
    }

    pub fn expire_after_access(mut self, ttl: Option<Duration>) -> Self {
        self.expire_after_access = ttl;
        self
    }

    pub fn refresh_after_write(mut self, interval: Option<Duration>) -> Self {
        self.refresh_after_write = interval;
        self
    }

    /// Pool for background refreshes and scheduled loads.
    pub fn executor(mut self, executor: Arc<ExecutorPool>) -> Self {
        self.executor = Some(executor);
        self
    }

    pub fn removal_listener(mut self, listener: RemovalListener<K, V>) -> Self {
        self.removal_listener = Some(listener);
        self
    }

    pub fn build(self, loader: Arc<dyn CacheLoader<K, V>>) -> LoadingCache<K, V> {
        self.build_inner(Some(loader))
    }

    /// A cache whose values come only from `put` and `get_with`.
    pub fn build_manual(self) -> LoadingCache<K, V> {
        self.build_inner(None)
    }

    fn build_inner(self, loader: Option<Arc<dyn CacheLoader<K, V>>>) -> LoadingCache<K, V> {
        let entries = match NonZeroUsize::new(self.max_size) {
            Some(cap) => LruCache::new(cap),
            None => LruCache::unbounded(),
        };
        LoadingCache {
            shared: Arc::new(Shared {
                name: self.name,
                store: Mutex::new(Store {
                    entries,
                    loads_in_flight: HashMap::new(),
                }),
                expire_after_access: self.expire_after_access,
                refresh_after_write: self.refresh_after_write,
                executor: self.executor,
                loader,
                listener: self.removal_listener,
                next_ticket: AtomicU64::new(0),
                loads: Mutex::new(HashMap::new()),
                pending: Mutex::new(HashSet::new()),
                stats: StatsCounter::default(),
            }),
        }
    }
}

struct Entry<V> {
    value: V,
    written_at: Instant,
    last_access: Instant,
    refreshing: bool,
}

type Removed<K, V> = Vec<(K, V, RemovalCause)>;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// A load that has not installed its value yet.
struct InFlight<K> {
    key: K,
    stale: bool,
}

struct Store<K, V> {
    entries: LruCache<K, Entry<V>>,
    loads_in_flight: HashMap<u64, InFlight<K>>,
}

struct Shared<K, V> {
    name: String,
    store: Mutex<Store<K, V>>,
    expire_after_access: Option<Duration>,
    refresh_after_write: Option<Duration>,
    executor: Option<Arc<ExecutorPool>>,
    loader: Option<Arc<dyn CacheLoader<K, V>>>,
    listener: Option<RemovalListener<K, V>>,
    next_ticket: AtomicU64,
    /// Per-key load serialization.
    loads: Mutex<HashMap<K, Arc<tokio::sync::Mutex<()>>>>,
    /// Keys with a scheduled background load.
    pending: Mutex<HashSet<K>>,
    stats: StatsCounter,
}

enum Probe<V> {
    Absent,
    Expired,
    Present { value: V, refresh: bool },
}

impl<K: CacheKey, V: CacheValue> Shared<K, V> {
    fn is_expired(&self, entry: &Entry<V>, now: Instant) -> bool {
        self.expire_after_access
            .is_some_and(|ttl| now.duration_since(entry.last_access) > ttl)
    }

    fn can_refresh(&self) -> bool {
        self.loader.is_some() && self.executor.is_some()
    }

    /// Look a key up, dropping it if expired. Returns the value and whether the
    /// caller should schedule a refresh.
    fn probe(&self, key: &K) -> (Option<V>, bool) {
        let now = Instant::now();
        let mut removed = Vec::new();
        let result = {
            let mut store = lock(&self.store);
            let entries = &mut store.entries;
            let probe = match entries.get_mut(key) {
                None => Probe::Absent,
                Some(entry) if self.is_expired(entry, now) => Probe::Expired,
                Some(entry) => {
                    entry.last_access = now;
                    let stale = self
                        .refresh_after_write
                        .is_some_and(|interval| now.duration_since(entry.written_at) >= interval);
                    let refresh = stale && !entry.refreshing && self.can_refresh();
                    if refresh {
                        entry.refreshing = true;
                    }
                    Probe::Present {
                        value: entry.value.clone(),
                        refresh,
                    }
                }
            };
            match probe {
                Probe::Absent => (None, false),
                Probe::Expired => {
                    if let Some((k, e)) = entries.pop_entry(key) {
                        self.stats.record_eviction();
                        removed.push((k, e.value, RemovalCause::Expired));
                    }
                    (None, false)
                }
                Probe::Present { value, refresh } => (Some(value), refresh),
            }
        };
        self.notify(removed);
        result
    }

    fn insert_locked(
        &self,
        entries: &mut LruCache<K, Entry<V>>,
        key: K,
        value: V,
        removed: &mut Removed<K, V>,
    ) {
        let now = Instant::now();
        let entry = Entry {
            value,
            written_at: now,
            last_access: now,
            refreshing: false,
        };
        if let Some((old_key, old)) = entries.push(key.clone(), entry) {
            if old_key == key {
                removed.push((old_key, old.value, RemovalCause::Replaced));
            } else {
                self.stats.record_eviction();
                removed.push((old_key, old.value, RemovalCause::Size));
            }
        }
    }

    /// Register a load of `key`; its result installs only if no invalidation
    /// matching `key` happens before [`LoadTicket::install`].
    fn begin_load(self: &Arc<Self>, key: &K) -> LoadTicket<K, V> {
        let id = self.next_ticket.fetch_add(1, Ordering::Relaxed);
        lock(&self.store).loads_in_flight.insert(
            id,
            InFlight {
                key: key.clone(),
                stale: false,
            },
        );
        LoadTicket {
            shared: self.clone(),
            id,
        }
    }

    fn clear_refreshing(&self, key: &K) {
        if let Some(entry) = lock(&self.store).entries.peek_mut(key) {
            entry.refreshing = false;
        }
    }

    fn remove_matching(&self, pred: impl Fn(&K) -> bool) -> usize {
        let removed: Removed<K, V> = {
            let mut store = lock(&self.store);
            for load in store.loads_in_flight.values_mut() {
                if pred(&load.key) {
                    load.stale = true;
                }
            }
            let entries = &mut store.entries;
            let keys: Vec<K> = entries
                .iter()
                .filter(|(k, _)| pred(k))
                .map(|(k, _)| k.clone())
                .collect();
            keys.into_iter()
                .filter_map(|k| entries.pop_entry(&k))
                .map(|(k, e)| (k, e.value, RemovalCause::Explicit))
                .collect()
        };
        let count = removed.len();
        self.notify(removed);
        count
    }

    fn notify(&self, removed: Removed<K, V>) {
        if let Some(listener) = &self.listener {
            for (key, value, cause) in removed {
                listener(&key, &value, cause);
            }
        }
    }
}

/// Registration of one in-flight load. Dropping it without installing
/// forgets the load.
struct LoadTicket<K: CacheKey, V: CacheValue> {
    shared: Arc<Shared<K, V>>,
    id: u64,
}

impl<K: CacheKey, V: CacheValue> LoadTicket<K, V> {
    /// Install the loaded value unless its key was invalidated meanwhile.
    fn install(self, key: K, value: V) -> bool {
        let mut removed = Vec::new();
        let installed = {
            let mut store = lock(&self.shared.store);
            let load = store.loads_in_flight.remove(&self.id);
            match load {
                Some(load) if !load.stale => {
                    self.shared
                        .insert_locked(&mut store.entries, key, value, &mut removed);
                    true
                }
                _ => false,
            }
        };
        self.shared.notify(removed);
        installed
    }
}

impl<K: CacheKey, V: CacheValue> Drop for LoadTicket<K, V> {
    fn drop(&mut self) {
        lock(&self.shared.store).loads_in_flight.remove(&self.id);
    }
}

/// Holds the per-key load lock and drops the map slot once nobody uses it.
struct LoadSlot<K: CacheKey, V: CacheValue> {
    shared: Arc<Shared<K, V>>,
    key: K,
    lock: Arc<tokio::sync::Mutex<()>>,
}

impl<K: CacheKey, V: CacheValue> LoadSlot<K, V> {
    fn acquire(shared: &Arc<Shared<K, V>>, key: &K) -> Self {
        let lock = lock(&shared.loads).entry(key.clone()).or_default().clone();
        Self {
            shared: shared.clone(),
            key: key.clone(),
            lock,
        }
    }
}

impl<K: CacheKey, V: CacheValue> Drop for LoadSlot<K, V> {
    fn drop(&mut self) {
        let mut loads = lock(&self.shared.loads);
        let unused = loads
            .get(&self.key)
            .is_some_and(|l| Arc::ptr_eq(l, &self.lock) && Arc::strong_count(&self.lock) == 2);
        if unused {
            loads.remove(&self.key);
        }
    }
}

/// Clears the pending marker of a scheduled load, even if the task never runs.
struct PendingGuard<K: CacheKey, V: CacheValue> {
    shared: Arc<Shared<K, V>>,
    key: K,
}

impl<K: CacheKey, V: CacheValue> Drop for PendingGuard<K, V> {
    fn drop(&mut self) {
        lock(&self.shared.pending).remove(&self.key);
    }
}

/// A concurrent keyed cache. Cloning shares the same entries.
pub struct LoadingCache<K, V> {
    shared: Arc<Shared<K, V>>,
}

impl<K, V> Clone for LoadingCache<K, V> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<K, V> Debug for LoadingCache<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoadingCache")
            .field("name", &self.shared.name)
            .finish()
    }
}

impl<K: CacheKey, V: CacheValue> LoadingCache<K, V> {
    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// Cached value, if any. Counts as a read and may schedule a refresh.
    pub fn get_if_present(&self, key: &K) -> Option<V> {
        let (value, refresh) = self.shared.probe(key);
        if value.is_some() {
            self.shared.stats.record_hit();
        } else {
            self.shared.stats.record_miss();
        }
        if refresh {
            self.schedule_refresh(key.clone());
        }
        value
    }

    /// Cached value without touching recency, expiry or statistics.
    pub fn peek(&self, key: &K) -> Option<V> {
        lock(&self.shared.store)
            .entries
            .peek(key)
            .map(|entry| entry.value.clone())
    }

    /// Value for `key`, loading it with the cache's loader on a miss.
    pub async fn get(&self, key: &K) -> Result<V> {
        let loader = match &self.shared.loader {
            Some(loader) => loader.clone(),
            None => return Err(anyhow!("cache {} has no loader", self.shared.name)),
        };
        self.get_with(key, move |k| async move { loader.load(&k).await })
            .await
    }

    /// Value for `key`, loading it with `load` on a miss.
    ///
    /// A failed load is returned to this caller only and caches nothing.
    pub async fn get_with<F, Fut>(&self, key: &K, load: F) -> Result<V>
    where
        F: FnOnce(K) -> Fut,
        Fut: Future<Output = Result<V>>,
    {
        if let Some(value) = self.get_if_present(key) {
            return Ok(value);
        }
        self.load_after_miss_with(key, load).await
    }

    /// Load `key` with the cache's loader for a caller that already saw it
    /// missing, without counting a second read.
    pub(crate) async fn load_after_miss(&self, key: &K) -> Result<V> {
        let loader = match &self.shared.loader {
            Some(loader) => loader.clone(),
            None => return Err(anyhow!("cache {} has no loader", self.shared.name)),
        };
        self.load_after_miss_with(key, move |k| async move { loader.load(&k).await })
            .await
    }

    async fn load_after_miss_with<F, Fut>(&self, key: &K, load: F) -> Result<V>
    where
        F: FnOnce(K) -> Fut,
        Fut: Future<Output = Result<V>>,
    {
        let slot = LoadSlot::acquire(&self.shared, key);
        let _guard = slot.lock.clone().lock_owned().await;

        // Another caller may have loaded the key while this one waited.
        if let (Some(value), _) = self.shared.probe(key) {
            return Ok(value);
        }

        let ticket = self.shared.begin_load(key);
        let start = Instant::now();
        let result = load(key.clone()).await;
        self.shared.stats.record_load(start.elapsed(), result.is_ok());

        match result {
            Ok(value) => {
                if !ticket.install(key.clone(), value.clone()) {
                    tracing::debug!(
                        cache = %self.shared.name,
                        key = ?key,
                        "Discarded load result after concurrent invalidation"
                    );
                }
                Ok(value)
            }
            Err(e) => {
                tracing::warn!(
                    cache = %self.shared.name,
                    key = ?key,
                    error = %e,
                    "Cache load failed"
                );
                Err(e.context(format!("Failed to load {} entry {:?}", self.shared.name, key)))
            }
        }
    }

    /// Values for `keys` in order, loading every miss with one call to `load_all`.
    ///
    /// Batch loads skip per-key serialization but honor invalidations the
    /// same way single loads do.
    pub async fn get_all<F, Fut>(&self, keys: &[K], load_all: F) -> Result<Vec<V>>
    where
        F: FnOnce(Vec<K>) -> Fut,
        Fut: Future<Output = Result<HashMap<K, V>>>,
    {
        let mut found: HashMap<K, V> = HashMap::with_capacity(keys.len());
        let mut missing = Vec::new();
        let mut seen = HashSet::new();
        for key in keys {
            if !seen.insert(key) {
                continue;
            }
            match self.get_if_present(key) {
                Some(value) => {
                    found.insert(key.clone(), value);
                }
                None => missing.push(key.clone()),
            }
        }

        if !missing.is_empty() {
            let tickets: Vec<_> = missing
                .iter()
                .map(|key| self.shared.begin_load(key))
                .collect();
            let start = Instant::now();
            let result = load_all(missing.clone()).await;
            self.shared.stats.record_load(start.elapsed(), result.is_ok());
            let mut loaded = match result {
                Ok(loaded) => loaded,
                Err(e) => {
                    tracing::warn!(
                        cache = %self.shared.name,
                        keys = missing.len(),
                        error = %e,
                        "Batch cache load failed"
                    );
                    return Err(e.context(format!(
                        "Failed to load {} entries of {}",
                        missing.len(),
                        self.shared.name
                    )));
                }
            };
            for (key, ticket) in missing.into_iter().zip(tickets) {
                let value = loaded.remove(&key).ok_or_else(|| {
                    anyhow!("{} has no entry for {:?}", self.shared.name, key)
                })?;
                ticket.install(key.clone(), value.clone());
                found.insert(key, value);
            }
        }

        Ok(keys.iter().filter_map(|k| found.get(k).cloned()).collect())
    }

    /// Load `key` in the background unless it is cached or already scheduled.
    ///
    /// Returns `Ok(true)` when a load was submitted. Never waits on the pool.
    pub fn schedule_load(&self, key: K) -> Result<bool, MetaCacheError> {
        let (executor, loader) = match (&self.shared.executor, &self.shared.loader) {
            (Some(executor), Some(loader)) => (executor.clone(), loader.clone()),
            _ => {
                return Err(MetaCacheError::NotSupported(format!(
                    "background loading for cache {}",
                    self.shared.name
                )))
            }
        };
        if lock(&self.shared.store).entries.contains(&key) {
            return Ok(false);
        }
        if !lock(&self.shared.pending).insert(key.clone()) {
            return Ok(false);
        }

        let pending = PendingGuard {
            shared: self.shared.clone(),
            key: key.clone(),
        };
        let shared = self.shared.clone();
        let ticket = shared.begin_load(&key);
        executor.try_spawn(async move {
            let _pending = pending;
            let start = Instant::now();
            let result = loader.load(&key).await;
            shared.stats.record_load(start.elapsed(), result.is_ok());
            match result {
                Ok(value) => {
                    ticket.install(key, value);
                }
                Err(e) => {
                    tracing::warn!(
                        cache = %shared.name,
                        key = ?key,
                        error = %e,
                        "Background cache load failed"
                    );
                }
            }
        })?;
        Ok(true)
    }

    fn schedule_refresh(&self, key: K) {
        let (executor, loader) = match (&self.shared.executor, &self.shared.loader) {
            (Some(executor), Some(loader)) => (executor.clone(), loader.clone()),
            _ => return,
        };
        let shared = self.shared.clone();
        let ticket = shared.begin_load(&key);
        let task_key = key.clone();
        let spawned = executor.try_spawn(async move {
            let start = Instant::now();
            let result = loader.load(&task_key).await;
            shared.stats.record_load(start.elapsed(), result.is_ok());
            match result {
                Ok(value) => {
                    if !ticket.install(task_key.clone(), value) {
                        shared.clear_refreshing(&task_key);
                    }
                }
                Err(e) => {
                    tracing::warn!(
                        cache = %shared.name,
                        key = ?task_key,
                        error = %e,
                        "Cache refresh failed, keeping current value"
                    );
                    shared.clear_refreshing(&task_key);
                }
            }
        });
        if let Err(e) = spawned {
            tracing::debug!(cache = %self.shared.name, key = ?key, error = %e, "Cache refresh skipped");
            self.shared.clear_refreshing(&key);
        }
    }

    pub fn put(&self, key: K, value: V) {
        let mut removed = Vec::new();
        {
            let mut store = lock(&self.shared.store);
            self.shared
                .insert_locked(&mut store.entries, key, value, &mut removed);
        }
        self.shared.notify(removed);
    }

    pub fn invalidate(&self, key: &K) -> bool {
        self.shared.remove_matching(|k| k == key) > 0
    }

    /// Invalidate every key matching `pred`; returns how many were removed.
    pub fn invalidate_if(&self, pred: impl Fn(&K) -> bool) -> usize {
        self.shared.remove_matching(pred)
    }

    pub fn invalidate_all(&self) -> usize {
        self.shared.remove_matching(|_| true)
    }

    pub fn keys(&self) -> Vec<K> {
        lock(&self.shared.store)
            .entries
            .iter()
            .map(|(k, _)| k.clone())
            .collect()
    }

    /// Entry count, including entries that expired but were not read since.
    pub fn estimated_size(&self) -> usize {
        lock(&self.shared.store).entries.len()
    }

    pub fn stats(&self) -> CacheStats {
        self.shared.stats.snapshot()
    }

    pub fn stats_map(&self) -> BTreeMap<String, String> {
        get_cache_stats(&self.stats(), self.estimated_size() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::new_thread_pool;
    use std::sync::atomic::AtomicUsize;
    use tokio::sync::Notify;

    fn counting_cache(calls: Arc<AtomicUsize>) -> LoadingCache<String, usize> {
        CacheSpec::new("test").build(loader_fn(move |key: String| {
            let calls = calls.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(key.len())
            }
        }))
    }

    #[tokio::test]
    async fn loads_once_then_hits() {
        let calls = Arc::new(AtomicUsize::new(0));
        let cache = counting_cache(calls.clone());

        assert_eq!(cache.get(&"abc".to_string()).await.unwrap(), 3);
        assert_eq!(cache.get(&"abc".to_string()).await.unwrap(), 3);

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        let stats = cache.stats();
        assert_eq!(stats.hit_count, 1);
        assert_eq!(stats.miss_count, 1);
        assert_eq!(stats.load_success_count, 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_misses_share_one_load() {
        let calls = Arc::new(AtomicUsize::new(0));
        let loader_calls = calls.clone();
        let cache: LoadingCache<String, usize> =
            CacheSpec::new("single_flight").build(loader_fn(move |key: String| {
                let calls = loader_calls.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    Ok(key.len())
                }
            }));

        let mut joins = Vec::new();
        for _ in 0..8 {
            let c = cache.clone();
            joins.push(tokio::spawn(async move { c.get(&"key".to_string()).await }));
        }
        for j in joins {
            assert_eq!(j.await.unwrap().unwrap(), 3);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn failed_load_is_not_cached_and_spares_other_keys() {
        let cache: LoadingCache<String, usize> =
            CacheSpec::new("failing").build(loader_fn(|key: String| async move {
                if key == "bad" {
                    Err(anyhow!("remote unavailable"))
                } else {
                    Ok(key.len())
                }
            }));

        assert_eq!(cache.get(&"good".to_string()).await.unwrap(), 4);
        let err = cache.get(&"bad".to_string()).await.unwrap_err();
        assert!(format!("{:#}", err).contains("remote unavailable"));

        assert_eq!(cache.peek(&"good".to_string()), Some(4));
        assert_eq!(cache.peek(&"bad".to_string()), None);
        assert_eq!(cache.stats().load_failure_count, 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn invalidation_discards_in_flight_load() {
        let release = Arc::new(Notify::new());
        let gate = release.clone();
        let cache: LoadingCache<String, usize> =
            CacheSpec::new("in_flight").build(loader_fn(move |_key: String| {
                let gate = gate.clone();
                async move {
                    gate.notified().await;
                    Ok(1)
                }
            }));

        let reader = cache.clone();
        let load = tokio::spawn(async move { reader.get(&"k".to_string()).await });
        tokio::time::sleep(Duration::from_millis(20)).await;

        cache.invalidate(&"k".to_string());
        release.notify_one();

        assert_eq!(load.await.unwrap().unwrap(), 1);
        assert_eq!(cache.peek(&"k".to_string()), None);
    }

    fn gated_cache(gate: Arc<Notify>) -> LoadingCache<String, usize> {
        CacheSpec::new("gated").build(loader_fn(move |key: String| {
            let gate = gate.clone();
            async move {
                gate.notified().await;
                Ok(key.len())
            }
        }))
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn invalidating_other_key_keeps_in_flight_load() {
        let release = Arc::new(Notify::new());
        let cache = gated_cache(release.clone());
        cache.put("a".to_string(), 1);

        let reader = cache.clone();
        let load = tokio::spawn(async move { reader.get(&"bb".to_string()).await });
        tokio::time::sleep(Duration::from_millis(20)).await;

        cache.invalidate(&"a".to_string());
        cache.invalidate_if(|k| k.starts_with('x'));
        release.notify_one();

        assert_eq!(load.await.unwrap().unwrap(), 2);
        assert_eq!(cache.peek(&"bb".to_string()), Some(2));
        assert_eq!(cache.peek(&"a".to_string()), None);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn invalidate_all_discards_every_in_flight_load() {
        let release = Arc::new(Notify::new());
        let cache = gated_cache(release.clone());

        let reader = cache.clone();
        let load = tokio::spawn(async move { reader.get(&"bb".to_string()).await });
        tokio::time::sleep(Duration::from_millis(20)).await;

        cache.invalidate_all();
        release.notify_one();

        assert_eq!(load.await.unwrap().unwrap(), 2);
        assert_eq!(cache.peek(&"bb".to_string()), None);

        // Later loads install normally.
        release.notify_one();
        cache.get(&"bb".to_string()).await.unwrap();
        assert_eq!(cache.peek(&"bb".to_string()), Some(2));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn batch_load_drops_only_invalidated_keys() {
        let cache: LoadingCache<String, usize> = CacheSpec::new("batch_race").build_manual();
        let release = Arc::new(Notify::new());
        let gate = release.clone();

        let reader = cache.clone();
        let load = tokio::spawn(async move {
            let keys = vec!["db1.t1".to_string(), "db2.t1".to_string()];
            reader
                .get_all(&keys, |missing| async move {
                    gate.notified().await;
                    Ok(missing.into_iter().map(|k| (k, 1)).collect())
                })
                .await
        });
        tokio::time::sleep(Duration::from_millis(20)).await;

        cache.invalidate_if(|k| k.starts_with("db1."));
        release.notify_one();

        assert_eq!(load.await.unwrap().unwrap(), vec![1, 1]);
        assert_eq!(cache.keys(), vec!["db2.t1".to_string()]);
    }

    #[tokio::test]
    async fn size_bound_evicts_least_recently_used() {
        let evicted = Arc::new(Mutex::new(Vec::new()));
        let sink = evicted.clone();
        let cache: LoadingCache<String, usize> = CacheSpec::new("bounded")
            .max_size(2)
            .removal_listener(Arc::new(move |k: &String, _v: &usize, cause| {
                sink.lock().unwrap().push((k.clone(), cause));
            }))
            .build_manual();

        cache.put("a".to_string(), 1);
        cache.put("b".to_string(), 2);
        cache.get_if_present(&"a".to_string());
        cache.put("c".to_string(), 3);

        assert_eq!(cache.peek(&"b".to_string()), None);
        assert_eq!(cache.peek(&"a".to_string()), Some(1));
        assert_eq!(
            evicted.lock().unwrap().clone(),
            vec![("b".to_string(), RemovalCause::Size)]
        );
        assert_eq!(cache.stats().eviction_count, 1);
    }

    #[tokio::test]
    async fn entries_expire_after_access() {
        let cache: LoadingCache<String, usize> = CacheSpec::new("expiring")
            .expire_after_access(Some(Duration::from_millis(20)))
            .build_manual();

        cache.put("a".to_string(), 1);
        tokio::time::sleep(Duration::from_millis(40)).await;

        assert_eq!(cache.get_if_present(&"a".to_string()), None);
        assert_eq!(cache.estimated_size(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn stale_entry_refreshes_in_background() {
        let pool = Arc::new(new_thread_pool(false, 1, 10, "Refresh", 0, None).unwrap());
        let version = Arc::new(AtomicUsize::new(1));
        let source = version.clone();
        let cache: LoadingCache<String, usize> = CacheSpec::new("refreshing")
            .refresh_after_write(Some(Duration::from_millis(10)))
            .executor(pool)
            .build(loader_fn(move |_key: String| {
                let source = source.clone();
                async move { Ok(source.load(Ordering::SeqCst)) }
            }));

        let key = "k".to_string();
        assert_eq!(cache.get(&key).await.unwrap(), 1);
        version.store(2, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(20)).await;

        // Stale value is served while the reload runs.
        assert_eq!(cache.get(&key).await.unwrap(), 1);
        let refreshed = tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                if cache.peek(&key) == Some(2) {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await;
        assert!(refreshed.is_ok());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn schedule_load_deduplicates_and_installs() {
        let pool = Arc::new(new_thread_pool(false, 1, 10, "Scheduled", 0, None).unwrap());
        let release = Arc::new(Notify::new());
        let gate = release.clone();
        let cache: LoadingCache<String, usize> = CacheSpec::new("scheduled")
            .executor(pool)
            .build(loader_fn(move |key: String| {
                let gate = gate.clone();
                async move {
                    gate.notified().await;
                    Ok(key.len())
                }
            }));

        assert!(cache.schedule_load("abcd".to_string()).unwrap());
        assert!(!cache.schedule_load("abcd".to_string()).unwrap());
        release.notify_one();

        let loaded = tokio::time::timeout(Duration::from_secs(2), async {
            while cache.peek(&"abcd".to_string()).is_none() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await;
        assert!(loaded.is_ok());
        assert!(!cache.schedule_load("abcd".to_string()).unwrap());
    }

    #[tokio::test]
    async fn schedule_load_requires_executor() {
        let cache = counting_cache(Arc::new(AtomicUsize::new(0)));
        assert!(matches!(
            cache.schedule_load("a".to_string()),
            Err(MetaCacheError::NotSupported(_))
        ));
    }

    #[tokio::test]
    async fn get_all_loads_only_misses_in_one_batch() {
        let cache: LoadingCache<String, usize> = CacheSpec::new("batch").build_manual();
        cache.put("a".to_string(), 1);
        let batches = Arc::new(Mutex::new(Vec::new()));
        let seen = batches.clone();

        let keys = vec!["a".to_string(), "bb".to_string(), "ccc".to_string(), "bb".to_string()];
        let values = cache
            .get_all(&keys, |missing| async move {
                seen.lock().unwrap().push(missing.clone());
                Ok(missing
                    .into_iter()
                    .map(|k| {
                        let len = k.len();
                        (k, len)
                    })
                    .collect())
            })
            .await
            .unwrap();

        assert_eq!(values, vec![1, 2, 3, 2]);
        assert_eq!(
            batches.lock().unwrap().clone(),
            vec![vec!["bb".to_string(), "ccc".to_string()]]
        );
        assert_eq!(cache.peek(&"ccc".to_string()), Some(3));
    }

    #[tokio::test]
    async fn invalidate_if_removes_matching_keys() {
        let cache: LoadingCache<String, usize> = CacheSpec::new("predicate").build_manual();
        cache.put("db1.t1".to_string(), 1);
        cache.put("db1.t2".to_string(), 2);
        cache.put("db2.t1".to_string(), 3);

        assert_eq!(cache.invalidate_if(|k| k.starts_with("db1.")), 2);
        assert_eq!(cache.keys(), vec!["db2.t1".to_string()]);
        assert_eq!(cache.invalidate_all(), 1);
        assert_eq!(cache.estimated_size(), 0);
    }
}
