use super::SourceCacheManager;
use crate::cache::{CacheSpec, LoadingCache, StatsMap};
use crate::catalog::{CatalogId, NameMapping};
use crate::config::MetaCacheConfig;
use crate::registry::CatalogRegistry;
use anyhow::Result;
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;

const PARTITION_VALUES_CACHE: &str = "max_compute_partition_values_cache";

/// Partition values of MaxCompute tables in one catalog.
///
/// The MaxCompute client lives in catalog code, so values are loaded through
/// a loader supplied on each read.
#[derive(Debug)]
pub struct MaxComputeMetadataCache {
    catalog_id: CatalogId,
    partition_values: LoadingCache<NameMapping, Arc<Vec<String>>>,
}

impl MaxComputeMetadataCache {
    pub fn new(catalog_id: CatalogId, config: &MetaCacheConfig) -> Self {
        let partition_values = CacheSpec::new(PARTITION_VALUES_CACHE)
            .max_size(config.max_hive_partition_table_cache_num)
            .expire_after_access(config.expire_after_access())
            .build_manual();
        Self {
            catalog_id,
            partition_values,
        }
    }

    pub fn catalog_id(&self) -> CatalogId {
        self.catalog_id
    }

    pub async fn get_cached_partition_values<F, Fut>(
        &self,
        names: &NameMapping,
        load: F,
    ) -> Result<Arc<Vec<String>>>
    where
        F: FnOnce(NameMapping) -> Fut,
        Fut: Future<Output = Result<Vec<String>>>,
    {
        self.partition_values
            .get_with(names, |key| async move { Ok(Arc::new(load(key).await?)) })
            .await
    }

    pub fn invalidate_table_cache(&self, names: &NameMapping) {
        self.partition_values.invalidate_if(|k| k.same_table(names));
    }

    pub fn invalidate_db_cache(&self, db: &str) {
        self.partition_values.invalidate_if(|k| k.in_db(db));
    }

    pub fn invalidate_all(&self) {
        self.partition_values.invalidate_all();
    }

    pub fn stats(&self) -> StatsMap {
        self.partition_values.stats_map()
    }
}

/// Per-catalog MaxCompute caches, created on first use.
#[derive(Debug)]
pub struct MaxComputeCacheManager {
    config: MetaCacheConfig,
    caches: CatalogRegistry<MaxComputeMetadataCache>,
}

impl MaxComputeCacheManager {
    pub fn new(config: &MetaCacheConfig) -> Self {
        Self {
            config: config.clone(),
            caches: CatalogRegistry::new("max_compute"),
        }
    }

    pub fn get_or_create(&self, catalog_id: CatalogId) -> Arc<MaxComputeMetadataCache> {
        self.caches.get_or_create(catalog_id, || {
            MaxComputeMetadataCache::new(catalog_id, &self.config)
        })
    }
}

impl SourceCacheManager for MaxComputeCacheManager {
    fn name(&self) -> &'static str {
        "max_compute"
    }

    fn invalidate_table(&self, names: &NameMapping) {
        if let Some(cache) = self.caches.get(names.catalog_id) {
            cache.invalidate_table_cache(names);
        }
    }

    fn invalidate_db(&self, catalog_id: CatalogId, db: &str) {
        if let Some(cache) = self.caches.get(catalog_id) {
            cache.invalidate_db_cache(db);
        }
    }

    fn invalidate_catalog(&self, catalog_id: CatalogId) {
        if let Some(cache) = self.caches.get(catalog_id) {
            cache.invalidate_all();
        }
    }

    fn remove_cache(&self, catalog_id: CatalogId) {
        if let Some(cache) = self.caches.remove(catalog_id) {
            cache.invalidate_all();
        }
    }

    fn stats(&self, catalog_id: CatalogId) -> BTreeMap<String, StatsMap> {
        self.caches
            .get(catalog_id)
            .map(|cache| BTreeMap::from([(PARTITION_VALUES_CACHE.to_string(), cache.stats())]))
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn caller_loader_runs_once_per_table() {
        let manager = MaxComputeCacheManager::new(&MetaCacheConfig::default());
        let cache = manager.get_or_create(4);
        let names = NameMapping::identity(4, "proj", "sales");
        let calls = AtomicUsize::new(0);

        for _ in 0..2 {
            let values = cache
                .get_cached_partition_values(&names, |_| async {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(vec!["ds=20240101".to_string()])
                })
                .await
                .unwrap();
            assert_eq!(values.len(), 1);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn remove_cache_forgets_catalog() {
        let manager = MaxComputeCacheManager::new(&MetaCacheConfig::default());
        let first = manager.get_or_create(4);

        manager.invalidate_table(&NameMapping::identity(8, "db", "t"));
        manager.remove_cache(4);
        manager.remove_cache(4);

        assert!(manager.stats(4).is_empty());
        assert!(!Arc::ptr_eq(&first, &manager.get_or_create(4)));
        assert_eq!(first.stats()["estimated_size"], "0");
    }
}
