//! Best-effort row count estimates.
//!
//! Reads never wait on the remote source: a miss schedules a load on the
//! row-count pool and reports the count as unknown.

use super::loading_cache::{loader_fn, CacheSpec, LoadingCache};
use super::StatsMap;
use crate::catalog::{CatalogId, ExternalTable, NameMapping, RemoteTableKey};
use crate::config::MetaCacheConfig;
use crate::executor::ExecutorPool;
use std::sync::Arc;

#[derive(Debug)]
pub struct RowCountCache {
    cache: LoadingCache<RemoteTableKey, Option<u64>>,
}

impl RowCountCache {
    pub fn new(config: &MetaCacheConfig, executor: Arc<ExecutorPool>) -> Self {
        // A failed fetch is cached as unknown and retried on refresh.
        let loader = loader_fn(|key: RemoteTableKey| async move {
            let names = key.names();
            match key
                .source()
                .row_count(&names.remote_db, &names.remote_table)
                .await
            {
                Ok(count) => Ok(count),
                Err(e) => {
                    tracing::warn!(
                        catalog_id = names.catalog_id,
                        table = %names,
                        error = %e,
                        "Failed to fetch row count"
                    );
                    Ok(None)
                }
            }
        });

        let cache = CacheSpec::new("row_count_cache")
            .max_size(config.max_external_table_row_count_cache_num)
            .expire_after_access(config.expire_after_access())
            .refresh_after_write(config.refresh_after_write())
            .executor(executor)
            .build(loader);
        Self { cache }
    }

    /// Cached row count, or `None` while unknown. Never blocks.
    pub fn get_cached_row_count(&self, table: &ExternalTable) -> Option<u64> {
        let key = RemoteTableKey::from(table);
        if let Some(count) = self.cache.get_if_present(&key) {
            return count;
        }
        match self.cache.schedule_load(key) {
            Ok(_) => {}
            Err(e) if e.is_saturation() => {
                tracing::debug!(table = %table.name_mapping(), error = %e, "Row count load not scheduled");
            }
            Err(e) => {
                tracing::warn!(table = %table.name_mapping(), error = %e, "Row count load not scheduled");
            }
        }
        None
    }

    pub fn invalidate_table(&self, names: &NameMapping) {
        self.cache.invalidate_if(|k| k.names().same_table(names));
    }

    pub fn invalidate_db(&self, catalog_id: CatalogId, db: &str) {
        self.cache
            .invalidate_if(|k| k.names().catalog_id == catalog_id && k.names().in_db(db));
    }

    pub fn invalidate_catalog(&self, catalog_id: CatalogId) {
        self.cache
            .invalidate_if(|k| k.names().catalog_id == catalog_id);
    }

    pub fn stats(&self) -> StatsMap {
        self.cache.stats_map()
    }
}
