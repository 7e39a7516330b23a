use super::SourceCacheManager;
use crate::cache::{loader_fn, CacheSpec, LoadingCache, StatsMap};
use crate::catalog::{CatalogId, ExternalTable, NameMapping, RemoteTableKey, SnapshotInfo};
use crate::config::MetaCacheConfig;
use crate::executor::ExecutorPool;
use anyhow::{Context, Result};
use std::collections::BTreeMap;
use std::sync::Arc;

const SNAPSHOT_CACHE: &str = "iceberg_snapshot_cache";

/// Snapshot lists of Iceberg tables across all catalogs.
#[derive(Debug)]
pub struct IcebergMetadataCache {
    snapshots: LoadingCache<RemoteTableKey, Arc<Vec<SnapshotInfo>>>,
}

impl IcebergMetadataCache {
    pub fn new(config: &MetaCacheConfig, refresh_executor: Arc<ExecutorPool>) -> Self {
        let snapshots = CacheSpec::new(SNAPSHOT_CACHE)
            .max_size(config.max_snapshot_cache_num)
            .expire_after_access(config.expire_after_access())
            .refresh_after_write(config.refresh_after_write())
            .executor(refresh_executor)
            .build(loader_fn(|key: RemoteTableKey| async move {
                let names = key.names();
                let snapshots = key
                    .source()
                    .list_snapshots(&names.remote_db, &names.remote_table)
                    .await
                    .with_context(|| format!("Failed to list Iceberg snapshots of {}", names))?;
                Ok(Arc::new(snapshots))
            }));
        Self { snapshots }
    }

    pub async fn get_snapshot_list(&self, table: &ExternalTable) -> Result<Arc<Vec<SnapshotInfo>>> {
        self.snapshots.get(&RemoteTableKey::from(table)).await
    }

    /// Most recently committed snapshot, or `None` for an empty table.
    pub async fn get_latest_snapshot(&self, table: &ExternalTable) -> Result<Option<SnapshotInfo>> {
        let snapshots = self.get_snapshot_list(table).await?;
        Ok(snapshots.iter().max_by_key(|s| s.committed_at).cloned())
    }

    pub fn invalidate_table(&self, names: &NameMapping) {
        self.snapshots.invalidate_if(|k| k.names().same_table(names));
    }

    pub fn invalidate_db(&self, catalog_id: CatalogId, db: &str) {
        self.snapshots
            .invalidate_if(|k| k.names().catalog_id == catalog_id && k.names().in_db(db));
    }

    pub fn invalidate_catalog(&self, catalog_id: CatalogId) {
        self.snapshots
            .invalidate_if(|k| k.names().catalog_id == catalog_id);
    }

    pub fn stats(&self) -> StatsMap {
        self.snapshots.stats_map()
    }
}

/// Registers the global Iceberg cache with the manager's fan-out list.
#[derive(Debug)]
pub struct IcebergCacheManager {
    cache: Arc<IcebergMetadataCache>,
}

impl IcebergCacheManager {
    pub fn new(config: &MetaCacheConfig, refresh_executor: Arc<ExecutorPool>) -> Self {
        Self {
            cache: Arc::new(IcebergMetadataCache::new(config, refresh_executor)),
        }
    }

    pub fn cache(&self) -> &Arc<IcebergMetadataCache> {
        &self.cache
    }
}

impl SourceCacheManager for IcebergCacheManager {
    fn name(&self) -> &'static str {
        "iceberg"
    }

    fn invalidate_table(&self, names: &NameMapping) {
        self.cache.invalidate_table(names);
    }

    fn invalidate_db(&self, catalog_id: CatalogId, db: &str) {
        self.cache.invalidate_db(catalog_id, db);
    }

    fn invalidate_catalog(&self, catalog_id: CatalogId) {
        self.cache.invalidate_catalog(catalog_id);
    }

    fn stats(&self, _catalog_id: CatalogId) -> BTreeMap<String, StatsMap> {
        BTreeMap::from([(SNAPSHOT_CACHE.to_string(), self.cache.stats())])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{ExternalCatalog, MockSource, MockTable, TableFormat};
    use crate::executor::new_thread_pool;
    use chrono::{TimeZone, Utc};

    fn snapshot(id: i64, hour: u32) -> SnapshotInfo {
        SnapshotInfo {
            snapshot_id: id,
            schema_id: 0,
            committed_at: Utc.with_ymd_and_hms(2024, 1, 1, hour, 0, 0).unwrap(),
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn latest_snapshot_is_cached_until_invalidated() {
        let source = Arc::new(MockSource::new());
        source.put_table(
            "db",
            "events",
            MockTable {
                format: TableFormat::Iceberg,
                snapshots: vec![snapshot(1, 1), snapshot(2, 2)],
                ..Default::default()
            },
        );
        let table = ExternalTable::new(
            ExternalCatalog::new(9, "lake", source.clone()),
            NameMapping::identity(9, "db", "events"),
            TableFormat::Iceberg,
            vec![],
        );
        let pool = Arc::new(new_thread_pool(false, 1, 10, "IcebergTest", 0, None).unwrap());
        let manager = IcebergCacheManager::new(&MetaCacheConfig::default(), pool);

        let latest = manager.cache().get_latest_snapshot(&table).await.unwrap();
        assert_eq!(latest.map(|s| s.snapshot_id), Some(2));

        source.update_table("db", "events", |t| t.snapshots.push(snapshot(3, 3)));
        manager.cache().get_latest_snapshot(&table).await.unwrap();
        assert_eq!(source.snapshot_calls(), 1);

        manager.invalidate_db(9, "db");
        let latest = manager.cache().get_latest_snapshot(&table).await.unwrap();
        assert_eq!(latest.map(|s| s.snapshot_id), Some(3));
        assert_eq!(source.snapshot_calls(), 2);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn other_catalogs_are_untouched() {
        let source = Arc::new(MockSource::new());
        let pool = Arc::new(new_thread_pool(false, 1, 10, "IcebergIso", 0, None).unwrap());
        let manager = IcebergCacheManager::new(&MetaCacheConfig::default(), pool);
        for id in [1, 2] {
            let table = ExternalTable::new(
                ExternalCatalog::new(id, "lake", source.clone()),
                NameMapping::identity(id, "db", "t"),
                TableFormat::Iceberg,
                vec![],
            );
            source.put_table("db", "t", MockTable::default());
            manager.cache().get_snapshot_list(&table).await.unwrap();
        }

        manager.remove_cache(1);

        assert_eq!(manager.stats(2)[SNAPSHOT_CACHE]["estimated_size"], "1");
    }
}
