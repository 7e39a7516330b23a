use super::SourceCacheManager;
use crate::cache::{loader_fn, CacheSpec, LoadingCache, StatsMap};
use crate::catalog::{CatalogId, ExternalTable, NameMapping, RemoteTableKey, SnapshotInfo};
use crate::config::MetaCacheConfig;
use crate::executor::ExecutorPool;
use anyhow::{Context, Result};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;

const SNAPSHOT_CACHE: &str = "paimon_snapshot_cache";

/// Latest snapshot of a Paimon table and the partitions visible in it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PaimonSnapshotCacheValue {
    pub snapshot: Option<SnapshotInfo>,
    pub partition_names: Vec<String>,
}

#[derive(Debug)]
pub struct PaimonMetadataCache {
    snapshots: LoadingCache<RemoteTableKey, Arc<PaimonSnapshotCacheValue>>,
}

impl PaimonMetadataCache {
    pub fn new(config: &MetaCacheConfig, refresh_executor: Arc<ExecutorPool>) -> Self {
        let snapshots = CacheSpec::new(SNAPSHOT_CACHE)
            .max_size(config.max_snapshot_cache_num)
            .expire_after_access(config.expire_after_access())
            .refresh_after_write(config.refresh_after_write())
            .executor(refresh_executor)
            .build(loader_fn(|key: RemoteTableKey| async move {
                let names = key.names();
                let source = key.source();
                let snapshot = source
                    .list_snapshots(&names.remote_db, &names.remote_table)
                    .await
                    .with_context(|| format!("Failed to list Paimon snapshots of {}", names))?
                    .into_iter()
                    .max_by_key(|s| s.snapshot_id);
                let partition_names = source
                    .list_partition_names(&names.remote_db, &names.remote_table)
                    .await
                    .with_context(|| format!("Failed to list Paimon partitions of {}", names))?;
                Ok(Arc::new(PaimonSnapshotCacheValue {
                    snapshot,
                    partition_names,
                }))
            }));
        Self { snapshots }
    }

    pub async fn get_snapshot(&self, table: &ExternalTable) -> Result<Arc<PaimonSnapshotCacheValue>> {
        self.snapshots.get(&RemoteTableKey::from(table)).await
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

#[derive(Debug)]
pub struct PaimonCacheManager {
    cache: Arc<PaimonMetadataCache>,
}

impl PaimonCacheManager {
    pub fn new(config: &MetaCacheConfig, refresh_executor: Arc<ExecutorPool>) -> Self {
        Self {
            cache: Arc::new(PaimonMetadataCache::new(config, refresh_executor)),
        }
    }

    pub fn cache(&self) -> &Arc<PaimonMetadataCache> {
        &self.cache
    }
}

impl SourceCacheManager for PaimonCacheManager {
    fn name(&self) -> &'static str {
        "paimon"
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
    use crate::catalog::{
        Column, ColumnType, ExternalCatalog, MockSource, MockTable, RemotePartition, TableFormat,
    };
    use crate::executor::new_thread_pool;
    use chrono::Utc;

    #[tokio::test(flavor = "multi_thread")]
    async fn snapshot_and_partitions_load_together() {
        let source = Arc::new(MockSource::new());
        source.put_table(
            "db",
            "orders",
            MockTable {
                format: TableFormat::Paimon,
                partition_columns: vec![Column::new("region", ColumnType::String)],
                partitions: vec![RemotePartition {
                    values: vec!["eu".to_string()],
                    location: "oss://b/orders/region=eu".to_string(),
                    input_format: String::new(),
                }],
                snapshots: vec![
                    SnapshotInfo { snapshot_id: 4, schema_id: 1, committed_at: Utc::now() },
                    SnapshotInfo { snapshot_id: 5, schema_id: 1, committed_at: Utc::now() },
                ],
                ..Default::default()
            },
        );
        let table = ExternalTable::new(
            ExternalCatalog::new(2, "paimon", source.clone()),
            NameMapping::identity(2, "db", "orders"),
            TableFormat::Paimon,
            vec![],
        );
        let pool = Arc::new(new_thread_pool(false, 1, 10, "PaimonTest", 0, None).unwrap());
        let manager = PaimonCacheManager::new(&MetaCacheConfig::default(), pool);

        let value = manager.cache().get_snapshot(&table).await.unwrap();
        assert_eq!(value.snapshot.as_ref().map(|s| s.snapshot_id), Some(5));
        assert_eq!(value.partition_names, vec!["region=eu".to_string()]);

        manager.invalidate_table(table.name_mapping());
        manager.cache().get_snapshot(&table).await.unwrap();
        assert_eq!(source.snapshot_calls(), 2);
    }
}
