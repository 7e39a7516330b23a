use super::SourceCacheManager;
use crate::cache::{loader_fn, CacheSpec, LoadingCache, StatsMap};
use crate::catalog::{CatalogId, ExternalCatalog, ExternalTable, NameMapping};
use crate::config::MetaCacheConfig;
use crate::executor::ExecutorPool;
use crate::registry::CatalogRegistry;
use anyhow::{Context, Result};
use std::collections::BTreeMap;
use std::sync::Arc;

const PARTITION_CACHE: &str = "hudi_partition_cache";

/// Partition names of a Hudi table as of one timeline instant.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct SnapshotPartitionKey {
    names: NameMapping,
    snapshot_id: i64,
}

/// Per-catalog cache of Hudi partitions keyed by table and snapshot.
#[derive(Debug)]
pub struct HudiPartitionProcessor {
    catalog_id: CatalogId,
    partitions: LoadingCache<SnapshotPartitionKey, Arc<Vec<String>>>,
}

impl HudiPartitionProcessor {
    pub fn new(
        catalog: &ExternalCatalog,
        config: &MetaCacheConfig,
        refresh_executor: Arc<ExecutorPool>,
    ) -> Self {
        let source = catalog.source().clone();
        let partitions = CacheSpec::new(PARTITION_CACHE)
            .max_size(config.max_hive_partition_table_cache_num)
            .expire_after_access(config.expire_after_access())
            .refresh_after_write(config.refresh_after_write())
            .executor(refresh_executor)
            .build(loader_fn(move |key: SnapshotPartitionKey| {
                let source = source.clone();
                async move {
                    let names = source
                        .list_partition_names(&key.names.remote_db, &key.names.remote_table)
                        .await
                        .with_context(|| {
                            format!(
                                "Failed to list Hudi partitions of {} at snapshot {}",
                                key.names, key.snapshot_id
                            )
                        })?;
                    Ok(Arc::new(names))
                }
            }));
        Self {
            catalog_id: catalog.id(),
            partitions,
        }
    }

    pub async fn get_snapshot_partitions(
        &self,
        table: &ExternalTable,
        snapshot_id: i64,
    ) -> Result<Arc<Vec<String>>> {
        let key = SnapshotPartitionKey {
            names: table.name_mapping().clone(),
            snapshot_id,
        };
        self.partitions.get(&key).await
    }

    pub fn clean_table_partitions(&self, names: &NameMapping) {
        self.partitions.invalidate_if(|k| k.names.same_table(names));
    }

    pub fn clean_database_partitions(&self, db: &str) {
        self.partitions.invalidate_if(|k| k.names.in_db(db));
    }

    pub fn clean_up(&self) {
        self.partitions.invalidate_all();
        tracing::debug!(catalog_id = self.catalog_id, "Cleaned Hudi partition cache");
    }

    pub fn stats(&self) -> StatsMap {
        self.partitions.stats_map()
    }
}

/// Per-catalog Hudi partition processors, created on first use.
#[derive(Debug)]
pub struct HudiCacheManager {
    config: MetaCacheConfig,
    refresh_executor: Arc<ExecutorPool>,
    processors: CatalogRegistry<HudiPartitionProcessor>,
}

impl HudiCacheManager {
    pub fn new(config: &MetaCacheConfig, refresh_executor: Arc<ExecutorPool>) -> Self {
        Self {
            config: config.clone(),
            refresh_executor,
            processors: CatalogRegistry::new("hudi"),
        }
    }

    pub fn get_or_create(&self, catalog: &ExternalCatalog) -> Arc<HudiPartitionProcessor> {
        self.processors.get_or_create(catalog.id(), || {
            HudiPartitionProcessor::new(catalog, &self.config, self.refresh_executor.clone())
        })
    }
}

impl SourceCacheManager for HudiCacheManager {
    fn name(&self) -> &'static str {
        "hudi"
    }

    fn invalidate_table(&self, names: &NameMapping) {
        if let Some(processor) = self.processors.get(names.catalog_id) {
            processor.clean_table_partitions(names);
        }
    }

    fn invalidate_db(&self, catalog_id: CatalogId, db: &str) {
        if let Some(processor) = self.processors.get(catalog_id) {
            processor.clean_database_partitions(db);
        }
    }

    fn invalidate_catalog(&self, catalog_id: CatalogId) {
        if let Some(processor) = self.processors.get(catalog_id) {
            processor.clean_up();
        }
    }

    fn remove_cache(&self, catalog_id: CatalogId) {
        if let Some(processor) = self.processors.remove(catalog_id) {
            processor.clean_up();
        }
    }

    fn stats(&self, catalog_id: CatalogId) -> BTreeMap<String, StatsMap> {
        self.processors
            .get(catalog_id)
            .map(|p| BTreeMap::from([(PARTITION_CACHE.to_string(), p.stats())]))
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{Column, ColumnType, MockSource, MockTable, RemotePartition, TableFormat};
    use crate::executor::new_thread_pool;

    #[tokio::test(flavor = "multi_thread")]
    async fn partitions_are_cached_per_snapshot() {
        let source = Arc::new(MockSource::new());
        source.put_table(
            "db",
            "trips",
            MockTable {
                format: TableFormat::Hudi,
                partition_columns: vec![Column::new("city", ColumnType::String)],
                partitions: vec![RemotePartition {
                    values: vec!["sf".to_string()],
                    location: "s3://b/trips/city=sf".to_string(),
                    input_format: String::new(),
                }],
                ..Default::default()
            },
        );
        let catalog = ExternalCatalog::new(6, "hudi", source.clone());
        let table = ExternalTable::new(
            catalog.clone(),
            NameMapping::identity(6, "db", "trips"),
            TableFormat::Hudi,
            vec![Column::new("city", ColumnType::String)],
        );
        let pool = Arc::new(new_thread_pool(false, 1, 10, "HudiTest", 0, None).unwrap());
        let manager = HudiCacheManager::new(&MetaCacheConfig::default(), pool);
        let processor = manager.get_or_create(&catalog);

        processor.get_snapshot_partitions(&table, 100).await.unwrap();
        processor.get_snapshot_partitions(&table, 100).await.unwrap();
        let parts = processor.get_snapshot_partitions(&table, 101).await.unwrap();

        assert_eq!(parts.as_slice(), ["city=sf".to_string()]);
        assert_eq!(source.partition_name_calls(), 2);

        manager.invalidate_db(6, "db");
        assert_eq!(manager.stats(6)[PARTITION_CACHE]["estimated_size"], "0");
    }
}
