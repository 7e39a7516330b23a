//! Entry point for every external metadata cache.
//!
//! The manager owns the loader pools, the per-catalog cache tables and the
//! format-specific cache managers, and fans invalidation out from catalog,
//! database or table granularity to all of them.

use crate::cache::{
    get_cache_stats, CacheLoader, CacheStats, ExternalSchemaCache, MetaCache, MetaCacheError,
    NamePair, RemovalListener, RowCountCache, StatsMap,
};
use crate::catalog::{name_from_full_name, CatalogId, ExternalCatalog, ExternalTable};
use crate::config::MetaCacheConfig;
use crate::executor::{ExecutorPool, ExecutorPools};
use crate::metastore::{FileCacheValue, HiveMetaStoreCache, HivePartition};
use crate::metrics::MetricRegistry;
use crate::registry::CatalogRegistry;
use crate::sources::{
    HudiCacheManager, HudiPartitionProcessor, IcebergCacheManager, IcebergMetadataCache,
    MaxComputeCacheManager, MaxComputeMetadataCache, PaimonCacheManager, PaimonMetadataCache,
    SourceCacheManager,
};
use anyhow::Result;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

pub const SCHEMA_CACHE: &str = "schema_cache";
pub const ROW_COUNT_CACHE: &str = "row_count_cache";

/// Builder for [`ExternalMetaCacheManager`].
pub struct ExternalMetaCacheManagerBuilder {
    config: MetaCacheConfig,
    is_checkpoint: bool,
    metrics: Option<Arc<MetricRegistry>>,
    extra_managers: Vec<Arc<dyn SourceCacheManager>>,
}

impl Default for ExternalMetaCacheManagerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ExternalMetaCacheManagerBuilder {
    pub fn new() -> Self {
        Self {
            config: MetaCacheConfig::default(),
            is_checkpoint: false,
            metrics: None,
            extra_managers: Vec::new(),
        }
    }

    pub fn config(mut self, config: MetaCacheConfig) -> Self {
        self.config = config;
        self
    }

    /// Build the checkpoint variant: pools hand tasks off directly and keep no queue.
    pub fn checkpoint(mut self, is_checkpoint: bool) -> Self {
        self.is_checkpoint = is_checkpoint;
        self
    }

    /// Registry to publish pool gauges into. A private one is created otherwise.
    pub fn metrics(mut self, metrics: Arc<MetricRegistry>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Add a format cache that should receive invalidations after the built-in ones.
    pub fn register_source_manager(mut self, manager: Arc<dyn SourceCacheManager>) -> Self {
        self.extra_managers.push(manager);
        self
    }

    pub fn build(self) -> Result<ExternalMetaCacheManager> {
        self.config.validate()?;
        let metrics = self.metrics.unwrap_or_default();
        let pools = ExecutorPools::new(&self.config, self.is_checkpoint, &metrics)?;

        let iceberg = Arc::new(IcebergCacheManager::new(
            &self.config,
            pools.common_refresh.clone(),
        ));
        let paimon = Arc::new(PaimonCacheManager::new(
            &self.config,
            pools.common_refresh.clone(),
        ));
        let max_compute = Arc::new(MaxComputeCacheManager::new(&self.config));
        let hudi = Arc::new(HudiCacheManager::new(
            &self.config,
            pools.common_refresh.clone(),
        ));

        let mut source_managers: Vec<Arc<dyn SourceCacheManager>> = vec![
            hudi.clone(),
            iceberg.clone(),
            max_compute.clone(),
            paimon.clone(),
        ];
        source_managers.extend(self.extra_managers);

        let row_count_cache = RowCountCache::new(&self.config, pools.row_count_refresh.clone());

        tracing::info!(
            checkpoint = self.is_checkpoint,
            loader_threads = self.config.max_external_cache_loader_thread_pool_size,
            source_managers = source_managers.len(),
            "External meta cache manager initialized"
        );

        Ok(ExternalMetaCacheManager {
            config: self.config,
            pools,
            metrics,
            meta_store_caches: CatalogRegistry::new("metastore"),
            schema_caches: CatalogRegistry::new("schema"),
            row_count_cache,
            iceberg,
            paimon,
            max_compute,
            hudi,
            source_managers,
        })
    }
}

/// Caches of remote metadata for every external catalog.
#[derive(Debug)]
pub struct ExternalMetaCacheManager {
    config: MetaCacheConfig,
    pools: ExecutorPools,
    metrics: Arc<MetricRegistry>,
    meta_store_caches: CatalogRegistry<HiveMetaStoreCache>,
    schema_caches: CatalogRegistry<ExternalSchemaCache>,
    row_count_cache: RowCountCache,
    iceberg: Arc<IcebergCacheManager>,
    paimon: Arc<PaimonCacheManager>,
    max_compute: Arc<MaxComputeCacheManager>,
    hudi: Arc<HudiCacheManager>,
    source_managers: Vec<Arc<dyn SourceCacheManager>>,
}

impl ExternalMetaCacheManager {
    pub fn builder() -> ExternalMetaCacheManagerBuilder {
        ExternalMetaCacheManagerBuilder::new()
    }

    pub fn config(&self) -> &MetaCacheConfig {
        &self.config
    }

    pub fn get_meta_store_cache(&self, catalog: &ExternalCatalog) -> Arc<HiveMetaStoreCache> {
        self.meta_store_caches.get_or_create(catalog.id(), || {
            HiveMetaStoreCache::new(
                catalog.clone(),
                &self.config,
                self.pools.common_refresh.clone(),
                self.pools.file_listing.clone(),
            )
        })
    }

    pub fn get_schema_cache(&self, catalog: &ExternalCatalog) -> Arc<ExternalSchemaCache> {
        self.schema_caches.get_or_create(catalog.id(), || {
            ExternalSchemaCache::new(catalog, &self.config, self.pools.common_refresh.clone())
        })
    }

    pub fn get_iceberg_metadata_cache(&self) -> Arc<IcebergMetadataCache> {
        self.iceberg.cache().clone()
    }

    pub fn get_paimon_metadata_cache(&self) -> Arc<PaimonMetadataCache> {
        self.paimon.cache().clone()
    }

    pub fn get_max_compute_metadata_cache(&self, catalog_id: CatalogId) -> Arc<MaxComputeMetadataCache> {
        self.max_compute.get_or_create(catalog_id)
    }

    pub fn get_hudi_partition_processor(&self, catalog: &ExternalCatalog) -> Arc<HudiPartitionProcessor> {
        self.hudi.get_or_create(catalog)
    }

    pub fn get_row_count_cache(&self) -> &RowCountCache {
        &self.row_count_cache
    }

    pub fn file_listing_executor(&self) -> &Arc<ExecutorPool> {
        &self.pools.file_listing
    }

    pub fn schedule_executor(&self) -> &Arc<ExecutorPool> {
        &self.pools.schedule
    }

    pub fn metrics(&self) -> &Arc<MetricRegistry> {
        &self.metrics
    }

    /// Drop every cache of a catalog. Safe to call for unknown or already removed ids.
    pub fn remove_cache(&self, catalog_id: CatalogId) {
        if let Some(metastore) = self.meta_store_caches.remove(catalog_id) {
            metastore.invalidate_all();
        }
        self.invalid_schema_cache(catalog_id);
        for manager in &self.source_managers {
            manager.remove_cache(catalog_id);
        }
        self.row_count_cache.invalidate_catalog(catalog_id);
        tracing::debug!(catalog_id, "Removed external meta cache");
    }

    pub fn invalidate_table_cache(&self, table: &ExternalTable) {
        let catalog_id = table.catalog_id();
        let names = table.name_mapping();
        if let Some(schema) = self.schema_caches.get(catalog_id) {
            schema.invalidate_table_cache(names);
        }
        if let Some(metastore) = self.meta_store_caches.get(catalog_id) {
            metastore.invalidate_table_cache(names);
        }
        for manager in &self.source_managers {
            manager.invalidate_table(names);
        }
        self.row_count_cache.invalidate_table(names);
        tracing::debug!(catalog_id, table = %names, "Invalidated table cache");
    }

    /// Invalidate every cache entry of a database. Accepts `cluster:db` names.
    pub fn invalidate_db_cache(&self, catalog_id: CatalogId, db: &str) {
        let db = name_from_full_name(db);
        if let Some(schema) = self.schema_caches.get(catalog_id) {
            schema.invalidate_db_cache(db);
        }
        if let Some(metastore) = self.meta_store_caches.get(catalog_id) {
            metastore.invalidate_db_cache(db);
        }
        for manager in &self.source_managers {
            manager.invalidate_db(catalog_id, db);
        }
        self.row_count_cache.invalidate_db(catalog_id, db);
        tracing::debug!(catalog_id, db = %db, "Invalidated db cache");
    }

    /// Invalidate a whole catalog. Its schema cache is dropped and rebuilt on
    /// next use; its metastore cache stays registered but empty.
    pub fn invalidate_catalog_cache(&self, catalog_id: CatalogId) {
        self.invalid_schema_cache(catalog_id);
        if let Some(metastore) = self.meta_store_caches.get(catalog_id) {
            metastore.invalidate_all();
        }
        for manager in &self.source_managers {
            manager.invalidate_catalog(catalog_id);
        }
        self.row_count_cache.invalidate_catalog(catalog_id);
        tracing::debug!(catalog_id, "Invalidated catalog cache");
    }

    /// Unregister a catalog's schema cache. Handles still held elsewhere are
    /// emptied so they cannot serve schemas loaded before the call.
    pub fn invalid_schema_cache(&self, catalog_id: CatalogId) {
        if let Some(schema) = self.schema_caches.remove(catalog_id) {
            schema.invalidate_all();
        }
    }

    /// Record partitions added to a table. Tables whose partitioning cannot be
    /// described are skipped with a warning.
    pub fn add_partitions_cache(
        &self,
        catalog_id: CatalogId,
        table: &ExternalTable,
        partition_names: &[String],
    ) -> Result<()> {
        let Some(metastore) = self.meta_store_caches.get(catalog_id) else {
            return Ok(());
        };
        let types = match table.partition_column_types() {
            Ok(types) => types,
            Err(e @ MetaCacheError::NotSupported(_)) => {
                tracing::warn!(
                    catalog_id,
                    table = %table.name_mapping(),
                    error = %e,
                    "Ignoring partition add for unsupported table"
                );
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };
        metastore.add_partitions_cache(table.name_mapping(), partition_names, &types)
    }

    pub fn drop_partitions_cache(
        &self,
        catalog_id: CatalogId,
        table: &ExternalTable,
        partition_names: &[String],
    ) {
        if let Some(metastore) = self.meta_store_caches.get(catalog_id) {
            metastore.drop_partitions_cache(table.name_mapping(), partition_names, true);
        }
    }

    pub fn invalidate_partitions_cache(
        &self,
        table: &ExternalTable,
        partition_names: &[String],
    ) -> Result<()> {
        if let Some(metastore) = self.meta_store_caches.get(table.catalog_id()) {
            for name in partition_names {
                metastore.invalidate_partition_cache(table.name_mapping(), name)?;
            }
        }
        Ok(())
    }

    /// Build a names + objects cache refreshed on the common refresh pool.
    #[allow(clippy::too_many_arguments)]
    pub fn build_meta_cache<T: Clone + Send + Sync + 'static>(
        &self,
        name: &str,
        expire_after_access: Option<Duration>,
        refresh_after_write: Option<Duration>,
        max_size: usize,
        names_loader: Arc<dyn CacheLoader<(), Vec<NamePair>>>,
        object_loader: Arc<dyn CacheLoader<String, Option<T>>>,
        removal_listener: Option<RemovalListener<String, Option<T>>>,
    ) -> MetaCache<T> {
        MetaCache::new(
            name,
            expire_after_access,
            refresh_after_write,
            max_size,
            self.pools.common_refresh.clone(),
            names_loader,
            object_loader,
            removal_listener,
        )
    }

    pub fn get_cache_stats(stats: &CacheStats, estimated_size: u64) -> StatsMap {
        get_cache_stats(stats, estimated_size)
    }

    /// Stats of every cache that holds entries for a catalog, keyed by cache name.
    ///
    /// Caches shared across catalogs report their global numbers.
    pub fn catalog_cache_stats(&self, catalog_id: CatalogId) -> BTreeMap<String, StatsMap> {
        let mut stats = BTreeMap::new();
        if let Some(schema) = self.schema_caches.get(catalog_id) {
            stats.insert(SCHEMA_CACHE.to_string(), schema.stats());
        }
        if let Some(metastore) = self.meta_store_caches.get(catalog_id) {
            stats.extend(metastore.stats());
        }
        for manager in &self.source_managers {
            stats.extend(manager.stats(catalog_id));
        }
        stats.insert(ROW_COUNT_CACHE.to_string(), self.row_count_cache.stats());
        stats
    }

    /// List files of `partitions` from the schedule pool, which fans the
    /// listings out to the file-listing pool.
    pub fn schedule_file_listing(
        &self,
        catalog: &ExternalCatalog,
        partitions: Vec<Arc<HivePartition>>,
    ) -> Result<JoinHandle<Result<Vec<Arc<FileCacheValue>>>>, MetaCacheError> {
        let metastore = self.get_meta_store_cache(catalog);
        self.pools
            .schedule
            .try_spawn(async move { metastore.get_files_by_partitions(&partitions).await })
    }

    /// Stop every loader pool. Queued loads are dropped.
    pub fn shutdown(&self) {
        self.pools.shutdown();
        tracing::info!("External meta cache manager shut down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{Column, ColumnType, MockSource, MockTable, NameMapping, TableFormat};

    fn small_config() -> MetaCacheConfig {
        MetaCacheConfig {
            max_external_cache_loader_thread_pool_size: 2,
            ..Default::default()
        }
    }

    fn manager() -> ExternalMetaCacheManager {
        ExternalMetaCacheManager::builder()
            .config(small_config())
            .build()
            .unwrap()
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn builder_rejects_invalid_config() {
        let config = MetaCacheConfig {
            max_external_cache_loader_thread_pool_size: 0,
            ..Default::default()
        };
        assert!(ExternalMetaCacheManager::builder().config(config).build().is_err());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn registry_caches_are_per_catalog() {
        let manager = manager();
        let source = Arc::new(MockSource::new());
        let a = ExternalCatalog::new(1, "a", source.clone());
        let b = ExternalCatalog::new(2, "b", source);

        let first = manager.get_meta_store_cache(&a);
        assert!(Arc::ptr_eq(&first, &manager.get_meta_store_cache(&a)));
        assert!(!Arc::ptr_eq(&first, &manager.get_meta_store_cache(&b)));
        assert_eq!(manager.get_schema_cache(&a).catalog_id(), 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn add_partitions_skips_unsupported_tables() {
        let manager = manager();
        let source = Arc::new(MockSource::new());
        source.put_table(
            "db",
            "t",
            MockTable {
                partition_columns: vec![Column::new("p", ColumnType::Int)],
                ..Default::default()
            },
        );
        let catalog = ExternalCatalog::new(1, "hive", source);
        manager.get_meta_store_cache(&catalog);
        let unknown = ExternalTable::new(
            catalog,
            NameMapping::identity(1, "db", "t"),
            TableFormat::Unknown,
            vec![Column::new("p", ColumnType::Int)],
        );

        manager
            .add_partitions_cache(1, &unknown, &["p=1".to_string()])
            .unwrap();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn catalog_stats_cover_every_cache() {
        let manager = manager();
        let catalog = ExternalCatalog::new(1, "hive", Arc::new(MockSource::new()));
        manager.get_schema_cache(&catalog);
        manager.get_meta_store_cache(&catalog);
        manager.get_hudi_partition_processor(&catalog);
        manager.get_max_compute_metadata_cache(1);

        let names: Vec<_> = manager.catalog_cache_stats(1).into_keys().collect();
        assert_eq!(
            names,
            vec![
                "hive_file_cache",
                "hive_partition_cache",
                "hive_partition_values_cache",
                "hudi_partition_cache",
                "iceberg_snapshot_cache",
                "max_compute_partition_values_cache",
                "paimon_snapshot_cache",
                "row_count_cache",
                "schema_cache",
            ]
        );
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn checkpoint_manager_names_pools_accordingly() {
        let metrics = Arc::new(MetricRegistry::new());
        let manager = ExternalMetaCacheManager::builder()
            .config(small_config())
            .checkpoint(true)
            .metrics(metrics.clone())
            .build()
            .unwrap();

        assert_eq!(
            manager.file_listing_executor().name(),
            "CheckpointFileListingExecutor"
        );
        assert!(metrics.pool("CheckpointscheduleExecutor").is_some());
        manager.shutdown();
        assert!(manager.schedule_executor().is_shut_down());
    }
}
