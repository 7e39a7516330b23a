//! Partition and file metadata cache of a Hive-style catalog.
//!
//! Three caches are kept per catalog: the partition value list of each table,
//! partition descriptors, and file listings under table or partition
//! locations. File listing misses fan out to the file-listing pool.

mod partition;

pub use partition::{
    escape_path_name, make_partition_name, parse_partition_name, partition_values_from_name,
    unescape_path_name, HivePartitionValues, PartitionItem, PartitionValue,
    HIVE_DEFAULT_PARTITION,
};

use crate::cache::{loader_fn, CacheSpec, LoadingCache, StatsMap};
use crate::catalog::{
    name_from_full_name, CatalogId, ColumnType, ExternalCatalog, ExternalTable, NameMapping,
    RemoteFile,
};
use crate::config::MetaCacheConfig;
use crate::executor::ExecutorPool;
use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use futures::future::try_join_all;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::task::JoinHandle;

pub const PARTITION_VALUES_CACHE: &str = "hive_partition_values_cache";
pub const PARTITION_CACHE: &str = "hive_partition_cache";
pub const FILE_CACHE: &str = "hive_file_cache";

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PartitionValueCacheKey {
    pub names: NameMapping,
    pub types: Vec<ColumnType>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PartitionCacheKey {
    pub names: NameMapping,
    pub values: Vec<String>,
}

/// File listing key. Unpartitioned tables use empty `partition_values`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FileCacheKey {
    pub names: NameMapping,
    pub location: String,
    pub partition_values: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HivePartition {
    pub names: NameMapping,
    pub values: Vec<String>,
    pub location: String,
    pub input_format: String,
}

impl HivePartition {
    fn file_cache_key(&self) -> FileCacheKey {
        FileCacheKey {
            names: self.names.clone(),
            location: self.location.clone(),
            partition_values: self.values.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileCacheValue {
    pub files: Vec<RemoteFile>,
    pub partition_values: Vec<String>,
    pub fetched_at: DateTime<Utc>,
}

impl FileCacheValue {
    pub fn total_length(&self) -> u64 {
        self.files.iter().map(|f| f.length).sum()
    }
}

/// Per-catalog Hive partition and file cache.
#[derive(Debug)]
pub struct HiveMetaStoreCache {
    catalog: ExternalCatalog,
    partition_values: LoadingCache<PartitionValueCacheKey, Arc<HivePartitionValues>>,
    partitions: LoadingCache<PartitionCacheKey, Arc<HivePartition>>,
    files: LoadingCache<FileCacheKey, Arc<FileCacheValue>>,
    file_listing: Arc<ExecutorPool>,
}

impl HiveMetaStoreCache {
    pub fn new(
        catalog: ExternalCatalog,
        config: &MetaCacheConfig,
        refresh_executor: Arc<ExecutorPool>,
        file_listing_executor: Arc<ExecutorPool>,
    ) -> Self {
        let source = catalog.source().clone();
        let partition_values = CacheSpec::new(PARTITION_VALUES_CACHE)
            .max_size(config.max_hive_partition_table_cache_num)
            .expire_after_access(config.expire_after_access())
            .refresh_after_write(config.refresh_after_write())
            .executor(refresh_executor.clone())
            .build(loader_fn(move |key: PartitionValueCacheKey| {
                let source = source.clone();
                async move {
                    let names = source
                        .list_partition_names(&key.names.remote_db, &key.names.remote_table)
                        .await
                        .with_context(|| format!("Failed to list partitions of {}", key.names))?;
                    Ok(Arc::new(HivePartitionValues::new(&names, &key.types)?))
                }
            }));

        let source = catalog.source().clone();
        let partitions = CacheSpec::new(PARTITION_CACHE)
            .max_size(config.max_hive_partition_cache_num)
            .expire_after_access(config.expire_after_access())
            .refresh_after_write(config.refresh_after_write())
            .executor(refresh_executor.clone())
            .build(loader_fn(move |key: PartitionCacheKey| {
                let source = source.clone();
                async move {
                    let mut found = source
                        .get_partitions(
                            &key.names.remote_db,
                            &key.names.remote_table,
                            std::slice::from_ref(&key.values),
                        )
                        .await?;
                    let partition = found
                        .pop()
                        .ok_or_else(|| anyhow!("partition {:?} of {} not found", key.values, key.names))?;
                    Ok(Arc::new(HivePartition {
                        names: key.names,
                        values: partition.values,
                        location: partition.location,
                        input_format: partition.input_format,
                    }))
                }
            }));

        let source = catalog.source().clone();
        let files = CacheSpec::new(FILE_CACHE)
            .max_size(config.max_external_file_cache_num)
            .expire_after_access(config.expire_after_access())
            .refresh_after_write(config.refresh_after_write())
            .executor(refresh_executor)
            .build(loader_fn(move |key: FileCacheKey| {
                let source = source.clone();
                async move {
                    let files = source
                        .list_files(&key.location)
                        .await
                        .with_context(|| format!("Failed to list files under {}", key.location))?;
                    Ok(Arc::new(FileCacheValue {
                        files,
                        partition_values: key.partition_values,
                        fetched_at: Utc::now(),
                    }))
                }
            }));

        Self {
            catalog,
            partition_values,
            partitions,
            files,
            file_listing: file_listing_executor,
        }
    }

    pub fn catalog_id(&self) -> CatalogId {
        self.catalog.id()
    }

    /// Partition value list of a partitioned table.
    pub async fn get_partition_values(&self, table: &ExternalTable) -> Result<Arc<HivePartitionValues>> {
        let key = PartitionValueCacheKey {
            names: table.name_mapping().clone(),
            types: table.partition_column_types()?,
        };
        self.partition_values.get(&key).await
    }

    /// Partitions for each value list, fetching all misses in one remote call.
    pub async fn get_all_partitions(
        &self,
        names: &NameMapping,
        values_list: &[Vec<String>],
    ) -> Result<Vec<Arc<HivePartition>>> {
        let keys: Vec<PartitionCacheKey> = values_list
            .iter()
            .map(|values| PartitionCacheKey {
                names: names.clone(),
                values: values.clone(),
            })
            .collect();
        let source = self.catalog.source().clone();
        self.partitions
            .get_all(&keys, |missing| async move {
                let values: Vec<Vec<String>> = missing.iter().map(|k| k.values.clone()).collect();
                let fetched = source
                    .get_partitions(&names.remote_db, &names.remote_table, &values)
                    .await
                    .with_context(|| format!("Failed to fetch partitions of {}", names))?;
                let mut loaded = HashMap::with_capacity(fetched.len());
                for partition in fetched {
                    let key = PartitionCacheKey {
                        names: names.clone(),
                        values: partition.values.clone(),
                    };
                    loaded.insert(
                        key,
                        Arc::new(HivePartition {
                            names: names.clone(),
                            values: partition.values,
                            location: partition.location,
                            input_format: partition.input_format,
                        }),
                    );
                }
                Ok(loaded)
            })
            .await
    }

    /// File listings of the given partitions, in input order.
    ///
    /// Misses are listed concurrently on the file-listing pool. When that pool
    /// is saturated the listing runs in the caller's task instead.
    pub async fn get_files_by_partitions(
        &self,
        partitions: &[Arc<HivePartition>],
    ) -> Result<Vec<Arc<FileCacheValue>>> {
        enum Listing {
            Cached(Arc<FileCacheValue>),
            Spawned(JoinHandle<Result<Arc<FileCacheValue>>>),
            Inline(FileCacheKey),
        }

        let mut listings = Vec::with_capacity(partitions.len());
        for partition in partitions {
            let key = partition.file_cache_key();
            if let Some(value) = self.files.get_if_present(&key) {
                listings.push(Listing::Cached(value));
                continue;
            }
            let files = self.files.clone();
            let task_key = key.clone();
            match self
                .file_listing
                .try_spawn(async move { files.load_after_miss(&task_key).await })
            {
                Ok(handle) => listings.push(Listing::Spawned(handle)),
                Err(e) => {
                    tracing::debug!(
                        catalog_id = self.catalog.id(),
                        location = %key.location,
                        error = %e,
                        "File listing pool unavailable, listing in caller"
                    );
                    listings.push(Listing::Inline(key));
                }
            }
        }

        try_join_all(listings.into_iter().map(|listing| async move {
            match listing {
                Listing::Cached(value) => Ok(value),
                Listing::Spawned(handle) => handle.await.context("File listing task failed")?,
                Listing::Inline(key) => self.files.load_after_miss(&key).await,
            }
        }))
        .await
    }

    /// File listing of an unpartitioned table's location.
    pub async fn get_files_for_table(&self, table: &ExternalTable) -> Result<Arc<FileCacheValue>> {
        let names = table.name_mapping();
        let location = self
            .catalog
            .source()
            .table_location(&names.remote_db, &names.remote_table)
            .await
            .with_context(|| format!("Failed to resolve location of {}", names))?;
        let key = FileCacheKey {
            names: names.clone(),
            location,
            partition_values: Vec::new(),
        };
        self.files.get(&key).await
    }

    pub fn invalidate_table_cache(&self, names: &NameMapping) {
        self.partition_values
            .invalidate_if(|k| k.names.same_table(names));
        self.partitions.invalidate_if(|k| k.names.same_table(names));
        self.files.invalidate_if(|k| k.names.same_table(names));
        tracing::debug!(catalog_id = self.catalog.id(), table = %names, "Invalidated metastore cache for table");
    }

    pub fn invalidate_db_cache(&self, db: &str) {
        let db = name_from_full_name(db);
        self.partition_values.invalidate_if(|k| k.names.in_db(db));
        self.partitions.invalidate_if(|k| k.names.in_db(db));
        self.files.invalidate_if(|k| k.names.in_db(db));
        tracing::debug!(catalog_id = self.catalog.id(), db = %db, "Invalidated metastore cache for db");
    }

    pub fn invalidate_all(&self) {
        self.partition_values.invalidate_all();
        self.partitions.invalidate_all();
        self.files.invalidate_all();
        tracing::debug!(catalog_id = self.catalog.id(), "Invalidated all metastore cache");
    }

    /// Add newly created partitions to a cached partition value list.
    ///
    /// Nothing happens when the list is not cached; the next read loads it
    /// with the new partitions included.
    pub fn add_partitions_cache(
        &self,
        names: &NameMapping,
        partition_names: &[String],
        types: &[ColumnType],
    ) -> Result<()> {
        let key = PartitionValueCacheKey {
            names: names.clone(),
            types: types.to_vec(),
        };
        let Some(current) = self.partition_values.peek(&key) else {
            return Ok(());
        };
        let mut updated = (*current).clone();
        let added = updated.add(partition_names, types)?;
        self.partition_values.put(key, Arc::new(updated));
        tracing::debug!(
            catalog_id = self.catalog.id(),
            table = %names,
            added,
            "Added partitions to metastore cache"
        );
        Ok(())
    }

    /// Remove dropped partitions from every cached value list of the table.
    pub fn drop_partitions_cache(
        &self,
        names: &NameMapping,
        partition_names: &[String],
        invalidate_file_cache: bool,
    ) {
        let keys: Vec<_> = self
            .partition_values
            .keys()
            .into_iter()
            .filter(|k| k.names.same_table(names))
            .collect();
        for key in keys {
            let Some(current) = self.partition_values.peek(&key) else {
                continue;
            };
            let mut updated = (*current).clone();
            let removed = updated.remove(partition_names);
            self.partition_values.put(key, Arc::new(updated));
            if invalidate_file_cache {
                for item in &removed {
                    self.invalidate_partition_values(names, &item.raw_values);
                }
            }
        }
        tracing::debug!(
            catalog_id = self.catalog.id(),
            table = %names,
            dropped = partition_names.len(),
            "Dropped partitions from metastore cache"
        );
    }

    /// Invalidate one partition's descriptor and file listing.
    pub fn invalidate_partition_cache(&self, names: &NameMapping, partition_name: &str) -> Result<()> {
        let values = partition_values_from_name(partition_name)?;
        self.invalidate_partition_values(names, &values);
        Ok(())
    }

    fn invalidate_partition_values(&self, names: &NameMapping, values: &[String]) {
        self.partitions
            .invalidate_if(|k| k.names.same_table(names) && k.values == values);
        self.files
            .invalidate_if(|k| k.names.same_table(names) && k.partition_values == values);
    }

    pub fn stats(&self) -> BTreeMap<String, StatsMap> {
        BTreeMap::from([
            (PARTITION_VALUES_CACHE.to_string(), self.partition_values.stats_map()),
            (PARTITION_CACHE.to_string(), self.partitions.stats_map()),
            (FILE_CACHE.to_string(), self.files.stats_map()),
        ])
    }
}
