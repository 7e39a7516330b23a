use super::loading_cache::{loader_fn, CacheSpec, LoadingCache};
use super::StatsMap;
use crate::catalog::{name_from_full_name, CatalogId, Column, ExternalCatalog, NameMapping};
use crate::config::MetaCacheConfig;
use crate::executor::ExecutorPool;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;

/// Columns of one table as fetched from the remote source.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SchemaCacheValue {
    pub columns: Vec<Column>,
    pub fetched_at: DateTime<Utc>,
}

/// Per-catalog cache of table schemas, keyed by table name mapping.
#[derive(Debug)]
pub struct ExternalSchemaCache {
    catalog_id: CatalogId,
    cache: LoadingCache<NameMapping, Option<Arc<SchemaCacheValue>>>,
}

impl ExternalSchemaCache {
    pub fn new(
        catalog: &ExternalCatalog,
        config: &MetaCacheConfig,
        refresh_executor: Arc<ExecutorPool>,
    ) -> Self {
        let source = catalog.source().clone();
        let loader = loader_fn(move |names: NameMapping| {
            let source = source.clone();
            async move {
                let columns = source
                    .table_schema(&names.remote_db, &names.remote_table)
                    .await
                    .with_context(|| format!("Failed to fetch schema of {}", names))?;
                Ok(columns.map(|columns| {
                    Arc::new(SchemaCacheValue {
                        columns,
                        fetched_at: Utc::now(),
                    })
                }))
            }
        });

        let cache = CacheSpec::new(format!("schema_cache_{}", catalog.id()))
            .max_size(config.max_external_schema_cache_num)
            .expire_after_access(config.expire_after_access())
            .refresh_after_write(config.refresh_after_write())
            .executor(refresh_executor)
            .build(loader);

        Self {
            catalog_id: catalog.id(),
            cache,
        }
    }

    pub fn catalog_id(&self) -> CatalogId {
        self.catalog_id
    }

    /// Schema of a table, or `None` if the source does not know it.
    pub async fn get_schema_value(&self, names: &NameMapping) -> Result<Option<Arc<SchemaCacheValue>>> {
        self.cache.get(names).await
    }

    /// Drop every cached schema of the table, under any remote mapping.
    pub fn invalidate_table_cache(&self, names: &NameMapping) {
        let removed = self.cache.invalidate_if(|k| k.same_table(names));
        tracing::debug!(
            catalog_id = self.catalog_id,
            table = %names,
            removed,
            "Invalidated schema cache for table"
        );
    }

    pub fn invalidate_db_cache(&self, db: &str) {
        let db = name_from_full_name(db);
        let removed = self
            .cache
            .invalidate_if(|k| k.in_db(db));
        tracing::debug!(
            catalog_id = self.catalog_id,
            db = %db,
            removed,
            "Invalidated schema cache for db"
        );
    }

    pub fn invalidate_all(&self) {
        self.cache.invalidate_all();
        tracing::debug!(catalog_id = self.catalog_id, "Invalidated all schema cache");
    }

    pub fn stats(&self) -> StatsMap {
        self.cache.stats_map()
    }
}
