//! Catalog and table identity as seen by the metadata caches.
//!
//! A catalog is a registered external data source. Caches never talk to the
//! remote service directly; they go through the catalog's [`MetadataSource`].

mod mock_source;
mod source;

pub use mock_source::{MockSource, MockSourceFixture, MockTable};
pub use source::{Column, ColumnType, MetadataSource, RemoteFile, RemotePartition, SnapshotInfo};

use crate::cache::MetaCacheError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

/// Stable identifier of an external catalog.
pub type CatalogId = i64;

/// Separator between cluster and database in a qualified database name.
const CLUSTER_DELIMITER: char = ':';

/// Strip the cluster qualifier from a database name (`cluster:db` -> `db`).
pub fn name_from_full_name(full_name: &str) -> &str {
    match full_name.split_once(CLUSTER_DELIMITER) {
        Some((_, name)) => name,
        None => full_name,
    }
}

/// A registered external data source.
#[derive(Clone)]
pub struct ExternalCatalog {
    id: CatalogId,
    name: String,
    source: Arc<dyn MetadataSource>,
}

impl ExternalCatalog {
    pub fn new(id: CatalogId, name: impl Into<String>, source: Arc<dyn MetadataSource>) -> Self {
        Self {
            id,
            name: name.into(),
            source,
        }
    }

    pub fn id(&self) -> CatalogId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn source(&self) -> &Arc<dyn MetadataSource> {
        &self.source
    }
}

impl fmt::Debug for ExternalCatalog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExternalCatalog")
            .field("id", &self.id)
            .field("name", &self.name)
            .finish()
    }
}

/// Local (exposed) and remote (source-side) names of one table.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NameMapping {
    pub catalog_id: CatalogId,
    pub local_db: String,
    pub local_table: String,
    pub remote_db: String,
    pub remote_table: String,
}

impl NameMapping {
    pub fn new(
        catalog_id: CatalogId,
        local_db: impl Into<String>,
        local_table: impl Into<String>,
        remote_db: impl Into<String>,
        remote_table: impl Into<String>,
    ) -> Self {
        Self {
            catalog_id,
            local_db: local_db.into(),
            local_table: local_table.into(),
            remote_db: remote_db.into(),
            remote_table: remote_table.into(),
        }
    }

    /// Mapping where local and remote names coincide.
    pub fn identity(catalog_id: CatalogId, db: &str, table: &str) -> Self {
        Self::new(catalog_id, db, table, db, table)
    }

    /// Local database name with any cluster qualifier removed.
    pub fn db_name(&self) -> &str {
        name_from_full_name(&self.local_db)
    }

    /// Whether the table lives in `db`. Cluster qualifiers on either side are ignored.
    pub fn in_db(&self, db: &str) -> bool {
        self.db_name() == name_from_full_name(db)
    }

    /// Whether both mappings name the same local table of the same catalog.
    pub fn same_table(&self, other: &NameMapping) -> bool {
        self.catalog_id == other.catalog_id
            && self.local_table == other.local_table
            && self.db_name() == other.db_name()
    }
}

impl fmt::Display for NameMapping {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.local_db, self.local_table)
    }
}

/// Storage format of an external table.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TableFormat {
    #[default]
    Hive,
    Iceberg,
    Paimon,
    Hudi,
    MaxCompute,
    Unknown,
}

/// An external table as handed to the cache manager by catalog code.
#[derive(Clone)]
pub struct ExternalTable {
    catalog: ExternalCatalog,
    names: NameMapping,
    format: TableFormat,
    partition_columns: Vec<Column>,
}

impl ExternalTable {
    pub fn new(
        catalog: ExternalCatalog,
        names: NameMapping,
        format: TableFormat,
        partition_columns: Vec<Column>,
    ) -> Self {
        Self {
            catalog,
            names,
            format,
            partition_columns,
        }
    }

    pub fn catalog(&self) -> &ExternalCatalog {
        &self.catalog
    }

    pub fn catalog_id(&self) -> CatalogId {
        self.catalog.id
    }

    pub fn name_mapping(&self) -> &NameMapping {
        &self.names
    }

    /// Local database name with any cluster qualifier removed.
    pub fn db_name(&self) -> &str {
        self.names.db_name()
    }

    pub fn name(&self) -> &str {
        &self.names.local_table
    }

    pub fn remote_db_name(&self) -> &str {
        &self.names.remote_db
    }

    pub fn remote_name(&self) -> &str {
        &self.names.remote_table
    }

    pub fn format(&self) -> TableFormat {
        self.format
    }

    pub fn partition_columns(&self) -> &[Column] {
        &self.partition_columns
    }

    /// Types of the partition columns, in declaration order.
    pub fn partition_column_types(&self) -> Result<Vec<ColumnType>, MetaCacheError> {
        if self.format == TableFormat::Unknown {
            return Err(MetaCacheError::NotSupported(format!(
                "partition columns of table {} with unknown format",
                self.names
            )));
        }
        Ok(self
            .partition_columns
            .iter()
            .map(|c| c.column_type)
            .collect())
    }
}

impl fmt::Debug for ExternalTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExternalTable")
            .field("catalog", &self.catalog.name)
            .field("names", &self.names)
            .field("format", &self.format)
            .finish()
    }
}

/// Cache key for caches shared across catalogs that need to reach the table's
/// source from a background refresh. Equality and hashing use the names only.
#[derive(Clone)]
pub struct RemoteTableKey {
    names: NameMapping,
    source: Arc<dyn MetadataSource>,
}

impl RemoteTableKey {
    pub fn new(names: NameMapping, source: Arc<dyn MetadataSource>) -> Self {
        Self { names, source }
    }

    pub fn names(&self) -> &NameMapping {
        &self.names
    }

    pub fn source(&self) -> &Arc<dyn MetadataSource> {
        &self.source
    }
}

impl From<&ExternalTable> for RemoteTableKey {
    fn from(table: &ExternalTable) -> Self {
        Self::new(table.names.clone(), table.catalog.source.clone())
    }
}

impl PartialEq for RemoteTableKey {
    fn eq(&self, other: &Self) -> bool {
        self.names == other.names
    }
}

impl Eq for RemoteTableKey {}

impl Hash for RemoteTableKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.names.hash(state);
    }
}

impl fmt::Debug for RemoteTableKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RemoteTableKey({})", self.names)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn catalog() -> ExternalCatalog {
        ExternalCatalog::new(1, "hive", Arc::new(MockSource::new()))
    }

    #[test]
    fn strips_cluster_qualifier() {
        assert_eq!(name_from_full_name("default_cluster:sales"), "sales");
        assert_eq!(name_from_full_name("sales"), "sales");
    }

    #[test]
    fn table_and_db_matches_ignore_cluster_qualifier() {
        let qualified = NameMapping::identity(1, "default_cluster:sales", "orders");
        let plain = NameMapping::identity(1, "sales", "orders");

        assert!(qualified.same_table(&plain));
        assert!(plain.same_table(&qualified));
        assert!(!plain.same_table(&NameMapping::identity(2, "sales", "orders")));
        assert!(qualified.in_db("sales"));
        assert!(plain.in_db("default_cluster:sales"));
        assert!(!plain.in_db("hr"));
    }

    #[test]
    fn unknown_format_has_no_partition_types() {
        let table = ExternalTable::new(
            catalog(),
            NameMapping::identity(1, "db", "t"),
            TableFormat::Unknown,
            vec![],
        );
        let err = table.partition_column_types().unwrap_err();
        assert!(matches!(err, MetaCacheError::NotSupported(_)));
    }

    #[test]
    fn remote_table_key_ignores_source_identity() {
        let names = NameMapping::identity(1, "db", "t");
        let a = RemoteTableKey::new(names.clone(), Arc::new(MockSource::new()));
        let b = RemoteTableKey::new(names, Arc::new(MockSource::new()));
        assert_eq!(a, b);
    }
}
