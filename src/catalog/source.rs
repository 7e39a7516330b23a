use crate::cache::MetaCacheError;
use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt::Debug;

/// Logical type of a column, as far as partition value parsing cares.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ColumnType {
    Boolean,
    Int,
    BigInt,
    Double,
    Decimal,
    Date,
    Timestamp,
    String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Column {
    pub name: String,
    pub column_type: ColumnType,
    #[serde(default = "default_nullable")]
    pub nullable: bool,
}

fn default_nullable() -> bool {
    true
}

impl Column {
    pub fn new(name: impl Into<String>, column_type: ColumnType) -> Self {
        Self {
            name: name.into(),
            column_type,
            nullable: true,
        }
    }
}

/// Partition descriptor returned by the remote metastore.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemotePartition {
    pub values: Vec<String>,
    pub location: String,
    #[serde(default)]
    pub input_format: String,
}

/// A data file under a table or partition location.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteFile {
    pub path: String,
    pub length: u64,
    #[serde(default)]
    pub modification_time: i64,
}

/// A table snapshot of a snapshot-based format (Iceberg, Paimon, Hudi).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotInfo {
    pub snapshot_id: i64,
    #[serde(default)]
    pub schema_id: i64,
    pub committed_at: DateTime<Utc>,
}

/// Async interface to a remote metadata service.
///
/// Implementations enforce their own timeouts; the caches never retry.
#[async_trait]
pub trait MetadataSource: Debug + Send + Sync {
    async fn list_database_names(&self) -> Result<Vec<String>>;

    async fn list_table_names(&self, db: &str) -> Result<Vec<String>>;

    /// Columns of a table, or `None` when the table does not exist remotely.
    async fn table_schema(&self, db: &str, table: &str) -> Result<Option<Vec<Column>>>;

    /// Hive-style partition names (`k1=v1/k2=v2`).
    async fn list_partition_names(&self, db: &str, table: &str) -> Result<Vec<String>>;

    async fn get_partitions(
        &self,
        db: &str,
        table: &str,
        values: &[Vec<String>],
    ) -> Result<Vec<RemotePartition>>;

    async fn table_location(&self, db: &str, table: &str) -> Result<String>;

    async fn list_files(&self, location: &str) -> Result<Vec<RemoteFile>>;

    async fn row_count(&self, db: &str, table: &str) -> Result<Option<u64>>;

    /// Snapshots in commit order. Only snapshot-based formats implement this.
    async fn list_snapshots(&self, db: &str, table: &str) -> Result<Vec<SnapshotInfo>> {
        Err(MetaCacheError::NotSupported(format!("snapshots of {}.{}", db, table)).into())
    }
}
