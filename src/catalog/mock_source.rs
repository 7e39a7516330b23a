//! In-memory metadata source for testing and local inspection.
//!
//! Provides a configurable implementation of `MetadataSource` that can be
//! loaded from a JSON fixture, mutated between reads, paused, and told to fail.

use super::source::{Column, MetadataSource, RemoteFile, RemotePartition, SnapshotInfo};
use super::TableFormat;
use crate::metastore::make_partition_name;
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::watch;

/// One table of a mock source.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MockTable {
    #[serde(default)]
    pub columns: Vec<Column>,
    #[serde(default)]
    pub partition_columns: Vec<Column>,
    #[serde(default)]
    pub format: TableFormat,
    #[serde(default)]
    pub location: String,
    #[serde(default)]
    pub partitions: Vec<RemotePartition>,
    /// Files keyed by table or partition location.
    #[serde(default)]
    pub files: BTreeMap<String, Vec<RemoteFile>>,
    #[serde(default)]
    pub row_count: Option<u64>,
    #[serde(default)]
    pub snapshots: Vec<SnapshotInfo>,
}

/// Serialized form of a mock source: database -> table -> definition.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MockSourceFixture {
    #[serde(default)]
    pub databases: BTreeMap<String, BTreeMap<String, MockTable>>,
}

impl MockSourceFixture {
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }
}

/// Mock source that counts remote calls and can be configured to fail.
#[derive(Debug)]
pub struct MockSource {
    fixture: Mutex<MockSourceFixture>,
    fail: AtomicBool,
    latency_ms: AtomicUsize,
    paused: watch::Sender<bool>,
    schema_calls: AtomicUsize,
    partition_name_calls: AtomicUsize,
    partition_calls: AtomicUsize,
    file_calls: AtomicUsize,
    row_count_calls: AtomicUsize,
    snapshot_calls: AtomicUsize,
}

impl MockSource {
    pub fn new() -> Self {
        Self::from_fixture(MockSourceFixture::default())
    }

    pub fn from_fixture(fixture: MockSourceFixture) -> Self {
        let (paused, _) = watch::channel(false);
        Self {
            fixture: Mutex::new(fixture),
            fail: AtomicBool::new(false),
            latency_ms: AtomicUsize::new(0),
            paused,
            schema_calls: AtomicUsize::new(0),
            partition_name_calls: AtomicUsize::new(0),
            partition_calls: AtomicUsize::new(0),
            file_calls: AtomicUsize::new(0),
            row_count_calls: AtomicUsize::new(0),
            snapshot_calls: AtomicUsize::new(0),
        }
    }

    fn fixture(&self) -> MutexGuard<'_, MockSourceFixture> {
        self.fixture.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Snapshot of the current fixture.
    pub fn snapshot(&self) -> MockSourceFixture {
        self.fixture().clone()
    }

    /// Insert or replace a table definition.
    pub fn put_table(&self, db: &str, table: &str, definition: MockTable) {
        self.fixture()
            .databases
            .entry(db.to_string())
            .or_default()
            .insert(table.to_string(), definition);
    }

    /// Apply an in-place change to an existing table.
    pub fn update_table(&self, db: &str, table: &str, f: impl FnOnce(&mut MockTable)) {
        if let Some(t) = self
            .fixture()
            .databases
            .get_mut(db)
            .and_then(|tables| tables.get_mut(table))
        {
            f(t);
        }
    }

    /// Configure whether every remote call should fail.
    pub fn set_fail(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    pub fn set_latency(&self, latency: Duration) {
        self.latency_ms
            .store(latency.as_millis() as usize, Ordering::SeqCst);
    }

    /// Hold every remote call until [`MockSource::resume`].
    pub fn pause(&self) {
        self.paused.send_replace(true);
    }

    pub fn resume(&self) {
        self.paused.send_replace(false);
    }

    pub fn schema_calls(&self) -> usize {
        self.schema_calls.load(Ordering::SeqCst)
    }

    pub fn partition_name_calls(&self) -> usize {
        self.partition_name_calls.load(Ordering::SeqCst)
    }

    pub fn partition_calls(&self) -> usize {
        self.partition_calls.load(Ordering::SeqCst)
    }

    pub fn file_calls(&self) -> usize {
        self.file_calls.load(Ordering::SeqCst)
    }

    pub fn row_count_calls(&self) -> usize {
        self.row_count_calls.load(Ordering::SeqCst)
    }

    pub fn snapshot_calls(&self) -> usize {
        self.snapshot_calls.load(Ordering::SeqCst)
    }

    async fn remote_call(&self, counter: &AtomicUsize) -> Result<()> {
        counter.fetch_add(1, Ordering::SeqCst);
        let mut paused = self.paused.subscribe();
        while *paused.borrow_and_update() {
            paused.changed().await?;
        }
        let latency = self.latency_ms.load(Ordering::SeqCst);
        if latency > 0 {
            tokio::time::sleep(Duration::from_millis(latency as u64)).await;
        }
        if self.fail.load(Ordering::SeqCst) {
            return Err(anyhow!("Simulated metadata source failure"));
        }
        Ok(())
    }

    fn table(&self, db: &str, table: &str) -> Option<MockTable> {
        self.fixture()
            .databases
            .get(db)
            .and_then(|tables| tables.get(table))
            .cloned()
    }

    fn require_table(&self, db: &str, table: &str) -> Result<MockTable> {
        self.table(db, table)
            .ok_or_else(|| anyhow!("table {}.{} not found", db, table))
    }
}

impl Default for MockSource {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MetadataSource for MockSource {
    async fn list_database_names(&self) -> Result<Vec<String>> {
        Ok(self.fixture().databases.keys().cloned().collect())
    }

    async fn list_table_names(&self, db: &str) -> Result<Vec<String>> {
        Ok(self
            .fixture()
            .databases
            .get(db)
            .map(|tables| tables.keys().cloned().collect())
            .unwrap_or_default())
    }

    async fn table_schema(&self, db: &str, table: &str) -> Result<Option<Vec<Column>>> {
        self.remote_call(&self.schema_calls).await?;
        Ok(self.table(db, table).map(|t| t.columns))
    }

    async fn list_partition_names(&self, db: &str, table: &str) -> Result<Vec<String>> {
        self.remote_call(&self.partition_name_calls).await?;
        let t = self.require_table(db, table)?;
        let keys: Vec<&str> = t.partition_columns.iter().map(|c| c.name.as_str()).collect();
        Ok(t.partitions
            .iter()
            .map(|p| make_partition_name(&keys, &p.values))
            .collect())
    }

    async fn get_partitions(
        &self,
        db: &str,
        table: &str,
        values: &[Vec<String>],
    ) -> Result<Vec<RemotePartition>> {
        self.remote_call(&self.partition_calls).await?;
        let t = self.require_table(db, table)?;
        Ok(t.partitions
            .into_iter()
            .filter(|p| values.contains(&p.values))
            .collect())
    }

    async fn table_location(&self, db: &str, table: &str) -> Result<String> {
        Ok(self.require_table(db, table)?.location)
    }

    async fn list_files(&self, location: &str) -> Result<Vec<RemoteFile>> {
        self.remote_call(&self.file_calls).await?;
        let fixture = self.fixture();
        Ok(fixture
            .databases
            .values()
            .flat_map(|tables| tables.values())
            .find_map(|t| t.files.get(location).cloned())
            .unwrap_or_default())
    }

    async fn row_count(&self, db: &str, table: &str) -> Result<Option<u64>> {
        self.remote_call(&self.row_count_calls).await?;
        Ok(self.table(db, table).and_then(|t| t.row_count))
    }

    async fn list_snapshots(&self, db: &str, table: &str) -> Result<Vec<SnapshotInfo>> {
        self.remote_call(&self.snapshot_calls).await?;
        Ok(self.require_table(db, table)?.snapshots)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::ColumnType;

    const FIXTURE: &str = r#"{
        "databases": {
            "sales": {
                "orders": {
                    "columns": [{"name": "id", "column_type": "big_int"}],
                    "partition_columns": [{"name": "dt", "column_type": "date"}],
                    "location": "s3://warehouse/sales/orders",
                    "partitions": [
                        {"values": ["2024-01-01"], "location": "s3://warehouse/sales/orders/dt=2024-01-01"}
                    ],
                    "row_count": 42
                }
            }
        }
    }"#;

    #[tokio::test]
    async fn fixture_round_trips_through_source() {
        let source = MockSource::from_fixture(MockSourceFixture::from_json(FIXTURE).unwrap());

        let columns = source.table_schema("sales", "orders").await.unwrap().unwrap();
        assert_eq!(columns[0].column_type, ColumnType::BigInt);
        assert_eq!(
            source.list_partition_names("sales", "orders").await.unwrap(),
            vec!["dt=2024-01-01".to_string()]
        );
        assert_eq!(source.row_count("sales", "orders").await.unwrap(), Some(42));
        assert_eq!(source.schema_calls(), 1);
    }

    #[test]
    fn tables_default_to_hive_format() {
        assert_eq!(MockTable::default().format, TableFormat::Hive);
        let fixture = MockSourceFixture::from_json(FIXTURE).unwrap();
        assert_eq!(fixture.databases["sales"]["orders"].format, TableFormat::Hive);
    }

    #[tokio::test]
    async fn missing_table_has_no_schema() {
        let source = MockSource::new();
        assert!(source.table_schema("db", "nope").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn configured_failure_is_returned() {
        let source = MockSource::from_fixture(MockSourceFixture::from_json(FIXTURE).unwrap());
        source.set_fail(true);
        assert!(source.row_count("sales", "orders").await.is_err());
    }

    #[tokio::test]
    async fn snapshots_default_to_empty() {
        let source = MockSource::from_fixture(MockSourceFixture::from_json(FIXTURE).unwrap());
        assert!(source.list_snapshots("sales", "orders").await.unwrap().is_empty());
    }
}
