use metacache::cache::StatsMap;
use metacache::catalog::{
    CatalogId, ExternalCatalog, ExternalTable, MockSource, MockTable, NameMapping, SnapshotInfo,
    TableFormat,
};
use metacache::sources::SourceCacheManager;
use metacache::{ExternalMetaCacheManager, MetaCacheConfig};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

/// Records every invalidation it receives.
#[derive(Debug, Default)]
struct RecordingManager {
    events: Mutex<Vec<String>>,
}

impl RecordingManager {
    fn events(&self) -> Vec<String> {
        self.events.lock().unwrap().clone()
    }
}

impl SourceCacheManager for RecordingManager {
    fn name(&self) -> &'static str {
        "recording"
    }

    fn invalidate_table(&self, names: &NameMapping) {
        self.events.lock().unwrap().push(format!("table {}", names));
    }

    fn invalidate_db(&self, catalog_id: CatalogId, db: &str) {
        self.events
            .lock()
            .unwrap()
            .push(format!("db {} {}", catalog_id, db));
    }

    fn invalidate_catalog(&self, catalog_id: CatalogId) {
        self.events
            .lock()
            .unwrap()
            .push(format!("catalog {}", catalog_id));
    }

    fn stats(&self, _catalog_id: CatalogId) -> BTreeMap<String, StatsMap> {
        BTreeMap::from([("recording_cache".to_string(), StatsMap::new())])
    }
}

fn manager_with(recorder: Arc<RecordingManager>) -> ExternalMetaCacheManager {
    ExternalMetaCacheManager::builder()
        .config(MetaCacheConfig {
            max_external_cache_loader_thread_pool_size: 2,
            ..Default::default()
        })
        .register_source_manager(recorder)
        .build()
        .unwrap()
}

#[tokio::test(flavor = "multi_thread")]
async fn registered_managers_receive_every_invalidation() {
    let recorder = Arc::new(RecordingManager::default());
    let manager = manager_with(recorder.clone());
    let catalog = ExternalCatalog::new(4, "lake", Arc::new(MockSource::new()));
    let table = ExternalTable::new(
        catalog,
        NameMapping::identity(4, "db", "t"),
        TableFormat::Iceberg,
        vec![],
    );

    manager.invalidate_table_cache(&table);
    manager.invalidate_db_cache(4, "cluster:db");
    manager.invalidate_catalog_cache(4);
    manager.remove_cache(4);

    assert_eq!(
        recorder.events(),
        vec!["table db.t", "db 4 db", "catalog 4", "catalog 4"]
    );
    assert!(manager.catalog_cache_stats(4).contains_key("recording_cache"));
}

#[tokio::test(flavor = "multi_thread")]
async fn iceberg_snapshots_follow_table_invalidation() {
    let manager = manager_with(Arc::new(RecordingManager::default()));
    let source = Arc::new(MockSource::new());
    source.put_table(
        "db",
        "events",
        MockTable {
            format: TableFormat::Iceberg,
            snapshots: vec![SnapshotInfo {
                snapshot_id: 11,
                schema_id: 0,
                committed_at: chrono::Utc::now(),
            }],
            ..Default::default()
        },
    );
    let table = ExternalTable::new(
        ExternalCatalog::new(4, "lake", source.clone()),
        NameMapping::identity(4, "db", "events"),
        TableFormat::Iceberg,
        vec![],
    );
    let iceberg = manager.get_iceberg_metadata_cache();

    let latest = iceberg.get_latest_snapshot(&table).await.unwrap();
    assert_eq!(latest.map(|s| s.snapshot_id), Some(11));

    manager.invalidate_table_cache(&table);
    iceberg.get_latest_snapshot(&table).await.unwrap();
    assert_eq!(source.snapshot_calls(), 2);
}

#[tokio::test(flavor = "multi_thread")]
async fn per_catalog_format_caches_are_dropped_with_catalog() {
    let manager = manager_with(Arc::new(RecordingManager::default()));
    let catalog = ExternalCatalog::new(5, "mc", Arc::new(MockSource::new()));

    let max_compute = manager.get_max_compute_metadata_cache(5);
    let hudi = manager.get_hudi_partition_processor(&catalog);
    assert!(Arc::ptr_eq(&max_compute, &manager.get_max_compute_metadata_cache(5)));

    manager.remove_cache(5);

    assert!(!Arc::ptr_eq(&max_compute, &manager.get_max_compute_metadata_cache(5)));
    assert!(!Arc::ptr_eq(&hudi, &manager.get_hudi_partition_processor(&catalog)));
}
