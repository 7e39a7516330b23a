use std::process::Command;
use tempfile::tempdir;

fn fixture_path() -> String {
    format!("{}/tests/fixtures/catalog.json", env!("CARGO_MANIFEST_DIR"))
}

#[test]
fn inspect_prints_stats_for_every_cache() {
    let output = Command::new(env!("CARGO_BIN_EXE_metacache-inspect"))
        .arg(fixture_path())
        .args(["--catalog-id", "9", "--row-count-wait-ms", "300"])
        .output()
        .unwrap();
    assert!(output.status.success(), "{}", String::from_utf8_lossy(&output.stderr));

    let report: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(report["catalog_id"], 9);
    assert_eq!(report["tables"], 3);
    assert_eq!(report["failed_tables"], serde_json::json!([]));
    assert_eq!(report["caches"]["hive_file_cache"]["estimated_size"], "3");
    assert_eq!(report["caches"]["schema_cache"]["estimated_size"], "3");
    assert_eq!(report["row_counts"]["sales.orders"], 3);
    assert!(report["pools"]["NotCheckpointFileListingExecutor"].is_object());
}

#[test]
fn inspect_reads_config_file() {
    let dir = tempdir().unwrap();
    let config = dir.path().join("metacache.toml");
    std::fs::write(&config, "max_external_cache_loader_thread_pool_size = 0\n").unwrap();

    let output = Command::new(env!("CARGO_BIN_EXE_metacache-inspect"))
        .arg(fixture_path())
        .arg("--config")
        .arg(&config)
        .output()
        .unwrap();

    assert!(!output.status.success());
}
