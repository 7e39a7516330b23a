use anyhow::{Context, Result};
use clap::Parser;
use metacache::cache::StatsMap;
use metacache::catalog::{
    ExternalCatalog, ExternalTable, MockSource, MockSourceFixture, NameMapping, TableFormat,
};
use metacache::metrics::PoolMetricsSnapshot;
use metacache::{ExternalMetaCacheManager, MetaCacheConfig};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

#[derive(Parser)]
#[command(
    name = "metacache-inspect",
    about = "Warm the metadata caches from a source fixture and print their stats"
)]
struct Cli {
    /// Path to a JSON source fixture
    fixture: String,

    /// Path to config file
    #[arg(long)]
    config: Option<String>,

    #[arg(long, default_value_t = 1)]
    catalog_id: i64,

    #[arg(long, default_value = "fixture")]
    catalog_name: String,

    /// How long to wait for background row count loads
    #[arg(long, default_value_t = 500)]
    row_count_wait_ms: u64,
}

#[derive(Serialize)]
struct Report {
    catalog_id: i64,
    tables: usize,
    failed_tables: Vec<String>,
    row_counts: BTreeMap<String, Option<u64>>,
    caches: BTreeMap<String, StatsMap>,
    pools: BTreeMap<String, PoolMetricsSnapshot>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let now = Instant::now();
    metacache::telemetry::init_telemetry()
        .map_err(|e| anyhow::anyhow!("Failed to initialize logging: {}", e))?;

    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => MetaCacheConfig::load(path)?,
        None => MetaCacheConfig::default(),
    };
    config.validate()?;

    let json = std::fs::read_to_string(&cli.fixture)
        .with_context(|| format!("Failed to read fixture {}", cli.fixture))?;
    let fixture = MockSourceFixture::from_json(&json)
        .with_context(|| format!("Failed to parse fixture {}", cli.fixture))?;

    let manager = ExternalMetaCacheManager::builder().config(config).build()?;
    let catalog = ExternalCatalog::new(
        cli.catalog_id,
        cli.catalog_name.clone(),
        Arc::new(MockSource::from_fixture(fixture.clone())),
    );

    let mut tables = Vec::new();
    for (db, db_tables) in &fixture.databases {
        for (name, definition) in db_tables {
            tables.push(ExternalTable::new(
                catalog.clone(),
                NameMapping::identity(cli.catalog_id, db, name),
                definition.format,
                definition.partition_columns.clone(),
            ));
        }
    }
    tracing::info!(tables = tables.len(), "Fixture loaded");

    let mut failed_tables = Vec::new();
    for table in &tables {
        manager.get_row_count_cache().get_cached_row_count(table);
        if let Err(e) = warm_table(&manager, &catalog, table).await {
            tracing::warn!(table = %table.name_mapping(), error = %e, "Failed to warm table");
            failed_tables.push(table.name_mapping().to_string());
        }
    }

    tokio::time::sleep(Duration::from_millis(cli.row_count_wait_ms)).await;
    let row_counts = tables
        .iter()
        .map(|t| {
            (
                t.name_mapping().to_string(),
                manager.get_row_count_cache().get_cached_row_count(t),
            )
        })
        .collect();

    let report = Report {
        catalog_id: cli.catalog_id,
        tables: tables.len(),
        failed_tables,
        row_counts,
        caches: manager.catalog_cache_stats(cli.catalog_id),
        pools: manager.metrics().snapshot(),
    };
    println!("{}", serde_json::to_string_pretty(&report)?);

    manager.shutdown();
    tracing::info!("Inspection finished in {}ms", now.elapsed().as_millis());
    Ok(())
}

async fn warm_table(
    manager: &ExternalMetaCacheManager,
    catalog: &ExternalCatalog,
    table: &ExternalTable,
) -> Result<()> {
    manager
        .get_schema_cache(catalog)
        .get_schema_value(table.name_mapping())
        .await?;

    if table.format() != TableFormat::Hive {
        return Ok(());
    }
    let metastore = manager.get_meta_store_cache(catalog);
    if table.partition_columns().is_empty() {
        metastore.get_files_for_table(table).await?;
        return Ok(());
    }

    let values = metastore.get_partition_values(table).await?;
    let partitions = metastore
        .get_all_partitions(table.name_mapping(), &values.raw_values())
        .await?;
    let files = manager
        .schedule_file_listing(catalog, partitions)?
        .await
        .context("File listing task failed")??;
    tracing::info!(
        table = %table.name_mapping(),
        partitions = values.len(),
        files = files.iter().map(|f| f.files.len()).sum::<usize>(),
        "Warmed table"
    );
    Ok(())
}
