use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Sizing and expiry of the external metadata caches.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MetaCacheConfig {
    /// Worker count of every loader pool.
    #[serde(default = "default_loader_pool_size")]
    pub max_external_cache_loader_thread_pool_size: usize,
    #[serde(default = "default_schema_cache_num")]
    pub max_external_schema_cache_num: usize,
    /// Tables whose partition value lists are cached.
    #[serde(default = "default_partition_table_cache_num")]
    pub max_hive_partition_table_cache_num: usize,
    #[serde(default = "default_partition_cache_num")]
    pub max_hive_partition_cache_num: usize,
    #[serde(default = "default_file_cache_num")]
    pub max_external_file_cache_num: usize,
    #[serde(default = "default_row_count_cache_num")]
    pub max_external_table_row_count_cache_num: usize,
    #[serde(default = "default_meta_object_cache_num")]
    pub max_meta_object_cache_num: usize,
    #[serde(default = "default_snapshot_cache_num")]
    pub max_snapshot_cache_num: usize,
    /// Entries not read for this long are dropped. 0 disables expiry.
    #[serde(default = "default_expire_after_access_secs")]
    pub expire_after_access_secs: u64,
    /// Entries older than this are reloaded in the background. 0 disables refresh.
    #[serde(default = "default_refresh_after_write_secs")]
    pub refresh_after_write_secs: u64,
    #[serde(default)]
    pub pools: PoolConfig,
}

/// Queue sizing of the loader pools, as multiples of the worker count.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PoolConfig {
    #[serde(default = "default_small_queue_factor")]
    pub row_count_queue_factor: usize,
    #[serde(default = "default_large_queue_factor")]
    pub common_refresh_queue_factor: usize,
    #[serde(default = "default_small_queue_factor")]
    pub file_listing_queue_factor: usize,
    #[serde(default = "default_small_queue_factor")]
    pub schedule_queue_factor: usize,
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,
    #[serde(default)]
    pub row_count_idle_timeout_secs: u64,
}

fn default_loader_pool_size() -> usize {
    64
}

fn default_schema_cache_num() -> usize {
    10_000
}

fn default_partition_table_cache_num() -> usize {
    1_000
}

fn default_partition_cache_num() -> usize {
    100_000
}

fn default_file_cache_num() -> usize {
    100_000
}

fn default_row_count_cache_num() -> usize {
    100_000
}

fn default_meta_object_cache_num() -> usize {
    1_000
}

fn default_snapshot_cache_num() -> usize {
    10_000
}

fn default_expire_after_access_secs() -> u64 {
    86_400
}

fn default_refresh_after_write_secs() -> u64 {
    600
}

fn default_small_queue_factor() -> usize {
    1_000
}

fn default_large_queue_factor() -> usize {
    10_000
}

fn default_idle_timeout_secs() -> u64 {
    10
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            row_count_queue_factor: default_small_queue_factor(),
            common_refresh_queue_factor: default_large_queue_factor(),
            file_listing_queue_factor: default_small_queue_factor(),
            schedule_queue_factor: default_small_queue_factor(),
            idle_timeout_secs: default_idle_timeout_secs(),
            row_count_idle_timeout_secs: 0,
        }
    }
}

impl Default for MetaCacheConfig {
    fn default() -> Self {
        Self {
            max_external_cache_loader_thread_pool_size: default_loader_pool_size(),
            max_external_schema_cache_num: default_schema_cache_num(),
            max_hive_partition_table_cache_num: default_partition_table_cache_num(),
            max_hive_partition_cache_num: default_partition_cache_num(),
            max_external_file_cache_num: default_file_cache_num(),
            max_external_table_row_count_cache_num: default_row_count_cache_num(),
            max_meta_object_cache_num: default_meta_object_cache_num(),
            max_snapshot_cache_num: default_snapshot_cache_num(),
            expire_after_access_secs: default_expire_after_access_secs(),
            refresh_after_write_secs: default_refresh_after_write_secs(),
            pools: PoolConfig::default(),
        }
    }
}

impl MetaCacheConfig {
    /// Load configuration from file and environment variables
    pub fn load(config_path: &str) -> Result<Self> {
        let mut builder = config::Config::builder();

        builder = builder.add_source(config::File::with_name(config_path));

        // Nested keys use a double underscore.
        // Example: METACACHE_POOLS__IDLE_TIMEOUT_SECS=30
        builder = builder.add_source(
            config::Environment::with_prefix("METACACHE")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        let config = builder.build().context("Failed to build configuration")?;

        config
            .try_deserialize()
            .context("Failed to deserialize configuration")
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.max_external_cache_loader_thread_pool_size == 0 {
            anyhow::bail!("max_external_cache_loader_thread_pool_size must be positive");
        }
        if self.refresh_after_write_secs > 0
            && self.expire_after_access_secs > 0
            && self.refresh_after_write_secs >= self.expire_after_access_secs
        {
            anyhow::bail!(
                "refresh_after_write_secs ({}) must be shorter than expire_after_access_secs ({})",
                self.refresh_after_write_secs,
                self.expire_after_access_secs
            );
        }
        Ok(())
    }

    pub fn expire_after_access(&self) -> Option<Duration> {
        non_zero_secs(self.expire_after_access_secs)
    }

    pub fn refresh_after_write(&self) -> Option<Duration> {
        non_zero_secs(self.refresh_after_write_secs)
    }
}

fn non_zero_secs(secs: u64) -> Option<Duration> {
    (secs > 0).then(|| Duration::from_secs(secs))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn defaults_are_valid() {
        let config = MetaCacheConfig::default();
        config.validate().unwrap();
        assert_eq!(config.max_external_cache_loader_thread_pool_size, 64);
        assert_eq!(config.expire_after_access(), Some(Duration::from_secs(86_400)));
    }

    #[test]
    fn load_reads_file_and_fills_defaults() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("metacache.toml");
        std::fs::write(
            &path,
            "max_external_cache_loader_thread_pool_size = 8\nrefresh_after_write_secs = 0\n\n[pools]\nidle_timeout_secs = 30\n",
        )
        .unwrap();

        let config = MetaCacheConfig::load(path.to_str().unwrap()).unwrap();
        assert_eq!(config.max_external_cache_loader_thread_pool_size, 8);
        assert_eq!(config.refresh_after_write(), None);
        assert_eq!(config.pools.idle_timeout_secs, 30);
        assert_eq!(config.pools.common_refresh_queue_factor, 10_000);
        assert_eq!(config.max_external_schema_cache_num, 10_000);
    }

    #[test]
    fn load_fails_for_missing_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("absent.toml");
        assert!(MetaCacheConfig::load(path.to_str().unwrap()).is_err());
    }

    #[test]
    fn refresh_must_be_shorter_than_expiry() {
        let config = MetaCacheConfig {
            expire_after_access_secs: 60,
            refresh_after_write_secs: 60,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn zero_pool_size_is_invalid() {
        let config = MetaCacheConfig {
            max_external_cache_loader_thread_pool_size: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
