pub mod cache;
pub mod catalog;
pub mod config;
pub mod executor;
mod manager;
pub mod metastore;
pub mod metrics;
mod registry;
pub mod sources;
pub mod telemetry;

pub use cache::{get_cache_stats, CacheStats, MetaCacheError};
pub use config::MetaCacheConfig;
pub use manager::{ExternalMetaCacheManager, ExternalMetaCacheManagerBuilder};
