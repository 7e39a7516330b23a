//! Cache primitives and the table-level caches built on them.

mod error;
mod loading_cache;
mod meta_cache;
mod row_count;
mod schema_cache;
mod stats;

pub use error::MetaCacheError;
pub use loading_cache::{
    loader_fn, CacheKey, CacheLoader, CacheSpec, CacheValue, LoadingCache, RemovalCause,
    RemovalListener,
};
pub use meta_cache::{MetaCache, NamePair};
pub use row_count::RowCountCache;
pub use schema_cache::{ExternalSchemaCache, SchemaCacheValue};
pub use stats::{get_cache_stats, CacheStats};

use std::collections::BTreeMap;

/// Operator-facing statistics of one cache (see [`get_cache_stats`]).
pub type StatsMap = BTreeMap<String, String>;
