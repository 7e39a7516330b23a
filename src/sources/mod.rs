//! Caches of snapshot-based and vendor table formats.
//!
//! Each format registers a [`SourceCacheManager`] with the cache manager so
//! that catalog, database and table invalidation reach it without the manager
//! knowing the format.

mod hudi;
mod iceberg;
mod maxcompute;
mod paimon;

pub use hudi::{HudiCacheManager, HudiPartitionProcessor};
pub use iceberg::{IcebergCacheManager, IcebergMetadataCache};
pub use maxcompute::{MaxComputeCacheManager, MaxComputeMetadataCache};
pub use paimon::{PaimonCacheManager, PaimonMetadataCache, PaimonSnapshotCacheValue};

use crate::cache::StatsMap;
use crate::catalog::{CatalogId, NameMapping};
use std::collections::BTreeMap;
use std::fmt::Debug;

/// Invalidation surface shared by every format-specific cache.
///
/// Invalidating something that is not cached is not an error.
pub trait SourceCacheManager: Debug + Send + Sync {
    /// Short format name, used as the stats key prefix.
    fn name(&self) -> &'static str;

    fn invalidate_table(&self, names: &NameMapping);

    fn invalidate_db(&self, catalog_id: CatalogId, db: &str);

    fn invalidate_catalog(&self, catalog_id: CatalogId);

    /// Forget a dropped catalog entirely.
    fn remove_cache(&self, catalog_id: CatalogId) {
        self.invalidate_catalog(catalog_id);
    }

    /// Stats of the caches holding entries for `catalog_id`, keyed by cache name.
    fn stats(&self, catalog_id: CatalogId) -> BTreeMap<String, StatsMap>;
}
