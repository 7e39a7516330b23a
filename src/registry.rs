//! Lazily populated catalog id -> cache tables.

use crate::catalog::CatalogId;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, RwLock};

/// One registry table guarded by its own lock.
///
/// `get_or_create` builds a value only while holding the write lock and only
/// if no value exists, so at most one instance per catalog is ever built.
pub struct CatalogRegistry<T> {
    name: &'static str,
    entries: RwLock<HashMap<CatalogId, Arc<T>>>,
}

impl<T> CatalogRegistry<T> {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            entries: RwLock::new(HashMap::new()),
        }
    }

    pub fn get(&self, catalog_id: CatalogId) -> Option<Arc<T>> {
        self.entries
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&catalog_id)
            .cloned()
    }

    pub fn get_or_create(&self, catalog_id: CatalogId, create: impl FnOnce() -> T) -> Arc<T> {
        if let Some(existing) = self.get(catalog_id) {
            return existing;
        }
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        entries
            .entry(catalog_id)
            .or_insert_with(|| {
                tracing::info!(registry = self.name, catalog_id, "Created catalog cache");
                Arc::new(create())
            })
            .clone()
    }

    pub fn remove(&self, catalog_id: CatalogId) -> Option<Arc<T>> {
        let removed = self
            .entries
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&catalog_id);
        if removed.is_some() {
            tracing::info!(registry = self.name, catalog_id, "Removed catalog cache");
        }
        removed
    }

    pub fn catalog_ids(&self) -> Vec<CatalogId> {
        let mut ids: Vec<_> = self
            .entries
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .copied()
            .collect();
        ids.sort_unstable();
        ids
    }
}

impl<T> fmt::Debug for CatalogRegistry<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CatalogRegistry")
            .field("name", &self.name)
            .field("catalog_ids", &self.catalog_ids())
            .finish()
    }
}
