//! Two-level names + objects cache used for catalog object listings.
//!
//! The names level holds the full `(remote, local)` name list of one
//! container (the databases of a catalog, the tables of a database). The
//! objects level holds the object behind each local name, and a side table
//! remembers which id resolved to which name.

use super::loading_cache::{CacheLoader, CacheSpec, CacheValue, LoadingCache, RemovalListener};
use super::StatsMap;
use anyhow::Result;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, RwLock};
use std::time::Duration;

/// `(remote name, local name)`.
pub type NamePair = (String, String);

pub struct MetaCache<T> {
    name: String,
    names: LoadingCache<(), Vec<NamePair>>,
    objects: LoadingCache<String, Option<T>>,
    id_to_name: RwLock<HashMap<i64, String>>,
}

impl<T: CacheValue> MetaCache<T> {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        name: &str,
        expire_after_access: Option<Duration>,
        refresh_after_write: Option<Duration>,
        max_size: usize,
        refresh_executor: Arc<crate::executor::ExecutorPool>,
        names_loader: Arc<dyn CacheLoader<(), Vec<NamePair>>>,
        object_loader: Arc<dyn CacheLoader<String, Option<T>>>,
        removal_listener: Option<RemovalListener<String, Option<T>>>,
    ) -> Self {
        let names = CacheSpec::new(format!("{}_names", name))
            .max_size(1)
            .expire_after_access(expire_after_access)
            .refresh_after_write(refresh_after_write)
            .executor(refresh_executor.clone())
            .build(names_loader);

        let mut objects = CacheSpec::new(format!("{}_objects", name))
            .max_size(max_size)
            .expire_after_access(expire_after_access)
            .refresh_after_write(refresh_after_write)
            .executor(refresh_executor);
        if let Some(listener) = removal_listener {
            objects = objects.removal_listener(listener);
        }

        Self {
            name: name.to_string(),
            names,
            objects: objects.build(object_loader),
            id_to_name: RwLock::new(HashMap::new()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Local names of every object in the container.
    pub async fn list_names(&self) -> Result<Vec<String>> {
        let pairs = self.names.get(&()).await?;
        Ok(pairs.into_iter().map(|(_, local)| local).collect())
    }

    /// Remote name behind a local name, if the container lists it.
    pub async fn get_remote_name(&self, local_name: &str) -> Result<Option<String>> {
        let pairs = self.names.get(&()).await?;
        Ok(pairs
            .into_iter()
            .find(|(_, local)| local == local_name)
            .map(|(remote, _)| remote))
    }

    /// Object behind `local_name`, remembering that `id` resolves to it.
    pub async fn get_meta_obj(&self, local_name: &str, id: i64) -> Result<Option<T>> {
        let obj = self.objects.get(&local_name.to_string()).await?;
        if obj.is_some() {
            self.id_to_name
                .write()
                .unwrap_or_else(|e| e.into_inner())
                .insert(id, local_name.to_string());
        }
        Ok(obj)
    }

    /// Object previously resolved under `id`, or `None` if the id is unknown.
    pub async fn get_meta_obj_by_id(&self, id: i64) -> Result<Option<T>> {
        let name = self
            .id_to_name
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&id)
            .cloned();
        match name {
            Some(name) => self.get_meta_obj(&name, id).await,
            None => Ok(None),
        }
    }

    /// Install an object created locally (e.g. by DDL) without a remote load.
    pub fn update_cache(&self, remote_name: &str, local_name: &str, obj: T, id: i64) {
        self.objects.put(local_name.to_string(), Some(obj));
        if let Some(mut pairs) = self.names.peek(&()) {
            if !pairs.iter().any(|(_, local)| local == local_name) {
                pairs.push((remote_name.to_string(), local_name.to_string()));
                self.names.put((), pairs);
            }
        }
        self.id_to_name
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id, local_name.to_string());
    }

    pub fn invalidate(&self, local_name: &str, id: i64) {
        self.names.invalidate_all();
        self.objects.invalidate(&local_name.to_string());
        self.id_to_name
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&id);
        tracing::debug!(cache = %self.name, name = %local_name, id, "Invalidated meta cache entry");
    }

    pub fn invalidate_all(&self) {
        self.names.invalidate_all();
        self.objects.invalidate_all();
        self.id_to_name
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
    }

    pub fn stats(&self) -> BTreeMap<String, StatsMap> {
        BTreeMap::from([
            (self.names.name().to_string(), self.names.stats_map()),
            (self.objects.name().to_string(), self.objects.stats_map()),
        ])
    }
}
