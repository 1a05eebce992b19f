use std::collections::BTreeSet;
use std::sync::Mutex;

use arc_swap::ArcSwap;
use async_trait::async_trait;
use bson::Document;
use imbl::OrdMap;
use std::sync::Arc;

use ripple_index::{index_keys, item_id};
use ripple_query::parse_path;

use crate::adapter::{AdapterError, IndexMap, StorageAdapter};

type Snapshot = OrdMap<String, Document>;

/// Reference in-memory storage backend: persistent-map snapshots swapped
/// atomically, so reads never block writers. Declared indexes are computed
/// from the current snapshot on demand.
pub struct MemoryStorageAdapter {
    items: ArcSwap<Snapshot>,
    write_lock: Mutex<()>,
    indexes: Mutex<BTreeSet<String>>,
    ready: Mutex<bool>,
}

impl Default for MemoryStorageAdapter {
    fn default() -> Self {
        Self {
            items: ArcSwap::new(Arc::new(OrdMap::new())),
            write_lock: Mutex::new(()),
            indexes: Mutex::new(BTreeSet::new()),
            ready: Mutex::new(false),
        }
    }
}

impl MemoryStorageAdapter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed with items before (or after) setup; test convenience.
    pub fn preloaded(items: Vec<Document>) -> Self {
        let adapter = Self::new();
        adapter.write(|map| {
            for item in items {
                if let Some(id) = item_id(&item) {
                    map.insert(id, item);
                }
            }
        });
        adapter
    }

    fn write(&self, f: impl FnOnce(&mut Snapshot)) {
        let _guard = self.write_lock.lock().unwrap();
        let mut next = (**self.items.load()).clone();
        f(&mut next);
        self.items.store(Arc::new(next));
    }

    pub fn len(&self) -> usize {
        self.items.load().len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.load().is_empty()
    }
}

#[async_trait]
impl StorageAdapter for MemoryStorageAdapter {
    async fn setup(&self) -> Result<(), AdapterError> {
        *self.ready.lock().unwrap() = true;
        Ok(())
    }

    async fn teardown(&self) -> Result<(), AdapterError> {
        *self.ready.lock().unwrap() = false;
        Ok(())
    }

    async fn read_all(&self) -> Result<Vec<Document>, AdapterError> {
        Ok(self.items.load().values().cloned().collect())
    }

    async fn read_ids(&self, ids: &[String]) -> Result<Vec<Document>, AdapterError> {
        let snapshot = self.items.load();
        Ok(ids.iter().filter_map(|id| snapshot.get(id).cloned()).collect())
    }

    async fn read_index(&self, field: &str) -> Result<IndexMap, AdapterError> {
        if !self.indexes.lock().unwrap().contains(field) {
            return Err(format!("no index declared on '{field}'").into());
        }
        let path = parse_path(field).map_err(|e| -> AdapterError { e.to_string().into() })?;
        let mut map = IndexMap::new();
        for (id, item) in self.items.load().iter() {
            for key in index_keys(item, &path) {
                map.entry(key).or_default().insert(id.clone());
            }
        }
        Ok(map)
    }

    fn create_index(&self, field: &str) {
        self.indexes.lock().unwrap().insert(field.to_string());
    }

    fn drop_index(&self, field: &str) {
        self.indexes.lock().unwrap().remove(field);
    }

    async fn insert(&self, items: &[Document]) -> Result<(), AdapterError> {
        self.write(|map| {
            for item in items {
                if let Some(id) = item_id(item) {
                    map.insert(id, item.clone());
                }
            }
        });
        Ok(())
    }

    async fn replace(&self, items: &[Document]) -> Result<(), AdapterError> {
        self.insert(items).await
    }

    async fn remove(&self, items: &[Document]) -> Result<(), AdapterError> {
        self.write(|map| {
            for item in items {
                if let Some(id) = item_id(item) {
                    map.remove(&id);
                }
            }
        });
        Ok(())
    }

    async fn remove_all(&self) -> Result<(), AdapterError> {
        self.write(|map| map.clear());
        Ok(())
    }
}
