#![allow(dead_code)]

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bson::{Bson, Document, doc};
use ripple_storage::{
    AdapterError, MemoryStorageAdapter, RemoteFetcher, StorageCollection,
    StorageCollectionOptions,
};

static NEXT_NAME: AtomicU64 = AtomicU64::new(0);

pub fn unique_name() -> String {
    format!("storage-{}", NEXT_NAME.fetch_add(1, Ordering::Relaxed))
}

pub async fn open_memory(indexes: &[&str]) -> (StorageCollection, Arc<MemoryStorageAdapter>) {
    let adapter = Arc::new(MemoryStorageAdapter::new());
    let mut options = StorageCollectionOptions::named(unique_name());
    for field in indexes {
        options = options.index(*field);
    }
    let collection = StorageCollection::open(options, adapter.clone()).await.unwrap();
    (collection, adapter)
}

pub fn ids(items: &[Document]) -> Vec<String> {
    let mut out: Vec<String> = items
        .iter()
        .map(|d| d.get_str("id").unwrap().to_string())
        .collect();
    out.sort();
    out
}

pub fn seed() -> Vec<Document> {
    vec![
        doc! { "id": "1", "name": "John", "age": 30 },
        doc! { "id": "2", "name": "Jane", "age": 25 },
        doc! { "id": "3", "name": "John", "age": 40 },
    ]
}

/// Scripted remote source: serves canned items per `name` equality
/// selector, counts fetches, and exposes the remote-change callback.
#[derive(Default)]
pub struct ScriptedFetcher {
    pub items: Mutex<Vec<Document>>,
    pub fetch_calls: AtomicU64,
    pub fail: Mutex<Option<String>>,
    pub on_change: Mutex<Option<Arc<dyn Fn() + Send + Sync>>>,
}

impl ScriptedFetcher {
    pub fn serving(items: Vec<Document>) -> Arc<Self> {
        let fetcher = Self::default();
        *fetcher.items.lock().unwrap() = items;
        Arc::new(fetcher)
    }

    pub fn set_items(&self, items: Vec<Document>) {
        *self.items.lock().unwrap() = items;
    }

    pub fn fail_with(&self, message: &str) {
        *self.fail.lock().unwrap() = Some(message.to_string());
    }

    /// Fire the registered remote-change callback.
    pub fn remote_changed(&self) {
        let callback = self.on_change.lock().unwrap().clone();
        if let Some(callback) = callback {
            callback();
        }
    }
}

#[async_trait]
impl RemoteFetcher for ScriptedFetcher {
    async fn fetch_query_items(
        &self,
        _collection: &str,
        selector: &Document,
    ) -> Result<Vec<Document>, AdapterError> {
        self.fetch_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(message) = self.fail.lock().unwrap().clone() {
            return Err(message.into());
        }
        let items = self.items.lock().unwrap().clone();
        if selector.is_empty() {
            return Ok(items);
        }
        // Serve the subset matching a flat equality selector.
        Ok(items
            .into_iter()
            .filter(|item| {
                selector.iter().all(|(field, expected)| {
                    item.get(field.as_str()) == Some(expected)
                })
            })
            .collect())
    }

    fn register_remote_change(&self, on_change: Arc<dyn Fn() + Send + Sync>) {
        *self.on_change.lock().unwrap() = Some(on_change);
    }
}

pub fn bson_str(value: &str) -> Bson {
    Bson::String(value.to_string())
}
