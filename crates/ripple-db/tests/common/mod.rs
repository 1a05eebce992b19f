#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use bson::{Document, doc};
use ripple_db::{
    Changeset, Collection, CollectionOptions, LoadResponse, OnChange, PersistenceAdapter,
    PersistenceError,
};

static NEXT_NAME: AtomicU64 = AtomicU64::new(0);

/// Fresh collection with a unique name per test.
pub fn collection() -> Collection {
    Collection::new(options())
}

pub fn options() -> CollectionOptions {
    let n = NEXT_NAME.fetch_add(1, Ordering::Relaxed);
    CollectionOptions::named(format!("test-{n}"))
}

pub fn seed_people(collection: &Collection) {
    collection
        .insert_many(vec![
            doc! { "id": "1", "name": "John" },
            doc! { "id": "2", "name": "Jane" },
            doc! { "id": "3", "name": "John" },
        ])
        .unwrap();
}

pub fn ids(items: &[Document]) -> Vec<&str> {
    items.iter().map(|d| d.get_str("id").unwrap()).collect()
}

/// In-memory persistence adapter: `load` returns the stored snapshot,
/// `save` applies the changeset to it, keyed by `id`. An `on_change`
/// handle is kept so tests can push external loads.
#[derive(Default)]
pub struct MemoryPersistence {
    stored: Mutex<Vec<Document>>,
    on_change: Mutex<Option<OnChange>>,
    fail_saves: AtomicBool,
    save_delay_ms: AtomicU64,
    pub save_calls: AtomicU64,
}

impl MemoryPersistence {
    pub fn preloaded(items: Vec<Document>) -> Arc<Self> {
        let adapter = Self::default();
        *adapter.stored.lock().unwrap() = items;
        Arc::new(adapter)
    }

    pub fn stored(&self) -> Vec<Document> {
        self.stored.lock().unwrap().clone()
    }

    pub fn fail_saves(&self, fail: bool) {
        self.fail_saves.store(fail, Ordering::SeqCst);
    }

    /// Make saves slow, so queued mutations pile up and coalesce.
    pub fn slow_saves(&self, millis: u64) {
        self.save_delay_ms.store(millis, Ordering::SeqCst);
    }

    /// Push a payload through the registered change callback, as an
    /// external writer would.
    pub fn push_load(&self, response: LoadResponse) {
        let callback = self.on_change.lock().unwrap().clone();
        if let Some(callback) = callback {
            callback(Some(response));
        }
    }
}

impl PersistenceAdapter for MemoryPersistence {
    fn register(&self, on_change: OnChange) -> Result<(), PersistenceError> {
        *self.on_change.lock().unwrap() = Some(on_change);
        Ok(())
    }

    fn load(&self) -> Result<LoadResponse, PersistenceError> {
        Ok(LoadResponse::Items(self.stored()))
    }

    fn save(&self, _items: &[Document], changes: &Changeset) -> Result<(), PersistenceError> {
        self.save_calls.fetch_add(1, Ordering::SeqCst);
        let delay = self.save_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            std::thread::sleep(std::time::Duration::from_millis(delay));
        }
        if self.fail_saves.load(Ordering::SeqCst) {
            return Err("save rejected".into());
        }
        let mut stored = self.stored.lock().unwrap();
        for item in changes.added.iter().chain(&changes.modified) {
            let id = item.get_str("id").ok();
            match stored
                .iter_mut()
                .find(|existing| existing.get_str("id").ok() == id)
            {
                Some(existing) => *existing = item.clone(),
                None => stored.push(item.clone()),
            }
        }
        for item in &changes.removed {
            let id = item.get_str("id").ok();
            stored.retain(|existing| existing.get_str("id").ok() != id);
        }
        Ok(())
    }
}
