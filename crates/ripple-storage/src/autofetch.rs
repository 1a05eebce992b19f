use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bson::{Bson, Document};
use tokio::sync::watch;
use tokio::task::AbortHandle;
use tracing::{debug, warn};

use ripple_db::{DbError, FindOptions};
use ripple_index::item_id;
use ripple_query::documents_equal;

use crate::adapter::AdapterError;
use crate::collection::{QuerySnapshot, StorageCollection, query_key};

/// Remote source the auto-fetch backend hydrates selector results from.
#[async_trait]
pub trait RemoteFetcher: Send + Sync {
    async fn fetch_query_items(
        &self,
        collection: &str,
        selector: &Document,
    ) -> Result<Vec<Document>, AdapterError>;

    /// Optional: receive a callback to invoke whenever the remote changed;
    /// the backend re-fetches every active selector in response.
    fn register_remote_change(&self, _on_change: Arc<dyn Fn() + Send + Sync>) {}
}

/// Merges a freshly fetched item into the one already stored. The default
/// keeps the fetched item wholesale.
pub type MergeItems = Arc<dyn Fn(&Document, &Document) -> Document + Send + Sync>;

pub struct AutoFetchOptions {
    /// How long a selector's items linger after its last observer leaves.
    pub purge_delay: Duration,
    pub merge_items: Option<MergeItems>,
}

impl Default for AutoFetchOptions {
    fn default() -> Self {
        Self {
            purge_delay: Duration::from_secs(10),
            merge_items: None,
        }
    }
}

#[derive(Default)]
struct SelectorEntry {
    refcount: usize,
    selector_doc: Document,
    options: FindOptions,
    loaded_keys: HashSet<String>,
}

#[derive(Default)]
struct AutoState {
    selectors: HashMap<u64, SelectorEntry>,
    /// id → number of live selectors that loaded it.
    item_refs: HashMap<String, usize>,
    /// Ids that entered through a fetch; only these are purge candidates.
    auto_loaded: HashSet<String>,
    /// Ids inserted through CRUD; never purged.
    manual: HashSet<String>,
    purge_tasks: HashMap<u64, AbortHandle>,
}

/// Auto-fetch backend: a [`StorageCollection`] whose registered queries
/// hydrate from a [`RemoteFetcher`] on first observation (per selector)
/// and purge unreferenced auto-loaded items after the last observer
/// leaves, once `purge_delay` elapses.
#[derive(Clone)]
pub struct AutoFetchCollection {
    base: StorageCollection,
    fetcher: Arc<dyn RemoteFetcher>,
    merge: Option<MergeItems>,
    purge_delay: Duration,
    state: Arc<Mutex<AutoState>>,
}

impl AutoFetchCollection {
    /// Wrap a storage collection with remote hydration. Must be called
    /// from within a tokio runtime: remote-change notifications spawn
    /// their re-fetches on the current handle.
    pub fn new(
        base: StorageCollection,
        fetcher: Arc<dyn RemoteFetcher>,
        options: AutoFetchOptions,
    ) -> Self {
        let collection = Self {
            base,
            fetcher: Arc::clone(&fetcher),
            merge: options.merge_items,
            purge_delay: options.purge_delay,
            state: Arc::new(Mutex::new(AutoState::default())),
        };

        let remote = collection.clone();
        let handle = tokio::runtime::Handle::current();
        fetcher.register_remote_change(Arc::new(move || {
            let remote = remote.clone();
            handle.spawn(async move {
                remote.refetch_all().await;
            });
        }));

        collection
    }

    pub fn storage(&self) -> &StorageCollection {
        &self.base
    }

    // ── Query surface ───────────────────────────────────────────

    /// Register a live query. The 0→1 transition for its selector fires an
    /// asynchronous remote fetch whose items are upserted into storage.
    pub async fn register_query(
        &self,
        selector: &Document,
        options: FindOptions,
    ) -> Result<(u64, watch::Receiver<QuerySnapshot>), DbError> {
        let (key, rx) = self.base.register_query(selector, options.clone()).await?;

        let first = {
            let mut state = self.state.lock().unwrap();
            if let Some(task) = state.purge_tasks.remove(&key) {
                task.abort();
            }
            let entry = state.selectors.entry(key).or_default();
            entry.refcount += 1;
            if entry.refcount == 1 {
                entry.selector_doc = selector.clone();
                entry.options = options;
                true
            } else {
                false
            }
        };

        if first {
            self.fetch_into(key).await;
        }
        Ok((key, rx))
    }

    /// Release one registration. On the 1→0 transition a purge is
    /// scheduled after `purge_delay` (immediately when zero); a
    /// re-registration cancels it.
    pub async fn unregister_query(&self, key: u64) {
        let schedule = {
            let mut state = self.state.lock().unwrap();
            match state.selectors.get_mut(&key) {
                Some(entry) if entry.refcount > 0 => {
                    entry.refcount -= 1;
                    entry.refcount == 0
                }
                _ => false,
            }
        };
        self.base.unregister_query(key);
        if !schedule {
            return;
        }

        if self.purge_delay.is_zero() {
            self.purge(key).await;
            return;
        }

        let delayed = self.clone();
        let delay = self.purge_delay;
        let task = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            delayed.purge(key).await;
        });
        self.state
            .lock()
            .unwrap()
            .purge_tasks
            .insert(key, task.abort_handle());
    }

    /// Fetch a selector's items from the remote and upsert them.
    async fn fetch_into(&self, key: u64) {
        let Some((selector_doc, _options)) = ({
            let state = self.state.lock().unwrap();
            state
                .selectors
                .get(&key)
                .map(|entry| (entry.selector_doc.clone(), entry.options.clone()))
        }) else {
            return;
        };

        let fetched = match self
            .fetcher
            .fetch_query_items(self.base.name(), &selector_doc)
            .await
        {
            Ok(items) => items,
            Err(e) => {
                warn!(collection = %self.base.name(), error = %e, "remote fetch failed");
                self.fail_query(key, e).await;
                return;
            }
        };
        debug!(
            collection = %self.base.name(),
            count = fetched.len(),
            "remote fetch complete"
        );

        if let Err(e) = self.upsert_fetched(key, fetched).await {
            self.fail_query(key, e.to_string().into()).await;
            return;
        }
        self.base.refresh_query(key).await;
    }

    async fn upsert_fetched(&self, key: u64, fetched: Vec<Document>) -> Result<(), DbError> {
        let keys: Vec<String> = fetched.iter().filter_map(item_id).collect();
        let existing = self
            .base
            .inner
            .adapter
            .read_ids(&keys)
            .await
            .map_err(|e| DbError::Storage(e.to_string()))?;
        let existing_by_key: HashMap<String, Document> = existing
            .into_iter()
            .filter_map(|item| item_id(&item).map(|key| (key, item)))
            .collect();

        let mut writes = Vec::with_capacity(fetched.len());
        for item in &fetched {
            let Some(item_key) = item_id(item) else { continue };
            match existing_by_key.get(&item_key) {
                Some(current) => {
                    let merged = match &self.merge {
                        Some(merge) => merge(current, item),
                        None => item.clone(),
                    };
                    if !documents_equal(current, &merged) {
                        writes.push(merged);
                    }
                }
                None => writes.push(item.clone()),
            }
        }

        if !writes.is_empty() {
            self.base
                .inner
                .adapter
                .replace(&writes)
                .await
                .map_err(|e| DbError::Storage(e.to_string()))?;
        }

        // Reference accounting: associate every fetched id with this
        // selector; brand-new ids are auto-loaded purge candidates.
        {
            let mut guard = self.state.lock().unwrap();
            let state = &mut *guard;
            let Some(entry) = state.selectors.get_mut(&key) else {
                return Ok(());
            };
            for item in &fetched {
                let Some(item_key) = item_id(item) else { continue };
                if entry.loaded_keys.insert(item_key.clone()) {
                    *state.item_refs.entry(item_key.clone()).or_insert(0) += 1;
                }
                if !existing_by_key.contains_key(&item_key) && !state.manual.contains(&item_key) {
                    state.auto_loaded.insert(item_key);
                }
            }
        }

        let changed: Vec<Document> = fetched;
        self.base.check_query_updates(&changed).await;
        Ok(())
    }

    async fn fail_query(&self, key: u64, error: AdapterError) {
        self.base.fail_query_record(key, error.to_string());
    }

    /// Drop this selector's hold on its loaded items; items whose last
    /// hold this was, and which were auto-loaded (never CRUD-inserted),
    /// leave storage.
    async fn purge(&self, key: u64) {
        let to_remove = {
            let mut state = self.state.lock().unwrap();
            state.purge_tasks.remove(&key);
            let Some(entry) = state.selectors.get(&key) else {
                return;
            };
            if entry.refcount > 0 {
                return; // re-registered while the purge was pending
            }
            let entry = state.selectors.remove(&key).unwrap_or_default();

            let mut to_remove = Vec::new();
            for item_key in entry.loaded_keys {
                let remaining = {
                    let counter = state.item_refs.entry(item_key.clone()).or_insert(1);
                    *counter = counter.saturating_sub(1);
                    *counter
                };
                if remaining == 0 {
                    state.item_refs.remove(&item_key);
                    if state.auto_loaded.remove(&item_key) && !state.manual.contains(&item_key) {
                        to_remove.push(item_key);
                    }
                }
            }
            to_remove
        };

        if to_remove.is_empty() {
            return;
        }
        debug!(
            collection = %self.base.name(),
            count = to_remove.len(),
            "purging auto-loaded items"
        );
        if let Err(e) = self.base.remove_by_keys(&to_remove).await {
            warn!(collection = %self.base.name(), error = %e, "purge failed");
        }
    }

    /// Re-fetch every active selector (remote-change notification).
    pub async fn refetch_all(&self) {
        let keys: Vec<u64> = {
            let state = self.state.lock().unwrap();
            state
                .selectors
                .iter()
                .filter(|(_, entry)| entry.refcount > 0)
                .map(|(key, _)| *key)
                .collect()
        };
        for key in keys {
            self.fetch_into(key).await;
        }
    }

    // ── CRUD passthrough (marks items manual: never auto-purged) ─

    pub async fn insert(&self, item: Document) -> Result<Bson, DbError> {
        let id = self.base.insert(item).await?;
        self.state
            .lock()
            .unwrap()
            .manual
            .insert(ripple_query::serialize_value(&id));
        Ok(id)
    }

    pub async fn update_one(
        &self,
        selector: &Document,
        modifier: &Document,
        upsert: bool,
    ) -> Result<usize, DbError> {
        self.base.update_one(selector, modifier, upsert).await
    }

    pub async fn update_many(
        &self,
        selector: &Document,
        modifier: &Document,
        upsert: bool,
    ) -> Result<usize, DbError> {
        self.base.update_many(selector, modifier, upsert).await
    }

    pub async fn remove_one(&self, selector: &Document) -> Result<usize, DbError> {
        self.base.remove_one(selector).await
    }

    pub async fn remove_many(&self, selector: &Document) -> Result<usize, DbError> {
        self.base.remove_many(selector).await
    }

    pub async fn find(
        &self,
        selector: &Document,
        options: FindOptions,
    ) -> Result<Vec<Document>, DbError> {
        self.base.find(selector, options).await
    }

    /// The selector key used by the registry, exposed for tests and
    /// bookkeeping around register/unregister pairs.
    pub fn key_for(&self, selector: &Document, options: &FindOptions) -> u64 {
        query_key(selector, options)
    }
}
