use std::collections::HashMap;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use bson::{Bson, Document};
use tokio::sync::watch;
use tracing::debug;

use ripple_db::{DbError, FindOptions};
use ripple_index::{FieldIndex, IndexProvider, item_id, plan};
use ripple_query::{
    Modifier, Selector, matches, parse_modifier, parse_selector, project, serialize_value,
    sort_items,
};

use crate::adapter::{AdapterError, StorageAdapter};

/// Lifecycle of a registered query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryState {
    /// A recompute is running (or queued).
    Active,
    /// `items` is current.
    Complete,
    /// The last recompute failed; `error` carries the surfaced failure.
    Error,
}

/// What query listeners observe through their watch channel.
#[derive(Debug, Clone)]
pub struct QuerySnapshot {
    pub state: QueryState,
    pub items: Vec<Document>,
    pub error: Option<String>,
}

impl QuerySnapshot {
    fn active() -> Self {
        Self {
            state: QueryState::Active,
            items: Vec::new(),
            error: None,
        }
    }
}

struct QueryRecord {
    selector: Selector,
    options: FindOptions,
    refcount: usize,
    tx: watch::Sender<QuerySnapshot>,
}

/// Stable key of a registered query: hash of the canonical selector plus
/// the result-shaping options.
pub(crate) fn query_key(selector: &Document, options: &FindOptions) -> u64 {
    let mut hasher = DefaultHasher::new();
    serialize_value(&Bson::Document(selector.clone())).hash(&mut hasher);
    if let Some(sort) = &options.sort {
        for (field, direction) in &sort.keys {
            field.hash(&mut hasher);
            format!("{direction:?}").hash(&mut hasher);
        }
    }
    options.skip.hash(&mut hasher);
    options.limit.hash(&mut hasher);
    hasher.finish()
}

pub(crate) struct StorageInner {
    pub name: String,
    pub adapter: Arc<dyn StorageAdapter>,
    pub indexes: Vec<String>,
    queries: Mutex<HashMap<u64, QueryRecord>>,
    disposed: AtomicBool,
}

impl std::fmt::Debug for StorageInner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StorageInner")
            .field("name", &self.name)
            .field("indexes", &self.indexes)
            .field("disposed", &self.disposed)
            .finish()
    }
}

/// The storage-backed collection: the synchronous collection's surface
/// with every read and mutation executed against a [`StorageAdapter`],
/// plus a per-query registry that keeps registered queries' results
/// current as mutations land.
#[derive(Clone)]
pub struct StorageCollection {
    pub(crate) inner: Arc<StorageInner>,
}

impl std::fmt::Debug for StorageCollection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StorageCollection")
            .field("inner", &self.inner)
            .finish()
    }
}

/// Configuration for [`StorageCollection::open`].
#[derive(Default)]
pub struct StorageCollectionOptions {
    pub name: String,
    /// Fields the storage backend indexes; planning reads these maps.
    pub indexes: Vec<String>,
    /// In-memory (synchronous) providers. The asynchronous backend plans
    /// against storage index reads; combining the two modes is refused.
    pub memory_indexes: Vec<FieldIndex>,
}

impl StorageCollectionOptions {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn index(mut self, field: impl Into<String>) -> Self {
        self.indexes.push(field.into());
        self
    }
}

fn storage_err(e: AdapterError) -> DbError {
    DbError::Storage(e.to_string())
}

impl StorageCollection {
    /// Declare indexes, run the adapter's setup, and wrap it.
    ///
    /// Fails with `MixedIndexModes` when synchronous in-memory providers
    /// are configured beside the storage-read (asynchronous) planner.
    pub async fn open(
        options: StorageCollectionOptions,
        adapter: Arc<dyn StorageAdapter>,
    ) -> Result<Self, DbError> {
        if !options.memory_indexes.is_empty() {
            return Err(DbError::MixedIndexModes);
        }
        for field in &options.indexes {
            adapter.create_index(field);
        }
        adapter.setup().await.map_err(storage_err)?;
        Ok(Self {
            inner: Arc::new(StorageInner {
                name: options.name,
                adapter,
                indexes: options.indexes,
                queries: Mutex::new(HashMap::new()),
                disposed: AtomicBool::new(false),
            }),
        })
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    fn ensure_active(&self) -> Result<(), DbError> {
        if self.inner.disposed.load(Ordering::SeqCst) {
            Err(DbError::Disposed)
        } else {
            Ok(())
        }
    }

    // ── Reads ───────────────────────────────────────────────────

    pub async fn find(
        &self,
        selector: &Document,
        options: FindOptions,
    ) -> Result<Vec<Document>, DbError> {
        self.ensure_active()?;
        let parsed = parse_selector(selector)?;
        self.execute(&parsed, &options).await
    }

    pub async fn find_one(&self, selector: &Document) -> Result<Option<Document>, DbError> {
        let mut items = self
            .find(selector, FindOptions::default().limit(1))
            .await?;
        Ok(if items.is_empty() {
            None
        } else {
            Some(items.remove(0))
        })
    }

    /// Index-assisted read: pull the declared index maps, plan, fetch
    /// candidates by id, then run the residual pipeline.
    async fn execute(
        &self,
        selector: &Selector,
        options: &FindOptions,
    ) -> Result<Vec<Document>, DbError> {
        let adapter = &self.inner.adapter;
        let candidates = if selector.is_empty() || self.inner.indexes.is_empty() {
            None
        } else {
            let mut providers = Vec::with_capacity(self.inner.indexes.len());
            for field in &self.inner.indexes {
                let map = adapter.read_index(field).await.map_err(storage_err)?;
                providers.push(FieldIndex::from_map(field.clone(), map));
            }
            let refs: Vec<&dyn IndexProvider> =
                providers.iter().map(|p| p as &dyn IndexProvider).collect();
            let info = plan(selector, &refs);
            if info.matched {
                let items = adapter.read_ids(&info.ids).await.map_err(storage_err)?;
                Some((items, info.optimized))
            } else {
                None
            }
        };

        let (items, residual) = match candidates {
            Some((items, residual)) => (items, residual),
            None => (
                adapter.read_all().await.map_err(storage_err)?,
                selector.clone(),
            ),
        };

        Ok(apply_pipeline(items, &residual, options))
    }

    // ── Mutations ───────────────────────────────────────────────

    pub async fn insert(&self, item: Document) -> Result<Bson, DbError> {
        let ids = self.insert_many(vec![item]).await?;
        Ok(ids.into_iter().next().unwrap_or(Bson::Null))
    }

    pub async fn insert_many(&self, items: Vec<Document>) -> Result<Vec<Bson>, DbError> {
        self.ensure_active()?;
        let mut prepared = Vec::with_capacity(items.len());
        let mut ids = Vec::with_capacity(items.len());
        let mut keys = Vec::with_capacity(items.len());
        for mut item in items {
            let id = match item.get("id") {
                Some(id) => id.clone(),
                None => {
                    let id = random_hex_id();
                    item.insert("id", id.clone());
                    id
                }
            };
            keys.push(serialize_value(&id));
            ids.push(id);
            prepared.push(item);
        }

        let mut unique = std::collections::HashSet::with_capacity(keys.len());
        for key in &keys {
            if !unique.insert(key) {
                return Err(DbError::DuplicateId(key.clone()));
            }
        }
        let existing = self
            .inner
            .adapter
            .read_ids(&keys)
            .await
            .map_err(storage_err)?;
        if let Some(duplicate) = existing.first().and_then(item_id) {
            return Err(DbError::DuplicateId(duplicate));
        }

        self.inner
            .adapter
            .insert(&prepared)
            .await
            .map_err(storage_err)?;
        self.check_query_updates(&prepared).await;
        Ok(ids)
    }

    pub async fn update_one(
        &self,
        selector: &Document,
        modifier: &Document,
        upsert: bool,
    ) -> Result<usize, DbError> {
        self.update_inner(selector, modifier, Some(1), upsert).await
    }

    pub async fn update_many(
        &self,
        selector: &Document,
        modifier: &Document,
        upsert: bool,
    ) -> Result<usize, DbError> {
        self.update_inner(selector, modifier, None, upsert).await
    }

    async fn update_inner(
        &self,
        selector: &Document,
        modifier: &Document,
        limit: Option<usize>,
        upsert: bool,
    ) -> Result<usize, DbError> {
        self.ensure_active()?;
        let parsed_selector = parse_selector(selector)?;
        let parsed_modifier = parse_modifier(modifier)?;

        let mut options = FindOptions::default();
        options.limit = limit;
        let targets = self.execute(&parsed_selector, &options).await?;

        if targets.is_empty() {
            if upsert {
                let item = parsed_modifier
                    .apply_upsert(&Document::new())
                    .map_err(DbError::from)?;
                self.insert(item).await?;
                return Ok(1);
            }
            return Ok(0);
        }

        let mut touched = Vec::with_capacity(targets.len() * 2);
        for old_item in &targets {
            let new_item = self
                .apply_update(old_item, &parsed_modifier)
                .await?;
            touched.push(old_item.clone());
            touched.push(new_item);
        }
        self.check_query_updates(&touched).await;
        Ok(targets.len())
    }

    async fn apply_update(
        &self,
        old_item: &Document,
        modifier: &Modifier,
    ) -> Result<Document, DbError> {
        let mut new_item = modifier.apply(old_item).map_err(DbError::from)?;
        if new_item.get("id").is_none() {
            if let Some(id) = old_item.get("id") {
                new_item.insert("id", id.clone());
            }
        }

        let old_key = item_id(old_item).unwrap_or_default();
        let new_key = item_id(&new_item).unwrap_or_default();
        let adapter = &self.inner.adapter;

        if new_key != old_key {
            let clash = adapter
                .read_ids(std::slice::from_ref(&new_key))
                .await
                .map_err(storage_err)?;
            if !clash.is_empty() {
                return Err(DbError::DuplicateId(new_key));
            }
            adapter
                .remove(std::slice::from_ref(old_item))
                .await
                .map_err(storage_err)?;
            adapter
                .insert(std::slice::from_ref(&new_item))
                .await
                .map_err(storage_err)?;
        } else {
            adapter
                .replace(std::slice::from_ref(&new_item))
                .await
                .map_err(storage_err)?;
        }
        Ok(new_item)
    }

    pub async fn replace_one(
        &self,
        selector: &Document,
        mut replacement: Document,
        upsert: bool,
    ) -> Result<usize, DbError> {
        self.ensure_active()?;
        let parsed_selector = parse_selector(selector)?;
        let targets = self
            .execute(&parsed_selector, &FindOptions::default().limit(1))
            .await?;

        let Some(old_item) = targets.into_iter().next() else {
            if upsert {
                self.insert(replacement).await?;
                return Ok(1);
            }
            return Ok(0);
        };

        if replacement.get("id").is_none() {
            if let Some(id) = old_item.get("id") {
                replacement.insert("id", id.clone());
            }
        }
        let old_key = item_id(&old_item).unwrap_or_default();
        let new_key = item_id(&replacement).unwrap_or_default();
        let adapter = &self.inner.adapter;
        if new_key != old_key {
            let clash = adapter
                .read_ids(std::slice::from_ref(&new_key))
                .await
                .map_err(storage_err)?;
            if !clash.is_empty() {
                return Err(DbError::DuplicateId(new_key));
            }
            adapter
                .remove(std::slice::from_ref(&old_item))
                .await
                .map_err(storage_err)?;
        }
        adapter
            .replace(std::slice::from_ref(&replacement))
            .await
            .map_err(storage_err)?;

        self.check_query_updates(&[old_item, replacement]).await;
        Ok(1)
    }

    pub async fn remove_one(&self, selector: &Document) -> Result<usize, DbError> {
        self.remove_inner(selector, Some(1)).await
    }

    pub async fn remove_many(&self, selector: &Document) -> Result<usize, DbError> {
        self.remove_inner(selector, None).await
    }

    async fn remove_inner(
        &self,
        selector: &Document,
        limit: Option<usize>,
    ) -> Result<usize, DbError> {
        self.ensure_active()?;
        let parsed_selector = parse_selector(selector)?;
        let mut options = FindOptions::default();
        options.limit = limit;
        let targets = self.execute(&parsed_selector, &options).await?;
        if targets.is_empty() {
            return Ok(0);
        }
        self.inner
            .adapter
            .remove(&targets)
            .await
            .map_err(storage_err)?;
        let count = targets.len();
        self.check_query_updates(&targets).await;
        Ok(count)
    }

    /// Remove every stored item by serialized id, used by auto-fetch
    /// purges which only hold ids.
    pub(crate) async fn remove_by_keys(&self, keys: &[String]) -> Result<usize, DbError> {
        let items = self
            .inner
            .adapter
            .read_ids(keys)
            .await
            .map_err(storage_err)?;
        if items.is_empty() {
            return Ok(0);
        }
        self.inner
            .adapter
            .remove(&items)
            .await
            .map_err(storage_err)?;
        let count = items.len();
        self.check_query_updates(&items).await;
        Ok(count)
    }

    pub async fn dispose(&self) -> Result<(), DbError> {
        if self.inner.disposed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.inner.queries.lock().unwrap().clear();
        self.inner.adapter.teardown().await.map_err(storage_err)
    }

    // ── Query registry ──────────────────────────────────────────

    /// Register a live query. The result arrives (and stays current)
    /// through the returned watch channel:
    /// `active → complete`, back to `active` whenever a mutation touches
    /// the selector, and to `error` when a recompute fails.
    pub async fn register_query(
        &self,
        selector: &Document,
        options: FindOptions,
    ) -> Result<(u64, watch::Receiver<QuerySnapshot>), DbError> {
        self.ensure_active()?;
        let parsed = parse_selector(selector)?;
        let key = query_key(selector, &options);

        let receiver = {
            let mut queries = self.inner.queries.lock().unwrap();
            match queries.get_mut(&key) {
                Some(record) => {
                    record.refcount += 1;
                    Some(record.tx.subscribe())
                }
                None => {
                    let (tx, _) = watch::channel(QuerySnapshot::active());
                    queries.insert(
                        key,
                        QueryRecord {
                            selector: parsed.clone(),
                            options: options.clone(),
                            refcount: 1,
                            tx,
                        },
                    );
                    None
                }
            }
        };

        if let Some(rx) = receiver {
            return Ok((key, rx));
        }

        self.refresh_query(key).await;
        let rx = self
            .inner
            .queries
            .lock()
            .unwrap()
            .get(&key)
            .map(|record| record.tx.subscribe())
            .ok_or_else(|| DbError::Storage("query record vanished".into()))?;
        Ok((key, rx))
    }

    /// Drop one registration; the record disappears with its last holder.
    pub fn unregister_query(&self, key: u64) {
        let mut queries = self.inner.queries.lock().unwrap();
        if let Some(record) = queries.get_mut(&key) {
            record.refcount -= 1;
            if record.refcount == 0 {
                queries.remove(&key);
            }
        }
    }

    /// Re-run every registered query whose selector matches at least one
    /// changed item (old or new form).
    pub(crate) async fn check_query_updates(&self, changed: &[Document]) {
        let affected: Vec<u64> = {
            let queries = self.inner.queries.lock().unwrap();
            queries
                .iter()
                .filter(|(_, record)| {
                    changed.iter().any(|item| matches(item, &record.selector))
                })
                .map(|(key, _)| *key)
                .collect()
        };
        for key in affected {
            self.refresh_query(key).await;
        }
    }

    /// Flip a query record to the error state, surfacing the failure to
    /// its listeners.
    pub(crate) fn fail_query_record(&self, key: u64, message: String) {
        let queries = self.inner.queries.lock().unwrap();
        if let Some(record) = queries.get(&key) {
            record.tx.send_modify(|snapshot| {
                snapshot.state = QueryState::Error;
                snapshot.error = Some(message.clone());
            });
        }
    }

    pub(crate) async fn refresh_query(&self, key: u64) {
        let Some((selector, options, tx)) = ({
            let queries = self.inner.queries.lock().unwrap();
            queries
                .get(&key)
                .map(|record| (record.selector.clone(), record.options.clone(), record.tx.clone()))
        }) else {
            return;
        };

        tx.send_modify(|snapshot| snapshot.state = QueryState::Active);
        match self.execute(&selector, &options).await {
            Ok(items) => {
                tx.send_replace(QuerySnapshot {
                    state: QueryState::Complete,
                    items,
                    error: None,
                });
            }
            Err(e) => {
                debug!(collection = %self.inner.name, error = %e, "query recompute failed");
                tx.send_modify(|snapshot| {
                    snapshot.state = QueryState::Error;
                    snapshot.error = Some(e.to_string());
                });
            }
        }
    }
}

fn random_hex_id() -> Bson {
    let n: u64 = rand::random();
    Bson::String(format!("{n:016x}"))
}

/// filter → sort → skip → limit → project.
pub(crate) fn apply_pipeline(
    items: Vec<Document>,
    selector: &Selector,
    options: &FindOptions,
) -> Vec<Document> {
    let mut items: Vec<Document> = items
        .into_iter()
        .filter(|item| matches(item, selector))
        .collect();
    if let Some(sort) = &options.sort {
        sort_items(&mut items, sort);
    }
    let skip = options.skip.unwrap_or(0);
    if skip > 0 {
        items.drain(..skip.min(items.len()));
    }
    if let Some(limit) = options.limit {
        items.truncate(limit);
    }
    if let Some(projection) = &options.fields {
        items = items.iter().map(|item| project(item, projection)).collect();
    }
    items
}
