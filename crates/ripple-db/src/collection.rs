use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use bson::{Bson, Document};

use ripple_index::{FieldIndex, IndexProvider, item_id, plan};
use ripple_query::{
    Modifier, Projection, Selector, SortSpec, matches, parse_modifier, parse_selector, project,
    serialize_value, sort_items,
};
use ripple_reactive::ReactivityAdapter;

use crate::cursor::Cursor;
use crate::error::DbError;
use crate::events::{
    ChangeEvent, ChangeListener, EventBus, PersistenceEvent, PersistenceEventKind,
    PersistenceListener,
};
use crate::persistence::{PersistenceAdapter, PersistenceHandle, PersistenceSignals};
use crate::runtime::Runtime;

/// Options for `find` / `find_one`.
#[derive(Debug, Clone, Default)]
pub struct FindOptions {
    pub sort: Option<SortSpec>,
    pub fields: Option<Projection>,
    pub skip: Option<usize>,
    pub limit: Option<usize>,
    /// Overrides the collection's field-tracking default for this query.
    pub field_tracking: Option<bool>,
}

impl FindOptions {
    pub fn sort(mut self, sort: SortSpec) -> Self {
        self.sort = Some(sort);
        self
    }

    pub fn fields(mut self, projection: Projection) -> Self {
        self.fields = Some(projection);
        self
    }

    pub fn skip(mut self, skip: usize) -> Self {
        self.skip = Some(skip);
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn field_tracking(mut self, on: bool) -> Self {
        self.field_tracking = Some(on);
        self
    }
}

pub type PrimaryKeyGenerator = Arc<dyn Fn() -> Bson + Send + Sync>;

/// Configuration for a collection.
#[derive(Clone, Default)]
pub struct CollectionOptions {
    pub name: String,
    /// Fields to index beside the mandatory id index.
    pub indexes: Vec<String>,
    pub reactivity: Option<Arc<dyn ReactivityAdapter>>,
    pub persistence: Option<Arc<dyn PersistenceAdapter>>,
    /// Generates ids for items inserted without one. Defaults to a random
    /// 16-hex string.
    pub primary_key_generator: Option<PrimaryKeyGenerator>,
    /// Default for field-level change tracking on cursors.
    pub field_tracking: bool,
}

impl CollectionOptions {
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

    pub fn reactivity(mut self, adapter: Arc<dyn ReactivityAdapter>) -> Self {
        self.reactivity = Some(adapter);
        self
    }

    pub fn persistence(mut self, adapter: Arc<dyn PersistenceAdapter>) -> Self {
        self.persistence = Some(adapter);
        self
    }
}

pub(crate) struct State {
    pub items: HashMap<String, Document>,
    pub order: Vec<String>,
    pub indexes: Vec<FieldIndex>,
    /// Set while a batch is deferring index maintenance; queries scan.
    pub indexes_stale: bool,
}

impl State {
    fn items_in_order(&self) -> Vec<Document> {
        self.order
            .iter()
            .filter_map(|key| self.items.get(key).cloned())
            .collect()
    }

    fn rebuild_indexes(&mut self) {
        let items = self.items_in_order();
        for index in &mut self.indexes {
            index.rebuild(&items);
        }
        self.indexes_stale = false;
    }
}

pub(crate) struct CollectionCore {
    pub name: String,
    pub state: RwLock<State>,
    pub events: EventBus,
    pub reactivity: Option<Arc<dyn ReactivityAdapter>>,
    pub field_tracking: bool,
    pk_gen: PrimaryKeyGenerator,
    disposed: AtomicBool,
    batch_depth: AtomicUsize,
    requery_pending: AtomicBool,
    requery_hooks: Mutex<Vec<(u64, Arc<dyn Fn() + Send + Sync>)>>,
    next_hook_id: AtomicU64,
    pub persistence_signals: Arc<PersistenceSignals>,
    runtime: Arc<Runtime>,
}

impl CollectionCore {
    pub fn ensure_active(&self) -> Result<(), DbError> {
        if self.disposed.load(Ordering::SeqCst) {
            Err(DbError::Disposed)
        } else {
            Ok(())
        }
    }

    /// Run the full read pipeline: plan → candidate filter → residual
    /// match → sort → skip → limit → project.
    pub fn query(&self, selector: &Selector, options: &FindOptions) -> Vec<Document> {
        let state = self.state.read().unwrap();
        Self::query_state(&state, selector, options)
    }

    fn query_state(state: &State, selector: &Selector, options: &FindOptions) -> Vec<Document> {
        let mut items: Vec<Document> = if selector.is_empty() || state.indexes_stale {
            state
                .order
                .iter()
                .filter_map(|key| state.items.get(key))
                .filter(|item| matches(item, selector))
                .cloned()
                .collect()
        } else {
            let providers: Vec<&dyn IndexProvider> = state
                .indexes
                .iter()
                .map(|index| index as &dyn IndexProvider)
                .collect();
            let info = plan(selector, &providers);
            if info.matched {
                let candidates: std::collections::HashSet<&String> = info.ids.iter().collect();
                state
                    .order
                    .iter()
                    .filter(|key| candidates.contains(key))
                    .filter_map(|key| state.items.get(key))
                    .filter(|item| matches(item, &info.optimized))
                    .cloned()
                    .collect()
            } else {
                state
                    .order
                    .iter()
                    .filter_map(|key| state.items.get(key))
                    .filter(|item| matches(item, selector))
                    .cloned()
                    .collect()
            }
        };

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

    pub fn register_requery_hook(&self, hook: Arc<dyn Fn() + Send + Sync>) -> u64 {
        let id = self.next_hook_id.fetch_add(1, Ordering::Relaxed);
        self.requery_hooks.lock().unwrap().push((id, hook));
        id
    }

    pub fn unregister_requery_hook(&self, id: u64) {
        self.requery_hooks.lock().unwrap().retain(|(hid, _)| *hid != id);
    }

    /// Re-run active observers, or defer to batch end.
    pub fn notify_queries(&self) {
        if self.batch_depth.load(Ordering::SeqCst) > 0 {
            self.requery_pending.store(true, Ordering::SeqCst);
            return;
        }
        let hooks: Vec<Arc<dyn Fn() + Send + Sync>> = self
            .requery_hooks
            .lock()
            .unwrap()
            .iter()
            .map(|(_, hook)| Arc::clone(hook))
            .collect();
        for hook in hooks {
            hook();
        }
    }

    /// Per-item events first, query-update notifications after.
    fn emit_and_requery(&self, events: Vec<ChangeEvent>) {
        for event in &events {
            self.events.emit_change(event);
        }
        if !events.is_empty() {
            self.notify_queries();
        }
    }

    pub(crate) fn begin_batch(&self) {
        if self.batch_depth.fetch_add(1, Ordering::SeqCst) == 0 {
            self.state.write().unwrap().indexes_stale = true;
        }
    }

    pub(crate) fn end_batch(&self) {
        if self.batch_depth.fetch_sub(1, Ordering::SeqCst) != 1 {
            return;
        }
        self.state.write().unwrap().rebuild_indexes();
        if self.requery_pending.swap(false, Ordering::SeqCst) {
            self.notify_queries();
        }
    }

    // ── Persistence entry points (silent: no change events) ─────

    pub fn items_snapshot(&self) -> Vec<Document> {
        self.state.read().unwrap().items_in_order()
    }

    /// Replace memory wholesale from a storage load.
    pub fn replace_all(&self, items: Vec<Document>) {
        {
            let mut state = self.state.write().unwrap();
            state.items.clear();
            state.order.clear();
            for item in items {
                let Some(key) = item_id(&item) else { continue };
                if state.items.insert(key.clone(), item).is_none() {
                    state.order.push(key);
                }
            }
            state.rebuild_indexes();
        }
        self.notify_queries();
    }

    /// Apply a load delta: upsert added, splice modified, drop removed.
    /// Modified or removed ids that are missing are an error.
    pub fn apply_load_changes(
        &self,
        added: Vec<Document>,
        modified: Vec<Document>,
        removed: Vec<Document>,
    ) -> Result<(), String> {
        let mut result = Ok(());
        {
            let mut state = self.state.write().unwrap();
            for item in added {
                let Some(key) = item_id(&item) else { continue };
                if state.items.insert(key.clone(), item).is_none() {
                    state.order.push(key);
                }
            }
            for item in modified {
                let Some(key) = item_id(&item) else { continue };
                match state.items.get_mut(&key) {
                    Some(slot) => *slot = item,
                    None => {
                        result = Err(format!("load changeset modified unknown id '{key}'"));
                    }
                }
            }
            for item in removed {
                let Some(key) = item_id(&item) else { continue };
                if state.items.remove(&key).is_none() {
                    result = Err(format!("load changeset removed unknown id '{key}'"));
                }
                state.order.retain(|existing| existing != &key);
            }
            state.rebuild_indexes();
        }
        self.notify_queries();
        result
    }

    fn shutdown(&self) {
        let mut state = self.state.write().unwrap();
        state.items.clear();
        state.order.clear();
        for index in &mut state.indexes {
            index.rebuild(&[]);
        }
    }
}

/// An embeddable, observable document collection over in-memory items.
///
/// Cheap to clone; clones share the same underlying state.
#[derive(Clone)]
pub struct Collection {
    core: Arc<CollectionCore>,
    persistence: Arc<Mutex<Option<PersistenceHandle>>>,
}

fn random_hex_id() -> Bson {
    let n: u64 = rand::random();
    Bson::String(format!("{n:016x}"))
}

impl Collection {
    pub fn new(options: CollectionOptions) -> Self {
        Self::new_in(options, Runtime::global())
    }

    pub fn new_in(options: CollectionOptions, runtime: Arc<Runtime>) -> Self {
        let mut indexes = vec![FieldIndex::new("id")];
        for field in &options.indexes {
            indexes.push(FieldIndex::new(field.clone()));
        }

        let signals = Arc::new(PersistenceSignals::new(options.persistence.is_none()));
        let core = Arc::new(CollectionCore {
            name: options.name.clone(),
            state: RwLock::new(State {
                items: HashMap::new(),
                order: Vec::new(),
                indexes,
                indexes_stale: false,
            }),
            events: EventBus::default(),
            reactivity: options.reactivity.clone(),
            field_tracking: options.field_tracking,
            pk_gen: options
                .primary_key_generator
                .unwrap_or_else(|| Arc::new(random_hex_id)),
            disposed: AtomicBool::new(false),
            batch_depth: AtomicUsize::new(0),
            requery_pending: AtomicBool::new(false),
            requery_hooks: Mutex::new(Vec::new()),
            next_hook_id: AtomicU64::new(0),
            persistence_signals: Arc::clone(&signals),
            runtime: Arc::clone(&runtime),
        });

        runtime.register(&options.name, &core);

        let persistence = options
            .persistence
            .map(|adapter| PersistenceHandle::spawn(adapter, Arc::clone(&core), signals));

        Self {
            core,
            persistence: Arc::new(Mutex::new(persistence)),
        }
    }

    pub fn name(&self) -> &str {
        &self.core.name
    }

    // ── Reads ───────────────────────────────────────────────────

    /// Build a lazy cursor; no work happens until it is materialized.
    pub fn find(&self, selector: &Document) -> Result<Cursor, DbError> {
        self.find_with_options(selector, FindOptions::default())
    }

    pub fn find_with_options(
        &self,
        selector: &Document,
        options: FindOptions,
    ) -> Result<Cursor, DbError> {
        self.core.ensure_active()?;
        let parsed = parse_selector(selector)?;
        Ok(Cursor::new(Arc::clone(&self.core), parsed, options))
    }

    /// Typed-selector variant; the only way to use `$where`.
    pub fn find_selector(
        &self,
        selector: Selector,
        options: FindOptions,
    ) -> Result<Cursor, DbError> {
        self.core.ensure_active()?;
        Ok(Cursor::new(Arc::clone(&self.core), selector, options))
    }

    pub fn find_one(&self, selector: &Document) -> Result<Option<Document>, DbError> {
        self.find_one_with_options(selector, FindOptions::default())
    }

    pub fn find_one_with_options(
        &self,
        selector: &Document,
        options: FindOptions,
    ) -> Result<Option<Document>, DbError> {
        let cursor = self.find_with_options(selector, options.limit(1))?;
        Ok(cursor.fetch().into_iter().next())
    }

    // ── Mutations ───────────────────────────────────────────────

    /// Insert a single item. Generates an id when absent. Fails with
    /// `DuplicateId` if the id already exists, leaving no side effects.
    pub fn insert(&self, item: Document) -> Result<Bson, DbError> {
        self.core.ensure_active()?;
        let (id, stored) = {
            let mut item = item;
            let id = match item.get("id") {
                Some(id) => id.clone(),
                None => {
                    let id = (self.core.pk_gen)();
                    item.insert("id", id.clone());
                    id
                }
            };
            let key = serialize_value(&id);
            let mut state = self.core.state.write().unwrap();
            if state.items.contains_key(&key) {
                return Err(DbError::DuplicateId(key));
            }
            state.items.insert(key.clone(), item.clone());
            state.order.push(key);
            if !state.indexes_stale {
                for index in &mut state.indexes {
                    index.insert(&item);
                }
            }
            (id, item)
        };
        self.core.emit_and_requery(vec![ChangeEvent::Added(stored)]);
        Ok(id)
    }

    /// Insert a batch inside one batch scope: indexes rebuild once, cursor
    /// re-queries coalesce. Events still fire per item.
    pub fn insert_many(&self, items: Vec<Document>) -> Result<Vec<Bson>, DbError> {
        self.core.ensure_active()?;
        self.batch(|| items.into_iter().map(|item| self.insert(item)).collect())
    }

    /// Update the first matching item. Returns the number of updated items
    /// (0 or 1); no match is not an error.
    pub fn update_one(
        &self,
        selector: &Document,
        modifier: &Document,
        upsert: bool,
    ) -> Result<usize, DbError> {
        self.update_inner(selector, modifier, Some(1), upsert)
    }

    /// Update every matching item, in natural order.
    pub fn update_many(
        &self,
        selector: &Document,
        modifier: &Document,
        upsert: bool,
    ) -> Result<usize, DbError> {
        self.update_inner(selector, modifier, None, upsert)
    }

    fn update_inner(
        &self,
        selector: &Document,
        modifier: &Document,
        limit: Option<usize>,
        upsert: bool,
    ) -> Result<usize, DbError> {
        self.core.ensure_active()?;
        let parsed_selector = parse_selector(selector)?;
        let parsed_modifier = parse_modifier(modifier)?;

        let mut events = Vec::new();
        let count = {
            let mut state = self.core.state.write().unwrap();
            let mut options = FindOptions::default();
            options.limit = limit;
            let targets = CollectionCore::query_state(&state, &parsed_selector, &options);

            if targets.is_empty() {
                drop(state);
                if upsert {
                    let seed = Document::new();
                    let item = parsed_modifier
                        .apply_upsert(&seed)
                        .map_err(DbError::from)?;
                    self.insert(item)?;
                    return Ok(1);
                }
                return Ok(0);
            }

            for old_item in &targets {
                let new_item =
                    apply_modifier_to(&parsed_modifier, old_item).map_err(DbError::from)?;
                replace_in_state(&mut state, old_item, new_item.clone())?;
                events.push(ChangeEvent::Changed {
                    item: new_item,
                    modifier: Some(parsed_modifier.clone()),
                });
            }
            targets.len()
        };

        self.core.emit_and_requery(events);
        Ok(count)
    }

    /// Replace the first matching item wholesale. The replacement's id
    /// defaults to the target's id.
    pub fn replace_one(
        &self,
        selector: &Document,
        replacement: Document,
        upsert: bool,
    ) -> Result<usize, DbError> {
        self.core.ensure_active()?;
        let parsed_selector = parse_selector(selector)?;

        let mut events = Vec::new();
        {
            let mut state = self.core.state.write().unwrap();
            let mut options = FindOptions::default();
            options.limit = Some(1);
            let targets = CollectionCore::query_state(&state, &parsed_selector, &options);

            let Some(old_item) = targets.into_iter().next() else {
                drop(state);
                if upsert {
                    self.insert(replacement)?;
                    return Ok(1);
                }
                return Ok(0);
            };

            let mut replacement = replacement;
            if replacement.get("id").is_none() {
                if let Some(id) = old_item.get("id") {
                    replacement.insert("id", id.clone());
                }
            }
            replace_in_state(&mut state, &old_item, replacement.clone())?;
            events.push(ChangeEvent::Changed {
                item: replacement,
                modifier: None,
            });
        }

        self.core.emit_and_requery(events);
        Ok(1)
    }

    /// Remove the first matching item. Returns 0 or 1.
    pub fn remove_one(&self, selector: &Document) -> Result<usize, DbError> {
        self.remove_inner(selector, Some(1))
    }

    /// Remove every matching item.
    pub fn remove_many(&self, selector: &Document) -> Result<usize, DbError> {
        self.remove_inner(selector, None)
    }

    fn remove_inner(&self, selector: &Document, limit: Option<usize>) -> Result<usize, DbError> {
        self.core.ensure_active()?;
        let parsed_selector = parse_selector(selector)?;

        let mut events = Vec::new();
        {
            let mut state = self.core.state.write().unwrap();
            let mut options = FindOptions::default();
            options.limit = limit;
            let targets = CollectionCore::query_state(&state, &parsed_selector, &options);

            for item in targets {
                let Some(key) = item_id(&item) else { continue };
                state.items.remove(&key);
                state.order.retain(|existing| existing != &key);
                if !state.indexes_stale {
                    for index in &mut state.indexes {
                        index.remove(&item)?;
                    }
                }
                events.push(ChangeEvent::Removed(item));
            }
        }

        let count = events.len();
        self.core.emit_and_requery(events);
        Ok(count)
    }

    // ── Batch / lifecycle ───────────────────────────────────────

    /// Defer index rebuilds and observer re-queries until `f` returns.
    /// Change events still fire per mutation.
    pub fn batch<R>(&self, f: impl FnOnce() -> R) -> R {
        self.core.begin_batch();
        let result = f();
        self.core.end_batch();
        result
    }

    /// Batch across every live collection of the global runtime.
    pub fn batch_all<R>(f: impl FnOnce() -> R) -> R {
        Runtime::global().batch_all(f)
    }

    /// Release storage, clear memory and indexes. Idempotent; subsequent
    /// operations fail with `Disposed`.
    pub fn dispose(&self) -> Result<(), DbError> {
        if self.core.disposed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        if let Some(mut handle) = self.persistence.lock().unwrap().take() {
            handle.stop();
        }
        self.core.shutdown();
        self.core.runtime.unregister(&self.core.name, &self.core);
        Ok(())
    }

    // ── Events / persistence state ──────────────────────────────

    pub fn on_change(&self, listener: impl Fn(&ChangeEvent) + Send + Sync + 'static) -> u64 {
        self.core.events.on_change(Arc::new(listener) as ChangeListener)
    }

    pub fn off_change(&self, id: u64) {
        self.core.events.off_change(id);
    }

    pub fn on_persistence(
        &self,
        listener: impl Fn(&PersistenceEvent) + Send + Sync + 'static,
    ) -> u64 {
        self.core
            .events
            .on_persistence(Arc::new(listener) as PersistenceListener)
    }

    pub fn off_persistence(&self, id: u64) {
        self.core.events.off_persistence(id);
    }

    /// Block until a persistence milestone has fired at least once.
    pub fn wait_for_persistence(
        &self,
        kind: PersistenceEventKind,
        timeout: std::time::Duration,
    ) -> bool {
        self.core.events.wait_for(kind, timeout)
    }

    /// Block until the next occurrence of a recurring persistence event.
    pub fn wait_for_next_persistence(
        &self,
        kind: PersistenceEventKind,
        timeout: std::time::Duration,
    ) -> bool {
        self.core.events.wait_for_next(kind, timeout)
    }

    /// True once the initial pull has completed (or immediately when the
    /// collection has no persistence).
    pub fn is_ready(&self) -> bool {
        self.core.persistence_signals.is_ready()
    }

    pub fn is_pulling(&self) -> bool {
        self.core.persistence_signals.is_pulling()
    }

    pub fn is_push_pending(&self) -> bool {
        self.core.persistence_signals.is_pushing()
    }
}

fn apply_modifier_to(
    modifier: &Modifier,
    old_item: &Document,
) -> Result<Document, ripple_query::ModifierError> {
    let mut new_item = modifier.apply(old_item)?;
    // A modifier may not strip the id; restore the original.
    if new_item.get("id").is_none() {
        if let Some(id) = old_item.get("id") {
            new_item.insert("id", id.clone());
        }
    }
    Ok(new_item)
}

/// Swap an item in place, handling id renames (with uniqueness validation)
/// and index deltas.
fn replace_in_state(
    state: &mut State,
    old_item: &Document,
    new_item: Document,
) -> Result<(), DbError> {
    let old_key = item_id(old_item)
        .ok_or_else(|| DbError::InvalidSelector("item without id".into()))?;
    let new_key = item_id(&new_item).unwrap_or_else(|| old_key.clone());

    if new_key != old_key {
        if state.items.contains_key(&new_key) {
            return Err(DbError::DuplicateId(new_key));
        }
        state.items.remove(&old_key);
        state.items.insert(new_key.clone(), new_item.clone());
        if let Some(slot) = state.order.iter_mut().find(|existing| **existing == old_key) {
            *slot = new_key;
        }
    } else {
        state.items.insert(old_key, new_item.clone());
    }

    if !state.indexes_stale {
        for index in &mut state.indexes {
            index.update(old_item, &new_item)?;
        }
    }
    Ok(())
}
