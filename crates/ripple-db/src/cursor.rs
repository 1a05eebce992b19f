use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};

use bson::{Bson, Document};
use ripple_query::Selector;
use ripple_reactive::{ReactivityAdapter, Signal};

use crate::collection::{CollectionCore, FindOptions};
use crate::observer::{ChangeCallbacks, Observer};

type Transform = Arc<dyn Fn(Document) -> Document + Send + Sync>;
type TransformAll = Arc<dyn Fn(Vec<Document>) -> Vec<Document> + Send + Sync>;

/// A lazy, reactive view of a query result.
///
/// Holds no cached items: every fetch recomputes through
/// plan → filter → sort → skip → limit → project. Inside a reactive scope,
/// `fetch`/`for_each`/`map`/`count` register dependencies that re-fire on
/// relevant collection changes; `observe_changes` is the non-reactive
/// subscription surface.
pub struct Cursor {
    core: Arc<CollectionCore>,
    selector: Selector,
    options: FindOptions,
    transform: Option<Transform>,
    transform_all: Option<TransformAll>,
    shared: Arc<CursorShared>,
}

impl std::fmt::Debug for Cursor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cursor")
            .field("selector", &self.selector)
            .field("options", &self.options)
            .finish()
    }
}

struct SignalSub {
    signal: Signal,
    subscription: u64,
}

struct ObserverBinding {
    observer: Arc<Mutex<Observer>>,
    hook_id: u64,
}

#[derive(Default)]
struct CursorShared {
    observer: Mutex<Option<ObserverBinding>>,
    items_signal: Mutex<Option<SignalSub>>,
    count_signal: Mutex<Option<SignalSub>>,
    field_dispatcher: Mutex<Option<u64>>,
    field_signals: Mutex<HashMap<(String, String), Signal>>,
    cleanups: Mutex<Vec<Box<dyn FnOnce() + Send>>>,
}

/// Undoes one `observe_changes` registration. The observer stops and its
/// event binding releases when the last subscriber leaves.
pub struct ObserveGuard {
    core: Arc<CollectionCore>,
    shared: Weak<CursorShared>,
    id: u64,
}

impl ObserveGuard {
    pub fn unsubscribe(self) {
        if let Some(shared) = self.shared.upgrade() {
            release_subscription(&self.core, &shared, self.id);
        }
    }
}

fn release_subscription(core: &CollectionCore, shared: &CursorShared, id: u64) {
    let mut binding = shared.observer.lock().unwrap();
    let Some(active) = binding.as_ref() else { return };
    let idle = active.observer.lock().unwrap().unsubscribe(id);
    if idle {
        core.unregister_requery_hook(active.hook_id);
        *binding = None;
    }
}

impl Cursor {
    pub(crate) fn new(core: Arc<CollectionCore>, selector: Selector, options: FindOptions) -> Self {
        Self {
            core,
            selector,
            options,
            transform: None,
            transform_all: None,
            shared: Arc::new(CursorShared::default()),
        }
    }

    /// Per-item transform, applied on fetch after `transform_all`.
    pub fn with_transform(
        mut self,
        transform: impl Fn(Document) -> Document + Send + Sync + 'static,
    ) -> Self {
        self.transform = Some(Arc::new(transform));
        self
    }

    /// Batch transform over the whole result slice, for solving N+1 lookups
    /// in one pass.
    pub fn with_transform_all(
        mut self,
        transform: impl Fn(Vec<Document>) -> Vec<Document> + Send + Sync + 'static,
    ) -> Self {
        self.transform_all = Some(Arc::new(transform));
        self
    }

    // ── Materialization ─────────────────────────────────────────

    /// Recompute and return the result items.
    pub fn fetch(&self) -> Vec<Document> {
        self.depend_items();
        let mut items = self.raw_results();
        if let Some(transform_all) = &self.transform_all {
            items = transform_all(items);
        }
        if let Some(transform) = &self.transform {
            items = items.into_iter().map(|item| transform(item)).collect();
        }
        items
    }

    pub fn for_each(&self, mut f: impl FnMut(&Document)) {
        for item in self.fetch() {
            f(&item);
        }
    }

    pub fn map<T>(&self, mut f: impl FnMut(&Document) -> T) -> Vec<T> {
        self.fetch().iter().map(|item| f(item)).collect()
    }

    /// Result count. Reactively, this depends only on membership changes
    /// (added/removed), not item edits.
    pub fn count(&self) -> usize {
        self.depend_count();
        self.raw_results().len()
    }

    /// Fetch with field-level tracking handles: reading a field through
    /// [`TrackedDocument::get`] registers a dependency that only a
    /// `changed_field` for that id + field invalidates.
    pub fn fetch_tracked(&self) -> Vec<TrackedDocument> {
        self.ensure_field_dispatcher();
        self.depend_items();
        self.raw_results()
            .into_iter()
            .map(|doc| {
                let id = doc
                    .get("id")
                    .map(ripple_query::serialize_value)
                    .unwrap_or_default();
                TrackedDocument {
                    doc,
                    id,
                    shared: Arc::clone(&self.shared),
                    reactivity: self.core.reactivity.clone(),
                }
            })
            .collect()
    }

    fn raw_results(&self) -> Vec<Document> {
        self.core.query(&self.selector, &self.options)
    }

    fn field_tracking_enabled(&self) -> bool {
        self.options.field_tracking.unwrap_or(self.core.field_tracking)
    }

    // ── Observation ─────────────────────────────────────────────

    /// Subscribe to the diff stream of this query. Non-reactive; the
    /// returned guard unsubscribes.
    pub fn observe_changes(&self, callbacks: ChangeCallbacks, skip_initial: bool) -> ObserveGuard {
        let id = self.subscribe(callbacks, skip_initial);
        ObserveGuard {
            core: Arc::clone(&self.core),
            shared: Arc::downgrade(&self.shared),
            id,
        }
    }

    fn subscribe(&self, callbacks: ChangeCallbacks, skip_initial: bool) -> u64 {
        let observer = self.ensure_observer();
        let items = self.raw_results();
        let mut guard = observer.lock().unwrap();
        let id = guard.subscribe(callbacks, skip_initial);
        if !guard.ran_initial() {
            guard.run(items);
        } else if !skip_initial {
            guard.replay_to(id);
        }
        id
    }

    /// Lazily create the observer and bind it to the collection's
    /// query-update notifications.
    fn ensure_observer(&self) -> Arc<Mutex<Observer>> {
        let mut binding = self.shared.observer.lock().unwrap();
        if let Some(active) = binding.as_ref() {
            return Arc::clone(&active.observer);
        }

        let observer = Arc::new(Mutex::new(Observer::new()));
        // Weak: the hook lives inside the collection, which must not keep
        // itself alive through it.
        let hook_core = Arc::downgrade(&self.core);
        let hook_selector = self.selector.clone();
        let hook_options = self.options.clone();
        let hook_observer = Arc::clone(&observer);
        let hook_id = self.core.register_requery_hook(Arc::new(move || {
            let Some(core) = hook_core.upgrade() else { return };
            let items = core.query(&hook_selector, &hook_options);
            hook_observer.lock().unwrap().run(items);
        }));

        *binding = Some(ObserverBinding {
            observer: Arc::clone(&observer),
            hook_id,
        });
        observer
    }

    // ── Reactive dependencies ───────────────────────────────────

    fn depend_items(&self) {
        let Some(adapter) = &self.core.reactivity else { return };
        if !adapter.is_in_scope() {
            return;
        }
        let mut slot = self.shared.items_signal.lock().unwrap();
        if slot.is_none() {
            let signal = Signal::new(Arc::clone(adapter));
            let mut callbacks = ChangeCallbacks::default();
            for target in [
                &mut callbacks.added,
                &mut callbacks.removed,
                &mut callbacks.changed,
            ] {
                let s = signal.clone();
                *target = Some(Box::new(move |_: &Document| s.notify()));
            }
            let s = signal.clone();
            callbacks.added_before = Some(Box::new(move |_, _| s.notify()));
            let s = signal.clone();
            callbacks.moved_before = Some(Box::new(move |_, _| s.notify()));
            if self.field_tracking_enabled() {
                // Field tracking swaps whole-item change wakeups for the
                // per-field signals routed by the field dispatcher.
                callbacks.changed = None;
            }

            let subscription = self.subscribe(callbacks, true);
            self.bind_dispose(&signal, subscription);
            *slot = Some(SignalSub {
                signal,
                subscription,
            });
        }
        if let Some(sub) = slot.as_ref() {
            sub.signal.depend();
        }
    }

    fn depend_count(&self) {
        let Some(adapter) = &self.core.reactivity else { return };
        if !adapter.is_in_scope() {
            return;
        }
        let mut slot = self.shared.count_signal.lock().unwrap();
        if slot.is_none() {
            let signal = Signal::new(Arc::clone(adapter));
            let mut callbacks = ChangeCallbacks::default();
            let s = signal.clone();
            callbacks.added = Some(Box::new(move |_| s.notify()));
            let s = signal.clone();
            callbacks.removed = Some(Box::new(move |_| s.notify()));

            let subscription = self.subscribe(callbacks, true);
            self.bind_dispose(&signal, subscription);
            *slot = Some(SignalSub {
                signal,
                subscription,
            });
        }
        if let Some(sub) = slot.as_ref() {
            sub.signal.depend();
        }
    }

    /// Tie a signal's observer subscription to the host scope's disposal,
    /// when the adapter supports it.
    fn bind_dispose(&self, signal: &Signal, subscription: u64) {
        let core = Arc::clone(&self.core);
        let shared = Arc::downgrade(&self.shared);
        signal.on_dispose(Box::new(move || {
            if let Some(shared) = shared.upgrade() {
                release_subscription(&core, &shared, subscription);
            }
        }));
    }

    fn ensure_field_dispatcher(&self) {
        let mut dispatcher = self.shared.field_dispatcher.lock().unwrap();
        if dispatcher.is_some() {
            return;
        }
        let signals = Arc::downgrade(&self.shared);
        let mut callbacks = ChangeCallbacks::default();
        callbacks.changed_field = Some(Box::new(move |item, field, _, _| {
            let Some(shared) = signals.upgrade() else { return };
            let Some(id) = item.get("id").map(ripple_query::serialize_value) else {
                return;
            };
            let guard = shared.field_signals.lock().unwrap();
            if let Some(signal) = guard.get(&(id, field.to_string())) {
                signal.notify();
            }
        }));
        drop(dispatcher);
        let subscription = self.subscribe(callbacks, true);
        *self.shared.field_dispatcher.lock().unwrap() = Some(subscription);
    }

    // ── Cleanup ─────────────────────────────────────────────────

    /// Register a callback to run on `cleanup`.
    pub fn on_cleanup(&self, callback: impl FnOnce() + Send + 'static) {
        self.shared.cleanups.lock().unwrap().push(Box::new(callback));
    }

    /// Release observers, signals, and registered callbacks. Idempotent;
    /// the cursor remains usable and will lazily rebuild its bindings.
    pub fn cleanup(&self) {
        let callbacks: Vec<Box<dyn FnOnce() + Send>> =
            std::mem::take(&mut *self.shared.cleanups.lock().unwrap());
        for callback in callbacks {
            callback();
        }

        if let Some(sub) = self.shared.items_signal.lock().unwrap().take() {
            release_subscription(&self.core, &self.shared, sub.subscription);
        }
        if let Some(sub) = self.shared.count_signal.lock().unwrap().take() {
            release_subscription(&self.core, &self.shared, sub.subscription);
        }
        if let Some(id) = self.shared.field_dispatcher.lock().unwrap().take() {
            release_subscription(&self.core, &self.shared, id);
        }
        self.shared.field_signals.lock().unwrap().clear();
    }
}

impl Drop for Cursor {
    fn drop(&mut self) {
        self.cleanup();
    }
}

/// A fetched item whose field reads register per-field dependencies.
pub struct TrackedDocument {
    doc: Document,
    id: String,
    shared: Arc<CursorShared>,
    reactivity: Option<Arc<dyn ReactivityAdapter>>,
}

impl TrackedDocument {
    /// Read a field, recording a dependency that only fires when a
    /// `changed_field` event for this id + field is observed.
    pub fn get(&self, field: &str) -> Option<&Bson> {
        if let Some(adapter) = &self.reactivity {
            if adapter.is_in_scope() {
                let mut signals = self.shared.field_signals.lock().unwrap();
                let signal = signals
                    .entry((self.id.clone(), field.to_string()))
                    .or_insert_with(|| Signal::new(Arc::clone(adapter)));
                signal.depend();
            }
        }
        self.doc.get(field)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// The underlying document, without dependency tracking.
    pub fn document(&self) -> &Document {
        &self.doc
    }
}
