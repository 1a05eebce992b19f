use std::sync::{Arc, Mutex, OnceLock, Weak};

use crate::collection::CollectionCore;

/// Per-process context that replaces ad-hoc global state: a registry of
/// live collections and cross-collection helpers. Collections register on
/// creation and unregister on dispose.
#[derive(Default)]
pub struct Runtime {
    collections: Mutex<Vec<(String, Weak<CollectionCore>)>>,
}

static GLOBAL: OnceLock<Arc<Runtime>> = OnceLock::new();

impl Runtime {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// The default runtime used by `Collection::new` and the static
    /// helpers.
    pub fn global() -> Arc<Self> {
        Arc::clone(GLOBAL.get_or_init(|| Arc::new(Self::default())))
    }

    pub(crate) fn register(&self, name: &str, core: &Arc<CollectionCore>) {
        let mut collections = self.collections.lock().unwrap();
        collections.retain(|(_, weak)| weak.strong_count() > 0);
        collections.push((name.to_string(), Arc::downgrade(core)));
    }

    pub(crate) fn unregister(&self, name: &str, core: &Arc<CollectionCore>) {
        let target = Arc::downgrade(core);
        self.collections
            .lock()
            .unwrap()
            .retain(|(existing, weak)| existing != name || !weak.ptr_eq(&target));
    }

    /// Names of currently-registered collections.
    pub fn collection_names(&self) -> Vec<String> {
        self.collections
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, weak)| weak.strong_count() > 0)
            .map(|(name, _)| name.clone())
            .collect()
    }

    /// Run `f` inside a batch spanning every live collection: index
    /// rebuilds and observer re-queries defer until the closure returns.
    pub fn batch_all<R>(&self, f: impl FnOnce() -> R) -> R {
        let live: Vec<Arc<CollectionCore>> = self
            .collections
            .lock()
            .unwrap()
            .iter()
            .filter_map(|(_, weak)| weak.upgrade())
            .collect();
        for core in &live {
            core.begin_batch();
        }
        let result = f();
        for core in live.iter().rev() {
            core.end_batch();
        }
        result
    }
}
