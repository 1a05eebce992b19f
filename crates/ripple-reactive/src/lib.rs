//! The narrow seam between collections and a host reactivity system.
//!
//! A binding implements [`ReactivityAdapter`]; the core only ever calls
//! `create`, `is_in_scope`, and `on_dispose`. Signals returned by `create`
//! carry the two-call contract: `depend()` registers the ambient scope as a
//! dependent, `notify()` invalidates every dependent.

mod manual;

use std::sync::Arc;

pub use manual::{ManualEffect, ManualReactivity};

/// A live dependency handle created by the host reactivity system.
pub trait SignalHandle: Send + Sync {
    /// Register a dependency in the ambient reactive scope.
    fn depend(&self);
    /// Invalidate every scope that depended on this signal.
    fn notify(&self);
}

/// Host reactivity binding.
pub trait ReactivityAdapter: Send + Sync {
    fn create(&self) -> Arc<dyn SignalHandle>;

    /// Whether a reactive scope is currently collecting dependencies.
    /// Dependency registration is elided when this returns false.
    fn is_in_scope(&self) -> bool {
        true
    }

    /// Bind cleanup to the ambient scope's disposal, if the host supports
    /// it. The default drops the callback.
    fn on_dispose(&self, _callback: Box<dyn FnOnce() + Send>, _signal: &Arc<dyn SignalHandle>) {}
}

/// A lazily-created signal owned by a cursor or query.
///
/// Wraps the adapter so call sites stay oblivious to whether a reactivity
/// system is configured at all.
pub struct Signal {
    adapter: Arc<dyn ReactivityAdapter>,
    handle: Arc<dyn SignalHandle>,
}

impl Signal {
    pub fn new(adapter: Arc<dyn ReactivityAdapter>) -> Self {
        let handle = adapter.create();
        Self { adapter, handle }
    }

    pub fn depend(&self) {
        self.handle.depend();
    }

    pub fn notify(&self) {
        self.handle.notify();
    }

    pub fn in_scope(&self) -> bool {
        self.adapter.is_in_scope()
    }

    pub fn on_dispose(&self, callback: Box<dyn FnOnce() + Send>) {
        self.adapter.on_dispose(callback, &self.handle);
    }

    pub fn handle(&self) -> &Arc<dyn SignalHandle> {
        &self.handle
    }
}

impl Clone for Signal {
    fn clone(&self) -> Self {
        Self {
            adapter: Arc::clone(&self.adapter),
            handle: Arc::clone(&self.handle),
        }
    }
}
