//! A small self-contained reactivity runtime: effects re-run when any
//! signal they depended on notifies. Reference binding for tests and
//! examples; real hosts bring their own framework.

use std::sync::{Arc, Mutex, Weak};

use crate::{ReactivityAdapter, SignalHandle};

/// Stack of currently-running effects. Effects nest, the innermost collects.
static SCOPE: Mutex<Vec<Weak<EffectState>>> = Mutex::new(Vec::new());

struct EffectState {
    body: Mutex<Box<dyn FnMut() + Send>>,
    stopped: Mutex<bool>,
}

impl EffectState {
    fn run(self: &Arc<Self>) {
        if *self.stopped.lock().unwrap() {
            return;
        }
        // A notify fired from inside this effect's own body would re-enter;
        // skip instead of deadlocking.
        let Ok(mut body) = self.body.try_lock() else {
            return;
        };
        SCOPE.lock().unwrap().push(Arc::downgrade(self));
        (body)();
        SCOPE.lock().unwrap().pop();
    }
}

/// Handle to a running effect. Dropping it does not stop the effect; call
/// [`ManualEffect::stop`].
pub struct ManualEffect {
    state: Arc<EffectState>,
}

impl ManualEffect {
    /// Run `body` now and re-run it whenever a dependency notifies.
    pub fn new(body: impl FnMut() + Send + 'static) -> Self {
        let state = Arc::new(EffectState {
            body: Mutex::new(Box::new(body)),
            stopped: Mutex::new(false),
        });
        state.run();
        Self { state }
    }

    pub fn stop(&self) {
        *self.state.stopped.lock().unwrap() = true;
    }
}

struct ManualSignal {
    dependents: Mutex<Vec<Weak<EffectState>>>,
}

impl SignalHandle for ManualSignal {
    fn depend(&self) {
        let Some(current) = SCOPE.lock().unwrap().last().cloned() else {
            return;
        };
        let mut dependents = self.dependents.lock().unwrap();
        if !dependents
            .iter()
            .any(|existing| existing.ptr_eq(&current))
        {
            dependents.push(current);
        }
    }

    fn notify(&self) {
        let dependents: Vec<_> = {
            let mut guard = self.dependents.lock().unwrap();
            guard.retain(|weak| weak.strong_count() > 0);
            guard.clone()
        };
        for weak in dependents {
            if let Some(effect) = weak.upgrade() {
                effect.run();
            }
        }
    }
}

/// The reference [`ReactivityAdapter`] over [`ManualEffect`] scopes.
#[derive(Default)]
pub struct ManualReactivity;

impl ManualReactivity {
    pub fn new() -> Self {
        Self
    }
}

impl ReactivityAdapter for ManualReactivity {
    fn create(&self) -> Arc<dyn SignalHandle> {
        Arc::new(ManualSignal {
            dependents: Mutex::new(Vec::new()),
        })
    }

    fn is_in_scope(&self) -> bool {
        !SCOPE.lock().unwrap().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn effect_reruns_on_notify() {
        let adapter = ManualReactivity::new();
        let signal = adapter.create();
        let runs = Arc::new(AtomicUsize::new(0));

        let counted = Arc::clone(&runs);
        let dep = Arc::clone(&signal);
        let effect = ManualEffect::new(move || {
            dep.depend();
            counted.fetch_add(1, Ordering::SeqCst);
        });

        assert_eq!(runs.load(Ordering::SeqCst), 1);
        signal.notify();
        assert_eq!(runs.load(Ordering::SeqCst), 2);

        effect.stop();
        signal.notify();
        assert_eq!(runs.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn depend_outside_scope_is_elided() {
        let adapter = ManualReactivity::new();
        let signal = adapter.create();
        signal.depend();
        signal.notify(); // no dependents, nothing happens
        assert!(!adapter.is_in_scope());
    }
}
