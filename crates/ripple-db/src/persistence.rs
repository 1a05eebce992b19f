use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, Weak};
use std::thread;

use bson::Document;
use tracing::{debug, warn};

use crate::collection::CollectionCore;
use crate::events::{ChangeEvent, PersistenceEvent};

/// Adapter failures in any shape; coerced to an error value at the
/// boundary and surfaced as `persistence.error`.
pub type PersistenceError = Box<dyn std::error::Error + Send + Sync>;

/// A coalesced batch of mutations, in enqueue order per bucket.
#[derive(Debug, Clone, Default)]
pub struct Changeset {
    pub added: Vec<Document>,
    pub modified: Vec<Document>,
    pub removed: Vec<Document>,
}

impl Changeset {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.modified.is_empty() && self.removed.is_empty()
    }

    fn record(&mut self, event: &ChangeEvent) {
        match event {
            ChangeEvent::Added(item) => self.added.push(item.clone()),
            ChangeEvent::Changed { item, .. } => self.modified.push(item.clone()),
            ChangeEvent::Removed(item) => self.removed.push(item.clone()),
        }
    }
}

/// What an adapter hands back on load: a full snapshot or a delta.
#[derive(Debug, Clone)]
pub enum LoadResponse {
    Items(Vec<Document>),
    Changes(Changeset),
}

/// Callback handed to `register`; the adapter invokes it when external
/// state changed. `None` asks the coordinator to pull via `load`.
pub type OnChange = Arc<dyn Fn(Option<LoadResponse>) + Send + Sync>;

/// Persistence collaborator of the synchronous collection.
pub trait PersistenceAdapter: Send + Sync {
    fn register(&self, on_change: OnChange) -> Result<(), PersistenceError>;
    fn load(&self) -> Result<LoadResponse, PersistenceError>;
    fn save(&self, items: &[Document], changes: &Changeset) -> Result<(), PersistenceError>;
    fn unregister(&self) -> Result<(), PersistenceError> {
        Ok(())
    }
}

/// Pull/push state booleans, readable from any thread.
pub struct PersistenceSignals {
    pulling: AtomicBool,
    pushing: AtomicBool,
    ready: AtomicBool,
}

impl PersistenceSignals {
    pub(crate) fn new(ready: bool) -> Self {
        Self {
            pulling: AtomicBool::new(false),
            pushing: AtomicBool::new(false),
            ready: AtomicBool::new(ready),
        }
    }

    pub fn is_pulling(&self) -> bool {
        self.pulling.load(Ordering::SeqCst)
    }

    pub fn is_pushing(&self) -> bool {
        self.pushing.load(Ordering::SeqCst)
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }
}

#[derive(Default)]
struct Work {
    changes: Changeset,
    /// Loads pushed by the adapter, with the save epoch they arrived in.
    loads: Vec<(LoadResponse, u64)>,
    pull_requested: bool,
}

struct Shared {
    work: Mutex<Work>,
    cond: Condvar,
    shutdown: AtomicBool,
    ongoing_saves: AtomicUsize,
    saves_started: AtomicU64,
}

/// The save/load coordinator: one background flusher thread per collection
/// (condvar-driven, shut down via flag + join).
pub(crate) struct PersistenceHandle {
    shared: Arc<Shared>,
    adapter: Arc<dyn PersistenceAdapter>,
    listener_id: u64,
    core: Weak<CollectionCore>,
    thread: Option<thread::JoinHandle<()>>,
}

impl PersistenceHandle {
    pub fn spawn(
        adapter: Arc<dyn PersistenceAdapter>,
        core: Arc<CollectionCore>,
        signals: Arc<PersistenceSignals>,
    ) -> Self {
        let shared = Arc::new(Shared {
            work: Mutex::new(Work::default()),
            cond: Condvar::new(),
            shutdown: AtomicBool::new(false),
            ongoing_saves: AtomicUsize::new(0),
            saves_started: AtomicU64::new(0),
        });

        // Mutations enqueue from the moment the collection exists, so
        // anything mutated before the initial pull replays into the save
        // queue afterwards.
        let listener_shared = Arc::clone(&shared);
        let listener_id = core.events.on_change(Arc::new(move |event: &ChangeEvent| {
            let mut work = listener_shared.work.lock().unwrap();
            work.changes.record(event);
            listener_shared.cond.notify_all();
        }));

        let thread_shared = Arc::clone(&shared);
        let thread_adapter = Arc::clone(&adapter);
        let thread_core = Arc::downgrade(&core);
        let thread = thread::spawn(move || {
            run_coordinator(thread_adapter, thread_core, thread_shared, signals);
        });

        Self {
            shared,
            adapter,
            listener_id,
            core: Arc::downgrade(&core),
            thread: Some(thread),
        }
    }

    pub fn stop(&mut self) {
        self.shared.shutdown.store(true, Ordering::SeqCst);
        self.shared.cond.notify_all();
        let Some(thread) = self.thread.take() else {
            return;
        };
        let _ = thread.join();
        if let Some(core) = self.core.upgrade() {
            core.events.off_change(self.listener_id);
        }
        if let Err(e) = self.adapter.unregister() {
            warn!(error = %e, "persistence adapter unregister failed");
        }
    }
}

impl Drop for PersistenceHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run_coordinator(
    adapter: Arc<dyn PersistenceAdapter>,
    core: Weak<CollectionCore>,
    shared: Arc<Shared>,
    signals: Arc<PersistenceSignals>,
) {
    // ── Startup protocol ────────────────────────────────────────
    {
        let Some(core) = core.upgrade() else { return };
        signals.pulling.store(true, Ordering::SeqCst);
        core.events.emit_persistence(&PersistenceEvent::PullStarted);

        let register_shared = Arc::clone(&shared);
        let on_change: OnChange = Arc::new(move |payload| {
            let epoch = register_shared.saves_started.load(Ordering::SeqCst);
            let mut work = register_shared.work.lock().unwrap();
            match payload {
                Some(load) => work.loads.push((load, epoch)),
                None => work.pull_requested = true,
            }
            register_shared.cond.notify_all();
        });
        if let Err(e) = adapter.register(on_change) {
            emit_error(&core, e);
        }

        match adapter.load() {
            Ok(response) => apply_load(&core, response),
            Err(e) => emit_error(&core, e),
        }

        signals.pulling.store(false, Ordering::SeqCst);
        core.events.emit_persistence(&PersistenceEvent::Received);
        core.events.emit_persistence(&PersistenceEvent::PullCompleted);
        signals.ready.store(true, Ordering::SeqCst);
        core.events.emit_persistence(&PersistenceEvent::Init);
        debug!(collection = %core.name, "persistence initialized");
    }

    // ── Flush loop ──────────────────────────────────────────────
    loop {
        let (changes, loads, pull_requested) = {
            let mut work = shared.work.lock().unwrap();
            loop {
                if shared.shutdown.load(Ordering::SeqCst) {
                    // Final drain below, then exit.
                    break;
                }
                if !work.changes.is_empty() || !work.loads.is_empty() || work.pull_requested {
                    break;
                }
                work = shared.cond.wait(work).unwrap();
            }
            (
                std::mem::take(&mut work.changes),
                std::mem::take(&mut work.loads),
                std::mem::replace(&mut work.pull_requested, false),
            )
        };

        let Some(core) = core.upgrade() else { return };

        // Adapter-pushed loads. A load that raced a save is stale: drop it.
        for (load, epoch) in loads {
            if shared.ongoing_saves.load(Ordering::SeqCst) != 0
                || epoch != shared.saves_started.load(Ordering::SeqCst)
            {
                debug!(collection = %core.name, "dropping stale load during save");
                continue;
            }
            signals.pulling.store(true, Ordering::SeqCst);
            apply_load(&core, load);
            signals.pulling.store(false, Ordering::SeqCst);
            core.events.emit_persistence(&PersistenceEvent::Received);
            core.events.emit_persistence(&PersistenceEvent::PullCompleted);
        }

        // Requested re-pull.
        if pull_requested {
            signals.pulling.store(true, Ordering::SeqCst);
            core.events.emit_persistence(&PersistenceEvent::PullStarted);
            match adapter.load() {
                Ok(response) => apply_load(&core, response),
                Err(e) => emit_error(&core, e),
            }
            signals.pulling.store(false, Ordering::SeqCst);
            core.events.emit_persistence(&PersistenceEvent::Received);
            core.events.emit_persistence(&PersistenceEvent::PullCompleted);
        }

        // Coalesced save: one adapter call per drained queue.
        if !changes.is_empty() {
            signals.pushing.store(true, Ordering::SeqCst);
            shared.saves_started.fetch_add(1, Ordering::SeqCst);
            shared.ongoing_saves.fetch_add(1, Ordering::SeqCst);
            let items = core.items_snapshot();
            match adapter.save(&items, &changes) {
                Ok(()) => {
                    core.events.emit_persistence(&PersistenceEvent::Transmitted);
                }
                Err(e) => emit_error(&core, e),
            }
            shared.ongoing_saves.fetch_sub(1, Ordering::SeqCst);

            let drained = shared.work.lock().unwrap().changes.is_empty();
            if drained {
                signals.pushing.store(false, Ordering::SeqCst);
                core.events.emit_persistence(&PersistenceEvent::PushCompleted);
            }
        }

        if shared.shutdown.load(Ordering::SeqCst) {
            let empty = shared.work.lock().unwrap().changes.is_empty();
            if empty {
                return;
            }
        }
    }
}

fn apply_load(core: &CollectionCore, response: LoadResponse) {
    match response {
        LoadResponse::Items(items) => core.replace_all(items),
        LoadResponse::Changes(changes) => {
            if let Err(message) =
                core.apply_load_changes(changes.added, changes.modified, changes.removed)
            {
                warn!(collection = %core.name, error = %message, "load changeset failed");
                core.events
                    .emit_persistence(&PersistenceEvent::Error(message));
            }
        }
    }
}

fn emit_error(core: &CollectionCore, error: PersistenceError) {
    warn!(collection = %core.name, error = %error, "persistence adapter error");
    core.events
        .emit_persistence(&PersistenceEvent::Error(error.to_string()));
}
