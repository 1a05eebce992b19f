use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use bson::Document;
use ripple_query::Modifier;

/// A mutation observed on a collection. Fired synchronously, one per
/// affected item, in iteration order.
#[derive(Debug, Clone)]
pub enum ChangeEvent {
    Added(Document),
    Changed {
        item: Document,
        /// The modifier that produced the change; `None` for replacements
        /// and storage-driven updates.
        modifier: Option<Modifier>,
    },
    Removed(Document),
}

impl ChangeEvent {
    pub fn item(&self) -> &Document {
        match self {
            ChangeEvent::Added(item)
            | ChangeEvent::Changed { item, .. }
            | ChangeEvent::Removed(item) => item,
        }
    }
}

/// Persistence lifecycle events: the pull and push legs of the
/// coordinator, plus its error surface.
#[derive(Debug, Clone)]
pub enum PersistenceEvent {
    PullStarted,
    Received,
    PullCompleted,
    Init,
    Transmitted,
    PushCompleted,
    Error(String),
}

/// Kind tags for counting and waiting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PersistenceEventKind {
    PullStarted,
    Received,
    PullCompleted,
    Init,
    Transmitted,
    PushCompleted,
    Error,
}

impl PersistenceEvent {
    pub fn kind(&self) -> PersistenceEventKind {
        match self {
            PersistenceEvent::PullStarted => PersistenceEventKind::PullStarted,
            PersistenceEvent::Received => PersistenceEventKind::Received,
            PersistenceEvent::PullCompleted => PersistenceEventKind::PullCompleted,
            PersistenceEvent::Init => PersistenceEventKind::Init,
            PersistenceEvent::Transmitted => PersistenceEventKind::Transmitted,
            PersistenceEvent::PushCompleted => PersistenceEventKind::PushCompleted,
            PersistenceEvent::Error(_) => PersistenceEventKind::Error,
        }
    }
}

const KIND_COUNT: usize = 7;

fn kind_slot(kind: PersistenceEventKind) -> usize {
    match kind {
        PersistenceEventKind::PullStarted => 0,
        PersistenceEventKind::Received => 1,
        PersistenceEventKind::PullCompleted => 2,
        PersistenceEventKind::Init => 3,
        PersistenceEventKind::Transmitted => 4,
        PersistenceEventKind::PushCompleted => 5,
        PersistenceEventKind::Error => 6,
    }
}

pub(crate) type ChangeListener = Arc<dyn Fn(&ChangeEvent) + Send + Sync>;
pub(crate) type PersistenceListener = Arc<dyn Fn(&PersistenceEvent) + Send + Sync>;

/// Typed per-event listener registry. Listeners run synchronously on the
/// emitting thread, outside the registry lock.
#[derive(Default)]
pub(crate) struct EventBus {
    next_id: AtomicU64,
    change: Mutex<Vec<(u64, ChangeListener)>>,
    persistence: Mutex<Vec<(u64, PersistenceListener)>>,
    counts: Mutex<[u64; KIND_COUNT]>,
    counts_changed: Condvar,
}

impl EventBus {
    pub fn on_change(&self, listener: ChangeListener) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.change.lock().unwrap().push((id, listener));
        id
    }

    pub fn off_change(&self, id: u64) {
        self.change.lock().unwrap().retain(|(lid, _)| *lid != id);
    }

    pub fn on_persistence(&self, listener: PersistenceListener) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.persistence.lock().unwrap().push((id, listener));
        id
    }

    pub fn off_persistence(&self, id: u64) {
        self.persistence.lock().unwrap().retain(|(lid, _)| *lid != id);
    }

    pub fn emit_change(&self, event: &ChangeEvent) {
        let listeners: Vec<ChangeListener> = self
            .change
            .lock()
            .unwrap()
            .iter()
            .map(|(_, l)| Arc::clone(l))
            .collect();
        for listener in listeners {
            listener(event);
        }
    }

    pub fn emit_persistence(&self, event: &PersistenceEvent) {
        let listeners: Vec<PersistenceListener> = self
            .persistence
            .lock()
            .unwrap()
            .iter()
            .map(|(_, l)| Arc::clone(l))
            .collect();
        for listener in listeners {
            listener(event);
        }
        let mut counts = self.counts.lock().unwrap();
        counts[kind_slot(event.kind())] += 1;
        self.counts_changed.notify_all();
    }

    /// How many times a persistence event kind has fired.
    pub fn count(&self, kind: PersistenceEventKind) -> u64 {
        self.counts.lock().unwrap()[kind_slot(kind)]
    }

    /// Block until the kind has fired at least once since collection
    /// creation. Suits latched milestones (`Init`, `PullCompleted`).
    pub fn wait_for(&self, kind: PersistenceEventKind, timeout: Duration) -> bool {
        self.wait_until(kind, 1, timeout)
    }

    /// Block until the kind fires again after this call. Suits recurring
    /// events (`Transmitted`, `PushCompleted`).
    pub fn wait_for_next(&self, kind: PersistenceEventKind, timeout: Duration) -> bool {
        let target = self.count(kind) + 1;
        self.wait_until(kind, target, timeout)
    }

    fn wait_until(&self, kind: PersistenceEventKind, target: u64, timeout: Duration) -> bool {
        let slot = kind_slot(kind);
        let deadline = Instant::now() + timeout;
        let mut counts = self.counts.lock().unwrap();
        while counts[slot] < target {
            let Some(remaining) = deadline.checked_duration_since(Instant::now()) else {
                return false;
            };
            let (guard, result) = self
                .counts_changed
                .wait_timeout(counts, remaining)
                .unwrap();
            counts = guard;
            if result.timed_out() && counts[slot] < target {
                return false;
            }
        }
        true
    }
}
