use std::collections::HashMap;

use bson::{Bson, Document};
use ripple_index::item_id;
use ripple_query::{documents_equal, is_equal};

/// Callbacks a subscriber can register on an observer. All are optional;
/// `changed_field` receives `(item, field, old_value, new_value)`.
#[derive(Default)]
pub struct ChangeCallbacks {
    pub added: Option<Box<dyn Fn(&Document) + Send + Sync>>,
    pub added_before: Option<Box<dyn Fn(&Document, Option<&Document>) + Send + Sync>>,
    pub changed: Option<Box<dyn Fn(&Document) + Send + Sync>>,
    pub changed_field:
        Option<Box<dyn Fn(&Document, &str, Option<&Bson>, Option<&Bson>) + Send + Sync>>,
    pub moved_before: Option<Box<dyn Fn(&Document, Option<&Document>) + Send + Sync>>,
    pub removed: Option<Box<dyn Fn(&Document) + Send + Sync>>,
}

struct Subscriber {
    id: u64,
    callbacks: ChangeCallbacks,
    skip_initial: bool,
}

/// Diffs successive query results, ordered and unique by id, into
/// added / removed / changed / changed-field / added-before / moved-before
/// notifications.
#[derive(Default)]
pub struct Observer {
    previous: Vec<Document>,
    subscribers: Vec<Subscriber>,
    next_id: u64,
    ran_initial: bool,
}

struct Slot<'a> {
    item: &'a Document,
    index: usize,
    before_id: Option<String>,
}

impl Observer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&mut self, callbacks: ChangeCallbacks, skip_initial: bool) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        self.subscribers.push(Subscriber {
            id,
            callbacks,
            skip_initial,
        });
        id
    }

    /// Remove a subscriber. Returns true when none remain, at which point
    /// the owner releases its event bindings.
    pub fn unsubscribe(&mut self, id: u64) -> bool {
        self.subscribers.retain(|s| s.id != id);
        self.subscribers.is_empty()
    }

    pub fn is_idle(&self) -> bool {
        self.subscribers.is_empty()
    }

    pub fn previous(&self) -> &[Document] {
        &self.previous
    }

    pub fn ran_initial(&self) -> bool {
        self.ran_initial
    }

    /// Replay the current result set as an add storm to one late
    /// subscriber, so it observes the same state as an initial run.
    pub fn replay_to(&self, id: u64) {
        let Some(sub) = self.subscribers.iter().find(|s| s.id == id) else {
            return;
        };
        for (index, item) in self.previous.iter().enumerate() {
            let before = self.previous.get(index + 1);
            if let Some(cb) = &sub.callbacks.added {
                cb(item);
            }
            if let Some(cb) = &sub.callbacks.added_before {
                cb(item, before);
            }
        }
    }

    /// Diff the new result sequence against the previous one, firing
    /// callbacks, then adopt it as the new baseline.
    pub fn run(&mut self, new_items: Vec<Document>) {
        let is_initial = !self.ran_initial;
        self.ran_initial = true;

        let old_slots = index_by_id(&self.previous);
        let new_slots = index_by_id(&new_items);

        let live: Vec<&Subscriber> = self
            .subscribers
            .iter()
            .filter(|s| !(is_initial && s.skip_initial))
            .collect();

        // Walk old order first: removals, changes, moves.
        for old_item in &self.previous {
            let Some(id) = item_id(old_item) else { continue };
            let Some(old_slot) = old_slots.get(&id) else { continue };
            match new_slots.get(&id) {
                None => {
                    for sub in &live {
                        if let Some(cb) = &sub.callbacks.removed {
                            cb(old_item);
                        }
                    }
                }
                Some(new_slot) => {
                    if !documents_equal(new_slot.item, old_item) {
                        for sub in &live {
                            if let Some(cb) = &sub.callbacks.changed {
                                cb(new_slot.item);
                            }
                            if let Some(cb) = &sub.callbacks.changed_field {
                                emit_field_changes(old_item, new_slot.item, cb.as_ref());
                            }
                        }
                    }
                    if new_slot.before_id != old_slot.before_id && new_slot.index != old_slot.index
                    {
                        let before = new_slot
                            .before_id
                            .as_ref()
                            .and_then(|bid| new_slots.get(bid))
                            .map(|slot| slot.item);
                        for sub in &live {
                            if let Some(cb) = &sub.callbacks.moved_before {
                                cb(new_slot.item, before);
                            }
                        }
                    }
                }
            }
        }

        // Then new order: additions.
        for (index, new_item) in new_items.iter().enumerate() {
            let Some(id) = item_id(new_item) else { continue };
            if old_slots.contains_key(&id) {
                continue;
            }
            let before = new_items.get(index + 1);
            for sub in &live {
                if let Some(cb) = &sub.callbacks.added {
                    cb(new_item);
                }
                if let Some(cb) = &sub.callbacks.added_before {
                    cb(new_item, before);
                }
            }
        }

        self.previous = new_items;
    }
}

fn index_by_id(items: &[Document]) -> HashMap<String, Slot<'_>> {
    let mut map = HashMap::with_capacity(items.len());
    for (index, item) in items.iter().enumerate() {
        let Some(id) = item_id(item) else { continue };
        let before_id = items.get(index + 1).and_then(item_id);
        map.insert(
            id,
            Slot {
                item,
                index,
                before_id,
            },
        );
    }
    map
}

/// For every distinct key in old ∪ new whose value differs, report the
/// field-level change.
fn emit_field_changes(
    old: &Document,
    new: &Document,
    cb: &(dyn Fn(&Document, &str, Option<&Bson>, Option<&Bson>) + Send + Sync),
) {
    for (key, new_value) in new {
        match old.get(key.as_str()) {
            Some(old_value) if is_equal(old_value, new_value) => {}
            old_value => cb(new, key, old_value, Some(new_value)),
        }
    }
    for (key, old_value) in old {
        if new.get(key.as_str()).is_none() {
            cb(new, key, Some(old_value), None);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bson::doc;
    use std::sync::{Arc, Mutex};

    type Log = Arc<Mutex<Vec<String>>>;

    fn logging_callbacks(log: &Log) -> ChangeCallbacks {
        let mut callbacks = ChangeCallbacks::default();
        let added = Arc::clone(log);
        callbacks.added = Some(Box::new(move |item| {
            added
                .lock()
                .unwrap()
                .push(format!("added:{}", item.get_str("id").unwrap()));
        }));
        let added_before = Arc::clone(log);
        callbacks.added_before = Some(Box::new(move |item, before| {
            added_before.lock().unwrap().push(format!(
                "added_before:{}:{}",
                item.get_str("id").unwrap(),
                before.map(|b| b.get_str("id").unwrap()).unwrap_or("-")
            ));
        }));
        let changed = Arc::clone(log);
        callbacks.changed = Some(Box::new(move |item| {
            changed
                .lock()
                .unwrap()
                .push(format!("changed:{}", item.get_str("id").unwrap()));
        }));
        let moved = Arc::clone(log);
        callbacks.moved_before = Some(Box::new(move |item, before| {
            moved.lock().unwrap().push(format!(
                "moved_before:{}:{}",
                item.get_str("id").unwrap(),
                before.map(|b| b.get_str("id").unwrap()).unwrap_or("-")
            ));
        }));
        let removed = Arc::clone(log);
        callbacks.removed = Some(Box::new(move |item| {
            removed
                .lock()
                .unwrap()
                .push(format!("removed:{}", item.get_str("id").unwrap()));
        }));
        callbacks
    }

    fn drain(log: &Log) -> Vec<String> {
        std::mem::take(&mut *log.lock().unwrap())
    }

    #[test]
    fn initial_run_emits_adds_in_order() {
        let log: Log = Arc::default();
        let mut observer = Observer::new();
        observer.subscribe(logging_callbacks(&log), false);

        observer.run(vec![doc! { "id": "1" }, doc! { "id": "2" }]);
        assert_eq!(
            drain(&log),
            [
                "added:1",
                "added_before:1:2",
                "added:2",
                "added_before:2:-"
            ]
        );
    }

    #[test]
    fn skip_initial_suppresses_only_the_first_run() {
        let log: Log = Arc::default();
        let mut observer = Observer::new();
        observer.subscribe(logging_callbacks(&log), true);

        observer.run(vec![doc! { "id": "1" }]);
        assert!(drain(&log).is_empty());

        observer.run(vec![doc! { "id": "1" }, doc! { "id": "2" }]);
        assert_eq!(drain(&log), ["added:2", "added_before:2:-"]);
    }

    #[test]
    fn removed_and_changed() {
        let log: Log = Arc::default();
        let mut observer = Observer::new();
        observer.run(vec![
            doc! { "id": "1", "n": 1 },
            doc! { "id": "2", "n": 2 },
        ]);
        observer.subscribe(logging_callbacks(&log), false);

        observer.run(vec![doc! { "id": "2", "n": 20 }]);
        // 2 keeps its tail position (same before item), so no move fires.
        assert_eq!(drain(&log), ["removed:1", "changed:2"]);
    }

    #[test]
    fn reorder_emits_moved_before() {
        let log: Log = Arc::default();
        let mut observer = Observer::new();
        observer.run(vec![doc! { "id": "1" }, doc! { "id": "2" }, doc! { "id": "3" }]);
        observer.subscribe(logging_callbacks(&log), false);

        observer.run(vec![doc! { "id": "2" }, doc! { "id": "1" }, doc! { "id": "3" }]);
        let events = drain(&log);
        assert!(events.contains(&"moved_before:1:3".to_string()));
        assert!(events.contains(&"moved_before:2:1".to_string()));
    }

    #[test]
    fn changed_field_reports_distinct_keys() {
        let fields: Arc<Mutex<Vec<(String, String, String)>>> = Arc::default();
        let sink = Arc::clone(&fields);
        let mut callbacks = ChangeCallbacks::default();
        callbacks.changed_field = Some(Box::new(move |_, field, old, new| {
            sink.lock().unwrap().push((
                field.to_string(),
                old.map(|v| v.to_string()).unwrap_or_default(),
                new.map(|v| v.to_string()).unwrap_or_default(),
            ));
        }));

        let mut observer = Observer::new();
        observer.run(vec![doc! { "id": "1", "a": 1, "b": 2 }]);
        observer.subscribe(callbacks, false);
        observer.run(vec![doc! { "id": "1", "a": 9, "c": 3 }]);

        let seen = fields.lock().unwrap();
        let names: Vec<&str> = seen.iter().map(|(f, _, _)| f.as_str()).collect();
        assert_eq!(names, ["a", "c", "b"]);
    }

    #[test]
    fn replaying_adds_reconstructs_sequence() {
        // added_before events replayed on an empty list rebuild the new
        // list in order.
        let rebuilt: Arc<Mutex<Vec<String>>> = Arc::default();
        let sink = Arc::clone(&rebuilt);
        let mut callbacks = ChangeCallbacks::default();
        callbacks.added_before = Some(Box::new(move |item, before| {
            let id = item.get_str("id").unwrap().to_string();
            let mut list = sink.lock().unwrap();
            match before.and_then(|b| b.get_str("id").ok()) {
                Some(before_id) => {
                    let at = list.iter().position(|x| x == before_id).unwrap_or(list.len());
                    list.insert(at, id);
                }
                None => list.push(id),
            }
        }));

        let mut observer = Observer::new();
        observer.subscribe(callbacks, false);
        observer.run(vec![doc! { "id": "a" }, doc! { "id": "b" }, doc! { "id": "c" }]);
        assert_eq!(*rebuilt.lock().unwrap(), ["a", "b", "c"]);
    }

    #[test]
    fn last_unsubscribe_reports_idle() {
        let mut observer = Observer::new();
        let id1 = observer.subscribe(ChangeCallbacks::default(), false);
        let id2 = observer.subscribe(ChangeCallbacks::default(), false);
        assert!(!observer.unsubscribe(id1));
        assert!(observer.unsubscribe(id2));
        assert!(observer.is_idle());
    }
}
