mod common;
use common::*;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use bson::{Bson, doc};
use ripple_db::{ChangeCallbacks, Collection, FindOptions};
use ripple_reactive::{ManualEffect, ManualReactivity};

fn reactive_collection() -> Collection {
    Collection::new(options().reactivity(Arc::new(ManualReactivity::new())))
}

// ── Laziness / materialization ──────────────────────────────────

#[test]
fn cursor_does_not_cache_between_fetches() {
    let collection = collection();
    let cursor = collection.find(&doc! { "name": "John" }).unwrap();
    assert!(cursor.fetch().is_empty());

    collection.insert(doc! { "id": "1", "name": "John" }).unwrap();
    assert_eq!(cursor.fetch().len(), 1);
}

#[test]
fn map_and_for_each_walk_results() {
    let collection = collection();
    seed_people(&collection);
    let cursor = collection.find(&doc! {}).unwrap();

    let names = cursor.map(|item| item.get_str("name").unwrap().to_string());
    assert_eq!(names, ["John", "Jane", "John"]);

    let mut seen = 0;
    cursor.for_each(|_| seen += 1);
    assert_eq!(seen, 3);
}

#[test]
fn transforms_apply_batch_then_per_item() {
    let collection = collection();
    seed_people(&collection);
    let cursor = collection
        .find(&doc! {})
        .unwrap()
        .with_transform_all(|mut items| {
            // Batch stage: annotate every item in one pass.
            for (n, item) in items.iter_mut().enumerate() {
                item.insert("position", n as i32);
            }
            items
        })
        .with_transform(|mut item| {
            let next = item.get_i32("position").unwrap() + 1;
            item.insert("position", next);
            item
        });

    let items = cursor.fetch();
    let positions: Vec<i32> = items.iter().map(|i| i.get_i32("position").unwrap()).collect();
    assert_eq!(positions, [1, 2, 3]);
}

// ── observe_changes ─────────────────────────────────────────────

#[test]
fn observe_changes_streams_diffs() {
    let collection = collection();
    let cursor = collection.find(&doc! { "kind": "task" }).unwrap();

    let log: Arc<Mutex<Vec<String>>> = Arc::default();
    let mut callbacks = ChangeCallbacks::default();
    let sink = Arc::clone(&log);
    callbacks.added = Some(Box::new(move |item| {
        sink.lock().unwrap().push(format!("added:{}", item.get_str("id").unwrap()));
    }));
    let sink = Arc::clone(&log);
    callbacks.changed = Some(Box::new(move |item| {
        sink.lock().unwrap().push(format!("changed:{}", item.get_str("id").unwrap()));
    }));
    let sink = Arc::clone(&log);
    callbacks.removed = Some(Box::new(move |item| {
        sink.lock().unwrap().push(format!("removed:{}", item.get_str("id").unwrap()));
    }));
    let guard = cursor.observe_changes(callbacks, true);

    collection.insert(doc! { "id": "1", "kind": "task" }).unwrap();
    collection.insert(doc! { "id": "2", "kind": "note" }).unwrap(); // filtered out
    collection
        .update_one(&doc! { "id": "1" }, &doc! { "$set": { "done": true } }, false)
        .unwrap();
    collection.remove_one(&doc! { "id": "1" }).unwrap();

    assert_eq!(*log.lock().unwrap(), ["added:1", "changed:1", "removed:1"]);

    guard.unsubscribe();
    collection.insert(doc! { "id": "3", "kind": "task" }).unwrap();
    assert_eq!(log.lock().unwrap().len(), 3);
}

#[test]
fn observe_without_skip_initial_replays_current_items() {
    let collection = collection();
    seed_people(&collection);
    let cursor = collection.find(&doc! { "name": "John" }).unwrap();

    let added = Arc::new(AtomicUsize::new(0));
    let counted = Arc::clone(&added);
    let mut callbacks = ChangeCallbacks::default();
    callbacks.added = Some(Box::new(move |_| {
        counted.fetch_add(1, Ordering::SeqCst);
    }));
    let _guard = cursor.observe_changes(callbacks, false);

    assert_eq!(added.load(Ordering::SeqCst), 2);
}

#[test]
fn second_subscriber_gets_its_own_initial_replay() {
    let collection = collection();
    seed_people(&collection);
    let cursor = collection.find(&doc! {}).unwrap();

    let first = Arc::new(AtomicUsize::new(0));
    let counted = Arc::clone(&first);
    let mut callbacks = ChangeCallbacks::default();
    callbacks.added = Some(Box::new(move |_| {
        counted.fetch_add(1, Ordering::SeqCst);
    }));
    let _g1 = cursor.observe_changes(callbacks, false);
    assert_eq!(first.load(Ordering::SeqCst), 3);

    let second = Arc::new(AtomicUsize::new(0));
    let counted = Arc::clone(&second);
    let mut callbacks = ChangeCallbacks::default();
    callbacks.added = Some(Box::new(move |_| {
        counted.fetch_add(1, Ordering::SeqCst);
    }));
    let _g2 = cursor.observe_changes(callbacks, false);
    assert_eq!(second.load(Ordering::SeqCst), 3);
    // The first subscriber saw nothing new.
    assert_eq!(first.load(Ordering::SeqCst), 3);
}

// ── Reactive scopes ─────────────────────────────────────────────

#[test]
fn fetch_inside_effect_reruns_on_matching_insert() {
    let collection = reactive_collection();
    let cursor = Arc::new(collection.find(&doc! { "name": "John" }).unwrap());

    let observed: Arc<Mutex<Vec<usize>>> = Arc::default();
    let sink = Arc::clone(&observed);
    let dep = Arc::clone(&cursor);
    let _effect = ManualEffect::new(move || {
        sink.lock().unwrap().push(dep.fetch().len());
    });

    collection.insert(doc! { "id": "1", "name": "John" }).unwrap();
    collection.insert(doc! { "id": "2", "name": "Jane" }).unwrap();

    let runs = observed.lock().unwrap().clone();
    // Initial run, then one re-run for the matching insert. The Jane
    // insert leaves the result set untouched, so no third run.
    assert_eq!(runs, [0, 1]);
}

#[test]
fn count_effect_runs_twice_and_ends_at_one() {
    let collection = reactive_collection();
    let cursor = Arc::new(collection.find(&doc! { "name": "John" }).unwrap());

    let observed: Arc<Mutex<Vec<usize>>> = Arc::default();
    let sink = Arc::clone(&observed);
    let dep = Arc::clone(&cursor);
    let _effect = ManualEffect::new(move || {
        sink.lock().unwrap().push(dep.count());
    });

    collection.insert(doc! { "id": "1", "name": "John" }).unwrap();

    let runs = observed.lock().unwrap().clone();
    assert_eq!(runs, [0, 1]);
}

#[test]
fn count_does_not_depend_on_item_edits() {
    let collection = reactive_collection();
    collection.insert(doc! { "id": "1", "name": "John", "age": 1 }).unwrap();
    let cursor = Arc::new(collection.find(&doc! { "name": "John" }).unwrap());

    let runs = Arc::new(AtomicUsize::new(0));
    let counted = Arc::clone(&runs);
    let dep = Arc::clone(&cursor);
    let _effect = ManualEffect::new(move || {
        counted.fetch_add(1, Ordering::SeqCst);
        let _ = dep.count();
    });
    assert_eq!(runs.load(Ordering::SeqCst), 1);

    collection
        .update_one(&doc! { "id": "1" }, &doc! { "$inc": { "age": 1 } }, false)
        .unwrap();
    // Changed events don't invalidate count.
    assert_eq!(runs.load(Ordering::SeqCst), 1);

    collection.remove_one(&doc! { "id": "1" }).unwrap();
    assert_eq!(runs.load(Ordering::SeqCst), 2);
}

#[test]
fn fetch_outside_scope_registers_nothing() {
    let collection = reactive_collection();
    let cursor = collection.find(&doc! {}).unwrap();
    // No ambient effect: no panic, no dependency, plain results.
    assert!(cursor.fetch().is_empty());
    collection.insert(doc! { "id": "1" }).unwrap();
    assert_eq!(cursor.fetch().len(), 1);
}

// ── Field tracking ──────────────────────────────────────────────

#[test]
fn tracked_field_read_fires_only_for_that_field() {
    let collection = reactive_collection();
    collection
        .insert(doc! { "id": "1", "name": "John", "age": 30 })
        .unwrap();
    let cursor = Arc::new(
        collection
            .find_with_options(&doc! {}, FindOptions::default().field_tracking(true))
            .unwrap(),
    );

    let name_reads: Arc<Mutex<Vec<String>>> = Arc::default();
    let sink = Arc::clone(&name_reads);
    let dep = Arc::clone(&cursor);
    let _effect = ManualEffect::new(move || {
        for item in dep.fetch_tracked() {
            if let Some(Bson::String(name)) = item.get("name") {
                sink.lock().unwrap().push(name.clone());
            }
        }
    });
    assert_eq!(*name_reads.lock().unwrap(), ["John"]);

    // Changing an untracked field does not re-run the effect.
    collection
        .update_one(&doc! { "id": "1" }, &doc! { "$set": { "age": 31 } }, false)
        .unwrap();
    assert_eq!(name_reads.lock().unwrap().len(), 1);

    // Changing the tracked field does.
    collection
        .update_one(&doc! { "id": "1" }, &doc! { "$set": { "name": "Jay" } }, false)
        .unwrap();
    assert_eq!(*name_reads.lock().unwrap(), ["John", "Jay"]);
}

// ── Cleanup ─────────────────────────────────────────────────────

#[test]
fn cleanup_runs_callbacks_once_and_detaches() {
    let collection = collection();
    let cursor = collection.find(&doc! {}).unwrap();

    let cleaned = Arc::new(AtomicUsize::new(0));
    let counted = Arc::clone(&cleaned);
    cursor.on_cleanup(move || {
        counted.fetch_add(1, Ordering::SeqCst);
    });

    cursor.cleanup();
    cursor.cleanup();
    assert_eq!(cleaned.load(Ordering::SeqCst), 1);

    // Still usable after cleanup.
    collection.insert(doc! { "id": "1" }).unwrap();
    assert_eq!(cursor.fetch().len(), 1);
}
