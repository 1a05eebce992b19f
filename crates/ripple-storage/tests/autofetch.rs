mod common;
use common::*;

use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use bson::doc;
use ripple_db::FindOptions;
use ripple_storage::{AutoFetchCollection, AutoFetchOptions, QueryState};

async fn open_autofetch(
    fetcher: Arc<ScriptedFetcher>,
    purge_delay: Duration,
) -> AutoFetchCollection {
    let (base, _) = open_memory(&[]).await;
    AutoFetchCollection::new(
        base,
        fetcher,
        AutoFetchOptions {
            purge_delay,
            merge_items: None,
        },
    )
}

#[tokio::test]
async fn first_registration_fetches_and_hydrates() {
    let fetcher = ScriptedFetcher::serving(vec![
        doc! { "id": "r1", "name": "John" },
        doc! { "id": "r2", "name": "Jane" },
    ]);
    let collection = open_autofetch(fetcher.clone(), Duration::ZERO).await;

    let (_key, rx) = collection
        .register_query(&doc! { "name": "John" }, FindOptions::default())
        .await
        .unwrap();

    assert_eq!(fetcher.fetch_calls.load(Ordering::SeqCst), 1);
    let snapshot = rx.borrow().clone();
    assert_eq!(snapshot.state, QueryState::Complete);
    assert_eq!(ids(&snapshot.items), ["r1"]);
}

#[tokio::test]
async fn second_registration_reuses_the_fetch() {
    let fetcher = ScriptedFetcher::serving(vec![doc! { "id": "r1", "name": "John" }]);
    let collection = open_autofetch(fetcher.clone(), Duration::ZERO).await;

    let (key_a, _rx_a) = collection
        .register_query(&doc! { "name": "John" }, FindOptions::default())
        .await
        .unwrap();
    let (key_b, _rx_b) = collection
        .register_query(&doc! { "name": "John" }, FindOptions::default())
        .await
        .unwrap();
    assert_eq!(key_a, key_b);
    assert_eq!(fetcher.fetch_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn last_unregister_purges_auto_loaded_items() {
    let fetcher = ScriptedFetcher::serving(vec![doc! { "id": "r1", "name": "John" }]);
    let collection = open_autofetch(fetcher.clone(), Duration::ZERO).await;

    let (key, _rx) = collection
        .register_query(&doc! { "name": "John" }, FindOptions::default())
        .await
        .unwrap();
    assert_eq!(
        ids(&collection.find(&doc! {}, FindOptions::default()).await.unwrap()),
        ["r1"]
    );

    collection.unregister_query(key).await;
    assert!(
        collection
            .find(&doc! {}, FindOptions::default())
            .await
            .unwrap()
            .is_empty(),
        "auto-loaded item should purge once unreferenced"
    );
}

#[tokio::test]
async fn delayed_purge_cancels_on_reregistration() {
    let fetcher = ScriptedFetcher::serving(vec![doc! { "id": "r1", "name": "John" }]);
    let collection = open_autofetch(fetcher.clone(), Duration::from_millis(50)).await;

    let selector = doc! { "name": "John" };
    let (key, _rx) = collection
        .register_query(&selector, FindOptions::default())
        .await
        .unwrap();
    collection.unregister_query(key).await;

    // Re-register inside the purge window: the pending purge cancels.
    let (key, _rx) = collection
        .register_query(&selector, FindOptions::default())
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(120)).await;
    assert_eq!(
        ids(&collection.find(&doc! {}, FindOptions::default()).await.unwrap()),
        ["r1"]
    );

    // Let it actually expire this time.
    collection.unregister_query(key).await;
    tokio::time::sleep(Duration::from_millis(120)).await;
    assert!(
        collection
            .find(&doc! {}, FindOptions::default())
            .await
            .unwrap()
            .is_empty()
    );
}

#[tokio::test]
async fn overlapping_selectors_keep_shared_items_alive() {
    let fetcher = ScriptedFetcher::serving(vec![
        doc! { "id": "r1", "name": "John", "team": "a" },
        doc! { "id": "r2", "name": "Jane", "team": "a" },
    ]);
    let collection = open_autofetch(fetcher.clone(), Duration::ZERO).await;

    let (john_key, _john_rx) = collection
        .register_query(&doc! { "name": "John" }, FindOptions::default())
        .await
        .unwrap();
    let (all_key, _all_rx) = collection
        .register_query(&doc! {}, FindOptions::default())
        .await
        .unwrap();

    // Dropping the narrow selector must not purge r1: the broad one still
    // references it.
    collection.unregister_query(john_key).await;
    assert_eq!(
        ids(&collection.find(&doc! {}, FindOptions::default()).await.unwrap()),
        ["r1", "r2"]
    );

    collection.unregister_query(all_key).await;
    assert!(
        collection
            .find(&doc! {}, FindOptions::default())
            .await
            .unwrap()
            .is_empty()
    );
}

#[tokio::test]
async fn crud_inserted_items_never_purge() {
    let fetcher = ScriptedFetcher::serving(vec![doc! { "id": "r1", "name": "John" }]);
    let collection = open_autofetch(fetcher.clone(), Duration::ZERO).await;

    collection.insert(doc! { "id": "mine", "name": "John" }).await.unwrap();

    let (key, _rx) = collection
        .register_query(&doc! { "name": "John" }, FindOptions::default())
        .await
        .unwrap();
    collection.unregister_query(key).await;

    let left = collection.find(&doc! {}, FindOptions::default()).await.unwrap();
    assert_eq!(ids(&left), ["mine"]);
}

#[tokio::test]
async fn remote_change_refetches_active_selectors() {
    let fetcher = ScriptedFetcher::serving(vec![doc! { "id": "r1", "name": "John" }]);
    let collection = open_autofetch(fetcher.clone(), Duration::ZERO).await;

    let (_key, rx) = collection
        .register_query(&doc! { "name": "John" }, FindOptions::default())
        .await
        .unwrap();
    assert_eq!(ids(&rx.borrow().items), ["r1"]);

    fetcher.set_items(vec![
        doc! { "id": "r1", "name": "John" },
        doc! { "id": "r9", "name": "John" },
    ]);
    fetcher.remote_changed();

    // The refetch runs on a spawned task; poll for convergence.
    let deadline = std::time::Instant::now() + Duration::from_secs(2);
    loop {
        if ids(&rx.borrow().items) == ["r1", "r9"] {
            break;
        }
        assert!(std::time::Instant::now() < deadline, "refetch never landed");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(fetcher.fetch_calls.load(Ordering::SeqCst) >= 2);
}

#[tokio::test]
async fn fetch_failure_surfaces_on_the_query_record() {
    let fetcher = ScriptedFetcher::serving(vec![]);
    fetcher.fail_with("remote unavailable");
    let collection = open_autofetch(fetcher.clone(), Duration::ZERO).await;

    let (_key, rx) = collection
        .register_query(&doc! { "name": "John" }, FindOptions::default())
        .await
        .unwrap();
    let snapshot = rx.borrow().clone();
    assert_eq!(snapshot.state, QueryState::Error);
    assert!(snapshot.error.unwrap().contains("remote unavailable"));
}

#[tokio::test]
async fn merge_items_controls_upsert_collisions() {
    let fetcher = ScriptedFetcher::serving(vec![doc! { "id": "r1", "name": "John", "remote": 1 }]);
    let (base, _) = open_memory(&[]).await;
    let collection = AutoFetchCollection::new(
        base,
        fetcher,
        AutoFetchOptions {
            purge_delay: Duration::ZERO,
            merge_items: Some(Arc::new(|current, fetched| {
                // Local fields win; remote fills the gaps.
                let mut merged = fetched.clone();
                for (key, value) in current {
                    merged.insert(key.clone(), value.clone());
                }
                merged
            })),
        },
    );

    collection
        .insert(doc! { "id": "r1", "name": "Local", "local": true })
        .await
        .unwrap();
    let (_key, _rx) = collection
        .register_query(&doc! {}, FindOptions::default())
        .await
        .unwrap();

    let item = collection
        .find(&doc! { "id": "r1" }, FindOptions::default())
        .await
        .unwrap()
        .remove(0);
    assert_eq!(item.get_str("name").unwrap(), "Local");
    assert_eq!(item.get_bool("local").unwrap(), true);
    assert_eq!(item.get_i32("remote").unwrap(), 1);
}

#[tokio::test]
async fn unregister_via_registry_refcount() {
    let fetcher = ScriptedFetcher::serving(vec![doc! { "id": "r1", "name": "John" }]);
    let collection = open_autofetch(fetcher.clone(), Duration::ZERO).await;

    let selector = doc! { "name": "John" };
    let (key, rx_a) = collection
        .register_query(&selector, FindOptions::default())
        .await
        .unwrap();
    let (_key, _rx_b) = collection
        .register_query(&selector, FindOptions::default())
        .await
        .unwrap();

    // One of two holders leaves: the record (and items) survive.
    collection.unregister_query(key).await;
    assert_eq!(ids(&rx_a.borrow().items), ["r1"]);

    collection.unregister_query(key).await;
    assert!(
        collection
            .find(&doc! {}, FindOptions::default())
            .await
            .unwrap()
            .is_empty()
    );
}
