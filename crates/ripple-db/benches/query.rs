use criterion::{Criterion, black_box, criterion_group, criterion_main};

use bson::doc;
use ripple_db::{Collection, CollectionOptions, FindOptions};
use ripple_query::SortSpec;

const STATUSES: [&str; 4] = ["active", "snoozed", "rejected", "archived"];

fn seeded(indexed: bool) -> Collection {
    let mut options = CollectionOptions::named(if indexed { "bench-idx" } else { "bench" });
    if indexed {
        options = options.index("status");
    }
    let collection = Collection::new(options);
    collection
        .batch(|| {
            for i in 0..10_000 {
                collection
                    .insert(doc! {
                        "id": format!("rec-{i:05}"),
                        "status": STATUSES[i % STATUSES.len()],
                        "score": (i % 100) as i32,
                    })
                    .unwrap();
            }
        });
    collection
}

fn bench_find(c: &mut Criterion) {
    let scan = seeded(false);
    let indexed = seeded(true);

    c.bench_function("find_eq_scan", |b| {
        b.iter(|| {
            let items = scan
                .find(&doc! { "status": "active" })
                .unwrap()
                .fetch();
            black_box(items.len())
        })
    });

    c.bench_function("find_eq_indexed", |b| {
        b.iter(|| {
            let items = indexed
                .find(&doc! { "status": "active" })
                .unwrap()
                .fetch();
            black_box(items.len())
        })
    });

    c.bench_function("find_range_sorted_page", |b| {
        b.iter(|| {
            let options = FindOptions::default()
                .sort(SortSpec::desc("score"))
                .limit(25);
            let items = indexed
                .find_with_options(&doc! { "score": { "$gte": 50 } }, options)
                .unwrap()
                .fetch();
            black_box(items.len())
        })
    });
}

fn bench_mutation(c: &mut Criterion) {
    let collection = seeded(true);
    let mut n = 0u64;

    c.bench_function("insert_remove_cycle", |b| {
        b.iter(|| {
            n += 1;
            let id = format!("tmp-{n}");
            collection.insert(doc! { "id": &id, "status": "tmp" }).unwrap();
            collection.remove_one(&doc! { "id": &id }).unwrap();
        })
    });

    c.bench_function("update_one_indexed_field", |b| {
        b.iter(|| {
            collection
                .update_one(
                    &doc! { "id": "rec-00001" },
                    &doc! { "$inc": { "score": 1 } },
                    false,
                )
                .unwrap()
        })
    });
}

criterion_group!(benches, bench_find, bench_mutation);
criterion_main!(benches);
