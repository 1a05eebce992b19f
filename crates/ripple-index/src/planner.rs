use std::collections::HashSet;

use ripple_query::Selector;

use crate::provider::{IndexProvider, ProviderResult, intersect_sorted};

/// The planner's combined answer for a selector.
#[derive(Debug, Clone, PartialEq)]
pub struct IndexInfo {
    /// Whether any index accelerated the query. When false, `ids` is
    /// meaningless and the caller scans.
    pub matched: bool,
    /// Candidate ids: a superset of the true matches, deduplicated.
    pub ids: Vec<String>,
    /// What remains to re-verify per candidate after index filtering.
    pub optimized: Selector,
}

impl IndexInfo {
    fn unmatched(optimized: Selector) -> Self {
        Self {
            matched: false,
            ids: Vec::new(),
            optimized,
        }
    }
}

/// Combine provider answers across a selector's flat part and its
/// `$and`/`$or` branches.
///
/// - Flat part: providers fold left to right; each match intersects the
///   running candidate set and strips its covered fields from the residual
///   (unless the provider asked `keep_selector`).
/// - `$and` children plan recursively; a matched child intersects and is
///   replaced by its residual (dropped when empty).
/// - `$or` children plan recursively; the branch is only optimizable when
///   every child matched with an empty residual. The union then constrains
///   the running set and the `$or` disappears from the residual. One
///   unoptimizable child reverts the whole branch: the original `$or` stays
///   in the residual and contributes no ids.
/// - The empty selector is never index-assisted.
pub fn plan(selector: &Selector, providers: &[&dyn IndexProvider]) -> IndexInfo {
    if selector.is_empty() {
        return IndexInfo::unmatched(Selector::default());
    }

    let mut matched = false;
    let mut ids: Vec<String> = Vec::new();

    // Flat part.
    let mut residual_fields = selector.fields.clone();
    for provider in providers {
        match provider.query(selector) {
            ProviderResult::NotMatched => {}
            ProviderResult::Matched {
                ids: provider_ids,
                fields,
                keep_selector,
            } => {
                ids = if matched {
                    intersect_sorted(&ids, &provider_ids)
                } else {
                    provider_ids
                };
                matched = true;
                if !keep_selector {
                    residual_fields.retain(|(field, _)| !fields.contains(field));
                }
            }
        }
    }

    let mut optimized = Selector {
        fields: residual_fields,
        ..Selector::default()
    };

    // $and children.
    for child in &selector.and {
        let sub = plan(child, providers);
        if sub.matched {
            ids = if matched {
                intersect_sorted(&ids, &sub.ids)
            } else {
                sub.ids
            };
            matched = true;
            if !sub.optimized.is_empty() {
                optimized.and.push(sub.optimized);
            }
        } else {
            optimized.and.push(child.clone());
        }
    }

    // $or children: all-or-nothing.
    if !selector.or.is_empty() {
        let mut union: Vec<String> = Vec::new();
        let mut fully_optimized = true;
        for child in &selector.or {
            let sub = plan(child, providers);
            if sub.matched && sub.optimized.is_empty() {
                union.extend(sub.ids);
            } else {
                fully_optimized = false;
                break;
            }
        }
        if fully_optimized {
            union.sort();
            union.dedup();
            ids = if matched {
                intersect_sorted(&ids, &union)
            } else {
                union
            };
            matched = true;
        } else {
            // Revert: the $or contributes nothing and survives verbatim.
            optimized.or = selector.or.clone();
        }
    }

    if !matched {
        return IndexInfo::unmatched(optimized);
    }

    // Deduplicate, preserving first occurrence.
    let mut seen = HashSet::with_capacity(ids.len());
    ids.retain(|id| seen.insert(id.clone()));

    IndexInfo {
        matched: true,
        ids,
        optimized,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::FieldIndex;
    use bson::{Document, doc};
    use ripple_query::{matches, parse_selector};

    fn seed() -> Vec<Document> {
        vec![
            doc! { "id": "1", "name": "John", "age": 30, "active": true },
            doc! { "id": "2", "name": "Jane", "age": 25, "active": true },
            doc! { "id": "3", "name": "John", "age": 40, "active": false },
            doc! { "id": "4", "name": "Mary", "age": 25, "active": true },
        ]
    }

    fn indexes(fields: &[&str]) -> Vec<FieldIndex> {
        let items = seed();
        fields
            .iter()
            .map(|field| {
                let mut index = FieldIndex::new(*field);
                index.rebuild(&items);
                index
            })
            .collect()
    }

    fn plan_with(indexes: &[FieldIndex], selector: Document) -> IndexInfo {
        let providers: Vec<&dyn IndexProvider> =
            indexes.iter().map(|i| i as &dyn IndexProvider).collect();
        plan(&parse_selector(&selector).unwrap(), &providers)
    }

    #[test]
    fn empty_selector_is_not_matched() {
        let idx = indexes(&["name"]);
        let info = plan_with(&idx, doc! {});
        assert!(!info.matched);
        assert!(info.optimized.is_empty());
    }

    #[test]
    fn single_field_match_strips_residual() {
        let idx = indexes(&["name"]);
        let info = plan_with(&idx, doc! { "name": "John" });
        assert!(info.matched);
        assert_eq!(info.ids, ["1", "3"]);
        assert!(info.optimized.is_empty());
    }

    #[test]
    fn uncovered_field_stays_in_residual() {
        let idx = indexes(&["name"]);
        let info = plan_with(&idx, doc! { "name": "John", "age": { "$gt": 35 } });
        assert!(info.matched);
        assert_eq!(info.ids, ["1", "3"]);
        assert_eq!(info.optimized.fields.len(), 1);
        assert_eq!(info.optimized.fields[0].0, "age");
    }

    #[test]
    fn two_providers_intersect() {
        let idx = indexes(&["name", "age"]);
        let info = plan_with(&idx, doc! { "name": "John", "age": 30 });
        assert!(info.matched);
        assert_eq!(info.ids, ["1"]);
        assert!(info.optimized.is_empty());
    }

    #[test]
    fn null_query_keeps_selector() {
        let items = vec![doc! { "id": "1", "name": null }, doc! { "id": "2" }];
        let mut index = FieldIndex::new("name");
        index.rebuild(&items);
        let providers: Vec<&dyn IndexProvider> = vec![&index];
        let info = plan(
            &parse_selector(&doc! { "name": null }).unwrap(),
            &providers,
        );
        assert!(info.matched);
        assert_eq!(info.ids, ["1", "2"]);
        // Residual still carries the null check for the matcher.
        assert_eq!(info.optimized.fields.len(), 1);
    }

    #[test]
    fn and_children_intersect_and_drop() {
        let idx = indexes(&["name", "age"]);
        let info = plan_with(
            &idx,
            doc! { "$and": [{ "name": "John" }, { "age": 30 }] },
        );
        assert!(info.matched);
        assert_eq!(info.ids, ["1"]);
        assert!(info.optimized.is_empty());
    }

    #[test]
    fn and_child_without_index_survives() {
        let idx = indexes(&["name"]);
        let info = plan_with(
            &idx,
            doc! { "$and": [{ "name": "John" }, { "age": { "$gt": 35 } }] },
        );
        assert!(info.matched);
        assert_eq!(info.ids, ["1", "3"]);
        assert_eq!(info.optimized.and.len(), 1);
    }

    #[test]
    fn or_all_children_indexed_unions() {
        let idx = indexes(&["name"]);
        let info = plan_with(&idx, doc! { "$or": [{ "name": "Jane" }, { "name": "Mary" }] });
        assert!(info.matched);
        assert_eq!(info.ids, ["2", "4"]);
        assert!(info.optimized.is_empty());
    }

    #[test]
    fn or_with_unindexed_child_reverts() {
        let idx = indexes(&["name"]);
        let info = plan_with(
            &idx,
            doc! { "$or": [{ "name": "Jane" }, { "age": { "$gt": 35 } }] },
        );
        assert!(!info.matched);
        assert_eq!(info.optimized.or.len(), 2);
    }

    #[test]
    fn flat_and_or_combine_soundly() {
        let idx = indexes(&["name", "active"]);
        let info = plan_with(
            &idx,
            doc! { "active": true, "$or": [{ "name": "John" }, { "name": "Jane" }] },
        );
        assert!(info.matched);
        // active ∩ (John ∪ Jane): item 3 is John but inactive.
        assert_eq!(info.ids, ["1", "2"]);
        assert!(info.optimized.is_empty());
    }

    #[test]
    fn planner_soundness_and_completeness() {
        let items = seed();
        let idx = indexes(&["name", "age", "active"]);
        let selectors = [
            doc! { "name": "John" },
            doc! { "name": "John", "age": 30 },
            doc! { "age": { "$in": [25, 40] } },
            doc! { "name": { "$ne": "John" }, "active": true },
            doc! { "$or": [{ "name": "Jane" }, { "age": 40 }] },
            doc! { "active": true, "$or": [{ "name": "John" }, { "name": "Mary" }] },
        ];
        for raw in selectors {
            let selector = parse_selector(&raw).unwrap();
            let info = plan_with(&idx, raw.clone());
            if !info.matched {
                continue;
            }
            for item in &items {
                let id = item.get_str("id").unwrap().to_string();
                let in_ids = info.ids.contains(&id);
                let is_match = matches(item, &selector);
                // Completeness: every true match is in the candidate set.
                // Soundness: candidates re-filtered by the residual are
                // exactly the true matches.
                assert_eq!(
                    in_ids && matches(item, &info.optimized),
                    is_match,
                    "planner disagreement for {id} on {raw:?}"
                );
            }
        }
    }
}
