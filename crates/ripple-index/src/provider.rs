use std::collections::{BTreeMap, BTreeSet};

use bson::{Bson, Document};
use ripple_query::{
    FieldOp, FieldPredicate, NULL_KEY, Path, Selector, get_path_all, parse_path, serialize_value,
};

use crate::error::NotFoundOnIndex;

/// Result of asking a provider about a selector's flat part.
#[derive(Debug, Clone, PartialEq)]
pub enum ProviderResult {
    /// The provider cannot accelerate this selector; the matcher handles it.
    NotMatched,
    Matched {
        /// Candidate ids (serialized), a superset of the true matches for
        /// the covered fields.
        ids: Vec<String>,
        /// Fields whose constraints these ids fully account for.
        fields: Vec<String>,
        /// When true, the planner must keep the covered predicates in the
        /// residual selector for re-verification (null/existence queries).
        keep_selector: bool,
    },
}

/// A field-scoped accelerator answering flat selector constraints with
/// candidate id sets.
pub trait IndexProvider: Send + Sync {
    fn query(&self, selector: &Selector) -> ProviderResult;

    fn rebuild(&mut self, items: &[Document]);
    fn insert(&mut self, item: &Document);
    fn remove(&mut self, item: &Document) -> Result<(), NotFoundOnIndex>;
    fn update(&mut self, old: &Document, new: &Document) -> Result<(), NotFoundOnIndex>;
}

/// The standard single-field index: `serialize(value) → set(id)`.
///
/// Multikey over arrays (each element gets an entry beside the whole array)
/// so that array-contains equality stays index-assisted. Items missing the
/// field, or holding null, land in the null bucket.
pub struct FieldIndex {
    field: String,
    path: Path,
    keys: BTreeMap<String, BTreeSet<String>>,
}

impl FieldIndex {
    /// Build an empty index over a field path.
    ///
    /// # Panics
    ///
    /// Panics if the field is not a valid path; indexes are declared in
    /// code, so a malformed field is a programming error.
    pub fn new(field: impl Into<String>) -> Self {
        let field = field.into();
        let path = match parse_path(&field) {
            Ok(path) => path,
            Err(e) => panic!("invalid index field '{field}': {e}"),
        };
        Self {
            field,
            path,
            keys: BTreeMap::new(),
        }
    }

    pub fn field(&self) -> &str {
        &self.field
    }

    /// Construct directly from a serialized key map, as handed back by a
    /// storage adapter's index read.
    pub fn from_map(field: impl Into<String>, keys: BTreeMap<String, BTreeSet<String>>) -> Self {
        let field = field.into();
        let path = match parse_path(&field) {
            Ok(path) => path,
            Err(e) => panic!("invalid index field '{field}': {e}"),
        };
        Self { field, path, keys }
    }

    fn item_keys(&self, item: &Document) -> Vec<String> {
        index_keys(item, &self.path)
    }

    fn ids_for_key(&self, key: &str) -> impl Iterator<Item = &String> {
        self.keys.get(key).into_iter().flatten()
    }

    fn all_ids_except(&self, excluded: &[String]) -> Vec<String> {
        let mut out = Vec::new();
        let mut dropped: BTreeSet<&String> = BTreeSet::new();
        for key in excluded {
            for id in self.ids_for_key(key) {
                dropped.insert(id);
            }
        }
        for ids in self.keys.values() {
            for id in ids {
                if !dropped.contains(id) {
                    out.push(id.clone());
                }
            }
        }
        out.sort();
        out.dedup();
        out
    }

    fn collect_includes(&self, included: &[String]) -> Vec<String> {
        let mut out = Vec::new();
        for key in included {
            out.extend(self.ids_for_key(key).cloned());
        }
        out.sort();
        out.dedup();
        out
    }

    /// Answer a single field predicate with an id set, or decline.
    fn query_predicate(&self, predicate: &FieldPredicate) -> Option<(Vec<String>, bool)> {
        match predicate {
            FieldPredicate::Value(Bson::Null) => {
                Some((self.collect_includes(&[NULL_KEY.to_string()]), true))
            }
            FieldPredicate::Value(Bson::RegularExpression(_)) => None,
            FieldPredicate::Value(value) => {
                Some((self.collect_includes(&[serialize_value(value)]), false))
            }
            FieldPredicate::Ops(ops) => {
                let mut result: Option<Vec<String>> = None;
                let mut keep = false;
                for op in ops {
                    let (ids, keep_op) = self.query_op(op)?;
                    keep |= keep_op;
                    result = Some(match result {
                        None => ids,
                        Some(prev) => intersect_sorted(&prev, &ids),
                    });
                }
                result.map(|ids| (ids, keep))
            }
        }
    }

    fn query_op(&self, op: &FieldOp) -> Option<(Vec<String>, bool)> {
        match op {
            FieldOp::Eq(Bson::Null) => Some((self.collect_includes(&[NULL_KEY.to_string()]), true)),
            FieldOp::Eq(value) => Some((self.collect_includes(&[serialize_value(value)]), false)),
            FieldOp::In(values) => {
                let keep = values.iter().any(|v| matches!(v, Bson::Null));
                let keys: Vec<String> = values
                    .iter()
                    .map(|v| match v {
                        Bson::Null => NULL_KEY.to_string(),
                        other => serialize_value(other),
                    })
                    .collect();
                Some((self.collect_includes(&keys), keep))
            }
            FieldOp::Ne(value) => {
                // Excluding null would also exclude missing; keep the
                // matcher in charge of that nuance.
                let keep = matches!(value, Bson::Null);
                Some((self.all_ids_except(&[serialize_value(value)]), keep))
            }
            FieldOp::Nin(values) => {
                let keep = values.iter().any(|v| matches!(v, Bson::Null));
                let keys: Vec<String> = values
                    .iter()
                    .map(|v| match v {
                        Bson::Null => NULL_KEY.to_string(),
                        other => serialize_value(other),
                    })
                    .collect();
                Some((self.all_ids_except(&keys), keep))
            }
            FieldOp::Exists(false) => {
                Some((self.collect_includes(&[NULL_KEY.to_string()]), true))
            }
            // Ranges, regex, array and schema operators fall through to the
            // matcher.
            _ => None,
        }
    }
}

impl IndexProvider for FieldIndex {
    fn query(&self, selector: &Selector) -> ProviderResult {
        let Some(predicate) = selector.field(&self.field) else {
            return ProviderResult::NotMatched;
        };
        match self.query_predicate(predicate) {
            Some((ids, keep_selector)) => ProviderResult::Matched {
                ids,
                fields: vec![self.field.clone()],
                keep_selector,
            },
            None => ProviderResult::NotMatched,
        }
    }

    fn rebuild(&mut self, items: &[Document]) {
        self.keys.clear();
        for item in items {
            self.insert(item);
        }
    }

    fn insert(&mut self, item: &Document) {
        let Some(id) = item_id(item) else { return };
        for key in self.item_keys(item) {
            self.keys.entry(key).or_default().insert(id.clone());
        }
    }

    fn remove(&mut self, item: &Document) -> Result<(), NotFoundOnIndex> {
        let Some(id) = item_id(item) else {
            return Ok(());
        };
        for key in self.item_keys(item) {
            let Some(ids) = self.keys.get_mut(&key) else {
                return Err(NotFoundOnIndex {
                    field: self.field.clone(),
                    id,
                });
            };
            if !ids.remove(&id) {
                return Err(NotFoundOnIndex {
                    field: self.field.clone(),
                    id,
                });
            }
            if ids.is_empty() {
                self.keys.remove(&key);
            }
        }
        Ok(())
    }

    fn update(&mut self, old: &Document, new: &Document) -> Result<(), NotFoundOnIndex> {
        self.remove(old)?;
        self.insert(new);
        Ok(())
    }
}

/// Serialized id of an item, if it has one.
pub fn item_id(item: &Document) -> Option<String> {
    item.get("id").map(serialize_value)
}

/// The index keys an item occupies for a field: its serialized value, each
/// array element (multikey), and the null bucket for missing-or-null.
/// Shared with storage adapters that maintain their own index maps.
pub fn index_keys(item: &Document, path: &Path) -> Vec<String> {
    let candidates = get_path_all(item, path);
    if candidates.is_empty() {
        return vec![NULL_KEY.to_string()];
    }
    let mut keys = Vec::new();
    for value in candidates {
        match value {
            Bson::Null => keys.push(NULL_KEY.to_string()),
            Bson::Array(items) => {
                keys.push(serialize_value(value));
                for element in items {
                    keys.push(serialize_value(element));
                }
            }
            other => keys.push(serialize_value(other)),
        }
    }
    keys.sort();
    keys.dedup();
    keys
}

/// Intersection of two sorted, deduplicated id lists.
pub(crate) fn intersect_sorted(a: &[String], b: &[String]) -> Vec<String> {
    let mut out = Vec::new();
    let (mut i, mut j) = (0, 0);
    while i < a.len() && j < b.len() {
        match a[i].cmp(&b[j]) {
            std::cmp::Ordering::Less => i += 1,
            std::cmp::Ordering::Greater => j += 1,
            std::cmp::Ordering::Equal => {
                out.push(a[i].clone());
                i += 1;
                j += 1;
            }
        }
    }
    out
}
