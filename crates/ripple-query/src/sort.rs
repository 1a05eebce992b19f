use std::cmp::Ordering;

use bson::{Bson, Document};
use serde::{Deserialize, Serialize};

use crate::error::SelectorError;
use crate::path::{get_path, parse_path};
use crate::value::numeric;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortDirection {
    Asc,
    Desc,
}

/// A multi-key sort specification, applied left to right.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct SortSpec {
    pub keys: Vec<(String, SortDirection)>,
}

impl SortSpec {
    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    pub fn asc(field: impl Into<String>) -> Self {
        Self {
            keys: vec![(field.into(), SortDirection::Asc)],
        }
    }

    pub fn desc(field: impl Into<String>) -> Self {
        Self {
            keys: vec![(field.into(), SortDirection::Desc)],
        }
    }

    pub fn then_asc(mut self, field: impl Into<String>) -> Self {
        self.keys.push((field.into(), SortDirection::Asc));
        self
    }

    pub fn then_desc(mut self, field: impl Into<String>) -> Self {
        self.keys.push((field.into(), SortDirection::Desc));
        self
    }
}

/// Parse a `{ field: ±1 }` sort document.
pub fn parse_sort(doc: &Document) -> Result<SortSpec, SelectorError> {
    let mut keys = Vec::with_capacity(doc.len());
    for (field, direction) in doc {
        let direction = match direction {
            Bson::Int32(1) | Bson::Int64(1) => SortDirection::Asc,
            Bson::Int32(-1) | Bson::Int64(-1) => SortDirection::Desc,
            Bson::Double(d) if *d == 1.0 => SortDirection::Asc,
            Bson::Double(d) if *d == -1.0 => SortDirection::Desc,
            other => {
                return Err(SelectorError(format!(
                    "sort direction for '{field}' must be 1 or -1, got {other}"
                )));
            }
        };
        keys.push((field.clone(), direction));
    }
    Ok(SortSpec { keys })
}

/// Stable multi-key sort.
pub fn sort_items(items: &mut [Document], spec: &SortSpec) {
    if spec.is_empty() {
        return;
    }
    let paths: Vec<_> = spec
        .keys
        .iter()
        .map(|(field, direction)| (parse_path(field).ok(), *direction))
        .collect();

    items.sort_by(|a, b| {
        for (path, direction) in &paths {
            let ord = match path {
                Some(path) => compare_options(get_path(a, path), get_path(b, path)),
                None => Ordering::Equal,
            };
            let ord = match direction {
                SortDirection::Asc => ord,
                SortDirection::Desc => ord.reverse(),
            };
            if ord != Ordering::Equal {
                return ord;
            }
        }
        Ordering::Equal
    });
}

fn compare_options(a: Option<&Bson>, b: Option<&Bson>) -> Ordering {
    match (a, b) {
        (None, None) => Ordering::Equal,
        (None, Some(_)) => Ordering::Less,
        (Some(_), None) => Ordering::Greater,
        (Some(a), Some(b)) => compare_values(a, b),
    }
}

/// Total cross-type ordering: null < numbers < strings < documents <
/// arrays < booleans < dates. Within a type, the natural order.
pub fn compare_values(a: &Bson, b: &Bson) -> Ordering {
    let (ra, rb) = (type_rank(a), type_rank(b));
    if ra != rb {
        return ra.cmp(&rb);
    }
    match (a, b) {
        (Bson::String(a), Bson::String(b)) => a.cmp(b),
        (Bson::Boolean(a), Bson::Boolean(b)) => a.cmp(b),
        (Bson::DateTime(a), Bson::DateTime(b)) => {
            a.timestamp_millis().cmp(&b.timestamp_millis())
        }
        (Bson::Array(a), Bson::Array(b)) => {
            for (x, y) in a.iter().zip(b.iter()) {
                let ord = compare_values(x, y);
                if ord != Ordering::Equal {
                    return ord;
                }
            }
            a.len().cmp(&b.len())
        }
        (Bson::Document(a), Bson::Document(b)) => {
            for ((ka, va), (kb, vb)) in a.iter().zip(b.iter()) {
                let ord = ka.cmp(kb);
                if ord != Ordering::Equal {
                    return ord;
                }
                let ord = compare_values(va, vb);
                if ord != Ordering::Equal {
                    return ord;
                }
            }
            a.len().cmp(&b.len())
        }
        _ => match (numeric(a), numeric(b)) {
            (Some(x), Some(y)) => x.partial_cmp(&y).unwrap_or(Ordering::Equal),
            _ => Ordering::Equal,
        },
    }
}

fn type_rank(value: &Bson) -> u8 {
    match value {
        Bson::Null => 0,
        Bson::Int32(_) | Bson::Int64(_) | Bson::Double(_) => 1,
        Bson::String(_) => 2,
        Bson::Document(_) => 3,
        Bson::Array(_) => 4,
        Bson::Boolean(_) => 5,
        Bson::DateTime(_) => 6,
        _ => 7,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bson::doc;

    fn names(items: &[Document]) -> Vec<&str> {
        items
            .iter()
            .map(|d| d.get_str("name").unwrap_or(""))
            .collect()
    }

    #[test]
    fn parses_sort_document() {
        let spec = parse_sort(&doc! { "age": -1, "name": 1 }).unwrap();
        assert_eq!(
            spec.keys,
            vec![
                ("age".to_string(), SortDirection::Desc),
                ("name".to_string(), SortDirection::Asc)
            ]
        );
    }

    #[test]
    fn rejects_bad_direction() {
        assert!(parse_sort(&doc! { "age": 2 }).is_err());
        assert!(parse_sort(&doc! { "age": "up" }).is_err());
    }

    #[test]
    fn multi_key_sort_is_stable() {
        let mut items = vec![
            doc! { "name": "c", "group": 2, "rank": 1 },
            doc! { "name": "a", "group": 1, "rank": 2 },
            doc! { "name": "b", "group": 1, "rank": 2 },
        ];
        sort_items(
            &mut items,
            &SortSpec::asc("group").then_desc("rank"),
        );
        assert_eq!(names(&items), ["a", "b", "c"]);
    }

    #[test]
    fn missing_fields_sort_first() {
        let mut items = vec![
            doc! { "name": "a", "age": 3 },
            doc! { "name": "b" },
        ];
        sort_items(&mut items, &SortSpec::asc("age"));
        assert_eq!(names(&items), ["b", "a"]);
    }

    #[test]
    fn cross_width_numbers_compare() {
        assert_eq!(
            compare_values(&Bson::Int32(2), &Bson::Double(2.5)),
            Ordering::Less
        );
        assert_eq!(
            compare_values(&Bson::Int64(3), &Bson::Int32(3)),
            Ordering::Equal
        );
    }

    #[test]
    fn cross_type_rank_order() {
        assert_eq!(
            compare_values(&Bson::Null, &Bson::Int32(0)),
            Ordering::Less
        );
        assert_eq!(
            compare_values(&Bson::String("z".into()), &Bson::Boolean(false)),
            Ordering::Less
        );
    }
}
