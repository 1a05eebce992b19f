use std::cmp::Ordering;

use bson::{Bson, Document};

use crate::path::{get_path_all, parse_path};
use crate::selector::{ElemMatch, FieldOp, FieldPredicate, Selector};
use crate::sort::compare_values;
use crate::value::{is_equal, numeric};

/// Evaluate a selector against an item.
///
/// Total: any structural mismatch (wrong type, bad path shape, absent
/// field) evaluates to false instead of erroring.
pub fn matches(item: &Document, selector: &Selector) -> bool {
    for (field, predicate) in &selector.fields {
        if !matches_field(item, field, predicate) {
            return false;
        }
    }
    for child in &selector.and {
        if !matches(item, child) {
            return false;
        }
    }
    if !selector.or.is_empty() && !selector.or.iter().any(|child| matches(item, child)) {
        return false;
    }
    true
}

fn matches_field(item: &Document, field: &str, predicate: &FieldPredicate) -> bool {
    // `$where` is attached under an empty field name and sees the whole item.
    if field.is_empty() {
        if let FieldPredicate::Ops(ops) = predicate {
            return ops.iter().all(|op| match op {
                FieldOp::Where(pred) => pred(item),
                _ => false,
            });
        }
        return false;
    }

    let candidates = match parse_path(field) {
        Ok(path) => get_path_all(item, &path),
        Err(_) => Vec::new(),
    };

    match predicate {
        FieldPredicate::Value(expected) => {
            if candidates.is_empty() {
                return matches!(expected, Bson::Null);
            }
            candidates.iter().any(|value| value_matches(value, expected))
        }
        FieldPredicate::Ops(ops) => ops.iter().all(|op| {
            if candidates.is_empty() {
                matches_op_absent(item, op)
            } else if negative(op) {
                // Negative operators must reject every candidate:
                // `{a.b: {$ne: 1}}` fails if any branch equals 1.
                candidates.iter().all(|value| matches_op(item, value, op))
            } else {
                candidates.iter().any(|value| matches_op(item, value, op))
            }
        }),
    }
}

fn negative(op: &FieldOp) -> bool {
    matches!(op, FieldOp::Ne(_) | FieldOp::Nin(_) | FieldOp::Not(_))
}

/// Direct value comparison: equal, or the field is an array containing the
/// expected value.
fn value_matches(value: &Bson, expected: &Bson) -> bool {
    if is_equal(value, expected) {
        return true;
    }
    match value {
        Bson::Array(items) => items.iter().any(|item| is_equal(item, expected)),
        _ => false,
    }
}

/// Operators evaluated when the path resolves to nothing.
fn matches_op_absent(item: &Document, op: &FieldOp) -> bool {
    match op {
        FieldOp::Exists(false) => true,
        FieldOp::Eq(Bson::Null) => true,
        FieldOp::Ne(v) => !matches!(v, Bson::Null),
        FieldOp::Nin(values) => !values.iter().any(|v| matches!(v, Bson::Null)),
        FieldOp::In(values) => values.iter().any(|v| matches!(v, Bson::Null)),
        FieldOp::Not(inner) => !matches_absent_predicate(item, inner),
        FieldOp::Where(pred) => pred(item),
        _ => false,
    }
}

fn matches_absent_predicate(item: &Document, predicate: &FieldPredicate) -> bool {
    match predicate {
        FieldPredicate::Value(v) => matches!(v, Bson::Null),
        FieldPredicate::Ops(ops) => ops.iter().all(|op| matches_op_absent(item, op)),
    }
}

fn matches_op(item: &Document, value: &Bson, op: &FieldOp) -> bool {
    match op {
        FieldOp::Eq(expected) => value_matches(value, expected),
        FieldOp::Ne(expected) => !value_matches(value, expected),
        FieldOp::Gt(bound) => compare_or_elements(value, bound, |ord| ord == Ordering::Greater),
        FieldOp::Gte(bound) => compare_or_elements(value, bound, |ord| ord != Ordering::Less),
        FieldOp::Lt(bound) => compare_or_elements(value, bound, |ord| ord == Ordering::Less),
        FieldOp::Lte(bound) => compare_or_elements(value, bound, |ord| ord != Ordering::Greater),
        FieldOp::In(values) => values.iter().any(|expected| value_matches(value, expected)),
        FieldOp::Nin(values) => !values.iter().any(|expected| value_matches(value, expected)),
        // A null-valued field satisfies both polarities: it "exists" in the
        // MongoDB sense and counts as absent for the null-unified bucket.
        FieldOp::Exists(expected) => matches!(value, Bson::Null) || *expected,
        FieldOp::Not(inner) => !matches_value_predicate(item, value, inner),
        FieldOp::Mod { divisor, remainder } => match numeric(value) {
            Some(n) => (n as i64) % divisor == *remainder,
            None => false,
        },
        FieldOp::Regex(re) => match value {
            Bson::String(s) => re.is_match(s),
            Bson::Array(items) => items
                .iter()
                .any(|item| matches!(item, Bson::String(s) if re.is_match(s))),
            _ => false,
        },
        FieldOp::All(required) => match value {
            Bson::Array(items) => required
                .iter()
                .all(|r| items.iter().any(|item| is_equal(item, r))),
            _ => false,
        },
        FieldOp::ElemMatch(em) => match value {
            Bson::Array(items) => items.iter().any(|element| match em {
                ElemMatch::Selector(sel) => match element {
                    Bson::Document(doc) => matches(doc, sel),
                    _ => false,
                },
                ElemMatch::Ops(ops) => ops.iter().all(|op| matches_op(item, element, op)),
            }),
            _ => false,
        },
        FieldOp::Size(n) => match value {
            Bson::Array(items) => items.len() == *n,
            _ => false,
        },
        FieldOp::BitsAllSet(mask) => bits(value).is_some_and(|b| b & mask == *mask),
        FieldOp::BitsAllClear(mask) => bits(value).is_some_and(|b| b & mask == 0),
        FieldOp::BitsAnySet(mask) => bits(value).is_some_and(|b| b & mask != 0),
        FieldOp::BitsAnyClear(mask) => bits(value).is_some_and(|b| b & mask != *mask),
        FieldOp::Text(needle) => match value {
            Bson::String(s) => s.to_lowercase().contains(&needle.to_lowercase()),
            _ => false,
        },
        FieldOp::JsonSchema(schema) => match value {
            Bson::Document(doc) => matches_schema(doc, schema),
            _ => false,
        },
        FieldOp::Expr(expr) => eval_expr(item, expr),
        FieldOp::Where(pred) => pred(item),
    }
}

/// Evaluate a field predicate against a standalone value, outside any item
/// context. Used by `$pull` criteria; item-scoped operators (`$where`,
/// `$expr`) never match here.
pub fn matches_value(value: &Bson, predicate: &FieldPredicate) -> bool {
    static EMPTY: std::sync::LazyLock<Document> = std::sync::LazyLock::new(Document::new);
    match predicate {
        FieldPredicate::Ops(ops) => ops.iter().all(|op| match op {
            FieldOp::Where(_) | FieldOp::Expr(_) => false,
            op => matches_op(&EMPTY, value, op),
        }),
        FieldPredicate::Value(expected) => value_matches(value, expected),
    }
}

fn matches_value_predicate(item: &Document, value: &Bson, predicate: &FieldPredicate) -> bool {
    match predicate {
        FieldPredicate::Value(expected) => value_matches(value, expected),
        FieldPredicate::Ops(ops) => ops.iter().all(|op| matches_op(item, value, op)),
    }
}

/// Range comparison; when the field value is an array, any element may
/// satisfy the bound. Mixed types never satisfy a range.
fn compare_or_elements(value: &Bson, bound: &Bson, predicate: fn(Ordering) -> bool) -> bool {
    if let Bson::Array(items) = value {
        if !matches!(bound, Bson::Array(_)) {
            return items.iter().any(|item| comparable(item, bound, predicate));
        }
    }
    comparable(value, bound, predicate)
}

fn comparable(value: &Bson, bound: &Bson, predicate: fn(Ordering) -> bool) -> bool {
    if !same_comparison_class(value, bound) {
        return false;
    }
    predicate(compare_values(value, bound))
}

fn same_comparison_class(a: &Bson, b: &Bson) -> bool {
    match (a, b) {
        (Bson::String(_), Bson::String(_)) => true,
        (Bson::DateTime(_), Bson::DateTime(_)) => true,
        (Bson::Boolean(_), Bson::Boolean(_)) => true,
        (Bson::Array(_), Bson::Array(_)) => true,
        _ => numeric(a).is_some() && numeric(b).is_some(),
    }
}

fn bits(value: &Bson) -> Option<u64> {
    match numeric(value) {
        Some(n) if n >= 0.0 && n.fract() == 0.0 => Some(n as u64),
        _ => None,
    }
}

/// Minimal `$jsonSchema`: `bsonType`/`type`, `required`, nested
/// `properties`.
fn matches_schema(doc: &Document, schema: &Document) -> bool {
    if let Some(Bson::Array(required)) = schema.get("required") {
        for entry in required {
            match entry {
                Bson::String(key) if doc.get(key.as_str()).is_some() => {}
                _ => return false,
            }
        }
    }
    if let Some(Bson::Document(properties)) = schema.get("properties") {
        for (key, prop) in properties {
            let Bson::Document(prop) = prop else {
                return false;
            };
            let Some(value) = doc.get(key.as_str()) else {
                continue; // absence is governed by `required`
            };
            if !matches_property(value, prop) {
                return false;
            }
        }
    }
    true
}

fn matches_property(value: &Bson, prop: &Document) -> bool {
    let declared = prop
        .get("bsonType")
        .or_else(|| prop.get("type"))
        .and_then(|t| match t {
            Bson::String(s) => Some(s.as_str()),
            _ => None,
        });
    if let Some(type_name) = declared {
        if !type_matches(value, type_name) {
            return false;
        }
    }
    if let Bson::Document(doc) = value {
        return matches_schema(doc, prop);
    }
    true
}

fn type_matches(value: &Bson, type_name: &str) -> bool {
    match type_name {
        "string" => matches!(value, Bson::String(_)),
        "bool" | "boolean" => matches!(value, Bson::Boolean(_)),
        "object" => matches!(value, Bson::Document(_)),
        "array" => matches!(value, Bson::Array(_)),
        "null" => matches!(value, Bson::Null),
        "date" => matches!(value, Bson::DateTime(_)),
        "int" => matches!(value, Bson::Int32(_)),
        "long" => matches!(value, Bson::Int64(_)),
        "double" => matches!(value, Bson::Double(_)),
        "number" => numeric(value).is_some(),
        _ => false,
    }
}

/// `$expr`: `{ $op: [lhs, rhs] }` where operands are `"$field"` references
/// or literals.
fn eval_expr(item: &Document, expr: &Bson) -> bool {
    let Bson::Document(doc) = expr else {
        return false;
    };
    let Some((op, Bson::Array(operands))) = doc.iter().next() else {
        return false;
    };
    if operands.len() != 2 {
        return false;
    }
    let lhs = resolve_operand(item, &operands[0]);
    let rhs = resolve_operand(item, &operands[1]);
    let (Some(lhs), Some(rhs)) = (lhs, rhs) else {
        return false;
    };
    match op.as_str() {
        "$eq" => is_equal(&lhs, &rhs),
        "$ne" => !is_equal(&lhs, &rhs),
        "$gt" => comparable(&lhs, &rhs, |ord| ord == Ordering::Greater),
        "$gte" => comparable(&lhs, &rhs, |ord| ord != Ordering::Less),
        "$lt" => comparable(&lhs, &rhs, |ord| ord == Ordering::Less),
        "$lte" => comparable(&lhs, &rhs, |ord| ord != Ordering::Greater),
        _ => false,
    }
}

fn resolve_operand(item: &Document, operand: &Bson) -> Option<Bson> {
    match operand {
        Bson::String(s) if s.starts_with('$') => {
            let path = parse_path(&s[1..]).ok()?;
            get_path_all(item, &path).first().map(|v| (*v).clone())
        }
        other => Some(other.clone()),
    }
}
