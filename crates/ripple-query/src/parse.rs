use bson::{Bson, Document};
use regex::Regex;

use crate::error::SelectorError;
use crate::selector::{ElemMatch, FieldOp, FieldPredicate, Selector};

/// Parse a BSON selector document into a [`Selector`] tree.
///
/// Follows MongoDB query semantics:
/// - The top-level document is an implicit AND of all entries
/// - `{ "field": value }` is implicit `$eq` (with array-contains semantics)
/// - `{ "field": { "$gt": v } }` uses operator sub-documents
/// - `{ "$or": [...] }` / `{ "$and": [...] }` for logical branches, freely
///   mixed with flat constraints
/// - The empty document matches everything
pub fn parse_selector(doc: &Document) -> Result<Selector, SelectorError> {
    let mut selector = Selector::default();

    for (key, value) in doc {
        match key.as_str() {
            "$and" => selector.and = parse_logical_array(key, value)?,
            "$or" => selector.or = parse_logical_array(key, value)?,
            k if k.starts_with('$') => {
                return Err(SelectorError(format!("unknown top-level operator: {k}")));
            }
            _ => selector
                .fields
                .push((key.clone(), parse_field_predicate(key, value)?)),
        }
    }

    Ok(selector)
}

fn parse_logical_array(key: &str, value: &Bson) -> Result<Vec<Selector>, SelectorError> {
    let Bson::Array(items) = value else {
        return Err(SelectorError(format!("{key} value must be an array")));
    };
    let mut children = Vec::with_capacity(items.len());
    for item in items {
        let Bson::Document(sub) = item else {
            return Err(SelectorError(format!("{key} elements must be documents")));
        };
        children.push(parse_selector(sub)?);
    }
    if children.is_empty() {
        return Err(SelectorError(format!("{key} array must not be empty")));
    }
    Ok(children)
}

fn parse_field_predicate(field: &str, value: &Bson) -> Result<FieldPredicate, SelectorError> {
    if let Bson::Document(sub) = value {
        if sub.iter().next().is_some_and(|(k, _)| k.starts_with('$')) {
            return Ok(FieldPredicate::Ops(parse_operator_doc(field, sub)?));
        }
    }
    if let Bson::RegularExpression(_) = value {
        // Compiled patterns enter through the typed API (FieldOp::Regex);
        // BSON documents spell them as { "$regex": "...", "$options": "..." }.
        return Err(SelectorError(format!(
            "regex value for '{field}' must use $regex"
        )));
    }
    Ok(FieldPredicate::Value(value.clone()))
}

/// Parse an operator sub-document like `{ "$gt": 21, "$lte": 100 }`.
/// All entries conjoin.
fn parse_operator_doc(field: &str, doc: &Document) -> Result<Vec<FieldOp>, SelectorError> {
    // $regex consumes its $options sibling, so collect those first.
    let mut pattern: Option<(String, String)> = None;
    let mut ops = Vec::new();

    for (key, value) in doc {
        match key.as_str() {
            "$regex" => match value {
                Bson::String(s) => {
                    let entry = pattern.get_or_insert_with(Default::default);
                    entry.0 = s.clone();
                }
                _ => return Err(SelectorError(format!("$regex for '{field}' must be a string"))),
            },
            "$options" => match value {
                Bson::String(s) => {
                    let entry = pattern.get_or_insert_with(Default::default);
                    entry.1 = s.clone();
                }
                _ => {
                    return Err(SelectorError(format!(
                        "$options for '{field}' must be a string"
                    )));
                }
            },
            "$eq" => ops.push(FieldOp::Eq(value.clone())),
            "$ne" => ops.push(FieldOp::Ne(value.clone())),
            "$gt" => ops.push(FieldOp::Gt(value.clone())),
            "$gte" => ops.push(FieldOp::Gte(value.clone())),
            "$lt" => ops.push(FieldOp::Lt(value.clone())),
            "$lte" => ops.push(FieldOp::Lte(value.clone())),
            "$in" => ops.push(FieldOp::In(parse_value_array(field, "$in", value)?)),
            "$nin" => ops.push(FieldOp::Nin(parse_value_array(field, "$nin", value)?)),
            "$all" => ops.push(FieldOp::All(parse_value_array(field, "$all", value)?)),
            "$exists" => match value {
                Bson::Boolean(b) => ops.push(FieldOp::Exists(*b)),
                _ => {
                    return Err(SelectorError(format!(
                        "$exists for '{field}' must be a boolean"
                    )));
                }
            },
            "$not" => {
                let inner = parse_field_predicate(field, value)?;
                match &inner {
                    FieldPredicate::Ops(_) => {}
                    FieldPredicate::Value(Bson::Document(_)) | FieldPredicate::Value(Bson::Null) => {
                        return Err(SelectorError(format!(
                            "$not for '{field}' must be an operator document or regex"
                        )));
                    }
                    // A bare scalar under $not is treated as negated equality.
                    FieldPredicate::Value(_) => {}
                }
                ops.push(FieldOp::Not(Box::new(inner)));
            }
            "$mod" => {
                let parts = parse_value_array(field, "$mod", value)?;
                let (divisor, remainder) = match (parts.first(), parts.get(1)) {
                    (Some(d), Some(r)) if parts.len() == 2 => {
                        (as_i64(d), as_i64(r))
                    }
                    _ => (None, None),
                };
                match (divisor, remainder) {
                    (Some(divisor), Some(remainder)) if divisor != 0 => {
                        ops.push(FieldOp::Mod { divisor, remainder });
                    }
                    _ => {
                        return Err(SelectorError(format!(
                            "$mod for '{field}' must be [divisor, remainder] with nonzero divisor"
                        )));
                    }
                }
            }
            "$elemMatch" => {
                let Bson::Document(sub) = value else {
                    return Err(SelectorError(format!(
                        "$elemMatch for '{field}' must be a document"
                    )));
                };
                if sub.iter().next().is_some_and(|(k, _)| k.starts_with('$')) {
                    ops.push(FieldOp::ElemMatch(ElemMatch::Ops(parse_operator_doc(
                        field, sub,
                    )?)));
                } else {
                    ops.push(FieldOp::ElemMatch(ElemMatch::Selector(Box::new(
                        parse_selector(sub)?,
                    ))));
                }
            }
            "$size" => match as_i64(value) {
                Some(n) if n >= 0 => ops.push(FieldOp::Size(n as usize)),
                _ => {
                    return Err(SelectorError(format!(
                        "$size for '{field}' must be a non-negative integer"
                    )));
                }
            },
            "$bitsAllSet" => ops.push(FieldOp::BitsAllSet(parse_bitmask(field, key, value)?)),
            "$bitsAllClear" => ops.push(FieldOp::BitsAllClear(parse_bitmask(field, key, value)?)),
            "$bitsAnySet" => ops.push(FieldOp::BitsAnySet(parse_bitmask(field, key, value)?)),
            "$bitsAnyClear" => ops.push(FieldOp::BitsAnyClear(parse_bitmask(field, key, value)?)),
            "$text" => match value {
                Bson::String(s) => ops.push(FieldOp::Text(s.clone())),
                _ => return Err(SelectorError(format!("$text for '{field}' must be a string"))),
            },
            "$jsonSchema" => match value {
                Bson::Document(schema) => ops.push(FieldOp::JsonSchema(schema.clone())),
                _ => {
                    return Err(SelectorError(format!(
                        "$jsonSchema for '{field}' must be a document"
                    )));
                }
            },
            "$expr" => ops.push(FieldOp::Expr(value.clone())),
            "$where" => {
                return Err(SelectorError(
                    "$where cannot be parsed from BSON; use Selector::and_where".into(),
                ));
            }
            k => return Err(SelectorError(format!("unknown field operator: {k}"))),
        }
    }

    if let Some((pat, opts)) = pattern {
        if pat.is_empty() {
            return Err(SelectorError(format!("$options without $regex for '{field}'")));
        }
        ops.push(FieldOp::Regex(compile_regex(&pat, &opts)?));
    }

    Ok(ops)
}

fn parse_value_array(field: &str, op: &str, value: &Bson) -> Result<Vec<Bson>, SelectorError> {
    match value {
        Bson::Array(items) => Ok(items.clone()),
        _ => Err(SelectorError(format!("{op} for '{field}' must be an array"))),
    }
}

fn parse_bitmask(field: &str, op: &str, value: &Bson) -> Result<u64, SelectorError> {
    match as_i64(value) {
        Some(n) if n >= 0 => Ok(n as u64),
        _ => Err(SelectorError(format!(
            "{op} for '{field}' must be a non-negative integer"
        ))),
    }
}

fn as_i64(value: &Bson) -> Option<i64> {
    match value {
        Bson::Int32(n) => Some(i64::from(*n)),
        Bson::Int64(n) => Some(*n),
        Bson::Double(d) if d.fract() == 0.0 => Some(*d as i64),
        _ => None,
    }
}

/// Compile a `$regex` pattern with MongoDB-style option flags.
pub(crate) fn compile_regex(pattern: &str, options: &str) -> Result<Regex, SelectorError> {
    let full = if options.is_empty() {
        pattern.to_string()
    } else {
        let mut prefix = String::with_capacity(4 + options.len() + pattern.len());
        prefix.push_str("(?");
        for ch in options.chars() {
            match ch {
                'i' | 's' | 'm' | 'x' => prefix.push(ch),
                c => return Err(SelectorError(format!("unknown regex option: {c}"))),
            }
        }
        prefix.push(')');
        prefix.push_str(pattern);
        prefix
    };
    Regex::new(&full).map_err(|e| SelectorError(format!("invalid regex pattern: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use bson::doc;

    #[test]
    fn bare_field_implicit_eq() {
        let sel = parse_selector(&doc! { "status": "active" }).unwrap();
        assert_eq!(sel.fields.len(), 1);
        assert_eq!(
            sel.field("status"),
            Some(&FieldPredicate::Value(Bson::String("active".into())))
        );
    }

    #[test]
    fn empty_selector_is_match_all() {
        let sel = parse_selector(&doc! {}).unwrap();
        assert!(sel.is_empty());
    }

    #[test]
    fn operator_doc_conjunction() {
        let sel = parse_selector(&doc! { "score": { "$gt": 50, "$lte": 100 } }).unwrap();
        match sel.field("score") {
            Some(FieldPredicate::Ops(ops)) => {
                assert_eq!(ops.len(), 2);
                assert!(matches!(ops[0], FieldOp::Gt(_)));
                assert!(matches!(ops[1], FieldOp::Lte(_)));
            }
            other => panic!("expected ops, got {other:?}"),
        }
    }

    #[test]
    fn logical_branches_mix_with_flat() {
        let sel = parse_selector(&doc! {
            "active": true,
            "$or": [{ "a": 1 }, { "b": 2 }]
        })
        .unwrap();
        assert_eq!(sel.fields.len(), 1);
        assert_eq!(sel.or.len(), 2);
    }

    #[test]
    fn regex_with_options() {
        let sel = parse_selector(&doc! { "name": { "$regex": "^jo", "$options": "i" } }).unwrap();
        match sel.field("name") {
            Some(FieldPredicate::Ops(ops)) => match &ops[0] {
                FieldOp::Regex(re) => assert_eq!(re.as_str(), "(?i)^jo"),
                other => panic!("expected regex, got {other:?}"),
            },
            other => panic!("expected ops, got {other:?}"),
        }
    }

    #[test]
    fn elem_match_selector_and_ops() {
        let sel =
            parse_selector(&doc! { "items": { "$elemMatch": { "sku": "a" } } }).unwrap();
        assert!(matches!(
            sel.field("items"),
            Some(FieldPredicate::Ops(ops))
                if matches!(&ops[0], FieldOp::ElemMatch(ElemMatch::Selector(_)))
        ));

        let sel =
            parse_selector(&doc! { "scores": { "$elemMatch": { "$gt": 5 } } }).unwrap();
        assert!(matches!(
            sel.field("scores"),
            Some(FieldPredicate::Ops(ops))
                if matches!(&ops[0], FieldOp::ElemMatch(ElemMatch::Ops(_)))
        ));
    }

    #[test]
    fn mod_requires_two_integers() {
        assert!(parse_selector(&doc! { "n": { "$mod": [4, 0] } }).is_ok());
        assert!(parse_selector(&doc! { "n": { "$mod": [4] } }).is_err());
        assert!(parse_selector(&doc! { "n": { "$mod": [0, 1] } }).is_err());
    }

    #[test]
    fn rejects_unknown_operators() {
        assert!(parse_selector(&doc! { "$nor": [{ "a": 1 }] }).is_err());
        assert!(parse_selector(&doc! { "a": { "$between": 1 } }).is_err());
    }

    #[test]
    fn rejects_options_without_regex() {
        assert!(parse_selector(&doc! { "a": { "$options": "i" } }).is_err());
    }

    #[test]
    fn rejects_where_in_bson() {
        assert!(parse_selector(&doc! { "a": { "$where": "code" } }).is_err());
    }

    #[test]
    fn embedded_doc_as_eq_value() {
        let sel = parse_selector(&doc! { "address": { "city": "Austin" } }).unwrap();
        assert!(matches!(
            sel.field("address"),
            Some(FieldPredicate::Value(Bson::Document(_)))
        ));
    }

    #[test]
    fn empty_logical_array_errors() {
        assert!(parse_selector(&doc! { "$or": [] }).is_err());
    }
}
