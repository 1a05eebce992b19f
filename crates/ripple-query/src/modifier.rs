use bson::{Bson, Document};

use crate::error::ModifierError;
use crate::matcher::matches_value;
use crate::parse::parse_selector;
use crate::path::{Path, get_path, parse_path, set_path, unset_path};
use crate::selector::FieldPredicate;
use crate::sort::compare_values;
use crate::value::is_equal;

/// A single field-level modifier operator.
#[derive(Debug, Clone, PartialEq)]
pub enum ModifierOp {
    /// Set a field to a value. Creates the field if it doesn't exist.
    Set(Bson),
    /// Like `Set`, but only applied when constructing an upsert item.
    SetOnInsert(Bson),
    /// Remove a field from the item.
    Unset,
    /// Add a numeric amount to the field (negative for decrement).
    Inc(Bson),
    /// Multiply the field by a numeric factor.
    Mul(Bson),
    /// Keep the smaller of the current value and the operand.
    Min(Bson),
    /// Keep the larger of the current value and the operand.
    Max(Bson),
    /// Move the value to a new field path.
    Rename(String),
    /// Set the field to the current datetime (or a timestamp).
    CurrentDate(DateRepr),
    /// Append values to an array field. Creates the array if missing.
    Push(Vec<Bson>),
    /// Append values not already present, by structural equality.
    AddToSet(Vec<Bson>),
    /// Remove array elements matching a value or condition.
    Pull(PullCriteria),
    /// Remove array elements equal to any of the listed values.
    PullAll(Vec<Bson>),
    /// Remove the first or last element of an array field.
    Pop(PopEnd),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DateRepr {
    Date,
    Timestamp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PopEnd {
    First,
    Last,
}

/// `$pull` removes by direct equality or by a field-predicate condition.
#[derive(Debug, Clone, PartialEq)]
pub enum PullCriteria {
    Value(Bson),
    Condition(FieldPredicate),
}

/// A single field + operator pair within a modifier.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldModifier {
    pub field: String,
    pub op: ModifierOp,
}

/// A complete modifier: a list of (field, operator) pairs applied in order.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Modifier {
    pub ops: Vec<FieldModifier>,
}

impl Modifier {
    /// Apply to an existing item, producing a new one. The input is never
    /// mutated. `$setOnInsert` entries are skipped.
    pub fn apply(&self, item: &Document) -> Result<Document, ModifierError> {
        let mut out = item.clone();
        for fm in &self.ops {
            if matches!(fm.op, ModifierOp::SetOnInsert(_)) {
                continue;
            }
            apply_op(&mut out, fm)?;
        }
        Ok(out)
    }

    /// Construct an upsert item by applying every operator, `$setOnInsert`
    /// included, to the given seed (usually empty).
    pub fn apply_upsert(&self, seed: &Document) -> Result<Document, ModifierError> {
        let mut out = seed.clone();
        for fm in &self.ops {
            match &fm.op {
                ModifierOp::SetOnInsert(value) => {
                    let path = field_path(&fm.field)?;
                    set_path(&mut out, &path, value.clone())
                        .map_err(|e| ModifierError(e.to_string()))?;
                }
                _ => apply_op(&mut out, fm)?,
            }
        }
        Ok(out)
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }
}

fn field_path(field: &str) -> Result<Path, ModifierError> {
    parse_path(field).map_err(|e| ModifierError(e.to_string()))
}

fn apply_op(doc: &mut Document, fm: &FieldModifier) -> Result<(), ModifierError> {
    let path = field_path(&fm.field)?;
    match &fm.op {
        ModifierOp::Set(value) => {
            set_path(doc, &path, value.clone()).map_err(|e| ModifierError(e.to_string()))
        }
        ModifierOp::SetOnInsert(_) => Ok(()),
        ModifierOp::Unset => {
            unset_path(doc, &path);
            Ok(())
        }
        ModifierOp::Inc(amount) => {
            let current = get_path(doc, &path).cloned();
            let next = match current {
                None => amount.clone(),
                Some(value) => add_numeric(&fm.field, &value, amount)?,
            };
            set_path(doc, &path, next).map_err(|e| ModifierError(e.to_string()))
        }
        ModifierOp::Mul(factor) => {
            let current = get_path(doc, &path).cloned();
            let next = match current {
                // Mongo semantics: $mul on a missing field yields zero of
                // the operand's type.
                None => zero_like(factor),
                Some(value) => mul_numeric(&fm.field, &value, factor)?,
            };
            set_path(doc, &path, next).map_err(|e| ModifierError(e.to_string()))
        }
        ModifierOp::Min(operand) => {
            let replace = match get_path(doc, &path) {
                None => true,
                Some(current) => {
                    compare_values(operand, current) == std::cmp::Ordering::Less
                }
            };
            if replace {
                set_path(doc, &path, operand.clone()).map_err(|e| ModifierError(e.to_string()))?;
            }
            Ok(())
        }
        ModifierOp::Max(operand) => {
            let replace = match get_path(doc, &path) {
                None => true,
                Some(current) => {
                    compare_values(operand, current) == std::cmp::Ordering::Greater
                }
            };
            if replace {
                set_path(doc, &path, operand.clone()).map_err(|e| ModifierError(e.to_string()))?;
            }
            Ok(())
        }
        ModifierOp::Rename(new_name) => {
            if let Some(value) = unset_path(doc, &path) {
                let target = field_path(new_name)?;
                set_path(doc, &target, value).map_err(|e| ModifierError(e.to_string()))?;
            }
            Ok(())
        }
        ModifierOp::CurrentDate(repr) => {
            let now = bson::DateTime::now();
            let value = match repr {
                DateRepr::Date => Bson::DateTime(now),
                DateRepr::Timestamp => Bson::Timestamp(bson::Timestamp {
                    time: (now.timestamp_millis() / 1000) as u32,
                    increment: 0,
                }),
            };
            set_path(doc, &path, value).map_err(|e| ModifierError(e.to_string()))
        }
        ModifierOp::Push(values) => with_array(doc, &path, &fm.field, true, |items| {
            items.extend(values.iter().cloned());
            Ok(())
        }),
        ModifierOp::AddToSet(values) => with_array(doc, &path, &fm.field, true, |items| {
            for value in values {
                if !items.iter().any(|existing| is_equal(existing, value)) {
                    items.push(value.clone());
                }
            }
            Ok(())
        }),
        ModifierOp::Pull(criteria) => with_array(doc, &path, &fm.field, false, |items| {
            items.retain(|element| !pull_matches(element, criteria));
            Ok(())
        }),
        ModifierOp::PullAll(values) => with_array(doc, &path, &fm.field, false, |items| {
            items.retain(|element| !values.iter().any(|v| is_equal(element, v)));
            Ok(())
        }),
        ModifierOp::Pop(end) => with_array(doc, &path, &fm.field, false, |items| {
            match end {
                PopEnd::First => {
                    if !items.is_empty() {
                        items.remove(0);
                    }
                }
                PopEnd::Last => {
                    items.pop();
                }
            }
            Ok(())
        }),
    }
}

fn pull_matches(element: &Bson, criteria: &PullCriteria) -> bool {
    match criteria {
        PullCriteria::Value(value) => is_equal(element, value),
        PullCriteria::Condition(predicate) => matches_value(element, predicate),
    }
}

/// Run a closure over the array at `path`. `create` controls whether a
/// missing field becomes an empty array first; a non-array value is a
/// type conflict.
fn with_array(
    doc: &mut Document,
    path: &Path,
    field: &str,
    create: bool,
    f: impl FnOnce(&mut Vec<Bson>) -> Result<(), ModifierError>,
) -> Result<(), ModifierError> {
    let current = get_path(doc, path).cloned();
    let mut items = match current {
        Some(Bson::Array(items)) => items,
        Some(_) => {
            return Err(ModifierError(format!(
                "field '{field}' is not an array"
            )));
        }
        None if create => Vec::new(),
        None => return Ok(()),
    };
    f(&mut items)?;
    set_path(doc, path, Bson::Array(items)).map_err(|e| ModifierError(e.to_string()))
}

fn zero_like(factor: &Bson) -> Bson {
    match factor {
        Bson::Double(_) => Bson::Double(0.0),
        Bson::Int64(_) => Bson::Int64(0),
        _ => Bson::Int32(0),
    }
}

fn add_numeric(field: &str, a: &Bson, b: &Bson) -> Result<Bson, ModifierError> {
    numeric_binop(field, a, b, |x, y| x + y, |x, y| x.checked_add(y))
}

fn mul_numeric(field: &str, a: &Bson, b: &Bson) -> Result<Bson, ModifierError> {
    numeric_binop(field, a, b, |x, y| x * y, |x, y| x.checked_mul(y))
}

/// Integer-preserving arithmetic: two integral operands stay integral
/// (widening to `Int64` when either side is), anything else goes through
/// f64.
fn numeric_binop(
    field: &str,
    a: &Bson,
    b: &Bson,
    float_op: fn(f64, f64) -> f64,
    int_op: fn(i64, i64) -> Option<i64>,
) -> Result<Bson, ModifierError> {
    let int_pair = match (a, b) {
        (Bson::Int32(x), Bson::Int32(y)) => Some((i64::from(*x), i64::from(*y), false)),
        (Bson::Int32(x), Bson::Int64(y)) => Some((i64::from(*x), *y, true)),
        (Bson::Int64(x), Bson::Int32(y)) => Some((*x, i64::from(*y), true)),
        (Bson::Int64(x), Bson::Int64(y)) => Some((*x, *y, true)),
        _ => None,
    };
    if let Some((x, y, wide)) = int_pair {
        if let Some(result) = int_op(x, y) {
            return Ok(if wide || i32::try_from(result).is_err() {
                Bson::Int64(result)
            } else {
                Bson::Int32(result as i32)
            });
        }
    }
    let (Some(x), Some(y)) = (crate::value::numeric(a), crate::value::numeric(b)) else {
        return Err(ModifierError(format!(
            "field '{field}' is not numeric"
        )));
    };
    Ok(Bson::Double(float_op(x, y)))
}

/// Parse a BSON update document into a validated [`Modifier`].
///
/// Recognizes the operator keys `$set`, `$setOnInsert`, `$unset`, `$inc`,
/// `$mul`, `$min`, `$max`, `$rename`, `$currentDate`, `$push`, `$pull`,
/// `$pullAll`, `$pop`, `$addToSet`, each mapping field paths to operands.
///
/// # Errors
///
/// Returns an error for unknown operator keys, bare top-level fields, and
/// invalid operand types (e.g. non-numeric `$inc`, non-string `$rename`).
pub fn parse_modifier(doc: &Document) -> Result<Modifier, ModifierError> {
    let mut ops = Vec::new();

    for (key, value) in doc {
        match key.as_str() {
            "$set" => parse_value_fields(key, value, ModifierOp::Set, &mut ops)?,
            "$setOnInsert" => parse_value_fields(key, value, ModifierOp::SetOnInsert, &mut ops)?,
            "$min" => parse_value_fields(key, value, ModifierOp::Min, &mut ops)?,
            "$max" => parse_value_fields(key, value, ModifierOp::Max, &mut ops)?,
            "$unset" => {
                for (field, _) in operator_doc(key, value)? {
                    ops.push(FieldModifier {
                        field: field.clone(),
                        op: ModifierOp::Unset,
                    });
                }
            }
            "$inc" => parse_numeric_fields(key, value, ModifierOp::Inc, &mut ops)?,
            "$mul" => parse_numeric_fields(key, value, ModifierOp::Mul, &mut ops)?,
            "$rename" => {
                for (field, operand) in operator_doc(key, value)? {
                    match operand {
                        Bson::String(new_name) if !new_name.is_empty() => {
                            ops.push(FieldModifier {
                                field: field.clone(),
                                op: ModifierOp::Rename(new_name.clone()),
                            });
                        }
                        _ => {
                            return Err(ModifierError(format!(
                                "$rename value for '{field}' must be a non-empty string"
                            )));
                        }
                    }
                }
            }
            "$currentDate" => {
                for (field, operand) in operator_doc(key, value)? {
                    let repr = match operand {
                        Bson::Boolean(true) => DateRepr::Date,
                        Bson::Document(spec) => match spec.get_str("$type") {
                            Ok("date") => DateRepr::Date,
                            Ok("timestamp") => DateRepr::Timestamp,
                            _ => {
                                return Err(ModifierError(format!(
                                    "$currentDate for '{field}' must be true or {{$type}}"
                                )));
                            }
                        },
                        _ => {
                            return Err(ModifierError(format!(
                                "$currentDate for '{field}' must be true or {{$type}}"
                            )));
                        }
                    };
                    ops.push(FieldModifier {
                        field: field.clone(),
                        op: ModifierOp::CurrentDate(repr),
                    });
                }
            }
            "$push" => parse_push_fields(key, value, ModifierOp::Push, &mut ops)?,
            "$addToSet" => parse_push_fields(key, value, ModifierOp::AddToSet, &mut ops)?,
            "$pull" => {
                for (field, operand) in operator_doc(key, value)? {
                    let criteria = parse_pull_criteria(field, operand)?;
                    ops.push(FieldModifier {
                        field: field.clone(),
                        op: ModifierOp::Pull(criteria),
                    });
                }
            }
            "$pullAll" => {
                for (field, operand) in operator_doc(key, value)? {
                    match operand {
                        Bson::Array(values) => ops.push(FieldModifier {
                            field: field.clone(),
                            op: ModifierOp::PullAll(values.clone()),
                        }),
                        _ => {
                            return Err(ModifierError(format!(
                                "$pullAll value for '{field}' must be an array"
                            )));
                        }
                    }
                }
            }
            "$pop" => {
                for (field, operand) in operator_doc(key, value)? {
                    let end = match operand {
                        Bson::Int32(1) | Bson::Int64(1) => PopEnd::Last,
                        Bson::Int32(-1) | Bson::Int64(-1) => PopEnd::First,
                        _ => {
                            return Err(ModifierError(format!(
                                "$pop value for '{field}' must be 1 or -1"
                            )));
                        }
                    };
                    ops.push(FieldModifier {
                        field: field.clone(),
                        op: ModifierOp::Pop(end),
                    });
                }
            }
            k => {
                return Err(ModifierError(format!("unknown modifier operator: {k}")));
            }
        }
    }

    if ops.is_empty() {
        return Err(ModifierError("empty modifier document".into()));
    }

    Ok(Modifier { ops })
}

fn operator_doc<'a>(
    key: &str,
    value: &'a Bson,
) -> Result<&'a Document, ModifierError> {
    match value {
        Bson::Document(doc) if !doc.is_empty() => Ok(doc),
        Bson::Document(_) => Err(ModifierError(format!("{key} document must not be empty"))),
        _ => Err(ModifierError(format!("{key} value must be a document"))),
    }
}

fn parse_value_fields(
    key: &str,
    value: &Bson,
    make_op: fn(Bson) -> ModifierOp,
    ops: &mut Vec<FieldModifier>,
) -> Result<(), ModifierError> {
    for (field, operand) in operator_doc(key, value)? {
        ops.push(FieldModifier {
            field: field.clone(),
            op: make_op(operand.clone()),
        });
    }
    Ok(())
}

fn parse_numeric_fields(
    key: &str,
    value: &Bson,
    make_op: fn(Bson) -> ModifierOp,
    ops: &mut Vec<FieldModifier>,
) -> Result<(), ModifierError> {
    for (field, operand) in operator_doc(key, value)? {
        match operand {
            Bson::Int32(_) | Bson::Int64(_) | Bson::Double(_) => ops.push(FieldModifier {
                field: field.clone(),
                op: make_op(operand.clone()),
            }),
            _ => {
                return Err(ModifierError(format!(
                    "{key} value for '{field}' must be numeric"
                )));
            }
        }
    }
    Ok(())
}

/// `$push`/`$addToSet` operands: a plain value, or `{ $each: [...] }`.
fn parse_push_fields(
    key: &str,
    value: &Bson,
    make_op: fn(Vec<Bson>) -> ModifierOp,
    ops: &mut Vec<FieldModifier>,
) -> Result<(), ModifierError> {
    for (field, operand) in operator_doc(key, value)? {
        let values = match operand {
            Bson::Document(spec) if spec.contains_key("$each") => match spec.get("$each") {
                Some(Bson::Array(values)) => values.clone(),
                _ => {
                    return Err(ModifierError(format!(
                        "$each for '{field}' must be an array"
                    )));
                }
            },
            other => vec![other.clone()],
        };
        ops.push(FieldModifier {
            field: field.clone(),
            op: make_op(values),
        });
    }
    Ok(())
}

fn parse_pull_criteria(field: &str, operand: &Bson) -> Result<PullCriteria, ModifierError> {
    if let Bson::Document(spec) = operand {
        if spec.iter().next().is_some_and(|(k, _)| k.starts_with('$')) {
            // Operator condition: reuse the selector parser on a synthetic
            // single-field document.
            let mut wrapper = Document::new();
            wrapper.insert(field.to_string(), Bson::Document(spec.clone()));
            let selector = parse_selector(&wrapper).map_err(|e| ModifierError(e.to_string()))?;
            let predicate = selector
                .fields
                .into_iter()
                .next()
                .map(|(_, predicate)| predicate)
                .ok_or_else(|| ModifierError(format!("invalid $pull condition for '{field}'")))?;
            return Ok(PullCriteria::Condition(predicate));
        }
    }
    Ok(PullCriteria::Value(operand.clone()))
}
