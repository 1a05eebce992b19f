use bson::{Bson, Document};

/// Sentinel key for null-or-missing values. Starts with a NUL byte so it can
/// never collide with a serialized user string.
pub const NULL_KEY: &str = "\u{0}null";

/// Serialize a BSON value into its canonical string form, used as an index
/// key and as the collection's internal id key.
///
/// - Strings pass through unchanged.
/// - Numbers serialize to their canonical decimal form: `Int32(1)`,
///   `Int64(1)` and `Double(1.0)` all map to `"1"`.
/// - Booleans map to `"true"` / `"false"`.
/// - Datetimes map to their RFC 3339 form.
/// - Null (and the absent value, by convention of the caller) maps to
///   [`NULL_KEY`].
/// - Documents and arrays map to canonical JSON-shaped text.
pub fn serialize_value(value: &Bson) -> String {
    match value {
        Bson::String(s) => s.clone(),
        Bson::Int32(n) => n.to_string(),
        Bson::Int64(n) => n.to_string(),
        Bson::Double(d) => serialize_double(*d),
        Bson::Boolean(b) => b.to_string(),
        Bson::Null => NULL_KEY.to_string(),
        Bson::DateTime(dt) => dt
            .try_to_rfc3339_string()
            .unwrap_or_else(|_| dt.timestamp_millis().to_string()),
        other => {
            let mut out = String::new();
            write_canonical(other, &mut out);
            out
        }
    }
}

/// Doubles with no fractional part serialize like integers, so cross-width
/// numeric values share one index bucket.
fn serialize_double(d: f64) -> String {
    if d.is_finite() && d.fract() == 0.0 && d.abs() < 9.007_199_254_740_992e15 {
        format!("{}", d as i64)
    } else {
        d.to_string()
    }
}

fn write_canonical(value: &Bson, out: &mut String) {
    match value {
        Bson::String(s) => {
            out.push('"');
            for ch in s.chars() {
                match ch {
                    '"' => out.push_str("\\\""),
                    '\\' => out.push_str("\\\\"),
                    c => out.push(c),
                }
            }
            out.push('"');
        }
        Bson::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        Bson::Document(doc) => {
            out.push('{');
            for (i, (key, val)) in doc.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push('"');
                out.push_str(key);
                out.push_str("\":");
                write_canonical(val, out);
            }
            out.push('}');
        }
        Bson::Int32(_)
        | Bson::Int64(_)
        | Bson::Double(_)
        | Bson::Boolean(_)
        | Bson::Null
        | Bson::DateTime(_) => out.push_str(&serialize_value(value)),
        // Exotic scalars (binary, object ids, timestamps) key off their
        // debug form.
        other => {
            use std::fmt::Write;
            let _ = write!(out, "{other:?}");
        }
    }
}

/// Structural equality with cross-width numeric comparison.
///
/// `Int32(2)`, `Int64(2)` and `Double(2.0)` compare equal; documents compare
/// entry-by-entry in order-insensitive fashion; arrays compare element-wise.
pub fn is_equal(a: &Bson, b: &Bson) -> bool {
    match (a, b) {
        (Bson::Array(xs), Bson::Array(ys)) => {
            xs.len() == ys.len() && xs.iter().zip(ys).all(|(x, y)| is_equal(x, y))
        }
        (Bson::Document(x), Bson::Document(y)) => documents_equal(x, y),
        _ => match (numeric(a), numeric(b)) {
            (Some(x), Some(y)) => x == y,
            _ => a == b,
        },
    }
}

pub fn documents_equal(a: &Document, b: &Document) -> bool {
    a.len() == b.len()
        && a.iter()
            .all(|(key, val)| b.get(key).is_some_and(|other| is_equal(val, other)))
}

/// Widen any numeric BSON value to f64 for comparison purposes.
pub(crate) fn numeric(value: &Bson) -> Option<f64> {
    match value {
        Bson::Int32(n) => Some(f64::from(*n)),
        Bson::Int64(n) => Some(*n as f64),
        Bson::Double(d) => Some(*d),
        _ => None,
    }
}
