use bson::{Bson, Document};

use crate::error::SelectorError;

/// A parsed `fields` projection.
///
/// Either all-exclude (`{secret: 0}`) or any-include (`{name: 1}`). Mixed
/// specs keep only the include entries. `id` rides along unless explicitly
/// excluded with `id: 0`.
#[derive(Debug, Clone, PartialEq)]
pub struct Projection {
    mode: Mode,
    fields: Vec<String>,
    include_id: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Include,
    Exclude,
}

/// Parse a `{ field: 0|1 }` projection document.
pub fn parse_projection(doc: &Document) -> Result<Projection, SelectorError> {
    let mut includes = Vec::new();
    let mut excludes = Vec::new();
    let mut include_id = true;

    for (field, flag) in doc {
        let included = match flag {
            Bson::Int32(1) | Bson::Int64(1) => true,
            Bson::Int32(0) | Bson::Int64(0) => false,
            Bson::Boolean(b) => *b,
            Bson::Double(d) if *d == 1.0 => true,
            Bson::Double(d) if *d == 0.0 => false,
            other => {
                return Err(SelectorError(format!(
                    "projection for '{field}' must be 0 or 1, got {other}"
                )));
            }
        };
        if field == "id" {
            include_id = included;
            continue;
        }
        if included {
            includes.push(field.clone());
        } else {
            excludes.push(field.clone());
        }
    }

    // Mixed mode keeps only the include entries.
    let (mode, fields) = if includes.is_empty() && !excludes.is_empty() {
        (Mode::Exclude, excludes)
    } else {
        (Mode::Include, includes)
    };

    Ok(Projection {
        mode,
        fields,
        include_id,
    })
}

/// Apply a projection, producing a new document.
pub fn project(item: &Document, projection: &Projection) -> Document {
    let mut out = Document::new();
    match projection.mode {
        Mode::Include => {
            if projection.include_id {
                if let Some(id) = item.get("id") {
                    out.insert("id", id.clone());
                }
            }
            for field in &projection.fields {
                if let Some(value) = item.get(field.as_str()) {
                    out.insert(field.clone(), value.clone());
                }
            }
        }
        Mode::Exclude => {
            for (key, value) in item {
                if key == "id" {
                    if projection.include_id {
                        out.insert("id", value.clone());
                    }
                    continue;
                }
                if !projection.fields.iter().any(|f| f == key) {
                    out.insert(key.clone(), value.clone());
                }
            }
        }
    }
    out
}
