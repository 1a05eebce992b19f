use bson::{Bson, Document};

use crate::error::PathError;

/// One segment of a parsed field path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Segment {
    /// A document key.
    Field(String),
    /// An array index, from either `a.0.b` or `a[0].b` syntax.
    Index(usize),
}

/// A field path parsed into segments.
///
/// Paths are parsed once and walked many times; malformed input is rejected
/// at parse time instead of silently resolving to nothing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Path {
    segments: Vec<Segment>,
}

impl Path {
    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }
}

/// Parse a dot/bracket path like `a.b`, `a[0].b`, or `a.0.b`.
///
/// Rejects a leading or trailing dot, an empty segment, a dot directly
/// before a bracket (`a.[0]`), and unterminated or non-numeric brackets.
pub fn parse_path(path: &str) -> Result<Path, PathError> {
    if path.is_empty() {
        return Err(PathError("empty path".into()));
    }

    let mut segments = Vec::new();
    let mut current = String::new();
    // Tracks whether a segment boundary was just crossed, to catch `a..b`
    // and `a.[0]`.
    let mut expect_segment = true;
    let mut chars = path.chars().peekable();

    while let Some(ch) = chars.next() {
        match ch {
            '.' => {
                if expect_segment && current.is_empty() {
                    return Err(PathError(format!("empty segment in '{path}'")));
                }
                if !current.is_empty() {
                    segments.push(Segment::Field(std::mem::take(&mut current)));
                }
                if chars.peek() == Some(&'[') {
                    return Err(PathError(format!("'.[' in '{path}'")));
                }
                expect_segment = true;
            }
            '[' => {
                if !current.is_empty() {
                    segments.push(Segment::Field(std::mem::take(&mut current)));
                } else if segments.is_empty() {
                    return Err(PathError(format!("leading bracket in '{path}'")));
                }
                let mut digits = String::new();
                loop {
                    match chars.next() {
                        Some(']') => break,
                        Some(d) if d.is_ascii_digit() => digits.push(d),
                        Some(other) => {
                            return Err(PathError(format!(
                                "non-numeric bracket segment '{other}' in '{path}'"
                            )));
                        }
                        None => {
                            return Err(PathError(format!("unterminated bracket in '{path}'")));
                        }
                    }
                }
                let index = digits
                    .parse::<usize>()
                    .map_err(|_| PathError(format!("empty bracket in '{path}'")))?;
                segments.push(Segment::Index(index));
                expect_segment = false;
            }
            c => {
                current.push(c);
                expect_segment = false;
            }
        }
    }

    if expect_segment {
        return Err(PathError(format!("trailing dot in '{path}'")));
    }
    if !current.is_empty() {
        // All-digit dot segments address array elements.
        match current.parse::<usize>() {
            Ok(index) => segments.push(Segment::Index(index)),
            Err(_) => segments.push(Segment::Field(current)),
        }
    }

    // Normalize interior all-digit field segments into indexes.
    let segments = segments
        .into_iter()
        .map(|seg| match seg {
            Segment::Field(f) => match f.parse::<usize>() {
                Ok(index) => Segment::Index(index),
                Err(_) => Segment::Field(f),
            },
            other => other,
        })
        .collect();

    Ok(Path { segments })
}

/// Resolve a parsed path against a document. Returns `None` when any segment
/// is absent or addresses the wrong shape.
pub fn get_path<'a>(doc: &'a Document, path: &Path) -> Option<&'a Bson> {
    let mut current: Option<&Bson> = None;
    for (i, segment) in path.segments.iter().enumerate() {
        current = match (i, segment, current) {
            (0, Segment::Field(f), _) => doc.get(f.as_str()),
            (0, Segment::Index(_), _) => None,
            (_, Segment::Field(f), Some(Bson::Document(d))) => d.get(f.as_str()),
            (_, Segment::Index(n), Some(Bson::Array(items))) => items.get(*n),
            _ => None,
        };
        current?;
    }
    current
}

/// Resolve a path, branching into array elements when a field segment meets
/// an array of documents. Returns every candidate value, in document order.
/// An empty result means the path resolved to nothing anywhere.
pub fn get_path_all<'a>(doc: &'a Document, path: &Path) -> Vec<&'a Bson> {
    fn descend<'a>(value: &'a Bson, segments: &[Segment], out: &mut Vec<&'a Bson>) {
        let Some(segment) = segments.first() else {
            out.push(value);
            return;
        };
        match (segment, value) {
            (Segment::Field(f), Bson::Document(d)) => {
                if let Some(next) = d.get(f.as_str()) {
                    descend(next, &segments[1..], out);
                }
            }
            (Segment::Field(_), Bson::Array(items)) => {
                for item in items {
                    descend(item, segments, out);
                }
            }
            (Segment::Index(n), Bson::Array(items)) => {
                if let Some(next) = items.get(*n) {
                    descend(next, &segments[1..], out);
                }
            }
            _ => {}
        }
    }

    let mut out = Vec::new();
    let Some(first) = path.segments.first() else {
        return out;
    };
    match first {
        Segment::Field(f) => {
            if let Some(value) = doc.get(f.as_str()) {
                descend(value, &path.segments[1..], &mut out);
            }
        }
        Segment::Index(_) => {}
    }
    out
}

/// Set a value at a parsed path, creating intermediate documents (and
/// extending arrays with nulls) as needed.
pub fn set_path(doc: &mut Document, path: &Path, value: Bson) -> Result<(), PathError> {
    fn place(container: &mut Bson, segments: &[Segment], value: Bson) -> Result<(), PathError> {
        let segment = &segments[0];
        if segments.len() == 1 {
            match (segment, container) {
                (Segment::Field(f), Bson::Document(d)) => {
                    d.insert(f.clone(), value);
                    Ok(())
                }
                (Segment::Index(n), Bson::Array(items)) => {
                    while items.len() <= *n {
                        items.push(Bson::Null);
                    }
                    items[*n] = value;
                    Ok(())
                }
                _ => Err(PathError("segment addresses the wrong shape".into())),
            }
        } else {
            let next_is_index = matches!(segments[1], Segment::Index(_));
            let slot: &mut Bson = match (segment, container) {
                (Segment::Field(f), Bson::Document(d)) => {
                    if !d.contains_key(f.as_str()) {
                        let empty = if next_is_index {
                            Bson::Array(Vec::new())
                        } else {
                            Bson::Document(Document::new())
                        };
                        d.insert(f.clone(), empty);
                    }
                    match d.get_mut(f.as_str()) {
                        Some(slot) => slot,
                        None => return Err(PathError("segment addresses the wrong shape".into())),
                    }
                }
                (Segment::Index(n), Bson::Array(items)) => {
                    while items.len() <= *n {
                        items.push(Bson::Null);
                    }
                    if matches!(items[*n], Bson::Null) {
                        items[*n] = if next_is_index {
                            Bson::Array(Vec::new())
                        } else {
                            Bson::Document(Document::new())
                        };
                    }
                    &mut items[*n]
                }
                _ => return Err(PathError("segment addresses the wrong shape".into())),
            };
            place(slot, &segments[1..], value)
        }
    }

    if path.segments.is_empty() {
        return Err(PathError("empty path".into()));
    }
    let mut root = Bson::Document(std::mem::take(doc));
    let result = place(&mut root, &path.segments, value);
    if let Bson::Document(d) = root {
        *doc = d;
    }
    result
}

/// Remove the value at a parsed path. Returns the removed value, if any.
pub fn unset_path(doc: &mut Document, path: &Path) -> Option<Bson> {
    let (leaf, parents) = path.segments.split_last()?;

    if parents.is_empty() {
        return match leaf {
            Segment::Field(f) => doc.remove(f.as_str()),
            Segment::Index(_) => None,
        };
    }

    fn descend_mut<'a>(value: &'a mut Bson, segments: &[Segment]) -> Option<&'a mut Bson> {
        let Some(segment) = segments.first() else {
            return Some(value);
        };
        let next = match (segment, value) {
            (Segment::Field(f), Bson::Document(d)) => d.get_mut(f.as_str())?,
            (Segment::Index(n), Bson::Array(items)) => items.get_mut(*n)?,
            _ => return None,
        };
        descend_mut(next, &segments[1..])
    }

    let (first, rest) = parents.split_first()?;
    let root = match first {
        Segment::Field(f) => doc.get_mut(f.as_str())?,
        Segment::Index(_) => return None,
    };
    let parent = descend_mut(root, rest)?;
    match (leaf, parent) {
        (Segment::Field(f), Bson::Document(d)) => d.remove(f.as_str()),
        // Unsetting an array element nulls it out rather than shifting.
        (Segment::Index(n), Bson::Array(items)) => {
            let slot = items.get_mut(*n)?;
            Some(std::mem::replace(slot, Bson::Null))
        }
        _ => None,
    }
}
