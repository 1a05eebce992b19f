use std::fmt;

/// Parse or validation error for selector documents.
#[derive(Debug, Clone, PartialEq)]
pub struct SelectorError(pub String);

impl fmt::Display for SelectorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid selector: {}", self.0)
    }
}

impl std::error::Error for SelectorError {}

/// Parse or apply error for modifier documents.
#[derive(Debug, Clone, PartialEq)]
pub struct ModifierError(pub String);

impl fmt::Display for ModifierError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid modifier: {}", self.0)
    }
}

impl std::error::Error for ModifierError {}

/// Error for malformed field paths (leading/trailing dot, empty segment, `.[`).
#[derive(Debug, Clone, PartialEq)]
pub struct PathError(pub String);

impl fmt::Display for PathError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid field path: {}", self.0)
    }
}

impl std::error::Error for PathError {}
