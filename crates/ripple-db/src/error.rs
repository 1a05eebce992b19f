use std::fmt;

use ripple_index::NotFoundOnIndex;
use ripple_query::{ModifierError, PathError, SelectorError};

#[derive(Debug)]
pub enum DbError {
    /// Operation on a disposed collection.
    Disposed,
    /// Selector failed validation or parsing.
    InvalidSelector(String),
    /// Modifier failed validation, parsing, or application.
    InvalidModifier(String),
    /// Insert or id-changing update would violate id uniqueness.
    DuplicateId(String),
    /// Internal index invariant violation. Fatal to the host.
    NotFoundOnIndex(String),
    /// Sync and async index providers combined on one collection.
    MixedIndexModes,
    /// Storage or persistence adapter failure, coerced at the boundary.
    Storage(String),
}

impl fmt::Display for DbError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DbError::Disposed => write!(f, "collection is disposed"),
            DbError::InvalidSelector(msg) => write!(f, "invalid selector: {msg}"),
            DbError::InvalidModifier(msg) => write!(f, "invalid modifier: {msg}"),
            DbError::DuplicateId(id) => write!(f, "duplicate id: {id}"),
            DbError::NotFoundOnIndex(msg) => write!(f, "not found on index: {msg}"),
            DbError::MixedIndexModes => {
                write!(f, "sync and async index providers cannot be mixed")
            }
            DbError::Storage(msg) => write!(f, "storage error: {msg}"),
        }
    }
}

impl std::error::Error for DbError {}

impl From<SelectorError> for DbError {
    fn from(e: SelectorError) -> Self {
        DbError::InvalidSelector(e.0)
    }
}

impl From<ModifierError> for DbError {
    fn from(e: ModifierError) -> Self {
        DbError::InvalidModifier(e.0)
    }
}

impl From<PathError> for DbError {
    fn from(e: PathError) -> Self {
        DbError::InvalidSelector(e.0)
    }
}

impl From<NotFoundOnIndex> for DbError {
    fn from(e: NotFoundOnIndex) -> Self {
        DbError::NotFoundOnIndex(e.to_string())
    }
}
