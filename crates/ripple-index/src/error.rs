use std::fmt;

/// Internal invariant violation while maintaining an index: an id that must
/// be present was not where it should be. Fatal to the host.
#[derive(Debug, Clone, PartialEq)]
pub struct NotFoundOnIndex {
    pub field: String,
    pub id: String,
}

impl fmt::Display for NotFoundOnIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "id '{}' not found on index for field '{}'",
            self.id, self.field
        )
    }
}

impl std::error::Error for NotFoundOnIndex {}
