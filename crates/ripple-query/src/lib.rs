mod error;
mod matcher;
mod modifier;
mod parse;
mod path;
mod project;
mod selector;
mod sort;
mod value;

pub use error::{ModifierError, PathError, SelectorError};
pub use matcher::{matches, matches_value};
pub use modifier::{
    DateRepr, FieldModifier, Modifier, ModifierOp, PopEnd, PullCriteria, parse_modifier,
};
pub use parse::parse_selector;
pub use path::{Path, Segment, get_path, get_path_all, parse_path, set_path, unset_path};
pub use project::{Projection, parse_projection, project};
pub use selector::{ElemMatch, FieldOp, FieldPredicate, Selector, WherePredicate};
pub use sort::{SortDirection, SortSpec, compare_values, parse_sort, sort_items};
pub use value::{NULL_KEY, documents_equal, is_equal, serialize_value};
