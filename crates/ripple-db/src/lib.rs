mod collection;
mod cursor;
mod error;
mod events;
mod observer;
mod persistence;
mod runtime;

pub use collection::{Collection, CollectionOptions, FindOptions, PrimaryKeyGenerator};
pub use cursor::{Cursor, ObserveGuard, TrackedDocument};
pub use error::DbError;
pub use events::{ChangeEvent, PersistenceEvent, PersistenceEventKind};
pub use observer::{ChangeCallbacks, Observer};
pub use persistence::{
    Changeset, LoadResponse, OnChange, PersistenceAdapter, PersistenceError, PersistenceSignals,
};
pub use runtime::Runtime;
