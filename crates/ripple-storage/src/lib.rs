mod adapter;
mod autofetch;
mod collection;
mod memory;

pub use adapter::{AdapterError, IndexMap, StorageAdapter};
pub use autofetch::{AutoFetchCollection, AutoFetchOptions, MergeItems, RemoteFetcher};
pub use collection::{
    QuerySnapshot, QueryState, StorageCollection, StorageCollectionOptions,
};
pub use memory::MemoryStorageAdapter;
