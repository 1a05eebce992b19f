use std::collections::{BTreeMap, BTreeSet};

use async_trait::async_trait;
use bson::Document;

/// Adapter failures in any shape; wrapped into `DbError::Storage` at the
/// collection boundary.
pub type AdapterError = Box<dyn std::error::Error + Send + Sync>;

/// The serialized-key index map a backend hands the planner:
/// `serialize(value) → set(serialized id)`, with the null-sentinel key
/// holding missing-or-null.
pub type IndexMap = BTreeMap<String, BTreeSet<String>>;

/// Storage collaborator of the asynchronous backend.
///
/// Secondary indexes are declared with [`create_index`](Self::create_index)
/// before [`setup`](Self::setup); the backend serves them to the planner
/// via [`read_index`](Self::read_index).
#[async_trait]
pub trait StorageAdapter: Send + Sync {
    async fn setup(&self) -> Result<(), AdapterError>;
    async fn teardown(&self) -> Result<(), AdapterError>;

    async fn read_all(&self) -> Result<Vec<Document>, AdapterError>;
    /// Fetch items by serialized id. Unknown ids are silently absent.
    async fn read_ids(&self, ids: &[String]) -> Result<Vec<Document>, AdapterError>;
    async fn read_index(&self, field: &str) -> Result<IndexMap, AdapterError>;

    /// Declare an index. Only valid before `setup`.
    fn create_index(&self, field: &str);
    /// Drop a declared index. Only valid before `setup`.
    fn drop_index(&self, field: &str);

    async fn insert(&self, items: &[Document]) -> Result<(), AdapterError>;
    async fn replace(&self, items: &[Document]) -> Result<(), AdapterError>;
    async fn remove(&self, items: &[Document]) -> Result<(), AdapterError>;
    async fn remove_all(&self) -> Result<(), AdapterError>;
}
