//! Persistence backends for the logical chunkflow stores (task state, task plans,
//! relationship graph, metadata catalog). Records are JSON values grouped by namespace.

pub mod file;
pub mod memory;

pub use file::FileKvStore;
pub use memory::MemoryKvStore;

use async_trait::async_trait;
use chunkflow_core::{StorageBackend, StorageConfig, StorageError};
use serde::{de::DeserializeOwned, Serialize};
use std::sync::Arc;

pub const NS_TASKS: &str = "tasks";
pub const NS_PLANS: &str = "plans";
pub const NS_EDGES: &str = "edges";
pub const NS_CATALOG: &str = "catalog";

pub type StorageResult<T> = std::result::Result<T, StorageError>;

#[async_trait]
pub trait KvStore: Send + Sync {
    async fn put(&self, namespace: &str, key: &str, value: serde_json::Value)
        -> StorageResult<()>;

    async fn get(&self, namespace: &str, key: &str) -> StorageResult<Option<serde_json::Value>>;

    async fn delete(&self, namespace: &str, key: &str) -> StorageResult<bool>;

    /// All records of a namespace, ordered by key.
    async fn scan(&self, namespace: &str) -> StorageResult<Vec<(String, serde_json::Value)>>;
}

/// Typed helpers on top of [`KvStore`].
#[async_trait]
pub trait KvStoreExt: KvStore {
    async fn put_json<T: Serialize + Sync>(
        &self,
        namespace: &str,
        key: &str,
        value: &T,
    ) -> StorageResult<()> {
        let value = serde_json::to_value(value).map_err(|e| StorageError::Corrupt(e.to_string()))?;
        self.put(namespace, key, value).await
    }

    async fn get_json<T: DeserializeOwned + Send>(
        &self,
        namespace: &str,
        key: &str,
    ) -> StorageResult<Option<T>> {
        match self.get(namespace, key).await? {
            Some(v) => serde_json::from_value(v)
                .map(Some)
                .map_err(|e| StorageError::Corrupt(format!("{}/{}: {}", namespace, key, e))),
            None => Ok(None),
        }
    }
}

impl<S: KvStore + ?Sized> KvStoreExt for S {}

/// Build the backend selected by configuration.
pub fn open_store(config: &StorageConfig) -> StorageResult<Arc<dyn KvStore>> {
    match config.backend {
        StorageBackend::Memory => Ok(Arc::new(MemoryKvStore::new())),
        StorageBackend::File => Ok(Arc::new(FileKvStore::open(&config.path)?)),
    }
}
