use crate::{KvStore, StorageResult};
use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::Arc;

type Namespace = Arc<RwLock<BTreeMap<String, serde_json::Value>>>;

/// In-process store. Each namespace is an ordered map behind its own lock.
#[derive(Debug, Default)]
pub struct MemoryKvStore {
    namespaces: DashMap<String, Namespace>,
}

impl MemoryKvStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn namespace(&self, name: &str) -> Namespace {
        self.namespaces
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(RwLock::new(BTreeMap::new())))
            .clone()
    }
}

#[async_trait]
impl KvStore for MemoryKvStore {
    async fn put(
        &self,
        namespace: &str,
        key: &str,
        value: serde_json::Value,
    ) -> StorageResult<()> {
        self.namespace(namespace)
            .write()
            .insert(key.to_string(), value);
        Ok(())
    }

    async fn get(&self, namespace: &str, key: &str) -> StorageResult<Option<serde_json::Value>> {
        Ok(self
            .namespaces
            .get(namespace)
            .and_then(|ns| ns.read().get(key).cloned()))
    }

    async fn delete(&self, namespace: &str, key: &str) -> StorageResult<bool> {
        Ok(self
            .namespaces
            .get(namespace)
            .map(|ns| ns.write().remove(key).is_some())
            .unwrap_or(false))
    }

    async fn scan(&self, namespace: &str) -> StorageResult<Vec<(String, serde_json::Value)>> {
        Ok(self
            .namespaces
            .get(namespace)
            .map(|ns| {
                ns.read()
                    .iter()
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect()
            })
            .unwrap_or_default())
    }
}
