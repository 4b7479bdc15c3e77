use crate::{KvStore, StorageResult};
use async_trait::async_trait;
use chunkflow_core::StorageError;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{debug, warn};
use uuid::Uuid;

#[derive(Debug, Serialize, Deserialize)]
struct Record {
    key: String,
    value: serde_json::Value,
}

/// One JSON file per record under `<root>/<namespace>/`. Writes go to a temp file that is
/// renamed over the target, so readers see either the old or the new record, never a torn one.
#[derive(Debug, Clone)]
pub struct FileKvStore {
    root: PathBuf,
}

impl FileKvStore {
    pub fn open<P: AsRef<Path>>(root: P) -> StorageResult<Self> {
        let root = root.as_ref().to_path_buf();
        std::fs::create_dir_all(&root)?;
        debug!("Opened file store at {:?}", root);
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn namespace_dir(&self, namespace: &str) -> PathBuf {
        self.root.join(namespace)
    }

    fn record_path(&self, namespace: &str, key: &str) -> PathBuf {
        let mut hasher = Sha256::new();
        hasher.update(key.as_bytes());
        self.namespace_dir(namespace)
            .join(format!("{:x}.json", hasher.finalize()))
    }

    async fn read_record(path: &Path) -> StorageResult<Option<Record>> {
        match fs::read(path).await {
            Ok(bytes) => serde_json::from_slice(&bytes)
                .map(Some)
                .map_err(|e| StorageError::Corrupt(format!("{:?}: {}", path, e))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait]
impl KvStore for FileKvStore {
    async fn put(
        &self,
        namespace: &str,
        key: &str,
        value: serde_json::Value,
    ) -> StorageResult<()> {
        fs::create_dir_all(self.namespace_dir(namespace)).await?;
        let target = self.record_path(namespace, key);
        let tmp = target.with_extension(format!("{}.tmp", Uuid::new_v4().simple()));
        let bytes = serde_json::to_vec(&Record {
            key: key.to_string(),
            value,
        })
        .map_err(|e| StorageError::Corrupt(e.to_string()))?;
        fs::write(&tmp, bytes).await?;
        if let Err(e) = fs::rename(&tmp, &target).await {
            let _ = fs::remove_file(&tmp).await;
            return Err(e.into());
        }
        Ok(())
    }

    async fn get(&self, namespace: &str, key: &str) -> StorageResult<Option<serde_json::Value>> {
        let path = self.record_path(namespace, key);
        match Self::read_record(&path).await? {
            Some(record) if record.key == key => Ok(Some(record.value)),
            Some(record) => Err(StorageError::Corrupt(format!(
                "{:?} holds key '{}' instead of '{}'",
                path, record.key, key
            ))),
            None => Ok(None),
        }
    }

    async fn delete(&self, namespace: &str, key: &str) -> StorageResult<bool> {
        match fs::remove_file(self.record_path(namespace, key)).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn scan(&self, namespace: &str) -> StorageResult<Vec<(String, serde_json::Value)>> {
        let dir = self.namespace_dir(namespace);
        let mut entries = match fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut out = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            match Self::read_record(&path).await {
                Ok(Some(record)) => out.push((record.key, record.value)),
                Ok(None) => {}
                Err(e) => warn!("Skipping unreadable record: {}", e),
            }
        }
        out.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::KvStoreExt;
    use tempfile::TempDir;

    #[tokio::test]
    async fn records_survive_reopen() {
        let tmp = TempDir::new().unwrap();
        {
            let store = FileKvStore::open(tmp.path()).unwrap();
            store
                .put_json("catalog", "proj/a.rs#0", &serde_json::json!({"v": 1}))
                .await
                .unwrap();
            store
                .put_json("catalog", "proj/a.rs#0", &serde_json::json!({"v": 2}))
                .await
                .unwrap();
        }
        let store = FileKvStore::open(tmp.path()).unwrap();
        let v: serde_json::Value = store
            .get_json("catalog", "proj/a.rs#0")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(v["v"], 2);
        let all = store.scan("catalog").await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].0, "proj/a.rs#0");
    }

    #[tokio::test]
    async fn corrupt_files_are_skipped_on_scan() {
        let tmp = TempDir::new().unwrap();
        let store = FileKvStore::open(tmp.path()).unwrap();
        store.put_json("tasks", "ok", &1u32).await.unwrap();
        std::fs::write(tmp.path().join("tasks").join("broken.json"), b"{not json").unwrap();
        let all = store.scan("tasks").await.unwrap();
        assert_eq!(all.len(), 1);
        assert!(store.delete("tasks", "ok").await.unwrap());
        assert!(store.scan("tasks").await.unwrap().is_empty());
    }
}
