use crate::{CatalogEntry, CatalogKey, CatalogStats, CompactionStats, ScopePath};
use arc_swap::ArcSwap;
use chunkflow_core::{CatalogInconsistency, MethodologyRef, Result};
use chunkflow_storage::{KvStore, KvStoreExt, NS_CATALOG};
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

type Chain = Vec<Arc<CatalogEntry>>;

/// Version chain of one key. Readers load the whole chain atomically; writers on the same
/// key queue on `writer`.
#[derive(Debug, Default)]
struct Slot {
    versions: ArcSwap<Chain>,
    writer: Arc<Mutex<()>>,
}

impl Slot {
    fn latest(&self) -> Option<Arc<CatalogEntry>> {
        self.versions.load().last().cloned()
    }
}

#[derive(Debug, Default)]
struct SubIndex {
    slots: DashMap<String, Arc<Slot>>,
}

/// Result of a validated lookup.
#[derive(Debug, Clone, PartialEq)]
pub enum Lookup {
    Hit {
        entry: Arc<CatalogEntry>,
        payload: serde_json::Value,
    },
    Miss,
}

impl Lookup {
    pub fn is_hit(&self) -> bool {
        matches!(self, Lookup::Hit { .. })
    }
}

/// Hierarchical catalog of analysis results.
///
/// The first level is keyed by [`ScopePath`], the second by the slot key of
/// [`CatalogKey`]; a lookup resolves its scope and touches a single sub-index.
pub struct MetadataCatalog {
    scopes: DashMap<ScopePath, Arc<SubIndex>>,
    sequence: AtomicU64,
    hits: AtomicU64,
    misses: AtomicU64,
    store: Option<Arc<dyn KvStore>>,
}

impl std::fmt::Debug for MetadataCatalog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetadataCatalog")
            .field("scopes", &self.scopes.len())
            .field("persistent", &self.store.is_some())
            .finish()
    }
}

impl Default for MetadataCatalog {
    fn default() -> Self {
        Self::new()
    }
}

impl MetadataCatalog {
    pub fn new() -> Self {
        Self {
            scopes: DashMap::new(),
            sequence: AtomicU64::new(1),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            store: None,
        }
    }

    /// Catalog with write-through persistence; the latest version of every key is reloaded.
    pub async fn open(store: Arc<dyn KvStore>) -> Result<Self> {
        let mut catalog = Self::new();
        let mut max_sequence = 0;
        let mut loaded = 0usize;
        for (key, value) in store.scan(NS_CATALOG).await? {
            let entry: CatalogEntry = match serde_json::from_value(value) {
                Ok(entry) => entry,
                Err(e) => {
                    warn!("Skipping corrupt catalog record {}: {}", key, e);
                    continue;
                }
            };
            max_sequence = max_sequence.max(entry.sequence);
            let slot = catalog.slot(&entry.key);
            slot.versions.store(Arc::new(vec![Arc::new(entry)]));
            loaded += 1;
        }
        catalog.sequence.store(max_sequence + 1, Ordering::SeqCst);
        catalog.store = Some(store);
        info!("Loaded metadata catalog with {} entries", loaded);
        Ok(catalog)
    }

    fn slot(&self, key: &CatalogKey) -> Arc<Slot> {
        let index = self
            .scopes
            .entry(key.path.clone())
            .or_insert_with(|| Arc::new(SubIndex::default()))
            .clone();
        let slot = index
            .slots
            .entry(key.key.clone())
            .or_insert_with(|| Arc::new(Slot::default()))
            .clone();
        slot
    }

    fn existing_slot(&self, key: &CatalogKey) -> Option<Arc<Slot>> {
        let index = self.scopes.get(&key.path)?.value().clone();
        let slot = index.slots.get(&key.key)?.value().clone();
        Some(slot)
    }

    /// Latest live entry for `key`, or `None` on a miss or tombstone.
    pub fn lookup(&self, key: &CatalogKey) -> Option<Arc<CatalogEntry>> {
        self.existing_slot(key)
            .and_then(|slot| slot.latest())
            .filter(|entry| !entry.tombstone)
    }

    /// All versions held for `key`, oldest first.
    pub fn history(&self, key: &CatalogKey) -> Vec<Arc<CatalogEntry>> {
        self.existing_slot(key)
            .map(|slot| slot.versions.load().as_ref().clone())
            .unwrap_or_default()
    }

    /// Lookup that only serves an entry produced by `producer` for content with `digest`.
    ///
    /// An entry from another producer is a miss. A digest that disagrees with the current
    /// content, or an undecodable payload, is an inconsistency the caller must resolve.
    pub fn lookup_valid(
        &self,
        key: &CatalogKey,
        digest: &str,
        producer: &MethodologyRef,
    ) -> std::result::Result<Lookup, CatalogInconsistency> {
        let entry = match self.lookup(key) {
            Some(entry) if &entry.producer == producer => entry,
            _ => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                return Ok(Lookup::Miss);
            }
        };

        if entry.digest != digest {
            self.misses.fetch_add(1, Ordering::Relaxed);
            return Err(CatalogInconsistency::DigestMismatch {
                content_id: entry.content_id.clone(),
                stored: entry.digest.clone(),
                current: digest.to_string(),
            });
        }

        match entry.payload() {
            Ok(payload) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                Ok(Lookup::Hit { entry, payload })
            }
            Err(e) => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                Err(e)
            }
        }
    }

    async fn append(&self, slot: &Slot, entry: CatalogEntry) -> Result<Arc<CatalogEntry>> {
        let entry = Arc::new(entry);
        if let Some(store) = &self.store {
            store
                .put_json(NS_CATALOG, &entry.key.storage_key(), entry.as_ref())
                .await?;
        }
        let mut chain = slot.versions.load().as_ref().clone();
        chain.push(entry.clone());
        slot.versions.store(Arc::new(chain));
        Ok(entry)
    }

    /// Append a new version under `key`. A later `lookup` on the same key returns it.
    pub async fn put(&self, key: &CatalogKey, mut entry: CatalogEntry) -> Result<Arc<CatalogEntry>> {
        // compact() may unlink a slot while we wait for its writer lock
        let (slot, _guard) = loop {
            let slot = self.slot(key);
            let guard = slot.writer.clone().lock_owned().await;
            let linked = self
                .existing_slot(key)
                .map(|current| Arc::ptr_eq(&current, &slot))
                .unwrap_or(false);
            if linked {
                break (slot, guard);
            }
        };
        entry.key = key.clone();
        entry.sequence = self.sequence.fetch_add(1, Ordering::SeqCst);
        let stored = self.append(&slot, entry).await?;
        debug!("Catalog put {} (seq {})", key, stored.sequence);
        Ok(stored)
    }

    /// Tombstone `key`. Returns false when there was no live entry.
    pub async fn invalidate(&self, key: &CatalogKey) -> Result<bool> {
        let Some(slot) = self.existing_slot(key) else {
            return Ok(false);
        };
        let _guard = slot.writer.lock().await;
        let previous = match slot.latest() {
            Some(latest) if !latest.tombstone => latest,
            _ => return Ok(false),
        };
        let mut tombstone = CatalogEntry::tombstone_for(&previous);
        tombstone.sequence = self.sequence.fetch_add(1, Ordering::SeqCst);
        self.append(&slot, tombstone).await?;
        debug!("Catalog invalidated {}", key);
        Ok(true)
    }

    /// Drop superseded versions, and slots whose latest version is a tombstone.
    pub async fn compact(&self) -> Result<CompactionStats> {
        let mut stats = CompactionStats::default();
        let indexes: Vec<(ScopePath, Arc<SubIndex>)> = self
            .scopes
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect();

        for (path, index) in indexes {
            let slots: Vec<(String, Arc<Slot>)> = index
                .slots
                .iter()
                .map(|e| (e.key().clone(), e.value().clone()))
                .collect();
            for (key, slot) in slots {
                let _guard = slot.writer.lock().await;
                let chain = slot.versions.load_full();
                let Some(latest) = chain.last().cloned() else {
                    continue;
                };
                if latest.tombstone {
                    if let Some(store) = &self.store {
                        store.delete(NS_CATALOG, &latest.key.storage_key()).await?;
                    }
                    stats.versions_dropped += chain.len();
                    stats.slots_removed += 1;
                    slot.versions.store(Arc::new(Vec::new()));
                    index.slots.remove(&key);
                } else if chain.len() > 1 {
                    stats.versions_dropped += chain.len() - 1;
                    slot.versions.store(Arc::new(vec![latest]));
                }
            }
            if index.slots.is_empty() {
                self.scopes.remove_if(&path, |_, idx| idx.slots.is_empty());
            }
        }
        info!(
            "Catalog compaction dropped {} versions, removed {} slots",
            stats.versions_dropped, stats.slots_removed
        );
        Ok(stats)
    }

    pub fn stats(&self) -> CatalogStats {
        let mut stats = CatalogStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            scopes: self.scopes.len(),
            ..Default::default()
        };
        for index in self.scopes.iter() {
            for slot in index.value().slots.iter() {
                let chain = slot.value().versions.load();
                stats.versions += chain.len();
                if chain.last().map(|e| !e.tombstone).unwrap_or(false) {
                    stats.entries += 1;
                }
            }
        }
        stats
    }
}
