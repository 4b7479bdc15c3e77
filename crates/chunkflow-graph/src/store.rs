use crate::has_cycle;
use chunkflow_core::{
    ConfidencePolicy, ContentId, EdgeKey, EdgeType, GraphConfig,
    RelationshipEdge, Result,
};
use chunkflow_storage::{KvStore, KvStoreExt, NS_EDGES};
use dashmap::DashMap;
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Outcome of an [`RelationshipGraph::upsert_edges`] call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UpsertStats {
    pub inserted: usize,
    pub updated: usize,
    /// Edges skipped for a NaN confidence.
    pub rejected: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GraphStats {
    pub edges: usize,
    pub content_ids: usize,
}

/// Persistent store of typed, confidence-scored links between content ids.
///
/// Edges live in a map keyed by [`EdgeKey`]; a second map indexes edge keys by every
/// content id they touch so lookups cost the size of the answer, not of the graph. Index
/// vectors are copy-on-write so readers never wait on writers. Writers are serialized per
/// edge key only.
pub struct RelationshipGraph {
    edges: DashMap<EdgeKey, Arc<RelationshipEdge>>,
    by_content: DashMap<ContentId, Arc<Vec<EdgeKey>>>,
    write_locks: DashMap<EdgeKey, Arc<Mutex<()>>>,
    policies: BTreeMap<String, ConfidencePolicy>,
    store: Option<Arc<dyn KvStore>>,
}

impl std::fmt::Debug for RelationshipGraph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelationshipGraph")
            .field("edges", &self.edges.len())
            .field("persistent", &self.store.is_some())
            .finish()
    }
}

impl RelationshipGraph {
    /// Volatile graph, nothing persisted.
    pub fn new(config: &GraphConfig) -> Self {
        Self {
            edges: DashMap::new(),
            by_content: DashMap::new(),
            write_locks: DashMap::new(),
            policies: config.confidence_policies.clone(),
            store: None,
        }
    }

    /// Graph backed by `store`; existing edges are loaded.
    pub async fn open(store: Arc<dyn KvStore>, config: &GraphConfig) -> Result<Self> {
        let mut graph = Self::new(config);
        for (key, value) in store.scan(NS_EDGES).await? {
            match serde_json::from_value::<RelationshipEdge>(value) {
                Ok(edge) => graph.insert_in_memory(edge),
                Err(e) => warn!("Skipping corrupt edge record {}: {}", key, e),
            }
        }
        info!("Loaded relationship graph with {} edges", graph.edges.len());
        graph.store = Some(store);
        Ok(graph)
    }

    pub fn policy_for(&self, edge_type: &EdgeType) -> ConfidencePolicy {
        self.policies
            .get(&edge_type.to_string())
            .copied()
            .unwrap_or_else(|| edge_type.default_policy())
    }

    fn insert_index(&self, id: ContentId, key: &EdgeKey) {
        self.by_content
            .entry(id)
            .and_modify(|list| {
                if !list.contains(key) {
                    let mut updated = list.as_ref().clone();
                    updated.push(key.clone());
                    *list = Arc::new(updated);
                }
            })
            .or_insert_with(|| Arc::new(vec![key.clone()]));
    }

    fn remove_index(&self, id: &ContentId, key: &EdgeKey) {
        let mut now_empty = false;
        if let Some(mut entry) = self.by_content.get_mut(id) {
            let mut nv = entry.value().as_ref().clone();
            nv.retain(|k| k != key);
            now_empty = nv.is_empty();
            *entry = Arc::new(nv);
        }
        if now_empty {
            self.by_content.remove_if(id, |_, v| v.is_empty());
        }
    }

    fn lock_for(&self, key: &EdgeKey) -> Arc<Mutex<()>> {
        self.write_locks
            .entry(key.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Drops the writer lock for `key` unless another writer still holds a handle to it.
    fn release_lock(&self, key: &EdgeKey, lock: Arc<Mutex<()>>) {
        drop(lock);
        self.write_locks.remove_if(key, |_, l| Arc::strong_count(l) == 1);
    }

    fn insert_in_memory(&self, edge: RelationshipEdge) {
        let key = edge.key();
        self.insert_index(key.source.clone(), &key);
        self.insert_index(key.target.clone(), &key);
        self.edges.insert(key, Arc::new(edge));
    }

    fn normalize(mut edge: RelationshipEdge) -> Option<RelationshipEdge> {
        if edge.confidence.is_nan() {
            return None;
        }
        edge.confidence = edge.confidence.clamp(0.0, 1.0);
        Some(edge)
    }

    fn merge(&self, existing: &RelationshipEdge, incoming: RelationshipEdge) -> RelationshipEdge {
        let confidence = match self.policy_for(&incoming.edge_type) {
            ConfidencePolicy::Max => existing.confidence.max(incoming.confidence),
            ConfidencePolicy::MostRecent => incoming.confidence,
        };
        RelationshipEdge {
            confidence,
            discovered_by: incoming.discovered_by.or(existing.discovered_by),
            ..incoming
        }
    }

    /// Insert or update edges. Idempotent on `(source, target, type)`. Edges with a NaN
    /// confidence are skipped and counted in [`UpsertStats::rejected`]; the rest of the
    /// batch is still applied.
    pub async fn upsert_edges<I>(&self, edges: I) -> Result<UpsertStats>
    where
        I: IntoIterator<Item = RelationshipEdge>,
    {
        let mut stats = UpsertStats::default();
        for edge in edges {
            let key = edge.key();
            let Some(edge) = Self::normalize(edge) else {
                warn!("Skipping edge {} with NaN confidence", key.storage_key());
                stats.rejected += 1;
                continue;
            };
            let lock = self.lock_for(&key);
            let result = {
                let _guard = lock.lock().await;
                self.upsert_locked(&key, edge, &mut stats).await
            };
            self.release_lock(&key, lock);
            result?;
        }
        debug!(
            "Upserted edges: {} inserted, {} updated, {} rejected",
            stats.inserted, stats.updated, stats.rejected
        );
        Ok(stats)
    }

    async fn upsert_locked(
        &self,
        key: &EdgeKey,
        edge: RelationshipEdge,
        stats: &mut UpsertStats,
    ) -> Result<()> {
        let existing = self.edges.get(key).map(|e| e.value().clone());
        let merged = match existing {
            Some(existing) => {
                stats.updated += 1;
                self.merge(&existing, edge)
            }
            None => {
                stats.inserted += 1;
                edge
            }
        };

        if let Some(store) = &self.store {
            store.put_json(NS_EDGES, &key.storage_key(), &merged).await?;
        }
        self.insert_in_memory(merged);
        Ok(())
    }

    pub fn get(&self, key: &EdgeKey) -> Option<RelationshipEdge> {
        self.edges.get(key).map(|e| e.value().as_ref().clone())
    }

    /// Every edge with at least one endpoint in `content_ids`, ordered by key.
    pub fn edges_touching(&self, content_ids: &[ContentId]) -> Vec<RelationshipEdge> {
        let mut keys: BTreeSet<EdgeKey> = BTreeSet::new();
        for id in content_ids {
            if let Some(list) = self.by_content.get(id) {
                let snapshot = list.value().clone();
                keys.extend(snapshot.iter().cloned());
            }
        }
        keys.iter()
            .filter_map(|k| self.edges.get(k).map(|e| e.value().as_ref().clone()))
            .collect()
    }

    /// Whether directed edges with both endpoints in `scope` form a cycle. An empty scope
    /// means the whole graph. Undirected edges never form cycles.
    pub fn detect_cycles(&self, scope: &[ContentId]) -> bool {
        let scope_set: Option<HashSet<&ContentId>> = if scope.is_empty() {
            None
        } else {
            Some(scope.iter().collect())
        };
        let roots: Vec<ContentId> = match &scope_set {
            Some(_) => scope.to_vec(),
            None => self.by_content.iter().map(|e| e.key().clone()).collect(),
        };

        has_cycle(roots, |node: &ContentId| {
            let Some(list) = self.by_content.get(node).map(|l| l.value().clone()) else {
                return Vec::new();
            };
            list.iter()
                .filter(|k| k.directed && &k.source == node)
                .filter(|k| {
                    scope_set
                        .as_ref()
                        .map(|s| s.contains(&k.target))
                        .unwrap_or(true)
                })
                .filter(|k| self.edges.contains_key(*k))
                .map(|k| k.target.clone())
                .collect()
        })
    }

    /// Drop every edge touching `content_id`. Returns how many were removed.
    pub async fn remove_edges_for(&self, content_id: &ContentId) -> Result<usize> {
        let keys: Vec<EdgeKey> = self
            .by_content
            .get(content_id)
            .map(|l| l.value().as_ref().clone())
            .unwrap_or_default();
        let mut removed = 0;
        for key in keys {
            let lock = self.lock_for(&key);
            let result = {
                let _guard = lock.lock().await;
                self.remove_locked(&key).await
            };
            self.release_lock(&key, lock);
            if result? {
                removed += 1;
            }
        }
        Ok(removed)
    }

    async fn remove_locked(&self, key: &EdgeKey) -> Result<bool> {
        if self.edges.remove(key).is_none() {
            return Ok(false);
        }
        self.remove_index(&key.source, key);
        self.remove_index(&key.target, key);
        if let Some(store) = &self.store {
            store.delete(NS_EDGES, &key.storage_key()).await?;
        }
        Ok(true)
    }

    pub fn len(&self) -> usize {
        self.edges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.edges.is_empty()
    }

    pub fn stats(&self) -> GraphStats {
        GraphStats {
            edges: self.edges.len(),
            content_ids: self.by_content.len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn edge(from: &str, to: &str, t: EdgeType, c: f64) -> RelationshipEdge {
        RelationshipEdge::new(from.into(), to.into(), t).with_confidence(c)
    }

    #[tokio::test]
    async fn upsert_is_idempotent() {
        let g = RelationshipGraph::new(&GraphConfig::default());
        let e = edge("p/a", "p/b", EdgeType::References, 0.5);
        g.upsert_edges(vec![e.clone()]).await.unwrap();
        let stats = g.upsert_edges(vec![e]).await.unwrap();
        assert_eq!(
            stats,
            UpsertStats {
                inserted: 0,
                updated: 1,
                rejected: 0
            }
        );
        assert_eq!(g.len(), 1);
    }

    #[tokio::test]
    async fn max_policy_keeps_highest_confidence() {
        let g = RelationshipGraph::new(&GraphConfig::default());
        g.upsert_edges(vec![edge("p/a", "p/b", EdgeType::References, 0.9)])
            .await
            .unwrap();
        g.upsert_edges(vec![edge("p/a", "p/b", EdgeType::References, 0.4)])
            .await
            .unwrap();
        let got = g.edges_touching(&["p/a".into()]);
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].confidence, 0.9);
    }

    #[tokio::test]
    async fn most_recent_policy_replaces_confidence() {
        let g = RelationshipGraph::new(&GraphConfig::default());
        g.upsert_edges(vec![edge("p/a", "p/b", EdgeType::DependsOn, 0.9)])
            .await
            .unwrap();
        g.upsert_edges(vec![edge("p/a", "p/b", EdgeType::DependsOn, 0.4)])
            .await
            .unwrap();
        assert_eq!(g.edges_touching(&["p/b".into()])[0].confidence, 0.4);
    }

    #[tokio::test]
    async fn configured_policy_overrides_default() {
        let mut config = GraphConfig::default();
        config
            .confidence_policies
            .insert("references".into(), ConfidencePolicy::MostRecent);
        let g = RelationshipGraph::new(&config);
        g.upsert_edges(vec![edge("p/a", "p/b", EdgeType::References, 0.9)])
            .await
            .unwrap();
        g.upsert_edges(vec![edge("p/a", "p/b", EdgeType::References, 0.2)])
            .await
            .unwrap();
        assert_eq!(g.edges_touching(&["p/a".into()])[0].confidence, 0.2);
    }

    #[tokio::test]
    async fn confidence_is_clamped_and_nan_rejected() {
        let g = RelationshipGraph::new(&GraphConfig::default());
        g.upsert_edges(vec![edge("p/a", "p/b", EdgeType::Contains, 7.0)])
            .await
            .unwrap();
        assert_eq!(g.edges_touching(&["p/a".into()])[0].confidence, 1.0);
        let stats = g
            .upsert_edges(vec![edge("p/a", "p/c", EdgeType::Contains, f64::NAN)])
            .await
            .unwrap();
        assert_eq!(stats.rejected, 1);
        assert!(g.get(&edge("p/a", "p/c", EdgeType::Contains, 0.0).key()).is_none());
    }

    #[tokio::test]
    async fn nan_edge_does_not_drop_the_rest_of_the_batch() {
        let g = RelationshipGraph::new(&GraphConfig::default());
        let stats = g
            .upsert_edges(vec![
                edge("p/a", "p/b", EdgeType::References, 0.8),
                edge("p/a", "p/c", EdgeType::References, f64::NAN),
                edge("p/a", "p/d", EdgeType::References, 0.6),
            ])
            .await
            .unwrap();
        assert_eq!(
            stats,
            UpsertStats {
                inserted: 2,
                updated: 0,
                rejected: 1
            }
        );
        assert_eq!(g.len(), 2);
        let touching: Vec<ContentId> = g
            .edges_touching(&["p/a".into()])
            .into_iter()
            .map(|e| e.target)
            .collect();
        assert_eq!(touching, vec![ContentId::from("p/b"), ContentId::from("p/d")]);
    }

    #[tokio::test]
    async fn writer_locks_are_released_after_use() {
        let g = RelationshipGraph::new(&GraphConfig::default());
        g.upsert_edges(vec![
            edge("p/a", "p/b", EdgeType::References, 1.0),
            edge("p/b", "p/c", EdgeType::DependsOn, 1.0),
        ])
        .await
        .unwrap();
        assert!(g.write_locks.is_empty());
        g.remove_edges_for(&"p/b".into()).await.unwrap();
        assert!(g.write_locks.is_empty());
        assert!(g.is_empty());
    }

    #[tokio::test]
    async fn cycles_respect_scope_and_direction() {
        let g = RelationshipGraph::new(&GraphConfig::default());
        g.upsert_edges(vec![
            edge("p/a", "p/b", EdgeType::DependsOn, 1.0),
            edge("p/b", "p/c", EdgeType::DependsOn, 1.0),
            edge("p/c", "p/a", EdgeType::DependsOn, 1.0),
            edge("p/x", "p/y", EdgeType::Duplicates, 1.0).undirected(),
        ])
        .await
        .unwrap();
        assert!(g.detect_cycles(&[]));
        assert!(g.detect_cycles(&["p/a".into(), "p/b".into(), "p/c".into()]));
        assert!(!g.detect_cycles(&["p/a".into(), "p/b".into()]));
        assert!(!g.detect_cycles(&["p/x".into(), "p/y".into()]));
    }

    #[tokio::test]
    async fn remove_edges_cleans_index() {
        let g = RelationshipGraph::new(&GraphConfig::default());
        g.upsert_edges(vec![
            edge("p/a", "p/b", EdgeType::References, 1.0),
            edge("p/a", "p/c", EdgeType::References, 1.0),
            edge("p/b", "p/c", EdgeType::References, 1.0),
        ])
        .await
        .unwrap();
        assert_eq!(g.remove_edges_for(&"p/a".into()).await.unwrap(), 2);
        assert!(g.edges_touching(&["p/a".into()]).is_empty());
        assert_eq!(g.edges_touching(&["p/c".into()]).len(), 1);
        assert_eq!(g.stats().edges, 1);
    }
}
