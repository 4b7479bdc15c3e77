use chunkflow_core::{ContentId, EdgeType, GraphConfig, RelationshipEdge};
use chunkflow_graph::RelationshipGraph;
use chunkflow_storage::{FileKvStore, KvStore};
use std::sync::Arc;
use tempfile::TempDir;
use uuid::Uuid;

fn id(s: &str) -> ContentId {
    ContentId::new(s)
}

#[tokio::test]
async fn edges_survive_reopen() {
    let tmp = TempDir::new().unwrap();
    let task = Uuid::new_v4();
    {
        let store: Arc<dyn KvStore> = Arc::new(FileKvStore::open(tmp.path()).unwrap());
        let graph = RelationshipGraph::open(store, &GraphConfig::default())
            .await
            .unwrap();
        graph
            .upsert_edges(vec![
                RelationshipEdge::new(id("proj/a.rs#0"), id("proj/b.rs#0"), EdgeType::References)
                    .with_confidence(0.7)
                    .discovered_by(task),
                RelationshipEdge::new(id("proj/b.rs#0"), id("proj/a.rs#0"), EdgeType::Duplicates)
                    .undirected(),
            ])
            .await
            .unwrap();
    }

    let store: Arc<dyn KvStore> = Arc::new(FileKvStore::open(tmp.path()).unwrap());
    let graph = RelationshipGraph::open(store, &GraphConfig::default())
        .await
        .unwrap();
    assert_eq!(graph.len(), 2);

    let touching = graph.edges_touching(&[id("proj/a.rs#0")]);
    assert_eq!(touching.len(), 2);
    let reference = touching
        .iter()
        .find(|e| e.edge_type == EdgeType::References)
        .unwrap();
    assert_eq!(reference.confidence, 0.7);
    assert_eq!(reference.discovered_by, Some(task));
}

#[tokio::test]
async fn undirected_edge_from_either_side_is_one_edge() {
    let graph = RelationshipGraph::new(&GraphConfig::default());
    graph
        .upsert_edges(vec![
            RelationshipEdge::new(id("p/x"), id("p/y"), EdgeType::Duplicates)
                .undirected()
                .with_confidence(0.3),
            RelationshipEdge::new(id("p/y"), id("p/x"), EdgeType::Duplicates)
                .undirected()
                .with_confidence(0.8),
        ])
        .await
        .unwrap();
    assert_eq!(graph.len(), 1);
    assert_eq!(graph.edges_touching(&[id("p/y")])[0].confidence, 0.8);
}

#[tokio::test]
async fn concurrent_upserts_of_same_key_converge() {
    let graph = Arc::new(RelationshipGraph::new(&GraphConfig::default()));
    let mut handles = Vec::new();
    for i in 0..16 {
        let graph = graph.clone();
        handles.push(tokio::spawn(async move {
            let confidence = i as f64 / 20.0;
            graph
                .upsert_edges(vec![RelationshipEdge::new(
                    id("p/a"),
                    id("p/b"),
                    EdgeType::References,
                )
                .with_confidence(confidence)])
                .await
                .unwrap();
        }));
    }
    for h in handles {
        h.await.unwrap();
    }
    assert_eq!(graph.len(), 1);
    // Max policy: the highest confidence wins regardless of interleaving.
    assert_eq!(graph.edges_touching(&[id("p/a")])[0].confidence, 15.0 / 20.0);
}

#[tokio::test]
async fn removed_edges_are_deleted_from_store() {
    let tmp = TempDir::new().unwrap();
    let store: Arc<dyn KvStore> = Arc::new(FileKvStore::open(tmp.path()).unwrap());
    let graph = RelationshipGraph::open(store.clone(), &GraphConfig::default())
        .await
        .unwrap();
    graph
        .upsert_edges(vec![RelationshipEdge::new(
            id("p/a"),
            id("p/b"),
            EdgeType::Contains,
        )])
        .await
        .unwrap();
    assert_eq!(graph.remove_edges_for(&id("p/b")).await.unwrap(), 1);
    assert!(store.scan(chunkflow_storage::NS_EDGES).await.unwrap().is_empty());
}
