use crate::{ChunkId, ContentId, DispatchError, RelationshipEdge, TaskId};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Everything a worker gets for one chunk.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerRequest {
    pub task_id: TaskId,
    pub chunk_id: ChunkId,
    pub content_id: ContentId,
    pub content: String,
    pub context: Option<String>,
    /// Relationship edges touching this chunk and its dependencies.
    pub context_edges: Vec<RelationshipEdge>,
    /// Payloads of the chunk's dependencies, keyed by their content id.
    pub dependency_results: BTreeMap<ContentId, serde_json::Value>,
    pub parameters: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerResponse {
    pub payload: serde_json::Value,
    #[serde(default)]
    pub discovered_edges: Vec<RelationshipEdge>,
    pub confidence: f64,
    #[serde(default)]
    pub error: Option<String>,
}

impl WorkerResponse {
    pub fn ok(payload: serde_json::Value, confidence: f64) -> Self {
        Self {
            payload,
            discovered_edges: Vec::new(),
            confidence,
            error: None,
        }
    }

    pub fn with_edges(mut self, edges: Vec<RelationshipEdge>) -> Self {
        self.discovered_edges = edges;
        self
    }

    /// Turn a worker-reported error into a failed attempt.
    pub fn into_result(self) -> Result<WorkerResponse, DispatchError> {
        match self.error {
            Some(message) => Err(DispatchError::Rejected(message)),
            None => Ok(self),
        }
    }
}

/// Boundary to external specialist processes. Implementations are opaque to the engine.
#[async_trait]
pub trait Worker: Send + Sync {
    fn name(&self) -> &str;

    async fn process(&self, request: WorkerRequest) -> Result<WorkerResponse, DispatchError>;
}
