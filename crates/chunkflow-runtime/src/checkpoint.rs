use crate::FinalResult;
use chrono::{DateTime, Utc};
use chunkflow_chunker::ChunkGraph;
use chunkflow_core::{
    Chunk, ChunkId, ChunkResult, ChunkStatus, ChunkflowError, Result, Task, TaskId,
};
use chunkflow_storage::{KvStore, KvStoreExt, NS_PLANS, NS_TASKS};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::{debug, warn};

/// What changes about a chunk while its task runs. Content, ranges and dependencies are
/// fixed at decomposition and live in the task's plan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkState {
    pub id: ChunkId,
    pub status: ChunkStatus,
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default)]
    pub last_error: Option<String>,
    #[serde(default)]
    pub result: Option<ChunkResult>,
}

impl ChunkState {
    pub fn of(chunk: &Chunk) -> Self {
        Self {
            id: chunk.id,
            status: chunk.status,
            retry_count: chunk.retry_count,
            last_error: chunk.last_error.clone(),
            result: chunk.result.clone(),
        }
    }

    fn apply_to(&self, chunk: &mut Chunk) {
        chunk.status = self.status;
        chunk.retry_count = self.retry_count;
        chunk.last_error = self.last_error.clone();
        chunk.result = self.result.clone();
    }
}

/// Durable snapshot of a task: enough to resume it or report on it after a restart,
/// together with the plan written once by [`CheckpointStore::save_plan`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskCheckpoint {
    pub task: Task,
    /// Empty until decomposition has finished.
    #[serde(default)]
    pub chunks: Vec<ChunkState>,
    #[serde(default)]
    pub ready: Vec<ChunkId>,
    #[serde(default)]
    pub result: Option<FinalResult>,
    pub saved_at: DateTime<Utc>,
}

impl TaskCheckpoint {
    pub fn new(task: Task) -> Self {
        Self {
            task,
            chunks: Vec::new(),
            ready: Vec::new(),
            result: None,
            saved_at: Utc::now(),
        }
    }

    /// Snapshot of a running task's chunk states.
    pub fn of_graph(task: &Task, graph: &ChunkGraph, ready: &BTreeSet<ChunkId>) -> Self {
        let mut checkpoint = Self::new(task.clone());
        checkpoint.chunks = graph.chunks().iter().map(ChunkState::of).collect();
        checkpoint.ready = ready.iter().copied().collect();
        checkpoint
    }

    pub fn chunk_counts(&self) -> BTreeMap<ChunkStatus, usize> {
        let mut counts = BTreeMap::new();
        for chunk in &self.chunks {
            *counts.entry(chunk.status).or_insert(0) += 1;
        }
        counts
    }
}

/// Checkpoints kept in the `tasks` namespace of a [`KvStore`], plans in `plans`.
#[derive(Clone)]
pub struct CheckpointStore {
    store: Arc<dyn KvStore>,
}

impl CheckpointStore {
    pub fn new(store: Arc<dyn KvStore>) -> Self {
        Self { store }
    }

    pub async fn save(&self, checkpoint: &mut TaskCheckpoint) -> Result<()> {
        checkpoint.saved_at = Utc::now();
        self.store
            .put_json(NS_TASKS, &checkpoint.task.id.to_string(), checkpoint)
            .await?;
        debug!(
            task_id = %checkpoint.task.id,
            status = %checkpoint.task.status,
            "Checkpoint saved"
        );
        Ok(())
    }

    pub async fn load(&self, task_id: TaskId) -> Result<Option<TaskCheckpoint>> {
        Ok(self.store.get_json(NS_TASKS, &task_id.to_string()).await?)
    }

    /// Store a task's decomposition. Written once, before the first chunk state.
    pub async fn save_plan(&self, graph: &ChunkGraph) -> Result<()> {
        self.store
            .put_json(NS_PLANS, &graph.task_id().to_string(), graph)
            .await?;
        debug!(task_id = %graph.task_id(), chunks = graph.len(), "Plan saved");
        Ok(())
    }

    pub async fn load_plan(&self, task_id: TaskId) -> Result<Option<ChunkGraph>> {
        let Some(plan) = self
            .store
            .get_json::<ChunkGraph>(NS_PLANS, &task_id.to_string())
            .await?
        else {
            return Ok(None);
        };
        let unread = plan.unread().to_vec();
        let graph = ChunkGraph::from_chunks(task_id, plan.into_chunks())?.with_unread(unread);
        Ok(Some(graph))
    }

    /// The task's plan with the chunk states of `checkpoint` applied.
    pub async fn restore(&self, checkpoint: &TaskCheckpoint) -> Result<ChunkGraph> {
        let task_id = checkpoint.task.id;
        let mut graph = self.load_plan(task_id).await?.ok_or_else(|| {
            ChunkflowError::InvalidOperation(format!("task {} has no stored plan", task_id))
        })?;
        if graph.len() != checkpoint.chunks.len() {
            return Err(ChunkflowError::InvalidOperation(format!(
                "checkpoint of task {} has {} chunk states for a plan of {} chunks",
                task_id,
                checkpoint.chunks.len(),
                graph.len()
            )));
        }
        for state in &checkpoint.chunks {
            let chunk = graph.chunk_mut(state.id).ok_or_else(|| {
                ChunkflowError::InvalidOperation(format!(
                    "checkpoint of task {} names unknown {}",
                    task_id, state.id
                ))
            })?;
            state.apply_to(chunk);
        }
        Ok(graph)
    }

    /// Every stored checkpoint, ordered by task id.
    pub async fn list(&self) -> Result<Vec<TaskCheckpoint>> {
        let mut out = Vec::new();
        for (key, value) in self.store.scan(NS_TASKS).await? {
            match serde_json::from_value(value) {
                Ok(checkpoint) => out.push(checkpoint),
                Err(e) => warn!("Skipping unreadable checkpoint {}: {}", key, e),
            }
        }
        Ok(out)
    }

    /// Forget a task and its plan. Returns whether a checkpoint existed.
    pub async fn remove(&self, task_id: TaskId) -> Result<bool> {
        let key = task_id.to_string();
        self.store.delete(NS_PLANS, &key).await?;
        Ok(self.store.delete(NS_TASKS, &key).await?)
    }
}
