use crate::{
    CheckpointStore, CoordinatorContext, FinalResult, LoopCoordinator, TaskCheckpoint, TaskResult,
};
use chrono::{DateTime, Utc};
use chunkflow_cache::MetadataCatalog;
use chunkflow_chunker::{
    ChunkGraph, Decomposer, DefaultInputResolver, FsInputResolver, InputUnit,
    MemoryInputResolver,
};
use chunkflow_core::{
    ByteRange, Chunk, ChunkId, ChunkStatus, ChunkflowError, ContentId, InputRef, MethodologyRef,
    MethodologyRegistry, Result, ResultSource, Settings, Task, TaskId, TaskStatus, Worker,
};
use chunkflow_graph::RelationshipGraph;
use chunkflow_storage::{open_store, KvStore};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::{watch, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRequest {
    pub input: InputRef,
    /// `name` for the latest version, or `name@version`.
    pub methodology: String,
    #[serde(default)]
    pub tolerate_partial: bool,
}

impl TaskRequest {
    pub fn new(input: InputRef, methodology: impl Into<String>) -> Self {
        Self {
            input,
            methodology: methodology.into(),
            tolerate_partial: false,
        }
    }

    pub fn tolerate_partial(mut self, tolerate: bool) -> Self {
        self.tolerate_partial = tolerate;
        self
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ChunkProgress {
    pub chunk: ChunkId,
    pub content_id: ContentId,
    pub unit: ContentId,
    pub range: ByteRange,
    pub status: ChunkStatus,
    pub retry_count: u32,
    pub last_error: Option<String>,
    pub source: Option<ResultSource>,
}

/// Snapshot of a task as of its latest checkpoint.
#[derive(Debug, Clone, Serialize)]
pub struct TaskStatusReport {
    pub task_id: TaskId,
    pub status: TaskStatus,
    pub methodology: MethodologyRef,
    pub failure: Option<String>,
    /// Whether a loop in this process currently owns the task.
    pub running: bool,
    pub progress: BTreeMap<ChunkStatus, usize>,
    pub chunks: Vec<ChunkProgress>,
    /// Payloads of succeeded chunks so far; only for tasks that tolerate partial results.
    pub partial_results: Option<BTreeMap<ContentId, Value>>,
    pub result: Option<FinalResult>,
    pub updated_at: DateTime<Utc>,
}

impl TaskStatusReport {
    /// `plan` is the task's chunk graph with the checkpoint's states applied, absent
    /// before decomposition has finished.
    fn from_checkpoint(checkpoint: TaskCheckpoint, plan: Option<ChunkGraph>, running: bool) -> Self {
        let progress = checkpoint.chunk_counts();
        let chunks: &[Chunk] = plan.as_ref().map(|g| g.chunks()).unwrap_or_default();
        let partial_results = checkpoint.task.tolerate_partial.then(|| {
            chunks
                .iter()
                .filter_map(|c| {
                    c.result
                        .as_ref()
                        .map(|r| (c.content_id.clone(), r.payload.clone()))
                })
                .collect()
        });
        let chunks = chunks
            .iter()
            .map(|c| ChunkProgress {
                chunk: c.id,
                content_id: c.content_id.clone(),
                unit: c.unit.clone(),
                range: c.range,
                status: c.status,
                retry_count: c.retry_count,
                last_error: c.last_error.clone(),
                source: c.result.as_ref().map(|r| r.source),
            })
            .collect();
        Self {
            task_id: checkpoint.task.id,
            status: checkpoint.task.status,
            methodology: checkpoint.task.methodology,
            failure: checkpoint.task.failure,
            running,
            progress,
            chunks,
            partial_results,
            result: checkpoint.result,
            updated_at: checkpoint.saved_at,
        }
    }

    /// Share of chunks in a terminal state, 0.0 before decomposition.
    pub fn completed_fraction(&self) -> f64 {
        if self.chunks.is_empty() {
            return 0.0;
        }
        let done = self.chunks.iter().filter(|c| c.status.is_terminal()).count();
        done as f64 / self.chunks.len() as f64
    }
}

struct RunningTask {
    cancel: CancellationToken,
    done: watch::Receiver<bool>,
}

/// Entry point for callers: submits tasks, reports on them and controls their runs.
#[derive(Clone)]
pub struct TaskService {
    coordinator: LoopCoordinator,
    inputs: Arc<MemoryInputResolver>,
    running: Arc<DashMap<TaskId, RunningTask>>,
}

impl TaskService {
    pub fn new(coordinator: LoopCoordinator, inputs: Arc<MemoryInputResolver>) -> Self {
        Self {
            coordinator,
            inputs,
            running: Arc::new(DashMap::new()),
        }
    }

    /// Build a service on the storage backend selected by `settings`.
    pub async fn open(settings: &Settings, worker: Arc<dyn Worker>) -> Result<Self> {
        let store = open_store(&settings.storage)?;
        Self::with_store(settings, store, worker).await
    }

    pub async fn with_store(
        settings: &Settings,
        store: Arc<dyn KvStore>,
        worker: Arc<dyn Worker>,
    ) -> Result<Self> {
        let methodologies = MethodologyRegistry::with_builtins(settings.chunking.max_chunk_bytes);
        for methodology in &settings.methodologies {
            methodologies.register(methodology.clone())?;
        }
        let graph = RelationshipGraph::open(store.clone(), &settings.graph).await?;
        let catalog = MetadataCatalog::open(store.clone()).await?;
        let inputs = Arc::new(MemoryInputResolver::new());
        let resolver = DefaultInputResolver::new(FsInputResolver::new(), inputs.clone());

        let ctx = CoordinatorContext {
            config: settings.coordinator.clone(),
            worker,
            pool: Arc::new(Semaphore::new(settings.pool.workers)),
            catalog: Arc::new(catalog),
            graph: Arc::new(graph),
            checkpoints: CheckpointStore::new(store),
            decomposer: Decomposer::new(Arc::new(resolver)),
            methodologies: Arc::new(methodologies),
        };
        info!(
            workers = settings.pool.workers,
            methodologies = ctx.methodologies.list().len(),
            "Task service ready"
        );
        Ok(Self::new(LoopCoordinator::new(ctx), inputs))
    }

    pub fn context(&self) -> &CoordinatorContext {
        self.coordinator.context()
    }

    pub fn methodologies(&self) -> &MethodologyRegistry {
        &self.context().methodologies
    }

    /// Make an in-memory corpus available as `InputRef::Memory(name)`.
    pub fn register_input(&self, name: impl Into<String>, units: Vec<InputUnit>) {
        self.inputs.insert(name, units);
    }

    /// Validate the request, persist the new task and start its run in the background.
    pub async fn submit(&self, request: TaskRequest) -> Result<TaskId> {
        let methodology = self.methodologies().resolve(&request.methodology)?;
        let task = Task::new(
            request.input,
            methodology.reference(),
            request.tolerate_partial,
        );
        let task_id = task.id;
        self.context()
            .checkpoints
            .save(&mut TaskCheckpoint::new(task.clone()))
            .await?;
        info!(
            task_id = %task_id,
            input = %task.input,
            methodology = %task.methodology,
            "Task submitted"
        );

        let coordinator = self.coordinator.clone();
        self.spawn(task_id, move |cancel| async move {
            coordinator.run(task, cancel).await
        });
        Ok(task_id)
    }

    /// Continue a non-terminal task from its checkpoint, e.g. after a restart.
    pub async fn resume(&self, task_id: TaskId) -> Result<()> {
        if self.running.contains_key(&task_id) {
            return Err(ChunkflowError::InvalidOperation(format!(
                "task {} is already running",
                task_id
            )));
        }
        let checkpoint = self.load(task_id).await?;
        if checkpoint.task.status.is_terminal() {
            return Err(ChunkflowError::InvalidOperation(format!(
                "task {} is already {}",
                task_id, checkpoint.task.status
            )));
        }
        let coordinator = self.coordinator.clone();
        self.spawn(task_id, move |cancel| async move {
            coordinator.resume(task_id, cancel).await
        });
        Ok(())
    }

    /// Resume every stored task that is neither terminal nor running.
    pub async fn resume_all(&self) -> Result<Vec<TaskId>> {
        let mut resumed = Vec::new();
        for checkpoint in self.context().checkpoints.list().await? {
            let task_id = checkpoint.task.id;
            if checkpoint.task.status.is_terminal() || self.running.contains_key(&task_id) {
                continue;
            }
            self.resume(task_id).await?;
            resumed.push(task_id);
        }
        if !resumed.is_empty() {
            info!("Resumed {} interrupted tasks", resumed.len());
        }
        Ok(resumed)
    }

    fn spawn<F, Fut>(&self, task_id: TaskId, run: F)
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = Result<TaskResult>> + Send + 'static,
    {
        let cancel = CancellationToken::new();
        let (done_tx, done_rx) = watch::channel(false);
        self.running.insert(
            task_id,
            RunningTask {
                cancel: cancel.clone(),
                done: done_rx,
            },
        );

        let running = self.running.clone();
        let run = run(cancel);
        tokio::spawn(async move {
            match run.await {
                Ok(outcome) => {
                    debug!(task_id = %task_id, status = %outcome.task.status, "Task run ended")
                }
                Err(e) => warn!(task_id = %task_id, "Task run ended with error: {}", e),
            }
            running.remove(&task_id);
            let _ = done_tx.send(true);
        });
    }

    async fn load(&self, task_id: TaskId) -> Result<TaskCheckpoint> {
        self.context()
            .checkpoints
            .load(task_id)
            .await?
            .ok_or(ChunkflowError::TaskNotFound(task_id))
    }

    pub async fn status(&self, task_id: TaskId) -> Result<TaskStatusReport> {
        let checkpoint = self.load(task_id).await?;
        let plan = if checkpoint.chunks.is_empty() {
            None
        } else {
            Some(self.context().checkpoints.restore(&checkpoint).await?)
        };
        Ok(TaskStatusReport::from_checkpoint(
            checkpoint,
            plan,
            self.running.contains_key(&task_id),
        ))
    }

    /// Every stored task, ordered by task id.
    pub async fn list(&self) -> Result<Vec<Task>> {
        Ok(self
            .context()
            .checkpoints
            .list()
            .await?
            .into_iter()
            .map(|c| c.task)
            .collect())
    }

    /// Request cancellation. Returns false when the task had already ended.
    pub async fn cancel(&self, task_id: TaskId) -> Result<bool> {
        let token = self.running.get(&task_id).map(|r| r.cancel.clone());
        if let Some(token) = token {
            token.cancel();
            info!(task_id = %task_id, "Cancellation requested");
            return Ok(true);
        }

        let mut checkpoint = self.load(task_id).await?;
        if checkpoint.task.status.is_terminal() {
            return Ok(false);
        }
        // no loop owns the task, so the checkpoint is updated directly
        for chunk in &mut checkpoint.chunks {
            if chunk.status == ChunkStatus::Dispatched {
                chunk.status = ChunkStatus::Pending;
            }
        }
        checkpoint.ready.clear();
        checkpoint.task.transition(TaskStatus::Cancelled)?;
        self.context().checkpoints.save(&mut checkpoint).await?;
        info!(task_id = %task_id, "Cancelled interrupted task");
        Ok(true)
    }

    /// Wait for the task's current run to end and return its outcome. A task that is not
    /// running is reported as of its checkpoint right away.
    pub async fn wait(&self, task_id: TaskId) -> Result<TaskResult> {
        let done = self.running.get(&task_id).map(|r| r.done.clone());
        if let Some(mut done) = done {
            while !*done.borrow_and_update() {
                if done.changed().await.is_err() {
                    break;
                }
            }
        }
        let checkpoint = self.load(task_id).await?;
        Ok(TaskResult {
            task: checkpoint.task,
            result: checkpoint.result,
        })
    }

    /// Drop a finished task's checkpoint. Running tasks must be cancelled first.
    pub async fn remove(&self, task_id: TaskId) -> Result<bool> {
        if self.running.contains_key(&task_id) {
            return Err(ChunkflowError::InvalidOperation(format!(
                "task {} is still running",
                task_id
            )));
        }
        let removed = self.context().checkpoints.remove(task_id).await?;
        if removed {
            debug!(task_id = %task_id, "Task removed");
        }
        Ok(removed)
    }
}
