use crate::{CheckpointStore, FinalResult, SynthesisEngine, TaskCheckpoint};
use chunkflow_cache::{CatalogEntry, CatalogKey, Lookup, MetadataCatalog};
use chunkflow_chunker::{ChunkGraph, Decomposer};
use chunkflow_core::{
    Chunk, ChunkId, ChunkResult, ChunkStatus, ChunkflowError, ContentId, CoordinatorConfig,
    DispatchError, Methodology, MethodologyRegistry, ResultSource, Result, Task, TaskId,
    TaskStatus, Worker, WorkerRequest, WorkerResponse,
};
use chunkflow_graph::RelationshipGraph;
use metrics::{counter, histogram};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Outcome of running (or resuming) a task to a terminal state.
#[derive(Debug, Clone)]
pub struct TaskResult {
    pub task: Task,
    /// Present for completed tasks, and for strict failures where partial output exists.
    pub result: Option<FinalResult>,
}

/// Services the coordinator shares with every task it runs.
#[derive(Clone)]
pub struct CoordinatorContext {
    pub config: CoordinatorConfig,
    pub worker: Arc<dyn Worker>,
    /// Bounded worker pool shared by all tasks.
    pub pool: Arc<Semaphore>,
    pub catalog: Arc<MetadataCatalog>,
    pub graph: Arc<RelationshipGraph>,
    pub checkpoints: CheckpointStore,
    pub decomposer: Decomposer,
    pub methodologies: Arc<MethodologyRegistry>,
}

/// Drives tasks through decomposition, dispatch and synthesis.
///
/// Each task runs as one sequential loop that owns all of the task's chunk state; only
/// worker calls run concurrently, bounded by the shared pool.
#[derive(Clone)]
pub struct LoopCoordinator {
    ctx: CoordinatorContext,
    synthesis: SynthesisEngine,
}

struct Attempt {
    chunk: ChunkId,
    outcome: std::result::Result<WorkerResponse, DispatchError>,
    elapsed: Duration,
}

enum Interrupt {
    Cancelled,
    TimedOut,
}

impl LoopCoordinator {
    pub fn new(ctx: CoordinatorContext) -> Self {
        Self {
            ctx,
            synthesis: SynthesisEngine::new(),
        }
    }

    pub fn context(&self) -> &CoordinatorContext {
        &self.ctx
    }

    /// Run a fresh task from `Pending` to a terminal state.
    pub async fn run(&self, task: Task, cancel: CancellationToken) -> Result<TaskResult> {
        let mut checkpoint = TaskCheckpoint::new(task);
        self.ctx.checkpoints.save(&mut checkpoint).await?;
        self.start(checkpoint, cancel).await
    }

    /// Continue a task from its last checkpoint. Chunks that were dispatched but never
    /// reported are redone; succeeded chunks are kept.
    pub async fn resume(&self, task_id: TaskId, cancel: CancellationToken) -> Result<TaskResult> {
        let mut checkpoint = self
            .ctx
            .checkpoints
            .load(task_id)
            .await?
            .ok_or(ChunkflowError::TaskNotFound(task_id))?;

        if checkpoint.task.status.is_terminal() {
            return Ok(TaskResult {
                task: checkpoint.task,
                result: checkpoint.result,
            });
        }
        info!(task_id = %task_id, status = %checkpoint.task.status, "Resuming task");

        if checkpoint.chunks.is_empty() {
            return self.start(checkpoint, cancel).await;
        }

        let methodology = self.ctx.methodologies.get(&checkpoint.task.methodology)?;
        let mut graph = self.ctx.checkpoints.restore(&checkpoint).await?;
        let redo: Vec<ChunkId> = graph
            .chunks()
            .iter()
            .filter(|c| c.status == ChunkStatus::Dispatched)
            .map(|c| c.id)
            .collect();
        for id in redo {
            if let Some(chunk) = graph.chunk_mut(id) {
                chunk.transition(ChunkStatus::Pending)?;
            }
        }
        self.ctx
            .checkpoints
            .save(&mut TaskCheckpoint::of_graph(&checkpoint.task, &graph, &BTreeSet::new()))
            .await?;
        self.drive(checkpoint.task, graph, methodology, cancel).await
    }

    async fn start(&self, checkpoint: TaskCheckpoint, cancel: CancellationToken) -> Result<TaskResult> {
        let mut task = checkpoint.task;
        let methodology = match self.ctx.methodologies.get(&task.methodology) {
            Ok(m) => m,
            Err(e) => {
                self.fail_early(&mut task, &e).await?;
                return Err(e);
            }
        };

        if task.status == TaskStatus::Pending {
            task.transition(TaskStatus::Decomposing)?;
            self.ctx
                .checkpoints
                .save(&mut TaskCheckpoint::new(task.clone()))
                .await?;
        }

        let graph = match self.ctx.decomposer.decompose(&task, &methodology).await {
            Ok(graph) => graph,
            Err(e) => {
                let e = ChunkflowError::from(e);
                self.fail_early(&mut task, &e).await?;
                return Err(e);
            }
        };

        self.ctx.checkpoints.save_plan(&graph).await?;
        task.transition(TaskStatus::Running)?;
        self.ctx
            .checkpoints
            .save(&mut TaskCheckpoint::of_graph(&task, &graph, &BTreeSet::new()))
            .await?;
        info!(task_id = %task.id, chunks = graph.len(), "Task running");
        self.drive(task, graph, methodology, cancel).await
    }

    async fn fail_early(&self, task: &mut Task, reason: &ChunkflowError) -> Result<()> {
        error!(task_id = %task.id, "Task failed before chunk work: {}", reason);
        task.fail(reason.to_string())?;
        self.ctx
            .checkpoints
            .save(&mut TaskCheckpoint::new(task.clone()))
            .await
    }

    async fn drive(
        &self,
        task: Task,
        graph: ChunkGraph,
        methodology: Arc<Methodology>,
        cancel: CancellationToken,
    ) -> Result<TaskResult> {
        let deadline = self.ctx.config.task_timeout().map(|t| Instant::now() + t);
        let mut run = TaskRun {
            ctx: &self.ctx,
            task,
            graph,
            methodology,
            ready: BTreeSet::new(),
            in_flight: JoinSet::new(),
            in_flight_ids: HashMap::new(),
            timers: JoinSet::new(),
            dispatch_cancel: cancel.child_token(),
        };

        let interrupt = run.run_loop(&cancel, deadline).await?;
        match interrupt {
            Some(Interrupt::Cancelled) => run.finish_cancelled().await,
            Some(Interrupt::TimedOut) => run.finish_timed_out().await,
            None => run.finish(&self.synthesis).await,
        }
    }
}

/// State of one task while its loop is running.
struct TaskRun<'a> {
    ctx: &'a CoordinatorContext,
    task: Task,
    graph: ChunkGraph,
    methodology: Arc<Methodology>,
    /// Chunks waiting for a pool slot, lowest id first.
    ready: BTreeSet<ChunkId>,
    in_flight: JoinSet<Attempt>,
    in_flight_ids: HashMap<tokio::task::Id, ChunkId>,
    /// Pending retries; each resolves to its chunk once the backoff has elapsed.
    timers: JoinSet<ChunkId>,
    /// Stops queued dispatches; running worker calls are drained separately.
    dispatch_cancel: CancellationToken,
}

impl TaskRun<'_> {
    fn chunk(&self, id: ChunkId) -> Result<&Chunk> {
        self.graph
            .chunk(id)
            .ok_or_else(|| ChunkflowError::InvalidOperation(format!("unknown {}", id)))
    }

    fn chunk_mut(&mut self, id: ChunkId) -> Result<&mut Chunk> {
        self.graph
            .chunk_mut(id)
            .ok_or_else(|| ChunkflowError::InvalidOperation(format!("unknown {}", id)))
    }

    async fn checkpoint(&self) -> Result<()> {
        self.ctx
            .checkpoints
            .save(&mut TaskCheckpoint::of_graph(&self.task, &self.graph, &self.ready))
            .await
    }

    fn dependencies_met(&self, chunk: &Chunk) -> bool {
        chunk.dependencies.iter().all(|d| {
            self.graph
                .chunk(*d)
                .map(|c| c.status == ChunkStatus::Succeeded)
                .unwrap_or(false)
        })
    }

    fn catalog_keys(&self, chunk: &Chunk) -> Vec<CatalogKey> {
        CatalogKey::for_levels(
            &self.methodology.catalog_levels,
            &chunk.content_id,
            &chunk.digest,
            &self.methodology.domain,
        )
    }

    /// Move every newly runnable chunk either straight to `Succeeded` from the catalog or
    /// into the ready queue. Repeats until nothing changes, since a hit can unlock
    /// dependents. Returns whether any chunk changed state.
    async fn promote_ready(&mut self) -> Result<bool> {
        let mut changed = false;
        loop {
            let candidates: Vec<ChunkId> = self
                .graph
                .chunks()
                .iter()
                .filter(|c| c.status == ChunkStatus::Pending && !self.ready.contains(&c.id))
                .filter(|c| self.dependencies_met(c))
                .map(|c| c.id)
                .collect();
            if candidates.is_empty() {
                return Ok(changed);
            }
            let mut hit_any = false;
            for id in candidates {
                if self.try_catalog(id).await? {
                    hit_any = true;
                } else {
                    self.ready.insert(id);
                }
                changed = true;
            }
            if !hit_any {
                return Ok(changed);
            }
        }
    }

    /// Consult the catalog levels in declared order. A valid hit completes the chunk. An
    /// inconsistent entry is invalidated and the chunk goes to a worker, whatever the
    /// remaining levels hold.
    async fn try_catalog(&mut self, id: ChunkId) -> Result<bool> {
        let chunk = self.chunk(id)?;
        let (digest, content_id) = (chunk.digest.clone(), chunk.content_id.clone());
        let producer = self.methodology.reference();

        for key in self.catalog_keys(chunk) {
            match self.ctx.catalog.lookup_valid(&key, &digest, &producer) {
                Ok(Lookup::Hit { entry, payload }) => {
                    let chunk = self.chunk_mut(id)?;
                    chunk.transition(ChunkStatus::Succeeded)?;
                    chunk.result = Some(ChunkResult {
                        payload,
                        confidence: entry.confidence,
                        source: ResultSource::Catalog,
                        digest,
                    });
                    counter!("chunkflow_catalog_hits_total").increment(1);
                    debug!(task_id = %self.task.id, chunk = %id, scope = %key.path, "Catalog hit");
                    return Ok(true);
                }
                Ok(Lookup::Miss) => {}
                Err(inconsistency) => {
                    warn!(
                        task_id = %self.task.id,
                        chunk = %id,
                        "Catalog inconsistency for {}: {}",
                        content_id,
                        inconsistency
                    );
                    counter!("chunkflow_catalog_inconsistencies_total").increment(1);
                    self.ctx.catalog.invalidate(&key).await?;
                    return Ok(false);
                }
            }
        }
        Ok(false)
    }

    fn build_request(&self, id: ChunkId) -> Result<WorkerRequest> {
        let chunk = self.chunk(id)?;
        let mut dependency_results = BTreeMap::new();
        let mut touching: Vec<ContentId> = vec![chunk.content_id.clone()];
        for dep in &chunk.dependencies {
            let dep = self.chunk(*dep)?;
            touching.push(dep.content_id.clone());
            if let Some(result) = &dep.result {
                dependency_results.insert(dep.content_id.clone(), result.payload.clone());
            }
        }
        Ok(WorkerRequest {
            task_id: self.task.id,
            chunk_id: id,
            content_id: chunk.content_id.clone(),
            content: chunk.content.clone(),
            context: chunk.context.clone(),
            context_edges: self.ctx.graph.edges_touching(&touching),
            dependency_results,
            parameters: self.methodology.parameters.clone(),
        })
    }

    fn spawn_dispatch(&mut self, id: ChunkId, permit: OwnedSemaphorePermit) -> Result<()> {
        let request = self.build_request(id)?;
        self.chunk_mut(id)?.transition(ChunkStatus::Dispatched)?;

        let worker = self.ctx.worker.clone();
        let timeout = self.ctx.config.dispatch_timeout();
        let handle = self.in_flight.spawn(async move {
            let started = Instant::now();
            let outcome = match tokio::time::timeout(timeout, worker.process(request)).await {
                Ok(outcome) => outcome.and_then(WorkerResponse::into_result),
                Err(_) => Err(DispatchError::Timeout(timeout)),
            };
            drop(permit);
            Attempt {
                chunk: id,
                outcome,
                elapsed: started.elapsed(),
            }
        });
        self.in_flight_ids.insert(handle.id(), id);
        counter!("chunkflow_dispatches_total").increment(1);
        debug!(task_id = %self.task.id, chunk = %id, "Dispatched");
        Ok(())
    }

    fn schedule_retry(&mut self, id: ChunkId, delay: Duration) {
        let cancel = self.dispatch_cancel.clone();
        self.timers.spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = cancel.cancelled() => {}
            }
            id
        });
    }

    async fn record_success(&mut self, id: ChunkId, response: WorkerResponse) -> Result<()> {
        let confidence = if response.confidence.is_nan() {
            0.0
        } else {
            response.confidence.clamp(0.0, 1.0)
        };
        let task_id = self.task.id;
        let chunk = self.chunk_mut(id)?;
        chunk.transition(ChunkStatus::Succeeded)?;
        chunk.last_error = None;
        chunk.result = Some(ChunkResult {
            payload: response.payload.clone(),
            confidence,
            source: ResultSource::Worker,
            digest: chunk.digest.clone(),
        });
        let content_id = chunk.content_id.clone();
        let digest = chunk.digest.clone();
        let keys = self.catalog_keys(self.chunk(id)?);

        for key in keys {
            let entry = CatalogEntry::new(
                content_id.clone(),
                digest.clone(),
                &response.payload,
                self.methodology.reference(),
                confidence,
            );
            if let Err(e) = self.ctx.catalog.put(&key, entry).await {
                warn!(task_id = %task_id, chunk = %id, "Catalog write failed for {}: {}", key, e);
            }
        }

        if !response.discovered_edges.is_empty() {
            let edges = response
                .discovered_edges
                .into_iter()
                .map(|e| e.discovered_by(task_id));
            match self.ctx.graph.upsert_edges(edges).await {
                Ok(stats) if stats.rejected > 0 => {
                    warn!(task_id = %task_id, chunk = %id, "Dropped {} discovered edges with NaN confidence", stats.rejected);
                }
                Ok(_) => {}
                Err(e) => {
                    warn!(task_id = %task_id, chunk = %id, "Edge write failed: {}", e);
                }
            }
        }
        debug!(task_id = %task_id, chunk = %id, "Chunk succeeded");
        Ok(())
    }

    /// A failed attempt: retry with backoff, or fail the chunk and skip its dependents.
    fn record_failure(&mut self, id: ChunkId, err: DispatchError) -> Result<()> {
        let ctx = self.ctx;
        let config = &ctx.config;
        let task_id = self.task.id;
        let chunk = self.chunk_mut(id)?;
        chunk.last_error = Some(err.to_string());

        if chunk.retry_count < config.max_retries {
            let delay = config.backoff(chunk.retry_count);
            chunk.retry_count += 1;
            let attempt = chunk.retry_count;
            counter!("chunkflow_retries_total").increment(1);
            warn!(
                task_id = %task_id,
                chunk = %id,
                attempt,
                "Dispatch failed ({}), retrying in {:?}",
                err,
                delay
            );
            self.schedule_retry(id, delay);
            return Ok(());
        }

        chunk.transition(ChunkStatus::Failed)?;
        counter!("chunkflow_chunks_failed_total").increment(1);
        error!(task_id = %task_id, chunk = %id, "Chunk failed: {}", err);

        for dependent in self.graph.dependents(id) {
            let chunk = self.chunk_mut(dependent)?;
            if chunk.status == ChunkStatus::Pending {
                chunk.transition(ChunkStatus::Skipped)?;
                chunk.last_error = Some(format!("dependency {} failed", id));
            }
            self.ready.remove(&dependent);
        }
        Ok(())
    }

    async fn handle_attempt(
        &mut self,
        joined: std::result::Result<(tokio::task::Id, Attempt), tokio::task::JoinError>,
        retry: bool,
    ) -> Result<()> {
        let (id, outcome) = match joined {
            Ok((task_id, attempt)) => {
                self.in_flight_ids.remove(&task_id);
                histogram!("chunkflow_dispatch_seconds").record(attempt.elapsed.as_secs_f64());
                (attempt.chunk, attempt.outcome)
            }
            Err(join_error) => {
                let Some(id) = self.in_flight_ids.remove(&join_error.id()) else {
                    return Ok(());
                };
                let err = if join_error.is_cancelled() {
                    DispatchError::Abandoned
                } else {
                    DispatchError::Unreachable(format!("worker panicked: {}", join_error))
                };
                (id, Err(err))
            }
        };

        match outcome {
            Ok(response) => self.record_success(id, response).await,
            Err(err) if retry => self.record_failure(id, err),
            Err(err) => {
                // draining after cancellation: the chunk is left for a later resume
                let chunk = self.chunk_mut(id)?;
                chunk.last_error = Some(err.to_string());
                chunk.transition(ChunkStatus::Pending)
            }
        }
    }

    fn is_idle(&self) -> bool {
        self.ready.is_empty() && self.in_flight.is_empty() && self.timers.is_empty()
    }

    async fn run_loop(
        &mut self,
        cancel: &CancellationToken,
        deadline: Option<Instant>,
    ) -> Result<Option<Interrupt>> {
        let deadline_sleep = async move {
            match deadline {
                Some(at) => tokio::time::sleep_until(at.into()).await,
                None => std::future::pending::<()>().await,
            }
        };
        tokio::pin!(deadline_sleep);

        loop {
            if self.promote_ready().await? {
                self.checkpoint().await?;
            }
            if self.is_idle() {
                return Ok(None);
            }

            let pool = self.ctx.pool.clone();
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Ok(Some(Interrupt::Cancelled)),
                _ = &mut deadline_sleep => return Ok(Some(Interrupt::TimedOut)),
                Some(joined) = self.in_flight.join_next_with_id(), if !self.in_flight.is_empty() => {
                    self.handle_attempt(joined, true).await?;
                }
                Some(timer) = self.timers.join_next(), if !self.timers.is_empty() => {
                    if let Ok(id) = timer {
                        if self.chunk(id)?.status == ChunkStatus::Dispatched {
                            self.ready.insert(id);
                        }
                    }
                }
                permit = pool.acquire_owned(), if !self.ready.is_empty() => {
                    let permit = permit.map_err(|_| {
                        ChunkflowError::InvalidOperation("worker pool closed".into())
                    })?;
                    if let Some(id) = self.ready.pop_first() {
                        self.spawn_dispatch(id, permit)?;
                    }
                }
            }
            self.checkpoint().await?;
        }
    }

    /// Put chunks that never got a result back to `Pending` so a resume redoes them.
    fn release_unfinished(&mut self) -> Result<()> {
        self.ready.clear();
        let ids: Vec<ChunkId> = self
            .graph
            .chunks()
            .iter()
            .filter(|c| c.status == ChunkStatus::Dispatched)
            .map(|c| c.id)
            .collect();
        for id in ids {
            self.chunk_mut(id)?.transition(ChunkStatus::Pending)?;
        }
        Ok(())
    }

    async fn finish_cancelled(mut self) -> Result<TaskResult> {
        self.dispatch_cancel.cancel();
        self.timers.abort_all();
        info!(task_id = %self.task.id, in_flight = self.in_flight.len(), "Cancelling task, draining dispatches");

        let drain = self.ctx.config.drain_timeout();
        let drained = tokio::time::timeout(drain, async {
            while let Some(joined) = self.in_flight.join_next_with_id().await {
                self.handle_attempt(joined, false).await?;
            }
            Ok::<(), ChunkflowError>(())
        })
        .await;
        match drained {
            Ok(result) => result?,
            Err(_) => {
                warn!(task_id = %self.task.id, "Drain timeout elapsed, abandoning dispatches");
                self.in_flight.abort_all();
            }
        }

        self.release_unfinished()?;
        self.task.transition(TaskStatus::Cancelled)?;
        self.checkpoint().await?;
        info!(task_id = %self.task.id, "Task cancelled");
        Ok(TaskResult {
            task: self.task,
            result: None,
        })
    }

    async fn finish_timed_out(mut self) -> Result<TaskResult> {
        self.dispatch_cancel.cancel();
        self.timers.abort_all();
        self.in_flight.abort_all();
        self.release_unfinished()?;
        let reason = format!(
            "task exceeded its timeout of {:?}",
            self.ctx.config.task_timeout().unwrap_or_default()
        );
        self.task.fail(reason)?;
        self.checkpoint().await?;
        error!(task_id = %self.task.id, "Task timed out");
        Err(ChunkflowError::TaskTimeout(self.task.id))
    }

    async fn finish(mut self, synthesis: &SynthesisEngine) -> Result<TaskResult> {
        self.task.transition(TaskStatus::Synthesizing)?;
        self.checkpoint().await?;

        let result = match synthesis.synthesize(
            self.task.id,
            &self.methodology,
            &self.graph,
            &self.ctx.graph,
        ) {
            Ok(result) => result,
            Err(e) => {
                self.task.fail(e.to_string())?;
                self.checkpoint().await?;
                error!(task_id = %self.task.id, "Synthesis failed: {}", e);
                return Err(e.into());
            }
        };

        let failed = result
            .gaps
            .iter()
            .filter(|g| g.status == ChunkStatus::Failed)
            .count();
        let unread = self.graph.unread().len();
        if !result.is_complete() && self.methodology.require_all_succeed && !self.task.tolerate_partial
        {
            let mut reason = format!(
                "{} of {} chunks were not analysed ({} failed)",
                result.gaps.len() - unread,
                self.graph.len(),
                failed
            );
            if unread > 0 {
                reason.push_str(&format!(", {} input units could not be read", unread));
            }
            self.task.fail(reason)?;
        } else {
            self.task.transition(TaskStatus::Completed)?;
        }

        let mut checkpoint = TaskCheckpoint::of_graph(&self.task, &self.graph, &BTreeSet::new());
        checkpoint.result = Some(result.clone());
        self.ctx.checkpoints.save(&mut checkpoint).await?;
        info!(
            task_id = %self.task.id,
            status = %self.task.status,
            gaps = result.gaps.len(),
            "Task finished"
        );
        Ok(TaskResult {
            task: self.task,
            result: Some(result),
        })
    }
}
