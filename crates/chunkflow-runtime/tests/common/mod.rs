#![allow(dead_code)]

use async_trait::async_trait;
use chunkflow_cache::MetadataCatalog;
use chunkflow_chunker::{
    Decomposer, DefaultInputResolver, FsInputResolver, InputUnit, MemoryInputResolver,
};
use chunkflow_core::{
    ContentId, CoordinatorConfig, DependencyRule, DispatchError, GraphConfig, Methodology,
    MethodologyRegistry, RelationshipEdge, Worker, WorkerRequest, WorkerResponse,
};
use chunkflow_graph::RelationshipGraph;
use chunkflow_runtime::{CheckpointStore, CoordinatorContext};
use chunkflow_storage::KvStore;
use parking_lot::Mutex;
use serde_json::{Map, Value};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;

/// Worker whose behaviour is keyed on substrings of the chunk content.
#[derive(Default)]
pub struct ScriptedWorker {
    failing: Vec<String>,
    stall_once: Mutex<HashSet<String>>,
    delay: Duration,
    edges: Vec<(String, RelationshipEdge)>,
    calls: Mutex<Vec<WorkerRequest>>,
}

impl ScriptedWorker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every attempt on a chunk containing `marker` is rejected.
    pub fn failing(mut self, marker: &str) -> Self {
        self.failing.push(marker.to_string());
        self
    }

    /// The first attempt on a chunk containing `marker` never returns.
    pub fn stall_once(self, marker: &str) -> Self {
        self.stall_once.lock().insert(marker.to_string());
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Report `edge` whenever a chunk containing `marker` succeeds.
    pub fn with_edge(mut self, marker: &str, edge: RelationshipEdge) -> Self {
        self.edges.push((marker.to_string(), edge));
        self
    }

    pub fn calls(&self) -> Vec<WorkerRequest> {
        self.calls.lock().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().len()
    }

    pub fn calls_containing(&self, marker: &str) -> usize {
        self.calls
            .lock()
            .iter()
            .filter(|r| r.content.contains(marker))
            .count()
    }

    /// Poll until at least `n` dispatches have started.
    pub async fn wait_for_calls(&self, n: usize) {
        tokio::time::timeout(Duration::from_secs(10), async {
            while self.call_count() < n {
                tokio::time::sleep(Duration::from_millis(2)).await;
            }
        })
        .await
        .expect("worker never saw the expected number of calls");
    }
}

#[async_trait]
impl Worker for ScriptedWorker {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn process(&self, request: WorkerRequest) -> Result<WorkerResponse, DispatchError> {
        self.calls.lock().push(request.clone());

        let stall = {
            let mut stall_once = self.stall_once.lock();
            let hit = stall_once
                .iter()
                .find(|m| request.content.contains(m.as_str()))
                .cloned();
            hit.map(|m| stall_once.remove(&m)).unwrap_or(false)
        };
        if stall {
            tokio::time::sleep(Duration::from_secs(3600)).await;
        }
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        if self.failing.iter().any(|m| request.content.contains(m.as_str())) {
            return Err(DispatchError::Rejected(format!(
                "cannot analyse {}",
                request.content_id
            )));
        }

        let mut payload = Map::new();
        payload.insert(
            request.content_id.to_string(),
            Value::String(request.content.trim_end().to_string()),
        );
        let edges = self
            .edges
            .iter()
            .filter(|(m, _)| request.content.contains(m.as_str()))
            .map(|(_, e)| e.clone())
            .collect();
        Ok(WorkerResponse::ok(Value::Object(payload), 0.9).with_edges(edges))
    }
}

pub fn fast_config() -> CoordinatorConfig {
    CoordinatorConfig {
        max_retries: 2,
        retry_base_ms: 1,
        retry_max_ms: 5,
        dispatch_timeout_ms: 2_000,
        task_timeout_ms: None,
        drain_timeout_ms: 2_000,
    }
}

/// Nine line-sized chunks in `a.txt` that depend on their predecessor, and one
/// independent chunk in `b.txt`.
pub fn ten_chunk_units() -> Vec<InputUnit> {
    let a: String = (1..=9).map(|i| format!("line-{:02}\n", i)).collect();
    vec![InputUnit::new("a.txt", a), InputUnit::new("b.txt", "solo-10\n")]
}

/// One chunk per 8-byte line, sequential within each unit, all chunks required.
pub fn scenario_methodology() -> Methodology {
    let mut m = Methodology::lines(8);
    m.name = "scenario".into();
    m
}

/// Like [`scenario_methodology`] but one chain across all units and no catalog, so every
/// chunk is dispatched exactly once per run.
pub fn replay_methodology() -> Methodology {
    let mut m = Methodology::lines(8);
    m.name = "replay".into();
    m.dependencies = DependencyRule::Chain;
    m.catalog_levels = Vec::new();
    m.require_all_succeed = false;
    m
}

pub fn content_id(s: &str) -> ContentId {
    ContentId::new(s)
}

pub fn context(
    worker: Arc<ScriptedWorker>,
    config: CoordinatorConfig,
    workers: usize,
    store: Arc<dyn KvStore>,
    inputs: Arc<MemoryInputResolver>,
) -> CoordinatorContext {
    let methodologies = MethodologyRegistry::with_builtins(4096);
    methodologies.register(scenario_methodology()).unwrap();
    methodologies.register(replay_methodology()).unwrap();
    CoordinatorContext {
        config,
        worker,
        pool: Arc::new(Semaphore::new(workers)),
        catalog: Arc::new(MetadataCatalog::new()),
        graph: Arc::new(RelationshipGraph::new(&GraphConfig::default())),
        checkpoints: CheckpointStore::new(store),
        decomposer: Decomposer::new(Arc::new(DefaultInputResolver::new(
            FsInputResolver::new(),
            inputs,
        ))),
        methodologies: Arc::new(methodologies),
    }
}
