mod common;

use chunkflow_cache::{CatalogKey, ScopePath};
use chunkflow_chunker::InputUnit;
use chunkflow_core::{
    content_digest, CatalogInconsistency, ChunkStatus, ChunkflowError, ContentId, InputRef,
    MethodologyRef, ResultSource, Settings, TaskId, TaskStatus,
};
use chunkflow_runtime::{TaskRequest, TaskService};
use chunkflow_storage::MemoryKvStore;
use common::*;
use std::sync::Arc;
use std::time::Duration;

fn settings(workers: usize) -> Settings {
    let mut settings = Settings::default();
    settings.pool.workers = workers;
    settings.coordinator = fast_config();
    settings.methodologies = vec![scenario_methodology()];
    settings
}

async fn service(worker: Arc<ScriptedWorker>, workers: usize) -> TaskService {
    TaskService::with_store(&settings(workers), Arc::new(MemoryKvStore::new()), worker)
        .await
        .unwrap()
}

fn sources() -> Vec<InputUnit> {
    vec![
        InputUnit::new("src/lib.rs", "pub mod parser;\n"),
        InputUnit::new("src/parser.rs", "pub fn parse() {}\n"),
        InputUnit::new("src/main.rs", "fn main() {}\n"),
    ]
}

#[tokio::test]
async fn identical_content_is_served_from_the_catalog() {
    let worker = Arc::new(ScriptedWorker::new());
    let service = service(worker.clone(), 2).await;
    service.register_input("proj", sources());
    service.register_input("mirror", sources());

    let first = service
        .submit(TaskRequest::new(InputRef::Memory("proj".into()), "files"))
        .await
        .unwrap();
    let done = service.wait(first).await.unwrap();
    assert_eq!(done.task.status, TaskStatus::Completed);
    assert_eq!(worker.call_count(), 3);

    // same project: project-level hits
    let second = service
        .submit(TaskRequest::new(InputRef::Memory("proj".into()), "files"))
        .await
        .unwrap();
    assert_eq!(service.wait(second).await.unwrap().task.status, TaskStatus::Completed);
    // different project, same bytes: global-level hits by digest
    let third = service
        .submit(TaskRequest::new(InputRef::Memory("mirror".into()), "files@1"))
        .await
        .unwrap();
    assert_eq!(service.wait(third).await.unwrap().task.status, TaskStatus::Completed);

    assert_eq!(worker.call_count(), 3);
    for task_id in [second, third] {
        let report = service.status(task_id).await.unwrap();
        assert_eq!(report.chunks.len(), 3);
        assert!(report
            .chunks
            .iter()
            .all(|c| c.source == Some(ResultSource::Catalog)));
    }
    let stats = service.context().catalog.stats();
    assert!(stats.hits >= 6);
}

async fn run_files(service: &TaskService) -> TaskId {
    let task_id = service
        .submit(TaskRequest::new(InputRef::Memory("proj".into()), "files"))
        .await
        .unwrap();
    let done = service.wait(task_id).await.unwrap();
    assert_eq!(done.task.status, TaskStatus::Completed);
    task_id
}

async fn source_of(service: &TaskService, task_id: TaskId, content_id: &str) -> ResultSource {
    let report = service.status(task_id).await.unwrap();
    report
        .chunks
        .iter()
        .find(|c| c.content_id == ContentId::new(content_id))
        .and_then(|c| c.source)
        .unwrap()
}

#[tokio::test]
async fn changed_content_invalidates_its_catalog_entry_and_is_redispatched() {
    let worker = Arc::new(ScriptedWorker::new());
    let service = service(worker.clone(), 2).await;
    service.register_input("proj", sources());
    run_files(&service).await;
    assert_eq!(worker.call_count(), 3);

    let edited = "pub fn parse() -> u8 { 0 }\n";
    let mut changed = sources();
    changed[1] = InputUnit::new("src/parser.rs", edited);
    service.register_input("proj", changed);
    let second = run_files(&service).await;

    assert_eq!(worker.call_count(), 4);
    assert_eq!(worker.calls_containing("-> u8"), 1);
    assert_eq!(
        source_of(&service, second, "proj/src/parser.rs#0").await,
        ResultSource::Worker
    );
    assert_eq!(
        source_of(&service, second, "proj/src/lib.rs#0").await,
        ResultSource::Catalog
    );

    // put, tombstone for the stale digest, put for the new content
    let key = CatalogKey::new(ScopePath::project("proj"), "proj/src/parser.rs#0");
    let history = service.context().catalog.history(&key);
    let tombstones: Vec<bool> = history.iter().map(|e| e.tombstone).collect();
    assert_eq!(tombstones, vec![false, true, false]);
    assert_eq!(history[2].digest, content_digest(edited));
}

#[tokio::test]
async fn corrupted_catalog_entry_forces_a_fresh_dispatch() {
    let worker = Arc::new(ScriptedWorker::new());
    let service = service(worker.clone(), 2).await;
    service.register_input("proj", sources());
    run_files(&service).await;

    let catalog = &service.context().catalog;
    let key = CatalogKey::new(ScopePath::project("proj"), "proj/src/lib.rs#0");
    let mut damaged = catalog.lookup(&key).unwrap().as_ref().clone();
    damaged.payload = "zstd:not base64!".into();
    let digest = damaged.digest.clone();
    catalog.put(&key, damaged).await.unwrap();
    assert!(matches!(
        catalog.lookup_valid(&key, &digest, &MethodologyRef::new("files", 1)),
        Err(CatalogInconsistency::Corrupted { .. })
    ));

    // the global level still holds a valid entry for the same digest, but is not consulted
    let second = run_files(&service).await;
    assert_eq!(worker.call_count(), 4);
    assert_eq!(worker.calls_containing("pub mod parser"), 2);
    assert_eq!(
        source_of(&service, second, "proj/src/lib.rs#0").await,
        ResultSource::Worker
    );

    let history = catalog.history(&key);
    let tombstones: Vec<bool> = history.iter().map(|e| e.tombstone).collect();
    assert_eq!(tombstones, vec![false, false, true, false]);
    assert!(catalog
        .lookup_valid(&key, &digest, &MethodologyRef::new("files", 1))
        .unwrap()
        .is_hit());
}

#[tokio::test]
async fn tolerant_status_reports_progress_and_partial_results() {
    let worker = Arc::new(ScriptedWorker::new().failing("line-04"));
    let service = service(worker, 3).await;
    service.register_input("proj", ten_chunk_units());

    let task_id = service
        .submit(
            TaskRequest::new(InputRef::Memory("proj".into()), "scenario").tolerate_partial(true),
        )
        .await
        .unwrap();
    let done = service.wait(task_id).await.unwrap();
    assert_eq!(done.task.status, TaskStatus::Completed);
    assert_eq!(done.result.as_ref().unwrap().gaps.len(), 6);

    let report = service.status(task_id).await.unwrap();
    assert!(!report.running);
    assert_eq!(report.progress.get(&ChunkStatus::Succeeded), Some(&4));
    assert_eq!(report.progress.get(&ChunkStatus::Failed), Some(&1));
    assert_eq!(report.progress.get(&ChunkStatus::Skipped), Some(&5));
    assert_eq!(report.completed_fraction(), 1.0);
    assert_eq!(report.partial_results.as_ref().map(|p| p.len()), Some(4));

    let failed = report
        .chunks
        .iter()
        .find(|c| c.status == ChunkStatus::Failed)
        .unwrap();
    assert_eq!(failed.retry_count, 2);
    assert!(failed.last_error.as_deref().unwrap().contains("cannot analyse"));
}

#[tokio::test]
async fn strict_status_hides_partial_results() {
    let worker = Arc::new(ScriptedWorker::new().failing("line-04"));
    let service = service(worker, 3).await;
    service.register_input("proj", ten_chunk_units());

    let task_id = service
        .submit(TaskRequest::new(InputRef::Memory("proj".into()), "scenario"))
        .await
        .unwrap();
    let done = service.wait(task_id).await.unwrap();
    assert_eq!(done.task.status, TaskStatus::Failed);
    assert!(done.result.is_some());

    let report = service.status(task_id).await.unwrap();
    assert_eq!(report.status, TaskStatus::Failed);
    assert!(report.partial_results.is_none());
}

#[tokio::test]
async fn cancel_running_task_through_the_service() {
    let worker = Arc::new(ScriptedWorker::new().with_delay(Duration::from_millis(300)));
    let service = service(worker.clone(), 1).await;
    service.register_input("proj", sources());

    let task_id = service
        .submit(TaskRequest::new(InputRef::Memory("proj".into()), "files"))
        .await
        .unwrap();
    worker.wait_for_calls(1).await;
    assert!(service.status(task_id).await.unwrap().running);
    assert!(service.remove(task_id).await.is_err());

    assert!(service.cancel(task_id).await.unwrap());
    let done = service.wait(task_id).await.unwrap();
    assert_eq!(done.task.status, TaskStatus::Cancelled);
    assert_eq!(worker.call_count(), 1);

    // already terminal
    assert!(!service.cancel(task_id).await.unwrap());
    assert!(service.resume(task_id).await.is_err());
    assert!(service.remove(task_id).await.unwrap());
    assert!(matches!(
        service.status(task_id).await,
        Err(ChunkflowError::TaskNotFound(id)) if id == task_id
    ));
}

#[tokio::test]
async fn unknown_methodology_is_rejected_at_submit() {
    let service = service(Arc::new(ScriptedWorker::new()), 1).await;
    let err = service
        .submit(TaskRequest::new(InputRef::Memory("proj".into()), "files@9"))
        .await
        .unwrap_err();
    assert!(matches!(err, ChunkflowError::MethodologyNotFound(_)));
    assert!(service.list().await.unwrap().is_empty());
}

#[tokio::test]
async fn failed_decomposition_is_visible_through_wait() {
    let worker = Arc::new(ScriptedWorker::new());
    let service = service(worker.clone(), 1).await;
    let task_id = service
        .submit(TaskRequest::new(InputRef::Memory("nowhere".into()), "documents"))
        .await
        .unwrap();

    let done = service.wait(task_id).await.unwrap();
    assert_eq!(done.task.status, TaskStatus::Failed);
    assert!(done.task.failure.unwrap().contains("nowhere"));
    assert_eq!(worker.call_count(), 0);
}

#[tokio::test]
async fn duplicate_configured_methodology_is_rejected() {
    let mut settings = settings(1);
    settings.methodologies.push(scenario_methodology());
    let result = TaskService::with_store(
        &settings,
        Arc::new(MemoryKvStore::new()),
        Arc::new(ScriptedWorker::new()),
    )
    .await;
    assert!(matches!(result, Err(ChunkflowError::InvalidOperation(_))));
}
