use crate::{ChunkId, ContentId, TaskId, TaskStatus};
use std::time::Duration;
use thiserror::Error;

/// Input could not be split within the methodology's bounds. Fatal, reported before any
/// chunk work starts.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DecompositionError {
    #[error("input reference cannot be resolved: {0}")]
    InputUnresolvable(String),

    #[error("input is empty: {0}")]
    EmptyInput(String),

    #[error("unit '{unit}' has an indivisible piece of {size} bytes, bound is {bound}")]
    BoundaryAmbiguous {
        unit: String,
        size: usize,
        bound: usize,
    },

    #[error("chunk dependencies contain a cycle")]
    CyclicDependencies,

    #[error("invalid methodology: {0}")]
    InvalidMethodology(String),
}

/// A single worker attempt failed. Retried with backoff by the coordinator.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DispatchError {
    #[error("worker unreachable: {0}")]
    Unreachable(String),

    #[error("dispatch timed out after {0:?}")]
    Timeout(Duration),

    #[error("worker rejected chunk: {0}")]
    Rejected(String),

    #[error("dispatch abandoned")]
    Abandoned,
}

/// Stored catalog state disagrees with the content it claims to describe.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum CatalogInconsistency {
    #[error("digest mismatch for {content_id}: stored {stored}, current {current}")]
    DigestMismatch {
        content_id: ContentId,
        stored: String,
        current: String,
    },

    #[error("corrupted catalog entry for {content_id}: {reason}")]
    Corrupted {
        content_id: ContentId,
        reason: String,
    },
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum SynthesisError {
    #[error("precedence rule cannot order conflicting values for '{key}' from chunks {chunks:?}")]
    IrreconcilableConflict { key: String, chunks: Vec<ChunkId> },
}

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("storage io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("storage record is corrupt: {0}")]
    Corrupt(String),

    #[error("storage backend error: {0}")]
    Backend(String),
}

#[derive(Error, Debug)]
pub enum ChunkflowError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error(transparent)]
    Decomposition(#[from] DecompositionError),

    #[error(transparent)]
    Dispatch(#[from] DispatchError),

    #[error(transparent)]
    Catalog(#[from] CatalogInconsistency),

    #[error(transparent)]
    Synthesis(#[from] SynthesisError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error("Task not found: {0}")]
    TaskNotFound(TaskId),

    #[error("Invalid transition for task {task}: {from:?} -> {to:?}")]
    InvalidTransition {
        task: TaskId,
        from: TaskStatus,
        to: TaskStatus,
    },

    #[error("Methodology not found: {0}")]
    MethodologyNotFound(String),

    #[error("Task {0} exceeded its timeout")]
    TaskTimeout(TaskId),

    #[error("Invalid operation: {0}")]
    InvalidOperation(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, ChunkflowError>;
