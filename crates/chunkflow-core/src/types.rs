use crate::{content_digest, ChunkflowError, MethodologyRef, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::path::PathBuf;
use uuid::Uuid;

pub type TaskId = Uuid;

/// Ordinal of a chunk inside its task, assigned in decomposition order.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default,
)]
#[serde(transparent)]
pub struct ChunkId(pub u32);

impl fmt::Display for ChunkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "chunk-{}", self.0)
    }
}

/// Identifier of a content unit or chunk: `<project>/<unit path>[#<ordinal>]`.
///
/// The leading segment names the project scope, which is how the catalog routes a lookup
/// to a single sub-index.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContentId(String);

impl ContentId {
    pub fn new<S: Into<String>>(id: S) -> Self {
        Self(id.into())
    }

    pub fn for_unit(project: &str, path: &str) -> Self {
        Self(format!("{}/{}", project, path.trim_start_matches('/')))
    }

    pub fn for_chunk(unit: &ContentId, ordinal: usize) -> Self {
        Self(format!("{}#{}", unit.0, ordinal))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Project segment (everything before the first `/`).
    pub fn project(&self) -> &str {
        self.0.split('/').next().unwrap_or_default()
    }

    /// The unit this id belongs to, without a chunk ordinal.
    pub fn unit(&self) -> &str {
        match self.0.rfind('#') {
            Some(pos) => &self.0[..pos],
            None => &self.0,
        }
    }
}

impl fmt::Display for ContentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ContentId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

/// Half-open byte range `[start, end)` inside a unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ByteRange {
    pub start: usize,
    pub end: usize,
}

impl ByteRange {
    pub fn new(start: usize, end: usize) -> Self {
        Self { start, end }
    }

    pub fn len(&self) -> usize {
        self.end.saturating_sub(self.start)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Where a task's input lives.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum InputRef {
    /// A directory or single file on the local filesystem.
    Path(PathBuf),
    /// A corpus registered with an in-process resolver.
    Memory(String),
}

impl InputRef {
    /// Name of the project scope derived from the input. Filesystem inputs are named
    /// `<dir name>-<first 8 hex digits of the canonical path's digest>`, so two checkouts
    /// with the same directory name get distinct scopes.
    pub fn project_name(&self) -> String {
        match self {
            InputRef::Path(path) => {
                let canonical = std::fs::canonicalize(path).unwrap_or_else(|_| path.clone());
                let base = canonical
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_else(|| "root".to_string());
                let digest = content_digest(&canonical.to_string_lossy());
                format!("{}-{}", base, &digest[..8])
            }
            InputRef::Memory(name) => name.clone(),
        }
    }
}

impl fmt::Display for InputRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InputRef::Path(p) => write!(f, "{}", p.display()),
            InputRef::Memory(name) => write!(f, "memory:{}", name),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Decomposing,
    Running,
    Synthesizing,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }

    pub fn can_transition_to(self, next: TaskStatus) -> bool {
        use TaskStatus::*;
        if self.is_terminal() {
            return false;
        }
        match (self, next) {
            (current, next) if current == next => true,
            (_, Failed) | (_, Cancelled) => true,
            (Pending, Decomposing) => true,
            (Decomposing, Running) => true,
            (Running, Synthesizing) => true,
            (Synthesizing, Completed) => true,
            _ => false,
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Decomposing => "decomposing",
            TaskStatus::Running => "running",
            TaskStatus::Synthesizing => "synthesizing",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub input: InputRef,
    pub methodology: MethodologyRef,
    pub tolerate_partial: bool,
    pub status: TaskStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub failure: Option<String>,
}

impl Task {
    pub fn new(input: InputRef, methodology: MethodologyRef, tolerate_partial: bool) -> Self {
        let now = Utc::now();
        Self {
            id: TaskId::new_v4(),
            input,
            methodology,
            tolerate_partial,
            status: TaskStatus::Pending,
            created_at: now,
            updated_at: now,
            failure: None,
        }
    }

    /// Move the task to `next`. Terminal tasks are immutable.
    pub fn transition(&mut self, next: TaskStatus) -> Result<()> {
        if !self.status.can_transition_to(next) {
            return Err(ChunkflowError::InvalidTransition {
                task: self.id,
                from: self.status,
                to: next,
            });
        }
        self.status = next;
        self.updated_at = Utc::now();
        Ok(())
    }

    pub fn fail(&mut self, reason: impl Into<String>) -> Result<()> {
        self.transition(TaskStatus::Failed)?;
        self.failure = Some(reason.into());
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChunkStatus {
    Pending,
    Dispatched,
    Succeeded,
    Failed,
    Skipped,
}

impl ChunkStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ChunkStatus::Succeeded | ChunkStatus::Failed | ChunkStatus::Skipped
        )
    }

    pub fn can_transition_to(self, next: ChunkStatus) -> bool {
        use ChunkStatus::*;
        matches!(
            (self, next),
            (Pending, Dispatched)
                | (Pending, Succeeded)
                | (Pending, Skipped)
                | (Dispatched, Dispatched)
                | (Dispatched, Succeeded)
                | (Dispatched, Failed)
                | (Dispatched, Pending)
        )
    }
}

impl fmt::Display for ChunkStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ChunkStatus::Pending => "pending",
            ChunkStatus::Dispatched => "dispatched",
            ChunkStatus::Succeeded => "succeeded",
            ChunkStatus::Failed => "failed",
            ChunkStatus::Skipped => "skipped",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultSource {
    Worker,
    Catalog,
}

/// Result reference of a succeeded chunk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkResult {
    pub payload: serde_json::Value,
    pub confidence: f64,
    pub source: ResultSource,
    pub digest: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Chunk {
    pub id: ChunkId,
    pub task_id: TaskId,
    pub content_id: ContentId,
    /// Content id of the unit (file, document) the chunk was cut from.
    pub unit: ContentId,
    pub range: ByteRange,
    pub content: String,
    /// Read-only boundary context from the preceding chunk, not part of coverage.
    pub context: Option<String>,
    pub digest: String,
    pub dependencies: BTreeSet<ChunkId>,
    pub status: ChunkStatus,
    pub result: Option<ChunkResult>,
    pub retry_count: u32,
    pub last_error: Option<String>,
}

impl Chunk {
    pub fn transition(&mut self, next: ChunkStatus) -> Result<()> {
        if !self.status.can_transition_to(next) {
            return Err(ChunkflowError::InvalidOperation(format!(
                "{} cannot move from {} to {}",
                self.id, self.status, next
            )));
        }
        self.status = next;
        Ok(())
    }
}
