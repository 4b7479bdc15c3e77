use crate::fs::FsInputResolver;
use async_trait::async_trait;
use chunkflow_core::{ContentId, DecompositionError, InputRef};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

/// A top-level piece of input (a file, a document).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InputUnit {
    /// Path relative to the input root, `/`-separated.
    pub path: String,
    pub content: String,
}

impl InputUnit {
    pub fn new(path: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            content: content.into(),
        }
    }
}

/// A unit that exists in the input but could not be read as text. It has no chunks and
/// is reported as a gap of the final result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnreadUnit {
    pub unit: ContentId,
    pub bytes: usize,
    pub reason: String,
}

/// Resolved input of a task: the project scope name and its units ordered by path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InputCorpus {
    pub project: String,
    pub units: Vec<InputUnit>,
    #[serde(default)]
    pub unread: Vec<UnreadUnit>,
}

impl InputCorpus {
    pub fn new(project: impl Into<String>, mut units: Vec<InputUnit>) -> Self {
        units.sort_by(|a, b| a.path.cmp(&b.path));
        Self {
            project: project.into(),
            units,
            unread: Vec::new(),
        }
    }

    pub fn with_unread(mut self, mut unread: Vec<UnreadUnit>) -> Self {
        unread.sort_by(|a, b| a.unit.cmp(&b.unit));
        self.unread = unread;
        self
    }

    pub fn unit_id(&self, unit: &InputUnit) -> ContentId {
        ContentId::for_unit(&self.project, &unit.path)
    }

    pub fn total_bytes(&self) -> usize {
        self.units.iter().map(|u| u.content.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.total_bytes() == 0
    }
}

/// Turns an [`InputRef`] into the content it names.
#[async_trait]
pub trait InputResolver: Send + Sync {
    async fn resolve(&self, input: &InputRef) -> Result<InputCorpus, DecompositionError>;
}

/// Serves corpora registered in-process under a name.
#[derive(Debug, Default)]
pub struct MemoryInputResolver {
    corpora: RwLock<HashMap<String, Vec<InputUnit>>>,
}

impl MemoryInputResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) the corpus `name`.
    pub fn insert(&self, name: impl Into<String>, units: Vec<InputUnit>) {
        self.corpora.write().insert(name.into(), units);
    }

    pub fn remove(&self, name: &str) -> bool {
        self.corpora.write().remove(name).is_some()
    }
}

#[async_trait]
impl InputResolver for MemoryInputResolver {
    async fn resolve(&self, input: &InputRef) -> Result<InputCorpus, DecompositionError> {
        match input {
            InputRef::Memory(name) => self
                .corpora
                .read()
                .get(name)
                .map(|units| InputCorpus::new(name.clone(), units.clone()))
                .ok_or_else(|| {
                    DecompositionError::InputUnresolvable(format!("no corpus named '{}'", name))
                }),
            other => Err(DecompositionError::InputUnresolvable(format!(
                "{} is not an in-memory corpus",
                other
            ))),
        }
    }
}

/// Routes filesystem references to [`FsInputResolver`] and named corpora to a
/// [`MemoryInputResolver`].
#[derive(Debug, Default)]
pub struct DefaultInputResolver {
    fs: FsInputResolver,
    memory: Arc<MemoryInputResolver>,
}

impl DefaultInputResolver {
    pub fn new(fs: FsInputResolver, memory: Arc<MemoryInputResolver>) -> Self {
        Self { fs, memory }
    }

    pub fn memory(&self) -> &Arc<MemoryInputResolver> {
        &self.memory
    }
}

#[async_trait]
impl InputResolver for DefaultInputResolver {
    async fn resolve(&self, input: &InputRef) -> Result<InputCorpus, DecompositionError> {
        match input {
            InputRef::Path(_) => self.fs.resolve(input).await,
            InputRef::Memory(_) => self.memory.resolve(input).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn memory_corpus_is_sorted_by_path() {
        let resolver = MemoryInputResolver::new();
        resolver.insert(
            "docs",
            vec![InputUnit::new("b.md", "b"), InputUnit::new("a.md", "a")],
        );
        let corpus = resolver
            .resolve(&InputRef::Memory("docs".into()))
            .await
            .unwrap();
        assert_eq!(corpus.project, "docs");
        assert_eq!(corpus.units[0].path, "a.md");
        assert_eq!(corpus.unit_id(&corpus.units[1]).as_str(), "docs/b.md");
    }

    #[tokio::test]
    async fn unknown_corpus_is_unresolvable() {
        let resolver = MemoryInputResolver::new();
        let err = resolver
            .resolve(&InputRef::Memory("missing".into()))
            .await
            .unwrap_err();
        assert!(matches!(err, DecompositionError::InputUnresolvable(_)));
    }
}
