use crate::{InputCorpus, UnreadUnit};
use chunkflow_core::{Chunk, ChunkId, DecompositionError, TaskId};
use chunkflow_graph::has_cycle;
use serde::{Deserialize, Serialize};
use std::cmp::Reverse;
use std::collections::{BTreeMap, BTreeSet, BinaryHeap};
use thiserror::Error;

/// A unit whose chunks do not tile it exactly.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CoverageError {
    #[error("unit {unit} is not covered from byte {at}")]
    Gap { unit: String, at: usize },

    #[error("chunks of unit {unit} overlap at byte {at}")]
    Overlap { unit: String, at: usize },

    #[error("chunk {chunk} content does not match its range in {unit}")]
    ContentMismatch { unit: String, chunk: ChunkId },

    #[error("chunk {chunk} belongs to no unit of the input")]
    Orphan { chunk: ChunkId },
}

/// Chunks of one task with their dependency edges. Chunk `i` has id `ChunkId(i)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkGraph {
    task_id: TaskId,
    chunks: Vec<Chunk>,
    #[serde(default)]
    unread: Vec<UnreadUnit>,
}

impl ChunkGraph {
    /// Build a graph from chunks numbered `0..n`, rejecting dangling or cyclic dependencies.
    pub fn from_chunks(task_id: TaskId, chunks: Vec<Chunk>) -> Result<Self, DecompositionError> {
        for (i, chunk) in chunks.iter().enumerate() {
            if chunk.id.0 as usize != i {
                return Err(DecompositionError::InvalidMethodology(format!(
                    "chunk ids are not dense: found {} at position {}",
                    chunk.id, i
                )));
            }
            if let Some(dep) = chunk.dependencies.iter().find(|d| d.0 as usize >= chunks.len()) {
                return Err(DecompositionError::InvalidMethodology(format!(
                    "{} depends on unknown {}",
                    chunk.id, dep
                )));
            }
        }
        let graph = Self {
            task_id,
            chunks,
            unread: Vec::new(),
        };
        if graph.has_cycle() {
            return Err(DecompositionError::CyclicDependencies);
        }
        Ok(graph)
    }

    fn has_cycle(&self) -> bool {
        has_cycle(self.ids(), |id: &ChunkId| {
            self.chunks[id.0 as usize]
                .dependencies
                .iter()
                .copied()
                .collect()
        })
    }

    /// Input units that produced no chunks because they could not be read.
    pub fn with_unread(mut self, unread: Vec<UnreadUnit>) -> Self {
        self.unread = unread;
        self
    }

    pub fn unread(&self) -> &[UnreadUnit] {
        &self.unread
    }

    pub fn task_id(&self) -> TaskId {
        self.task_id
    }

    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    pub fn ids(&self) -> impl Iterator<Item = ChunkId> + '_ {
        (0..self.chunks.len() as u32).map(ChunkId)
    }

    pub fn chunks(&self) -> &[Chunk] {
        &self.chunks
    }

    pub fn chunk(&self, id: ChunkId) -> Option<&Chunk> {
        self.chunks.get(id.0 as usize)
    }

    pub fn chunk_mut(&mut self, id: ChunkId) -> Option<&mut Chunk> {
        self.chunks.get_mut(id.0 as usize)
    }

    pub fn into_chunks(self) -> Vec<Chunk> {
        self.chunks
    }

    /// Chunks with no dependencies.
    pub fn roots(&self) -> Vec<ChunkId> {
        self.chunks
            .iter()
            .filter(|c| c.dependencies.is_empty())
            .map(|c| c.id)
            .collect()
    }

    fn direct_dependents(&self) -> BTreeMap<ChunkId, Vec<ChunkId>> {
        let mut out: BTreeMap<ChunkId, Vec<ChunkId>> = BTreeMap::new();
        for chunk in &self.chunks {
            for dep in &chunk.dependencies {
                out.entry(*dep).or_default().push(chunk.id);
            }
        }
        out
    }

    /// Every chunk that transitively depends on `id`.
    pub fn dependents(&self, id: ChunkId) -> BTreeSet<ChunkId> {
        let direct = self.direct_dependents();
        let mut seen = BTreeSet::new();
        let mut stack = vec![id];
        while let Some(next) = stack.pop() {
            for child in direct.get(&next).into_iter().flatten() {
                if seen.insert(*child) {
                    stack.push(*child);
                }
            }
        }
        seen
    }

    /// Kahn's algorithm, always taking the lowest ready id. Deterministic for a given graph.
    pub fn topological_order(&self) -> Vec<ChunkId> {
        let direct = self.direct_dependents();
        let mut indegree: Vec<usize> = self.chunks.iter().map(|c| c.dependencies.len()).collect();
        let mut ready: BinaryHeap<Reverse<ChunkId>> = self
            .chunks
            .iter()
            .filter(|c| c.dependencies.is_empty())
            .map(|c| Reverse(c.id))
            .collect();

        let mut order = Vec::with_capacity(self.chunks.len());
        while let Some(Reverse(id)) = ready.pop() {
            order.push(id);
            for child in direct.get(&id).into_iter().flatten() {
                let slot = &mut indegree[child.0 as usize];
                *slot -= 1;
                if *slot == 0 {
                    ready.push(Reverse(*child));
                }
            }
        }
        order
    }

    /// Check that the chunks of every unit tile that unit exactly, with matching content.
    pub fn verify_coverage(&self, corpus: &InputCorpus) -> Result<(), CoverageError> {
        let mut by_unit: BTreeMap<&str, Vec<&Chunk>> = BTreeMap::new();
        for chunk in &self.chunks {
            by_unit.entry(chunk.unit.as_str()).or_default().push(chunk);
        }

        for unit in &corpus.units {
            let unit_id = corpus.unit_id(unit);
            let mut chunks = by_unit.remove(unit_id.as_str()).unwrap_or_default();
            chunks.sort_by_key(|c| c.range.start);

            let mut cursor = 0;
            for chunk in chunks {
                if chunk.range.start > cursor {
                    return Err(CoverageError::Gap {
                        unit: unit.path.clone(),
                        at: cursor,
                    });
                }
                if chunk.range.start < cursor {
                    return Err(CoverageError::Overlap {
                        unit: unit.path.clone(),
                        at: chunk.range.start,
                    });
                }
                if unit.content.get(chunk.range.start..chunk.range.end) != Some(chunk.content.as_str())
                {
                    return Err(CoverageError::ContentMismatch {
                        unit: unit.path.clone(),
                        chunk: chunk.id,
                    });
                }
                cursor = chunk.range.end;
            }
            if cursor != unit.content.len() {
                return Err(CoverageError::Gap {
                    unit: unit.path.clone(),
                    at: cursor,
                });
            }
        }

        match by_unit.into_values().flatten().next() {
            Some(orphan) => Err(CoverageError::Orphan { chunk: orphan.id }),
            None => Ok(()),
        }
    }
}
