use crate::boundary::{pack, pieces, tail_lines};
use crate::{ChunkGraph, InputCorpus, InputResolver};
use chunkflow_core::{
    content_digest, Chunk, ChunkId, ChunkStatus, ContentId, DecompositionError, DependencyRule,
    Methodology, Task, TaskId,
};
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, info};

/// Resolves a task's input and cuts it into a [`ChunkGraph`]. Has no side effects.
#[derive(Clone)]
pub struct Decomposer {
    resolver: Arc<dyn InputResolver>,
}

impl Decomposer {
    pub fn new(resolver: Arc<dyn InputResolver>) -> Self {
        Self { resolver }
    }

    pub async fn resolve(&self, task: &Task) -> Result<InputCorpus, DecompositionError> {
        self.resolver.resolve(&task.input).await
    }

    pub async fn decompose(
        &self,
        task: &Task,
        methodology: &Methodology,
    ) -> Result<ChunkGraph, DecompositionError> {
        methodology.validate()?;
        let corpus = self.resolve(task).await?;
        decompose_corpus(task.id, &corpus, methodology)
    }
}

/// Decompose an already resolved corpus.
pub fn decompose_corpus(
    task_id: TaskId,
    corpus: &InputCorpus,
    methodology: &Methodology,
) -> Result<ChunkGraph, DecompositionError> {
    methodology.validate()?;
    if corpus.is_empty() {
        return Err(DecompositionError::EmptyInput(corpus.project.clone()));
    }

    let bound = methodology.max_chunk_bytes;
    let mut chunks: Vec<Chunk> = Vec::new();
    // chunk ids of each non-empty unit, in unit order
    let mut unit_chunks: Vec<Vec<ChunkId>> = Vec::new();

    for unit in &corpus.units {
        let ranges = pack(&unit.path, &pieces(&unit.content, &methodology.boundary), bound)?;
        if ranges.is_empty() {
            continue;
        }
        let unit_id = corpus.unit_id(unit);
        let mut ids = Vec::with_capacity(ranges.len());
        let mut previous: Option<&str> = None;

        for (ordinal, range) in ranges.into_iter().enumerate() {
            let id = ChunkId(chunks.len() as u32);
            let content = &unit.content[range.start..range.end];
            chunks.push(Chunk {
                id,
                task_id,
                content_id: ContentId::for_chunk(&unit_id, ordinal),
                unit: unit_id.clone(),
                range,
                content: content.to_string(),
                context: previous.and_then(|p| tail_lines(p, methodology.context_lines)),
                digest: content_digest(content),
                dependencies: BTreeSet::new(),
                status: ChunkStatus::Pending,
                result: None,
                retry_count: 0,
                last_error: None,
            });
            ids.push(id);
            previous = Some(content);
        }
        unit_chunks.push(ids);
    }

    wire_dependencies(&mut chunks, &unit_chunks, methodology.dependencies);

    let graph = ChunkGraph::from_chunks(task_id, chunks)?.with_unread(corpus.unread.clone());
    info!(
        "Decomposed {} into {} chunks across {} units ({} unread)",
        corpus.project,
        graph.len(),
        unit_chunks.len(),
        graph.unread().len()
    );
    Ok(graph)
}

fn wire_dependencies(chunks: &mut [Chunk], units: &[Vec<ChunkId>], rule: DependencyRule) {
    match rule {
        DependencyRule::Independent => {}
        DependencyRule::SequentialWithinUnit => {
            for ids in units {
                for pair in ids.windows(2) {
                    chunks[pair[1].0 as usize].dependencies.insert(pair[0]);
                }
            }
        }
        DependencyRule::Chain => {
            for i in 1..chunks.len() {
                let prev = chunks[i - 1].id;
                chunks[i].dependencies.insert(prev);
            }
        }
        DependencyRule::UnitOrder => {
            for pair in units.windows(2) {
                for id in &pair[1] {
                    chunks[id.0 as usize]
                        .dependencies
                        .extend(pair[0].iter().copied());
                }
            }
        }
    }
    debug!("Wired {:?} dependencies for {} chunks", rule, chunks.len());
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{InputUnit, UnreadUnit};
    use chunkflow_core::{BoundaryRule, Methodology};
    use uuid::Uuid;

    fn corpus() -> InputCorpus {
        InputCorpus::new(
            "docs",
            vec![
                InputUnit::new("a.md", "# A\nalpha\n# B\nbeta\n"),
                InputUnit::new("empty.md", ""),
                InputUnit::new("b.md", "# C\ngamma\n"),
            ],
        )
    }

    fn sections(bound: usize) -> Methodology {
        let mut m = Methodology::documents(bound);
        m.boundary = BoundaryRule::Sections {
            marker: "#".into(),
        };
        m
    }

    #[test]
    fn sections_become_chunks_with_context() {
        let corpus = corpus();
        let graph = decompose_corpus(Uuid::new_v4(), &corpus, &sections(10)).unwrap();
        let contents: Vec<&str> = graph.chunks().iter().map(|c| c.content.as_str()).collect();
        assert_eq!(contents, vec!["# A\nalpha\n", "# B\nbeta\n", "# C\ngamma\n"]);
        assert_eq!(graph.chunks()[0].context, None);
        assert_eq!(graph.chunks()[1].context.as_deref(), Some("# A\nalpha\n"));
        assert_eq!(graph.chunks()[1].content_id.as_str(), "docs/a.md#1");
        graph.verify_coverage(&corpus).unwrap();
    }

    #[test]
    fn sequential_within_unit_links_neighbours_only() {
        let graph = decompose_corpus(Uuid::new_v4(), &corpus(), &sections(10)).unwrap();
        assert!(graph.chunks()[0].dependencies.is_empty());
        assert_eq!(
            graph.chunks()[1].dependencies,
            BTreeSet::from([ChunkId(0)])
        );
        assert!(graph.chunks()[2].dependencies.is_empty());
        assert_eq!(graph.roots(), vec![ChunkId(0), ChunkId(2)]);
    }

    #[test]
    fn unit_order_makes_later_units_wait() {
        let mut m = sections(10);
        m.dependencies = DependencyRule::UnitOrder;
        let graph = decompose_corpus(Uuid::new_v4(), &corpus(), &m).unwrap();
        assert_eq!(
            graph.chunks()[2].dependencies,
            BTreeSet::from([ChunkId(0), ChunkId(1)])
        );
        assert_eq!(graph.dependents(ChunkId(0)), BTreeSet::from([ChunkId(2)]));
    }

    #[test]
    fn empty_input_is_rejected() {
        let empty = InputCorpus::new("void", vec![InputUnit::new("x", "")]);
        let err = decompose_corpus(Uuid::new_v4(), &empty, &sections(10)).unwrap_err();
        assert_eq!(err, DecompositionError::EmptyInput("void".into()));
    }

    #[test]
    fn unread_units_travel_with_the_graph() {
        let corpus = corpus().with_unread(vec![UnreadUnit {
            unit: ContentId::for_unit("docs", "logo.png"),
            bytes: 42,
            reason: "not valid UTF-8".into(),
        }]);
        let graph = decompose_corpus(Uuid::new_v4(), &corpus, &sections(10)).unwrap();
        assert_eq!(graph.len(), 3);
        assert_eq!(graph.unread(), corpus.unread.as_slice());
        graph.verify_coverage(&corpus).unwrap();
    }

    #[test]
    fn oversized_section_fails_instead_of_truncating() {
        let err = decompose_corpus(Uuid::new_v4(), &corpus(), &sections(5)).unwrap_err();
        assert!(matches!(err, DecompositionError::BoundaryAmbiguous { .. }));
    }
}
