use chunkflow_chunker::ChunkGraph;
use chunkflow_core::{
    ByteRange, ChunkId, ChunkStatus, ContentId, Methodology, MethodologyRef, PrecedenceRule,
    ResultSource, SynthesisError, TaskId, TieBreak,
};
use chunkflow_graph::RelationshipGraph;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashSet};
use tracing::debug;

/// Contribution of one succeeded chunk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Section {
    pub chunk: ChunkId,
    pub content_id: ContentId,
    pub unit: ContentId,
    pub range: ByteRange,
    pub payload: Value,
    pub confidence: f64,
    pub source: ResultSource,
}

/// A portion of the input that was not analysed. `chunk` is `None` for a unit that could
/// not be read and so was never cut into chunks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Gap {
    pub chunk: Option<ChunkId>,
    pub content_id: ContentId,
    pub unit: ContentId,
    pub range: ByteRange,
    pub status: ChunkStatus,
    pub reason: String,
}

/// How a key written by several chunks was settled.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConflictResolution {
    pub key: String,
    pub contenders: Vec<ChunkId>,
    pub winner: ChunkId,
}

/// Relationship between two content units that both belong to the task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CrossReference {
    pub source: ContentId,
    pub target: ContentId,
    pub edge_type: String,
    pub directed: bool,
    pub confidence: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FinalResult {
    pub task_id: TaskId,
    pub methodology: MethodologyRef,
    pub sections: Vec<Section>,
    pub merged: BTreeMap<String, Value>,
    pub conflicts: Vec<ConflictResolution>,
    pub cross_references: Vec<CrossReference>,
    pub gaps: Vec<Gap>,
}

impl FinalResult {
    pub fn is_complete(&self) -> bool {
        self.gaps.is_empty()
    }

    /// Stable byte encoding: object keys sorted at every depth, no timestamps.
    pub fn canonical_bytes(&self) -> Vec<u8> {
        match serde_json::to_value(self) {
            Ok(value) => canonicalize(value).to_string().into_bytes(),
            Err(_) => Vec::new(),
        }
    }
}

fn canonicalize(value: Value) -> Value {
    match value {
        Value::Object(map) => {
            let sorted: BTreeMap<String, Value> =
                map.into_iter().map(|(k, v)| (k, canonicalize(v))).collect();
            Value::Object(sorted.into_iter().collect())
        }
        Value::Array(items) => Value::Array(items.into_iter().map(canonicalize).collect()),
        other => other,
    }
}

struct Owner {
    chunk: ChunkId,
    confidence: f64,
}

/// Combines per-chunk results into one [`FinalResult`]. Pure: same inputs, same bytes.
#[derive(Debug, Default, Clone, Copy)]
pub struct SynthesisEngine;

impl SynthesisEngine {
    pub fn new() -> Self {
        Self
    }

    pub fn synthesize(
        &self,
        task_id: TaskId,
        methodology: &Methodology,
        chunks: &ChunkGraph,
        relationships: &RelationshipGraph,
    ) -> Result<FinalResult, SynthesisError> {
        let mut sections = Vec::new();
        let mut gaps = Vec::new();
        let mut merged: BTreeMap<String, Value> = BTreeMap::new();
        let mut owners: BTreeMap<String, Owner> = BTreeMap::new();
        let mut conflicts = Vec::new();

        let mut order = chunks.topological_order();
        // chunks outside the order (only possible for a malformed graph) still get reported
        if order.len() < chunks.len() {
            let seen: HashSet<ChunkId> = order.iter().copied().collect();
            order.extend(chunks.ids().filter(|id| !seen.contains(id)));
        }

        for id in order {
            let Some(chunk) = chunks.chunk(id) else {
                continue;
            };
            let result = match (&chunk.status, &chunk.result) {
                (ChunkStatus::Succeeded, Some(result)) => result,
                (status, _) => {
                    gaps.push(Gap {
                        chunk: Some(chunk.id),
                        content_id: chunk.content_id.clone(),
                        unit: chunk.unit.clone(),
                        range: chunk.range,
                        status: *status,
                        reason: chunk
                            .last_error
                            .clone()
                            .unwrap_or_else(|| "not processed".to_string()),
                    });
                    continue;
                }
            };

            if let Value::Object(fields) = &result.payload {
                for (key, value) in fields {
                    let Some(current) = merged.get(key) else {
                        merged.insert(key.clone(), value.clone());
                        owners.insert(
                            key.clone(),
                            Owner {
                                chunk: id,
                                confidence: result.confidence,
                            },
                        );
                        continue;
                    };
                    if current == value {
                        continue;
                    }
                    let Some(owner) = owners.get(key) else {
                        continue;
                    };
                    let later_wins = resolve(
                        methodology.precedence,
                        key,
                        owner,
                        id,
                        result.confidence,
                    )?;
                    conflicts.push(ConflictResolution {
                        key: key.clone(),
                        contenders: vec![owner.chunk, id],
                        winner: if later_wins { id } else { owner.chunk },
                    });
                    if later_wins {
                        merged.insert(key.clone(), value.clone());
                        owners.insert(
                            key.clone(),
                            Owner {
                                chunk: id,
                                confidence: result.confidence,
                            },
                        );
                    }
                }
            }

            sections.push(Section {
                chunk: chunk.id,
                content_id: chunk.content_id.clone(),
                unit: chunk.unit.clone(),
                range: chunk.range,
                payload: result.payload.clone(),
                confidence: result.confidence,
                source: result.source,
            });
        }

        gaps.extend(chunks.unread().iter().map(|unread| Gap {
            chunk: None,
            content_id: unread.unit.clone(),
            unit: unread.unit.clone(),
            range: ByteRange::new(0, unread.bytes),
            status: ChunkStatus::Skipped,
            reason: unread.reason.clone(),
        }));

        let task_ids: Vec<ContentId> = chunks
            .chunks()
            .iter()
            .map(|c| c.content_id.clone())
            .collect();
        let members: HashSet<&ContentId> = task_ids.iter().collect();
        let cross_references = relationships
            .edges_touching(&task_ids)
            .into_iter()
            .filter(|e| members.contains(&e.source) && members.contains(&e.target))
            .map(|e| CrossReference {
                source: e.source,
                target: e.target,
                edge_type: e.edge_type.to_string(),
                directed: e.directed,
                confidence: e.confidence,
            })
            .collect();

        debug!(
            task_id = %task_id,
            sections = sections.len(),
            gaps = gaps.len(),
            conflicts = conflicts.len(),
            "Synthesized result"
        );
        Ok(FinalResult {
            task_id,
            methodology: methodology.reference(),
            sections,
            merged,
            conflicts,
            cross_references,
            gaps,
        })
    }
}

/// Whether the later contender replaces the current owner of `key`.
fn resolve(
    rule: PrecedenceRule,
    key: &str,
    owner: &Owner,
    later: ChunkId,
    later_confidence: f64,
) -> Result<bool, SynthesisError> {
    match rule {
        PrecedenceRule::LaterWins => Ok(true),
        PrecedenceRule::EarlierWins => Ok(false),
        PrecedenceRule::HigherConfidence { tie_break } => {
            if later_confidence > owner.confidence {
                Ok(true)
            } else if later_confidence < owner.confidence {
                Ok(false)
            } else {
                match tie_break {
                    Some(TieBreak::Later) => Ok(true),
                    Some(TieBreak::Earlier) => Ok(false),
                    None => Err(SynthesisError::IrreconcilableConflict {
                        key: key.to_string(),
                        chunks: vec![owner.chunk, later],
                    }),
                }
            }
        }
    }
}
