use crate::{ContentId, TaskId};
use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EdgeType {
    References,
    DependsOn,
    Duplicates,
    Contains,
    Other(String),
}

impl Default for EdgeType {
    fn default() -> Self {
        EdgeType::References
    }
}

impl fmt::Display for EdgeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            EdgeType::References => "references",
            EdgeType::DependsOn => "depends-on",
            EdgeType::Duplicates => "duplicates",
            EdgeType::Contains => "contains",
            EdgeType::Other(s) => s.as_str(),
        };
        write!(f, "{}", s)
    }
}

impl FromStr for EdgeType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "references" => Ok(EdgeType::References),
            "depends-on" | "depends_on" => Ok(EdgeType::DependsOn),
            "duplicates" => Ok(EdgeType::Duplicates),
            "contains" => Ok(EdgeType::Contains),
            other => Ok(EdgeType::Other(other.to_string())),
        }
    }
}

/// How a re-ingested edge's confidence combines with the stored one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum ConfidencePolicy {
    Max,
    MostRecent,
}

impl EdgeType {
    pub fn default_policy(&self) -> ConfidencePolicy {
        match self {
            EdgeType::References | EdgeType::Duplicates => ConfidencePolicy::Max,
            EdgeType::DependsOn | EdgeType::Contains | EdgeType::Other(_) => {
                ConfidencePolicy::MostRecent
            }
        }
    }
}

/// Typed, confidence-scored link between two content identifiers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelationshipEdge {
    pub source: ContentId,
    pub target: ContentId,
    pub edge_type: EdgeType,
    pub directed: bool,
    pub confidence: f64,
    pub discovered_by: Option<TaskId>,
    pub updated_at: DateTime<Utc>,
}

impl RelationshipEdge {
    pub fn new(source: ContentId, target: ContentId, edge_type: EdgeType) -> Self {
        Self {
            source,
            target,
            edge_type,
            directed: true,
            confidence: 1.0,
            discovered_by: None,
            updated_at: Utc::now(),
        }
    }

    pub fn undirected(mut self) -> Self {
        self.directed = false;
        self
    }

    pub fn with_confidence(mut self, confidence: f64) -> Self {
        self.confidence = confidence;
        self
    }

    pub fn discovered_by(mut self, task: TaskId) -> Self {
        self.discovered_by = Some(task);
        self
    }

    pub fn key(&self) -> EdgeKey {
        EdgeKey::of(self)
    }

    pub fn touches(&self, id: &ContentId) -> bool {
        &self.source == id || &self.target == id
    }
}

/// Identity of an edge: `(source, target, type)`, endpoints ordered for undirected edges.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EdgeKey {
    pub source: ContentId,
    pub target: ContentId,
    pub edge_type: EdgeType,
    pub directed: bool,
}

impl EdgeKey {
    pub fn of(edge: &RelationshipEdge) -> Self {
        let (source, target) = if !edge.directed && edge.target < edge.source {
            (edge.target.clone(), edge.source.clone())
        } else {
            (edge.source.clone(), edge.target.clone())
        };
        Self {
            source,
            target,
            edge_type: edge.edge_type.clone(),
            directed: edge.directed,
        }
    }

    /// Stable string form, used as the persistence key.
    pub fn storage_key(&self) -> String {
        let arrow = if self.directed { "->" } else { "--" };
        format!(
            "{}{}{}|{}",
            self.source, arrow, self.target, self.edge_type
        )
    }
}
