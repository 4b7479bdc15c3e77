use crate::{ChunkflowError, DecompositionError, Result};
use parking_lot::RwLock;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use tracing::info;

pub const DEFAULT_MAX_CHUNK_BYTES: usize = 16 * 1024;

/// `name@version` handle recorded on tasks and catalog entries.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, JsonSchema)]
pub struct MethodologyRef {
    pub name: String,
    pub version: u32,
}

impl MethodologyRef {
    pub fn new<S: Into<String>>(name: S, version: u32) -> Self {
        Self {
            name: name.into(),
            version,
        }
    }
}

impl fmt::Display for MethodologyRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.name, self.version)
    }
}

/// How natural boundaries inside a unit are detected.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BoundaryRule {
    /// One chunk per top-level unit (file or document).
    WholeUnit,
    /// Whole lines packed up to the size bound.
    Lines,
    /// Sections starting at lines beginning with `marker`, packed up to the size bound.
    Sections { marker: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum DependencyRule {
    Independent,
    /// Chunk k of a unit depends on chunk k-1 of the same unit.
    SequentialWithinUnit,
    /// Every chunk depends on the previous chunk of the task.
    Chain,
    /// Every chunk of unit i depends on every chunk of unit i-1.
    UnitOrder,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum TieBreak {
    Earlier,
    Later,
}

/// Conflict resolution for synthesis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PrecedenceRule {
    /// Later chunk in traversal order wins.
    LaterWins,
    EarlierWins,
    HigherConfidence { tie_break: Option<TieBreak> },
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, JsonSchema,
)]
#[serde(rename_all = "snake_case")]
pub enum CatalogLevel {
    Global,
    Domain,
    Project,
}

impl fmt::Display for CatalogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CatalogLevel::Global => "global",
            CatalogLevel::Domain => "domain",
            CatalogLevel::Project => "project",
        };
        f.write_str(s)
    }
}

/// Immutable, versioned bundle of decomposition and catalog parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct Methodology {
    pub name: String,
    pub version: u32,
    /// Domain scope used by the catalog's domain level (e.g. "code", "docs").
    pub domain: String,
    pub boundary: BoundaryRule,
    #[serde(default = "Methodology::default_max_chunk_bytes")]
    pub max_chunk_bytes: usize,
    /// Lines of the preceding chunk handed to the worker as boundary context.
    #[serde(default)]
    pub context_lines: usize,
    pub dependencies: DependencyRule,
    pub precedence: PrecedenceRule,
    /// Catalog levels consulted, in order.
    pub catalog_levels: Vec<CatalogLevel>,
    #[serde(default)]
    pub require_all_succeed: bool,
    #[serde(default)]
    pub parameters: serde_json::Value,
}

impl Methodology {
    fn default_max_chunk_bytes() -> usize {
        DEFAULT_MAX_CHUNK_BYTES
    }

    pub fn reference(&self) -> MethodologyRef {
        MethodologyRef::new(self.name.clone(), self.version)
    }

    pub fn validate(&self) -> std::result::Result<(), DecompositionError> {
        if self.name.trim().is_empty() || self.name.contains('@') {
            return Err(DecompositionError::InvalidMethodology(format!(
                "invalid name '{}'",
                self.name
            )));
        }
        if self.max_chunk_bytes == 0 {
            return Err(DecompositionError::InvalidMethodology(format!(
                "{}: max_chunk_bytes must be > 0",
                self.reference()
            )));
        }
        if let BoundaryRule::Sections { marker } = &self.boundary {
            if marker.is_empty() {
                return Err(DecompositionError::InvalidMethodology(format!(
                    "{}: section marker cannot be empty",
                    self.reference()
                )));
            }
        }
        if self.precedence == (PrecedenceRule::HigherConfidence { tie_break: None }) {
            return Err(DecompositionError::InvalidMethodology(format!(
                "{}: higher_confidence precedence needs a tie_break for equal confidences",
                self.reference()
            )));
        }
        Ok(())
    }

    /// One chunk per source file, independent, project-level cache only.
    pub fn files(max_chunk_bytes: usize) -> Self {
        Self {
            name: "files".into(),
            version: 1,
            domain: "code".into(),
            boundary: BoundaryRule::WholeUnit,
            max_chunk_bytes,
            context_lines: 0,
            dependencies: DependencyRule::Independent,
            precedence: PrecedenceRule::LaterWins,
            catalog_levels: vec![CatalogLevel::Project, CatalogLevel::Global],
            require_all_succeed: false,
            parameters: serde_json::Value::Null,
        }
    }

    /// Markdown-style documents split at headings, read in order.
    pub fn documents(max_chunk_bytes: usize) -> Self {
        Self {
            name: "documents".into(),
            version: 1,
            domain: "docs".into(),
            boundary: BoundaryRule::Sections {
                marker: "#".into(),
            },
            max_chunk_bytes,
            context_lines: 2,
            dependencies: DependencyRule::SequentialWithinUnit,
            precedence: PrecedenceRule::HigherConfidence {
                tie_break: Some(TieBreak::Later),
            },
            catalog_levels: vec![CatalogLevel::Project, CatalogLevel::Domain],
            require_all_succeed: false,
            parameters: serde_json::Value::Null,
        }
    }

    /// Line-packed chunks with strict all-succeed semantics.
    pub fn lines(max_chunk_bytes: usize) -> Self {
        Self {
            name: "lines".into(),
            version: 1,
            domain: "text".into(),
            boundary: BoundaryRule::Lines,
            max_chunk_bytes,
            context_lines: 0,
            dependencies: DependencyRule::SequentialWithinUnit,
            precedence: PrecedenceRule::LaterWins,
            catalog_levels: vec![CatalogLevel::Project],
            require_all_succeed: true,
            parameters: serde_json::Value::Null,
        }
    }
}

/// Registry of immutable methodology descriptors. New versions are added by offline
/// processes; an existing `(name, version)` is never replaced.
#[derive(Debug, Default)]
pub struct MethodologyRegistry {
    entries: RwLock<BTreeMap<MethodologyRef, Arc<Methodology>>>,
}

impl MethodologyRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_builtins(max_chunk_bytes: usize) -> Self {
        let registry = Self::new();
        for m in [
            Methodology::files(max_chunk_bytes),
            Methodology::documents(max_chunk_bytes),
            Methodology::lines(max_chunk_bytes),
        ] {
            // builtins have distinct names
            let _ = registry.register(m);
        }
        registry
    }

    pub fn register(&self, methodology: Methodology) -> Result<Arc<Methodology>> {
        methodology.validate()?;
        let key = methodology.reference();
        let mut entries = self.entries.write();
        if entries.contains_key(&key) {
            return Err(ChunkflowError::InvalidOperation(format!(
                "methodology {} already registered",
                key
            )));
        }
        let arc = Arc::new(methodology);
        entries.insert(key.clone(), arc.clone());
        info!("Registered methodology {}", key);
        Ok(arc)
    }

    pub fn get(&self, reference: &MethodologyRef) -> Result<Arc<Methodology>> {
        self.entries
            .read()
            .get(reference)
            .cloned()
            .ok_or_else(|| ChunkflowError::MethodologyNotFound(reference.to_string()))
    }

    /// Resolve `name` (latest version) or `name@version`.
    pub fn resolve(&self, id: &str) -> Result<Arc<Methodology>> {
        if let Some((name, version)) = id.split_once('@') {
            let version: u32 = version
                .parse()
                .map_err(|_| ChunkflowError::MethodologyNotFound(id.to_string()))?;
            return self.get(&MethodologyRef::new(name, version));
        }
        self.entries
            .read()
            .iter()
            .filter(|(k, _)| k.name == id)
            .max_by_key(|(k, _)| k.version)
            .map(|(_, v)| v.clone())
            .ok_or_else(|| ChunkflowError::MethodologyNotFound(id.to_string()))
    }

    pub fn list(&self) -> Vec<MethodologyRef> {
        self.entries.read().keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolves_latest_and_exact_versions() {
        let registry = MethodologyRegistry::with_builtins(1024);
        let mut v2 = Methodology::files(2048);
        v2.version = 2;
        registry.register(v2).unwrap();

        assert_eq!(registry.resolve("files").unwrap().version, 2);
        assert_eq!(registry.resolve("files@1").unwrap().max_chunk_bytes, 1024);
        assert!(registry.resolve("files@9").is_err());
        assert!(registry.resolve("nope").is_err());
    }

    #[test]
    fn existing_versions_are_immutable() {
        let registry = MethodologyRegistry::with_builtins(1024);
        let err = registry.register(Methodology::files(4096)).unwrap_err();
        assert!(matches!(err, ChunkflowError::InvalidOperation(_)));
        assert_eq!(registry.resolve("files").unwrap().max_chunk_bytes, 1024);
    }

    #[test]
    fn validation_rejects_zero_bound() {
        let mut m = Methodology::lines(0);
        assert!(m.validate().is_err());
        m.max_chunk_bytes = 10;
        m.boundary = BoundaryRule::Sections {
            marker: String::new(),
        };
        assert!(m.validate().is_err());
    }

    #[test]
    fn ambiguous_precedence_is_a_configuration_error() {
        let mut m = Methodology::documents(1024);
        m.precedence = PrecedenceRule::HigherConfidence { tie_break: None };
        assert!(matches!(
            m.validate(),
            Err(DecompositionError::InvalidMethodology(msg)) if msg.contains("tie_break")
        ));
        let registry = MethodologyRegistry::new();
        assert!(registry.register(m.clone()).is_err());

        m.precedence = PrecedenceRule::HigherConfidence {
            tie_break: Some(TieBreak::Earlier),
        };
        registry.register(m).unwrap();
    }
}
