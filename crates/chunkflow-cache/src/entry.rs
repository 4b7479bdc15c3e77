use chrono::{DateTime, Utc};
use chunkflow_core::compression::{decode_payload, encode_payload};
use chunkflow_core::{CatalogInconsistency, CatalogLevel, ContentId, MethodologyRef};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Name of the global scope.
pub const GLOBAL_SCOPE: &str = "*";

/// First level of the catalog index: which sub-index an entry lives in.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ScopePath {
    pub level: CatalogLevel,
    pub name: String,
}

impl ScopePath {
    pub fn project<S: Into<String>>(name: S) -> Self {
        Self {
            level: CatalogLevel::Project,
            name: name.into(),
        }
    }

    pub fn domain<S: Into<String>>(name: S) -> Self {
        Self {
            level: CatalogLevel::Domain,
            name: name.into(),
        }
    }

    pub fn global() -> Self {
        Self {
            level: CatalogLevel::Global,
            name: GLOBAL_SCOPE.to_string(),
        }
    }
}

impl fmt::Display for ScopePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.level, self.name)
    }
}

/// Full address of a catalog slot.
///
/// Project slots are keyed by content id. Domain and global slots are keyed by content
/// digest, so identical content analysed in different projects shares one entry.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CatalogKey {
    pub path: ScopePath,
    pub key: String,
}

impl CatalogKey {
    pub fn new(path: ScopePath, key: impl Into<String>) -> Self {
        Self {
            path,
            key: key.into(),
        }
    }

    pub fn resolve(level: CatalogLevel, content_id: &ContentId, digest: &str, domain: &str) -> Self {
        match level {
            CatalogLevel::Project => {
                Self::new(ScopePath::project(content_id.project()), content_id.as_str())
            }
            CatalogLevel::Domain => Self::new(ScopePath::domain(domain), digest),
            CatalogLevel::Global => Self::new(ScopePath::global(), digest),
        }
    }

    /// Keys for every listed level, in the order given.
    pub fn for_levels(
        levels: &[CatalogLevel],
        content_id: &ContentId,
        digest: &str,
        domain: &str,
    ) -> Vec<Self> {
        levels
            .iter()
            .map(|level| Self::resolve(*level, content_id, digest, domain))
            .collect()
    }

    pub fn storage_key(&self) -> String {
        format!("{}|{}", self.path, self.key)
    }
}

impl fmt::Display for CatalogKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.path, self.key)
    }
}

/// One version of a cached analysis result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CatalogEntry {
    pub key: CatalogKey,
    pub content_id: ContentId,
    pub digest: String,
    /// JSON payload, `zstd:`-compressed when large.
    pub payload: String,
    pub producer: MethodologyRef,
    pub confidence: f64,
    /// Catalog-wide write order; assigned by the catalog on `put`.
    pub sequence: u64,
    pub created_at: DateTime<Utc>,
    pub tombstone: bool,
}

impl CatalogEntry {
    pub fn new(
        content_id: ContentId,
        digest: impl Into<String>,
        payload: &serde_json::Value,
        producer: MethodologyRef,
        confidence: f64,
    ) -> Self {
        Self {
            key: CatalogKey::new(ScopePath::global(), String::new()),
            content_id,
            digest: digest.into(),
            payload: encode_payload(payload),
            producer,
            confidence,
            sequence: 0,
            created_at: Utc::now(),
            tombstone: false,
        }
    }

    pub(crate) fn tombstone_for(previous: &CatalogEntry) -> Self {
        Self {
            payload: String::new(),
            tombstone: true,
            created_at: Utc::now(),
            ..previous.clone()
        }
    }

    pub fn payload(&self) -> Result<serde_json::Value, CatalogInconsistency> {
        decode_payload(&self.payload).map_err(|e| CatalogInconsistency::Corrupted {
            content_id: self.content_id.clone(),
            reason: format!("{:#}", e),
        })
    }
}
