use sha2::{Digest, Sha256};

/// Hex SHA-256 of `content`. Catalog entries are only valid while this matches.
pub fn content_digest(content: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content.as_bytes());
    format!("{:x}", hasher.finalize())
}
