//! Storage trait definitions for featureflow
//!
//! `DocumentStore` persists the serialized coordination document of each
//! workflow run, keyed by feature id. The store treats the payload as opaque
//! bytes; encoding the document is the caller's concern.
//!
//! In-memory fakes are provided for testing via the `fakes` module.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::Sha256;

use crate::error::StorageError;

/// Result type for storage operations
pub type StorageResult<T> = std::result::Result<T, StorageError>;

/// Document digest (SHA-256 hex string).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DocumentDigest(String);

impl DocumentDigest {
    /// Compute the SHA-256 digest of the given bytes.
    pub fn from_bytes(data: &[u8]) -> Self {
        use sha2::Digest;
        let mut hasher = Sha256::new();
        hasher.update(data);
        DocumentDigest(hex::encode(hasher.finalize()))
    }

    /// Return the full hex string.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Short form (first 12 hex chars).
    pub fn short(&self) -> &str {
        &self.0[..12.min(self.0.len())]
    }
}

impl std::fmt::Display for DocumentDigest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Bookkeeping stored next to every document payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentMeta {
    pub feature_id: String,
    pub version: u64,
    pub digest: DocumentDigest,
    pub stored_at: DateTime<Utc>,
}

/// A document payload read back from a store, integrity-verified.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredDocument {
    pub meta: DocumentMeta,
    pub bytes: Vec<u8>,
}

/// Versioned document store.
///
/// Guarantees:
/// - `put` only accepts a version strictly newer than the stored one.
/// - `get` returns exactly the bytes of the latest accepted `put`, or
///   `StorageError::DigestMismatch` if they were altered at rest.
/// - Documents are never deleted; a stale document is a valid resumption point.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Store a new version of a document and return its digest.
    async fn put(&self, feature_id: &str, version: u64, bytes: &[u8])
        -> StorageResult<DocumentMeta>;

    /// Fetch the latest version. Returns `StorageError::NotFound` if absent.
    async fn get(&self, feature_id: &str) -> StorageResult<StoredDocument>;

    /// Whether any version is stored under `feature_id`.
    async fn contains(&self, feature_id: &str) -> StorageResult<bool>;

    /// All stored feature ids, sorted.
    async fn list(&self) -> StorageResult<Vec<String>>;
}

/// Reject keys that cannot safely be used as a single path segment.
pub fn validate_key(feature_id: &str) -> StorageResult<()> {
    let valid = !feature_id.is_empty()
        && feature_id != "."
        && feature_id != ".."
        && feature_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
    if !valid {
        return Err(StorageError::InvalidKey {
            key: feature_id.to_string(),
        });
    }
    Ok(())
}

/// Shared version rule for every store implementation.
pub(crate) fn check_version(
    feature_id: &str,
    stored: Option<u64>,
    attempted: u64,
) -> StorageResult<()> {
    match stored {
        Some(stored) if attempted <= stored => Err(StorageError::VersionConflict {
            feature_id: feature_id.to_string(),
            stored,
            attempted,
        }),
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_digest_is_stable_for_identical_bytes() {
        let a = DocumentDigest::from_bytes(b"{\"feature_id\":\"x\"}");
        let b = DocumentDigest::from_bytes(b"{\"feature_id\":\"x\"}");
        assert_eq!(a, b);
        assert_eq!(a.as_str().len(), 64);
        assert_eq!(a.short().len(), 12);
    }

    #[test]
    fn test_validate_key_rejects_path_traversal() {
        assert!(validate_key("feat-20240101-abc").is_ok());
        assert!(validate_key("..").is_err());
        assert!(validate_key("a/b").is_err());
        assert!(validate_key("").is_err());
    }

    #[test]
    fn test_check_version_requires_strictly_newer() {
        assert!(check_version("f", None, 0).is_ok());
        assert!(check_version("f", Some(2), 3).is_ok());
        assert!(matches!(
            check_version("f", Some(2), 2),
            Err(StorageError::VersionConflict { stored: 2, .. })
        ));
    }
}
