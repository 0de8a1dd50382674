//! In-memory fakes for storage traits (testing only)
//!
//! `MemoryDocumentStore` satisfies the `DocumentStore` contract without
//! touching the filesystem.

use std::collections::BTreeMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::Utc;

use crate::error::StorageError;
use crate::storage_traits::*;

/// In-memory document store backed by a `BTreeMap<feature_id, StoredDocument>`.
#[derive(Debug, Default)]
pub struct MemoryDocumentStore {
    docs: Mutex<BTreeMap<String, StoredDocument>>,
}

impl MemoryDocumentStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of distinct documents held.
    pub fn len(&self) -> usize {
        self.docs.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl DocumentStore for MemoryDocumentStore {
    async fn put(
        &self,
        feature_id: &str,
        version: u64,
        bytes: &[u8],
    ) -> StorageResult<DocumentMeta> {
        validate_key(feature_id)?;
        let mut docs = self.docs.lock().unwrap();
        check_version(feature_id, docs.get(feature_id).map(|d| d.meta.version), version)?;

        let meta = DocumentMeta {
            feature_id: feature_id.to_string(),
            version,
            digest: DocumentDigest::from_bytes(bytes),
            stored_at: Utc::now(),
        };
        docs.insert(
            feature_id.to_string(),
            StoredDocument {
                meta: meta.clone(),
                bytes: bytes.to_vec(),
            },
        );
        Ok(meta)
    }

    async fn get(&self, feature_id: &str) -> StorageResult<StoredDocument> {
        let docs = self.docs.lock().unwrap();
        docs.get(feature_id)
            .cloned()
            .ok_or_else(|| StorageError::NotFound {
                feature_id: feature_id.to_string(),
            })
    }

    async fn contains(&self, feature_id: &str) -> StorageResult<bool> {
        Ok(self.docs.lock().unwrap().contains_key(feature_id))
    }

    async fn list(&self) -> StorageResult<Vec<String>> {
        Ok(self.docs.lock().unwrap().keys().cloned().collect())
    }
}
