//! Loading and saving documents through a [`DocumentStore`].

use std::sync::Arc;

use featureflow_store::{DocumentStore, StorageError};
use tracing::debug;

use crate::domain::error::{FlowError, Result};
use crate::domain::{Document, FeatureId};
use crate::graph::StageGraph;

/// Typed document access on top of a byte-level store.
#[derive(Clone)]
pub struct DocumentRepo {
    store: Arc<dyn DocumentStore>,
}

impl DocumentRepo {
    pub fn new(store: Arc<dyn DocumentStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<dyn DocumentStore> {
        &self.store
    }

    /// Persist `doc` at its current version. The store refuses versions that
    /// are not newer than the stored one.
    pub async fn save(&self, doc: &Document) -> Result<()> {
        let bytes = doc.to_json()?;
        let meta = self
            .store
            .put(doc.feature_id().as_str(), doc.version(), &bytes)
            .await?;
        debug!(feature_id = %doc.feature_id(), version = meta.version, digest = %meta.digest.short(), "document saved");
        Ok(())
    }

    /// Load a document and check it against the configured graph.
    pub async fn load(&self, feature_id: &FeatureId, graph: &StageGraph) -> Result<Document> {
        let stored = self.store.get(feature_id.as_str()).await?;
        let doc = Document::from_json(&stored.bytes)?;
        if doc.feature_id() != feature_id || doc.version() != stored.meta.version {
            return Err(FlowError::SchemaMismatch {
                feature_id: feature_id.to_string(),
                detail: format!(
                    "stored metadata (version {}) does not match document {} v{}",
                    stored.meta.version,
                    doc.feature_id(),
                    doc.version()
                ),
            });
        }
        graph.check_document(&doc)?;
        Ok(doc)
    }

    pub async fn exists(&self, feature_id: &FeatureId) -> Result<bool> {
        Ok(self.store.contains(feature_id.as_str()).await?)
    }

    /// Stored feature ids, skipping keys that are not valid feature ids.
    pub async fn list(&self) -> Result<Vec<FeatureId>> {
        let keys = self.store.list().await?;
        Ok(keys.into_iter().filter_map(|k| FeatureId::new(k).ok()).collect())
    }
}

/// `true` when a storage error means "no such document".
pub fn is_not_found(err: &FlowError) -> bool {
    matches!(err, FlowError::Storage(StorageError::NotFound { .. }))
}
