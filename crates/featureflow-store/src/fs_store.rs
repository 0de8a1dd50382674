//! Filesystem-backed document store.
//!
//! Layout: `<root>/<feature_id>/document.<version>.json` plus
//! `<root>/<feature_id>/meta.json` carrying the current version and the
//! SHA-256 digest of its payload. Both files are written atomically (temp
//! file in the same directory, then rename), payload first. `meta.json` is
//! the commit point: until it is replaced, `get` keeps serving the previous
//! version, so a crash mid-`put` never strands a document.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::Utc;
use tempfile::NamedTempFile;
use tracing::debug;

use crate::error::StorageError;
use crate::storage_traits::{
    check_version, validate_key, DocumentDigest, DocumentMeta, DocumentStore, StorageResult,
    StoredDocument,
};

const META_FILE: &str = "meta.json";

/// Document store rooted at a directory on disk.
#[derive(Debug, Clone)]
pub struct FsDocumentStore {
    root: PathBuf,
}

impl FsDocumentStore {
    /// Create a store rooted at `root`, creating the directory if needed.
    pub fn new(root: impl AsRef<Path>) -> StorageResult<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn document_dir(&self, feature_id: &str) -> PathBuf {
        self.root.join(feature_id)
    }

    async fn blocking<T, F>(&self, f: F) -> StorageResult<T>
    where
        T: Send + 'static,
        F: FnOnce(PathBuf) -> StorageResult<T> + Send + 'static,
    {
        let root = self.root.clone();
        tokio::task::spawn_blocking(move || f(root))
            .await
            .map_err(|e| StorageError::Task(e.to_string()))?
    }
}

fn write_atomic(dir: &Path, name: &str, data: &[u8]) -> StorageResult<()> {
    let mut tmp = NamedTempFile::new_in(dir)?;
    tmp.write_all(data)?;
    tmp.as_file().sync_all()?;
    tmp.persist(dir.join(name)).map_err(|e| e.error)?;
    Ok(())
}

fn payload_file(version: u64) -> String {
    format!("document.{version}.json")
}

fn read_meta(dir: &Path, feature_id: &str) -> StorageResult<Option<DocumentMeta>> {
    match fs::read(dir.join(META_FILE)) {
        Ok(raw) => Ok(Some(serde_json::from_slice(&raw)?)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            debug!(feature_id, "no meta file");
            Ok(None)
        }
        Err(e) => Err(StorageError::Io(e)),
    }
}

#[async_trait]
impl DocumentStore for FsDocumentStore {
    async fn put(
        &self,
        feature_id: &str,
        version: u64,
        bytes: &[u8],
    ) -> StorageResult<DocumentMeta> {
        validate_key(feature_id)?;
        let dir = self.document_dir(feature_id);
        let feature_id = feature_id.to_string();
        let bytes = bytes.to_vec();

        self.blocking(move |_root| {
            fs::create_dir_all(&dir)?;
            let stored = read_meta(&dir, &feature_id)?.map(|m| m.version);
            check_version(&feature_id, stored, version)?;

            let meta = DocumentMeta {
                feature_id: feature_id.clone(),
                version,
                digest: DocumentDigest::from_bytes(&bytes),
                stored_at: Utc::now(),
            };
            write_atomic(&dir, &payload_file(version), &bytes)?;
            write_atomic(&dir, META_FILE, &serde_json::to_vec_pretty(&meta)?)?;
            if let Some(previous) = stored {
                // No longer referenced once meta.json has moved on.
                if let Err(e) = fs::remove_file(dir.join(payload_file(previous))) {
                    debug!(feature_id = %feature_id, previous, error = %e, "stale payload kept");
                }
            }
            debug!(feature_id = %feature_id, version, digest = %meta.digest.short(), "document stored");
            Ok(meta)
        })
        .await
    }

    async fn get(&self, feature_id: &str) -> StorageResult<StoredDocument> {
        validate_key(feature_id)?;
        let dir = self.document_dir(feature_id);
        let feature_id = feature_id.to_string();

        self.blocking(move |_root| {
            let meta = read_meta(&dir, &feature_id)?.ok_or_else(|| StorageError::NotFound {
                feature_id: feature_id.clone(),
            })?;
            let bytes = fs::read(dir.join(payload_file(meta.version))).map_err(|e| {
                if e.kind() == std::io::ErrorKind::NotFound {
                    StorageError::NotFound {
                        feature_id: feature_id.clone(),
                    }
                } else {
                    StorageError::Io(e)
                }
            })?;

            let actual = DocumentDigest::from_bytes(&bytes);
            if actual != meta.digest {
                return Err(StorageError::DigestMismatch {
                    feature_id,
                    expected: meta.digest.to_string(),
                    actual: actual.to_string(),
                });
            }
            Ok(StoredDocument { meta, bytes })
        })
        .await
    }

    async fn contains(&self, feature_id: &str) -> StorageResult<bool> {
        validate_key(feature_id)?;
        let meta = self.document_dir(feature_id).join(META_FILE);
        self.blocking(move |_root| Ok(meta.is_file())).await
    }

    async fn list(&self) -> StorageResult<Vec<String>> {
        self.blocking(|root| {
            let mut ids = Vec::new();
            for entry in fs::read_dir(&root)? {
                let entry = entry?;
                if entry.path().join(META_FILE).is_file() {
                    if let Some(name) = entry.file_name().to_str() {
                        ids.push(name.to_string());
                    }
                }
            }
            ids.sort();
            Ok(ids)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_store() -> (tempfile::TempDir, FsDocumentStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = FsDocumentStore::new(dir.path()).unwrap();
        (dir, store)
    }

    #[tokio::test]
    async fn document_roundtrip() {
        let (_dir, store) = make_store();
        let meta = store.put("feat-a", 0, b"{\"v\":0}").await.unwrap();
        let got = store.get("feat-a").await.unwrap();
        assert_eq!(got.bytes, b"{\"v\":0}");
        assert_eq!(got.meta, meta);
    }

    #[tokio::test]
    async fn tampered_payload_fails_verification() {
        let (dir, store) = make_store();
        store.put("feat-b", 0, b"original").await.unwrap();
        fs::write(dir.path().join("feat-b").join(payload_file(0)), b"edited").unwrap();

        let err = store.get("feat-b").await.unwrap_err();
        assert!(matches!(err, StorageError::DigestMismatch { .. }));
    }

    #[tokio::test]
    async fn stale_version_is_rejected_and_previous_kept() {
        let (_dir, store) = make_store();
        store.put("feat-c", 3, b"three").await.unwrap();
        let err = store.put("feat-c", 2, b"two").await.unwrap_err();
        assert!(matches!(err, StorageError::VersionConflict { .. }));
        assert_eq!(store.get("feat-c").await.unwrap().bytes, b"three");
    }

    #[tokio::test]
    async fn list_ignores_stray_directories() {
        let (dir, store) = make_store();
        store.put("feat-2", 0, b"x").await.unwrap();
        store.put("feat-1", 0, b"y").await.unwrap();
        fs::create_dir_all(dir.path().join("scratch")).unwrap();

        assert_eq!(store.list().await.unwrap(), vec!["feat-1", "feat-2"]);
    }

    #[tokio::test]
    async fn interrupted_put_leaves_previous_version_readable() {
        let (dir, store) = make_store();
        store.put("feat-d", 1, b"one").await.unwrap();

        // Payload of version 2 landed, meta.json was never switched.
        let doc_dir = dir.path().join("feat-d");
        write_atomic(&doc_dir, &payload_file(2), b"two").unwrap();

        let got = store.get("feat-d").await.unwrap();
        assert_eq!(got.meta.version, 1);
        assert_eq!(got.bytes, b"one");

        // The retried write goes through and replaces the orphan.
        store.put("feat-d", 2, b"two again").await.unwrap();
        let got = store.get("feat-d").await.unwrap();
        assert_eq!(got.meta.version, 2);
        assert_eq!(got.bytes, b"two again");
        assert!(!doc_dir.join(payload_file(1)).exists());
    }

    #[tokio::test]
    async fn contains_tracks_committed_documents() {
        let (_dir, store) = make_store();
        assert!(!store.contains("feat-e").await.unwrap());
        store.put("feat-e", 1, b"x").await.unwrap();
        assert!(store.contains("feat-e").await.unwrap());
    }
}
