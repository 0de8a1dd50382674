//! featureflow-store: persistence for workflow coordination documents
//!
//! ## Layer 0 - Data/Persistence
//!
//! Focus: integrity (digest-verified reads), monotonic versions, and
//! resumability. Documents are never deleted.
//!
//! ## Key Components
//!
//! - `DocumentStore`: async, backend-agnostic storage trait
//! - `FsDocumentStore`: atomic filesystem store with digest metadata
//! - `fakes::MemoryDocumentStore`: in-memory store for tests

mod error;
pub mod fakes;
mod fs_store;
pub mod storage_traits;

pub use error::StorageError;
pub use fs_store::FsDocumentStore;
pub use storage_traits::{
    validate_key, DocumentDigest, DocumentMeta, DocumentStore, StorageResult, StoredDocument,
};
