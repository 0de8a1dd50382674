//! Domain models for featureflow.
//!
//! - `Document`: the shared coordination document of one workflow run
//! - `HandoffEntry`: an immutable record in the document's log
//! - typed identifiers for features, stages, roles and artifacts

pub mod document;
pub mod error;
pub mod ids;

pub use document::{
    Document, HandoffEntry, HandoffOutcome, ProposedUpdate, StageStatus, StageStatusEntry,
    StatusChange,
};
pub use error::{DocumentError, FlowError, Result};
pub use ids::{ArtifactRef, BranchValue, FeatureId, RoleId, StageId};
