//! Typed identifiers: `FeatureId`, `StageId`, `RoleId`, `BranchValue`, `ArtifactRef`.
//!
//! Stage and role ids are validated slugs so configuration typos surface at
//! load time, never at dispatch time.

use std::fmt;
use std::str::FromStr;

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::domain::error::FlowError;

fn is_slug(s: &str) -> bool {
    let mut chars = s.chars();
    match chars.next() {
        Some(c) if c.is_ascii_lowercase() || c.is_ascii_digit() => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' || c == '_')
}

/// Identifier of a stage in the stage graph.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct StageId(String);

impl StageId {
    pub fn new(id: impl Into<String>) -> Result<Self, FlowError> {
        let id = id.into();
        if !is_slug(&id) {
            return Err(FlowError::InvalidId {
                kind: "stage",
                value: id,
            });
        }
        Ok(Self(id))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Identifier of an executor role.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct RoleId(String);

impl RoleId {
    pub fn new(id: impl Into<String>) -> Result<Self, FlowError> {
        let id = id.into();
        if !is_slug(&id) {
            return Err(FlowError::InvalidId {
                kind: "role",
                value: id,
            });
        }
        Ok(Self(id))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Stable identifier of one workflow run, assigned at start.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct FeatureId(String);

impl FeatureId {
    pub fn new(id: impl Into<String>) -> Result<Self, FlowError> {
        let id = id.into();
        featureflow_store::validate_key(&id).map_err(|_| FlowError::InvalidId {
            kind: "feature",
            value: id.clone(),
        })?;
        Ok(Self(id))
    }

    /// A fresh id of the form `feat-YYYYMMDD-xxxxxxxx`.
    pub fn generate() -> Self {
        let suffix = uuid::Uuid::new_v4().simple().to_string();
        Self(format!(
            "feat-{}-{}",
            Utc::now().format("%Y%m%d"),
            &suffix[..8]
        ))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Opaque reference to a file or resource produced by a stage.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ArtifactRef(String);

impl ArtifactRef {
    pub fn new(reference: impl Into<String>) -> Result<Self, FlowError> {
        let reference = reference.into();
        if reference.trim().is_empty() {
            return Err(FlowError::InvalidId {
                kind: "artifact",
                value: reference,
            });
        }
        Ok(Self(reference))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

macro_rules! string_conversions {
    ($($ty:ident),*) => {$(
        impl TryFrom<String> for $ty {
            type Error = FlowError;

            fn try_from(value: String) -> Result<Self, Self::Error> {
                $ty::new(value)
            }
        }

        impl From<$ty> for String {
            fn from(value: $ty) -> Self {
                value.0
            }
        }

        impl FromStr for $ty {
            type Err = FlowError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                $ty::new(s)
            }
        }

        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.pad(&self.0)
            }
        }
    )*};
}

string_conversions!(StageId, RoleId, FeatureId, ArtifactRef);

/// The two alternative downstream paths selected by the branch stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum BranchValue {
    A,
    B,
}

impl BranchValue {
    pub const ALL: [BranchValue; 2] = [BranchValue::A, BranchValue::B];

    pub fn other(self) -> BranchValue {
        match self {
            BranchValue::A => BranchValue::B,
            BranchValue::B => BranchValue::A,
        }
    }
}

impl fmt::Display for BranchValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BranchValue::A => f.write_str("A"),
            BranchValue::B => f.write_str("B"),
        }
    }
}

impl FromStr for BranchValue {
    type Err = FlowError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "A" | "a" => Ok(BranchValue::A),
            "B" | "b" => Ok(BranchValue::B),
            other => Err(FlowError::InvalidId {
                kind: "branch",
                value: other.to_string(),
            }),
        }
    }
}
