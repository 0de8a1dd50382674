//! TOML workflow configuration.
//!
//! A [`WorkflowConfig`] is the raw, serde-facing shape of `featureflow.toml`.
//! [`WorkflowConfig::build`] validates it into an immutable
//! [`WorkflowDefinition`]: the role registry, the stage graph, the retry
//! policy and the entry-point bindings the dispatcher runs with.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::dispatch::entry::EntryBindings;
use crate::domain::{FlowError, RoleId, StageId};
use crate::fanout::{FanOutConfig, PartialMergePolicy};
use crate::graph::{BranchTargets, StageDefinition, StageGraph, StageKind};
use crate::retry::{FailureCategory, RetryPolicy};
use crate::roles::{RoleDefinition, RoleRegistry};

/// Built-in feature-development pipeline, used when no config file exists.
pub const DEFAULT_TOML: &str = include_str!("default_pipeline.toml");

/// Executor key used for roles without their own entry.
pub const DEFAULT_EXECUTOR: &str = "default";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("failed to render config: {0}")]
    Render(#[from] toml::ser::Error),

    #[error(transparent)]
    Invalid(#[from] FlowError),
}

pub type ConfigResult<T> = std::result::Result<T, ConfigError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageKindSpec {
    Standard,
    Optional,
    Terminal,
    Branch,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageSpec {
    pub id: StageId,
    pub role: RoleId,
    #[serde(default = "default_kind")]
    pub kind: StageKindSpec,
    #[serde(default)]
    pub requires: Vec<StageId>,
    #[serde(default)]
    pub instructions: String,
    /// Disjoint regions the stage is fanned out over.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sections: Vec<String>,
    /// Branch stages only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub targets: Option<BranchTargets>,
}

fn default_kind() -> StageKindSpec {
    StageKindSpec::Standard
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CategorySpec {
    pub name: String,
    pub role: RoleId,
    #[serde(default)]
    pub patterns: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetrySpec {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default)]
    pub categories: Vec<CategorySpec>,
}

fn default_max_attempts() -> u32 {
    3
}

impl Default for RetrySpec {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            categories: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FanOutSpec {
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,
    #[serde(default)]
    pub partial_merge: PartialMergePolicy,
}

fn default_max_concurrent() -> usize {
    FanOutConfig::default().max_concurrent
}

impl Default for FanOutSpec {
    fn default() -> Self {
        Self {
            max_concurrent: default_max_concurrent(),
            partial_merge: PartialMergePolicy::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatchSpec {
    /// How many recent handoff entries each task input carries.
    #[serde(default = "default_handoff_tail")]
    pub handoff_tail: usize,
}

fn default_handoff_tail() -> usize {
    10
}

impl Default for DispatchSpec {
    fn default() -> Self {
        Self {
            handoff_tail: default_handoff_tail(),
        }
    }
}

/// How to run the executor for one role.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutorSpec {
    /// Program followed by its arguments.
    pub command: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub env: BTreeMap<String, String>,
}

/// The raw contents of `featureflow.toml`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowConfig {
    #[serde(default)]
    pub retry: RetrySpec,
    #[serde(default)]
    pub fanout: FanOutSpec,
    #[serde(default)]
    pub dispatch: DispatchSpec,
    pub entry_points: EntryBindings,
    /// Keyed by role id, or [`DEFAULT_EXECUTOR`].
    #[serde(default)]
    pub executors: BTreeMap<String, ExecutorSpec>,
    pub roles: Vec<RoleDefinition>,
    pub stages: Vec<StageSpec>,
}

/// Validated, immutable workflow configuration.
#[derive(Debug, Clone)]
pub struct WorkflowDefinition {
    pub roles: RoleRegistry,
    pub graph: StageGraph,
    pub retry: RetryPolicy,
    pub entry_points: EntryBindings,
    pub fanout: FanOutConfig,
    pub partial_merge: PartialMergePolicy,
    pub handoff_tail: usize,
    pub executors: BTreeMap<String, ExecutorSpec>,
}

impl WorkflowDefinition {
    /// Executor settings for `role`, falling back to the default entry.
    pub fn executor_for(&self, role: &RoleId) -> Option<&ExecutorSpec> {
        self.executors
            .get(role.as_str())
            .or_else(|| self.executors.get(DEFAULT_EXECUTOR))
    }
}

impl WorkflowConfig {
    pub fn default_pipeline() -> ConfigResult<Self> {
        Self::from_toml(DEFAULT_TOML)
    }

    pub fn from_toml(text: &str) -> ConfigResult<Self> {
        Ok(toml::from_str(text)?)
    }

    pub fn to_toml(&self) -> ConfigResult<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    pub fn load(path: &Path) -> ConfigResult<Self> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        debug!(path = %path.display(), "loaded workflow config");
        Self::from_toml(&text)
    }

    /// `path` when given, otherwise the built-in pipeline.
    pub fn load_or_default(path: Option<&Path>) -> ConfigResult<Self> {
        match path {
            Some(p) => Self::load(p),
            None => Self::default_pipeline(),
        }
    }

    pub fn build(&self) -> ConfigResult<WorkflowDefinition> {
        if self.roles.is_empty() {
            return Err(invalid("at least one role is required"));
        }
        let roles = RoleRegistry::new(self.roles.iter().cloned())?;

        let stages = self
            .stages
            .iter()
            .map(StageSpec::to_definition)
            .collect::<ConfigResult<Vec<_>>>()?;
        let graph = StageGraph::new(stages, &roles)?;

        let mut categories = Vec::with_capacity(self.retry.categories.len());
        for c in &self.retry.categories {
            if !roles.contains(&c.role) {
                return Err(invalid(format!(
                    "retry category {} maps to unknown role {}",
                    c.name, c.role
                )));
            }
            categories.push(FailureCategory::new(c.name.clone(), c.role.clone(), &c.patterns)?);
        }
        let retry = RetryPolicy::new(self.retry.max_attempts, categories)?;

        self.entry_points.validate(&graph)?;

        if self.fanout.max_concurrent == 0 {
            return Err(invalid("fanout.max_concurrent must be at least 1"));
        }
        if self.dispatch.handoff_tail == 0 {
            return Err(invalid("dispatch.handoff_tail must be at least 1"));
        }

        for (key, spec) in &self.executors {
            if key != DEFAULT_EXECUTOR && !RoleId::new(key.as_str()).is_ok_and(|r| roles.contains(&r))
            {
                return Err(invalid(format!("executor configured for unknown role {key}")));
            }
            if spec.command.first().map_or(true, |p| p.trim().is_empty()) {
                return Err(invalid(format!("executor {key} has an empty command")));
            }
        }

        Ok(WorkflowDefinition {
            roles,
            graph,
            retry,
            entry_points: self.entry_points.clone(),
            fanout: FanOutConfig {
                max_concurrent: self.fanout.max_concurrent,
            },
            partial_merge: self.fanout.partial_merge,
            handoff_tail: self.dispatch.handoff_tail,
            executors: self.executors.clone(),
        })
    }
}

impl StageSpec {
    fn to_definition(&self) -> ConfigResult<StageDefinition> {
        let kind = match (self.kind, &self.targets) {
            (StageKindSpec::Branch, Some(targets)) => StageKind::Branch {
                targets: targets.clone(),
            },
            (StageKindSpec::Branch, None) => {
                return Err(invalid(format!("branch stage {} has no targets", self.id)));
            }
            (_, Some(_)) => {
                return Err(invalid(format!(
                    "stage {} has targets but is not a branch stage",
                    self.id
                )));
            }
            (StageKindSpec::Standard, None) => StageKind::Standard,
            (StageKindSpec::Optional, None) => StageKind::Optional,
            (StageKindSpec::Terminal, None) => StageKind::Terminal,
        };
        Ok(StageDefinition {
            id: self.id.clone(),
            role: self.role.clone(),
            required_predecessors: self.requires.iter().cloned().collect::<BTreeSet<_>>(),
            kind,
            instructions: self.instructions.clone(),
            sections: self.sections.clone(),
        })
    }
}

fn invalid(msg: impl Into<String>) -> ConfigError {
    ConfigError::Invalid(FlowError::InvalidConfig(msg.into()))
}
