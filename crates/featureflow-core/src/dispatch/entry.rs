//! Entry points: which part of the graph a run covers and where it starts.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::domain::error::{FlowError, Result};
use crate::domain::StageId;
use crate::graph::{GraphView, StageGraph};

/// Stage bindings for the entry points that target a single stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryBindings {
    pub plan: StageId,
    pub test: StageId,
    pub build: StageId,
    pub review: StageId,
    pub modernize: StageId,
}

impl EntryBindings {
    pub fn validate(&self, graph: &StageGraph) -> Result<()> {
        for (name, stage) in [
            ("plan", &self.plan),
            ("test", &self.test),
            ("build", &self.build),
            ("review", &self.review),
            ("modernize", &self.modernize),
        ] {
            if !graph.contains(stage) {
                return Err(FlowError::InvalidConfig(format!(
                    "entry point binding {name} names unknown stage {stage}"
                )));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntryPoint {
    FullWorkflow,
    PlanOnly,
    TestOnly,
    BuildOnly,
    ReviewOnly,
    ModernizeOnly,
}

impl EntryPoint {
    pub const ALL: [EntryPoint; 6] = [
        EntryPoint::FullWorkflow,
        EntryPoint::PlanOnly,
        EntryPoint::TestOnly,
        EntryPoint::BuildOnly,
        EntryPoint::ReviewOnly,
        EntryPoint::ModernizeOnly,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            EntryPoint::FullWorkflow => "full-workflow",
            EntryPoint::PlanOnly => "plan-only",
            EntryPoint::TestOnly => "test-only",
            EntryPoint::BuildOnly => "build-only",
            EntryPoint::ReviewOnly => "review-only",
            EntryPoint::ModernizeOnly => "modernize-only",
        }
    }

    /// Single-stage entry points only make sense against a stored document.
    pub fn requires_existing(&self) -> bool {
        !matches!(self, EntryPoint::FullWorkflow | EntryPoint::PlanOnly)
    }

    /// The stage a single-stage entry point runs.
    pub fn single_stage<'a>(&self, bindings: &'a EntryBindings) -> Option<&'a StageId> {
        match self {
            EntryPoint::FullWorkflow | EntryPoint::PlanOnly => None,
            EntryPoint::TestOnly => Some(&bindings.test),
            EntryPoint::BuildOnly => Some(&bindings.build),
            EntryPoint::ReviewOnly => Some(&bindings.review),
            EntryPoint::ModernizeOnly => Some(&bindings.modernize),
        }
    }

    /// The view a run from this entry point works in.
    ///
    /// `plan-only` covers the plan stage and everything it depends on. A
    /// single-stage entry covers just its stage, optional or not; its
    /// predecessors must already be settled in the document.
    pub fn view(
        &self,
        graph: &StageGraph,
        bindings: &EntryBindings,
        with_optional: bool,
    ) -> GraphView {
        match self {
            EntryPoint::FullWorkflow => GraphView::full().with_optional(with_optional),
            EntryPoint::PlanOnly => GraphView::scoped(graph.ancestors_inclusive(&bindings.plan))
                .with_optional(with_optional),
            _ => match self.single_stage(bindings) {
                Some(stage) => GraphView::scoped([stage.clone()]).with_optional(true),
                None => GraphView::full().with_optional(with_optional),
            },
        }
    }
}

impl fmt::Display for EntryPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for EntryPoint {
    type Err = FlowError;

    fn from_str(s: &str) -> Result<Self> {
        EntryPoint::ALL
            .into_iter()
            .find(|e| e.name() == s)
            .ok_or_else(|| FlowError::InvalidId {
                kind: "entry point",
                value: s.to_string(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_names_round_trip() {
        for e in EntryPoint::ALL {
            assert_eq!(e.name().parse::<EntryPoint>().unwrap(), e);
        }
        assert!("deploy-only".parse::<EntryPoint>().is_err());
    }

    #[test]
    fn test_single_stage_entries_require_existing_feature() {
        assert!(!EntryPoint::FullWorkflow.requires_existing());
        assert!(!EntryPoint::PlanOnly.requires_existing());
        assert!(EntryPoint::TestOnly.requires_existing());
        assert!(EntryPoint::ModernizeOnly.requires_existing());
    }

    #[test]
    fn test_single_stage_binding() {
        let sid = |s: &str| StageId::new(s).unwrap();
        let bindings = EntryBindings {
            plan: sid("plan"),
            test: sid("test"),
            build: sid("build"),
            review: sid("review"),
            modernize: sid("modernize"),
        };
        assert_eq!(EntryPoint::BuildOnly.single_stage(&bindings), Some(&sid("build")));
        assert_eq!(EntryPoint::FullWorkflow.single_stage(&bindings), None);
    }
}
