//! Stage graph: the legal ordering of work.
//!
//! Built once from configuration and validated up front, so that a
//! dispatched stage never discovers a dangling predecessor or missing role.
//! [`StageGraph::next`] is a pure function of the document and a
//! [`GraphView`]; nothing about routing is read from free text.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::domain::error::{FlowError, Result};
use crate::domain::{
    BranchValue, Document, FeatureId, HandoffOutcome, RoleId, StageId, StageStatus, StatusChange,
};
use crate::retry::EscalationSummary;
use crate::roles::{RejectReason, RoleRegistry};

/// Entry stage of each downstream path of the branch stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BranchTargets {
    #[serde(rename = "A")]
    pub a: StageId,
    #[serde(rename = "B")]
    pub b: StageId,
}

impl BranchTargets {
    pub fn get(&self, value: BranchValue) -> &StageId {
        match value {
            BranchValue::A => &self.a,
            BranchValue::B => &self.b,
        }
    }

    pub fn pairs(&self) -> [(BranchValue, &StageId); 2] {
        [(BranchValue::A, &self.a), (BranchValue::B, &self.b)]
    }
}

/// Stage kind, one tagged variant per schema shape.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StageKind {
    Standard,
    /// Not required for completion; dispatched only when optional stages are included.
    Optional,
    /// No stage may depend on it.
    Terminal,
    Branch { targets: BranchTargets },
}

/// Static definition of one stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageDefinition {
    pub id: StageId,
    pub role: RoleId,
    pub required_predecessors: BTreeSet<StageId>,
    pub kind: StageKind,
    pub instructions: String,
    /// Non-empty: the stage runs once per section through the fan-out helper.
    pub sections: Vec<String>,
}

impl StageDefinition {
    pub fn is_branch(&self) -> bool {
        matches!(self.kind, StageKind::Branch { .. })
    }

    pub fn is_optional(&self) -> bool {
        matches!(self.kind, StageKind::Optional)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self.kind, StageKind::Terminal)
    }

    pub fn branch_targets(&self) -> Option<&BranchTargets> {
        match &self.kind {
            StageKind::Branch { targets } => Some(targets),
            _ => None,
        }
    }
}

/// Why the graph has no stage to hand out.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BlockReason {
    /// The branch stage ran but no path was chosen.
    BranchUndecided {
        stage: StageId,
        options: Vec<(BranchValue, StageId)>,
    },
    MissingPredecessors {
        stage: StageId,
        missing: Vec<StageId>,
    },
    /// Retries exhausted; a human has to look at the failure.
    NeedsUserInput(EscalationSummary),
}

impl fmt::Display for BlockReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BlockReason::BranchUndecided { stage, options } => {
                let opts: Vec<String> = options
                    .iter()
                    .map(|(v, s)| format!("{v} -> {s}"))
                    .collect();
                write!(
                    f,
                    "branch stage {stage} needs a decision: choose one of [{}]",
                    opts.join(", ")
                )
            }
            BlockReason::MissingPredecessors { stage, missing } => {
                let names: Vec<&str> = missing.iter().map(StageId::as_str).collect();
                write!(
                    f,
                    "stage {stage} cannot start: predecessors not complete: {}",
                    names.join(", ")
                )
            }
            BlockReason::NeedsUserInput(summary) => write!(f, "{summary}"),
        }
    }
}

/// Result of [`StageGraph::next`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Next {
    Stage(StageId),
    Done,
    Blocked(BlockReason),
}

/// Which part of the graph a run may touch.
///
/// Stages outside the scope are treated as skipped for completion, but do
/// *not* satisfy predecessor constraints of in-scope stages. Nothing about
/// the view is persisted in the document.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct GraphView {
    scope: Option<BTreeSet<StageId>>,
    include_optional: bool,
}

impl GraphView {
    /// Every stage; optional stages excluded.
    pub fn full() -> Self {
        Self::default()
    }

    pub fn scoped(stages: impl IntoIterator<Item = StageId>) -> Self {
        Self {
            scope: Some(stages.into_iter().collect()),
            include_optional: false,
        }
    }

    pub fn with_optional(mut self, include: bool) -> Self {
        self.include_optional = include;
        self
    }

    pub fn includes_optional(&self) -> bool {
        self.include_optional
    }

    pub fn in_scope(&self, stage: &StageId) -> bool {
        self.scope.as_ref().map(|s| s.contains(stage)).unwrap_or(true)
    }
}

/// Validated, immutable stage graph.
#[derive(Debug, Clone)]
pub struct StageGraph {
    stages: Vec<StageDefinition>,
    index: BTreeMap<StageId, usize>,
    branch: Option<usize>,
    exclusive: BTreeMap<BranchValue, BTreeSet<StageId>>,
}

impl StageGraph {
    /// Validate `stages` against `roles` and build the graph.
    pub fn new(stages: Vec<StageDefinition>, roles: &RoleRegistry) -> Result<Self> {
        let invalid = |msg: String| Err(FlowError::InvalidConfig(msg));

        if stages.is_empty() {
            return invalid("stage graph has no stages".to_string());
        }

        let mut index = BTreeMap::new();
        for (i, stage) in stages.iter().enumerate() {
            if index.insert(stage.id.clone(), i).is_some() {
                return invalid(format!("duplicate stage id: {}", stage.id));
            }
        }

        let mut branch = None;
        for (i, stage) in stages.iter().enumerate() {
            if !roles.contains(&stage.role) {
                return invalid(format!("stage {} uses unknown role {}", stage.id, stage.role));
            }
            for pred in &stage.required_predecessors {
                if pred == &stage.id {
                    return invalid(format!("stage {} lists itself as a predecessor", stage.id));
                }
                let Some(&p) = index.get(pred) else {
                    return invalid(format!(
                        "stage {} lists unknown predecessor {}",
                        stage.id, pred
                    ));
                };
                if stages[p].is_terminal() {
                    return invalid(format!(
                        "terminal stage {} cannot be a predecessor of {}",
                        pred, stage.id
                    ));
                }
            }
            let mut seen = BTreeSet::new();
            for section in &stage.sections {
                if section.trim().is_empty() || !seen.insert(section.as_str()) {
                    return invalid(format!(
                        "stage {} has an empty or duplicate section {:?}",
                        stage.id, section
                    ));
                }
            }
            if let Some(targets) = stage.branch_targets() {
                if branch.replace(i).is_some() {
                    return invalid("at most one branch stage is allowed".to_string());
                }
                if targets.a == targets.b {
                    return invalid(format!(
                        "branch stage {} must target two different stages",
                        stage.id
                    ));
                }
                for (value, target) in targets.pairs() {
                    let Some(&t) = index.get(target) else {
                        return invalid(format!(
                            "branch {} of {} targets unknown stage {}",
                            value, stage.id, target
                        ));
                    };
                    if !stages[t].required_predecessors.contains(&stage.id) {
                        return invalid(format!(
                            "branch target {} must list {} as a predecessor",
                            target, stage.id
                        ));
                    }
                }
            }
        }

        let mut graph = Self {
            stages,
            index,
            branch,
            exclusive: BTreeMap::new(),
        };
        graph.check_acyclic()?;
        graph.exclusive = graph.compute_exclusive();
        Ok(graph)
    }

    /// Kahn's algorithm over declaration order.
    fn check_acyclic(&self) -> Result<()> {
        let mut indegree: Vec<usize> = self
            .stages
            .iter()
            .map(|s| s.required_predecessors.len())
            .collect();
        let mut queue: VecDeque<usize> = (0..self.stages.len())
            .filter(|&i| indegree[i] == 0)
            .collect();
        let mut visited = 0;
        while let Some(i) = queue.pop_front() {
            visited += 1;
            for succ in self.successor_indices(&self.stages[i].id) {
                indegree[succ] -= 1;
                if indegree[succ] == 0 {
                    queue.push_back(succ);
                }
            }
        }
        if visited != self.stages.len() {
            return Err(FlowError::InvalidConfig(
                "stage graph contains a dependency cycle".to_string(),
            ));
        }
        Ok(())
    }

    fn successor_indices<'a>(&'a self, id: &'a StageId) -> impl Iterator<Item = usize> + 'a {
        self.stages
            .iter()
            .enumerate()
            .filter(move |(_, s)| s.required_predecessors.contains(id))
            .map(|(i, _)| i)
    }

    fn compute_exclusive(&self) -> BTreeMap<BranchValue, BTreeSet<StageId>> {
        let mut exclusive = BTreeMap::new();
        let Some(targets) = self.branch_stage().and_then(|s| s.branch_targets()) else {
            return exclusive;
        };
        let reach: BTreeMap<BranchValue, BTreeSet<StageId>> = targets
            .pairs()
            .into_iter()
            .map(|(value, target)| {
                let mut set = self.descendants(target);
                set.insert(target.clone());
                (value, set)
            })
            .collect();
        for value in BranchValue::ALL {
            let own = &reach[&value];
            let others: BTreeSet<&StageId> = reach
                .iter()
                .filter(|(v, _)| **v != value)
                .flat_map(|(_, s)| s.iter())
                .collect();
            exclusive.insert(
                value,
                own.iter().filter(|s| !others.contains(s)).cloned().collect(),
            );
        }
        exclusive
    }

    pub fn stages(&self) -> &[StageDefinition] {
        &self.stages
    }

    pub fn stage_ids(&self) -> impl Iterator<Item = &StageId> {
        self.stages.iter().map(|s| &s.id)
    }

    pub fn stage(&self, id: &StageId) -> Option<&StageDefinition> {
        self.index.get(id).map(|&i| &self.stages[i])
    }

    pub fn contains(&self, id: &StageId) -> bool {
        self.index.contains_key(id)
    }

    /// First declared stage without predecessors.
    pub fn first_stage(&self) -> &StageDefinition {
        self.stages
            .iter()
            .find(|s| s.required_predecessors.is_empty())
            .unwrap_or(&self.stages[0])
    }

    pub fn branch_stage(&self) -> Option<&StageDefinition> {
        self.branch.map(|i| &self.stages[i])
    }

    /// Stages that only run when the branch resolves to `value`.
    pub fn exclusive_to(&self, value: BranchValue) -> Option<&BTreeSet<StageId>> {
        self.exclusive.get(&value)
    }

    /// All transitive successors of `id`, excluding `id` itself.
    pub fn descendants(&self, id: &StageId) -> BTreeSet<StageId> {
        let mut out = BTreeSet::new();
        let mut queue = VecDeque::from([id.clone()]);
        while let Some(current) = queue.pop_front() {
            for succ in self.successor_indices(&current).collect::<Vec<_>>() {
                let succ_id = self.stages[succ].id.clone();
                if out.insert(succ_id.clone()) {
                    queue.push_back(succ_id);
                }
            }
        }
        out
    }

    /// `id` together with all its transitive predecessors.
    pub fn ancestors_inclusive(&self, id: &StageId) -> BTreeSet<StageId> {
        let mut out = BTreeSet::new();
        let mut queue = VecDeque::from([id.clone()]);
        while let Some(current) = queue.pop_front() {
            if !out.insert(current.clone()) {
                continue;
            }
            if let Some(stage) = self.stage(&current) {
                queue.extend(stage.required_predecessors.iter().cloned());
            }
        }
        out
    }

    /// A fresh document listing this graph's stages, all pending.
    pub fn new_document(&self, feature_id: FeatureId, description: impl Into<String>) -> Document {
        Document::new(feature_id, description, self.stage_ids().cloned())
    }

    /// Verify a loaded document tracks exactly this graph's stages, in order.
    pub fn check_document(&self, doc: &Document) -> Result<()> {
        let doc_ids: Vec<&StageId> = doc.stage_statuses().iter().map(|e| &e.stage).collect();
        let graph_ids: Vec<&StageId> = self.stage_ids().collect();
        if doc_ids != graph_ids {
            return Err(FlowError::SchemaMismatch {
                feature_id: doc.feature_id().to_string(),
                detail: format!("document stages {doc_ids:?} != graph stages {graph_ids:?}"),
            });
        }
        Ok(())
    }

    /// Executors may only propose skipping a pending optional stage, or
    /// restate a settled stage's status. `pending` is never a proposal.
    pub fn vet_status_change(
        &self,
        change: &StatusChange,
        doc: &Document,
    ) -> std::result::Result<(), RejectReason> {
        let (Some(stage), Some(from)) = (self.stage(&change.stage), doc.status(&change.stage))
        else {
            return Err(RejectReason::UnknownStage {
                stage: change.stage.clone(),
            });
        };
        let allowed = (from == change.status && from.is_settled())
            || (stage.is_optional()
                && from == StageStatus::Pending
                && change.status == StageStatus::Skipped);
        if !allowed {
            return Err(RejectReason::IllegalTransition {
                stage: change.stage.clone(),
                from,
                to: change.status,
            });
        }
        Ok(())
    }

    /// Whether `stage` is a branch stage whose last run ended without a decision.
    pub fn awaiting_decision(&self, doc: &Document, stage: &StageDefinition) -> bool {
        stage.is_branch()
            && doc.status(&stage.id) == Some(StageStatus::Pending)
            && doc
                .latest_entry_for(&stage.id)
                .map(|e| e.outcome == HandoffOutcome::AwaitingDecision)
                .unwrap_or(false)
    }

    fn required<'a>(&'a self, view: &'a GraphView) -> impl Iterator<Item = &'a StageDefinition> {
        self.stages
            .iter()
            .filter(move |s| view.in_scope(&s.id) && (!s.is_optional() || view.includes_optional()))
    }

    /// Resolve the next stage to dispatch.
    ///
    /// Candidates are pending stages in the view whose predecessors are all
    /// complete or skipped. Stages exclusive to the decided branch path win;
    /// remaining ties go to declaration order.
    pub fn next(&self, doc: &Document, view: &GraphView) -> Next {
        if self.required(view).all(|s| doc.is_settled(&s.id)) {
            return Next::Done;
        }

        let primary = doc
            .branch_decision()
            .and_then(|v| self.exclusive.get(&v));

        let chosen = self
            .required(view)
            .filter(|s| doc.status(&s.id) == Some(StageStatus::Pending))
            .filter(|s| s.required_predecessors.iter().all(|p| doc.is_settled(p)))
            .filter(|s| !self.awaiting_decision(doc, s))
            .min_by_key(|s| {
                let on_primary = primary.map(|p| p.contains(&s.id)).unwrap_or(false);
                (!on_primary, self.index[&s.id])
            });

        if let Some(stage) = chosen {
            return Next::Stage(stage.id.clone());
        }

        if let Some(branch) = self
            .branch_stage()
            .filter(|b| view.in_scope(&b.id) && self.awaiting_decision(doc, b))
        {
            let options = branch
                .branch_targets()
                .map(|t| {
                    t.pairs()
                        .into_iter()
                        .map(|(v, s)| (v, s.clone()))
                        .collect()
                })
                .unwrap_or_default();
            return Next::Blocked(BlockReason::BranchUndecided {
                stage: branch.id.clone(),
                options,
            });
        }

        // An acyclic graph with an unsettled required stage and no candidate
        // means some predecessor lies outside the view.
        let stage = self
            .required(view)
            .find(|s| !doc.is_settled(&s.id))
            .map(|s| {
                let missing = s
                    .required_predecessors
                    .iter()
                    .filter(|p| !doc.is_settled(p))
                    .cloned()
                    .collect();
                (s.id.clone(), missing)
            });
        match stage {
            Some((stage, missing)) => {
                Next::Blocked(BlockReason::MissingPredecessors { stage, missing })
            }
            None => Next::Done,
        }
    }
}
