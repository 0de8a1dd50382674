//! Retry and escalation policy for recoverable stage failures.
//!
//! A stage that reports a recoverable failure (a build stage with compile
//! errors, say) is re-dispatched in place, possibly with a different role
//! chosen from the failure's category, until `max_attempts` retries are
//! used up. The next failure escalates to a human instead of looping.
//!
//! Attempt counts are derived from the handoff log, so they survive a
//! process restart and resumption from a stored document.

use std::fmt;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::domain::error::{FlowError, Result};
use crate::domain::{Document, HandoffOutcome, RoleId, StageId};
use crate::graph::StageDefinition;

/// Category used when no configured category matches.
pub const UNCATEGORIZED: &str = "uncategorized";

/// Failure detail reported by an executor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureReport {
    /// Category the executor already knows, if any.
    #[serde(default)]
    pub category: Option<String>,
    pub detail: String,
}

impl FailureReport {
    pub fn new(detail: impl Into<String>) -> Self {
        Self {
            category: None,
            detail: detail.into(),
        }
    }

    pub fn categorized(category: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            category: Some(category.into()),
            detail: detail.into(),
        }
    }
}

/// A named failure category and the role best suited to fix it.
#[derive(Debug, Clone)]
pub struct FailureCategory {
    pub name: String,
    pub role: RoleId,
    patterns: Vec<Regex>,
}

impl FailureCategory {
    /// Patterns are matched case-insensitively against the failure detail.
    pub fn new(name: impl Into<String>, role: RoleId, patterns: &[String]) -> Result<Self> {
        let name = name.into();
        let patterns = patterns
            .iter()
            .map(|p| {
                Regex::new(&format!("(?i){p}")).map_err(|e| {
                    FlowError::InvalidConfig(format!("category {name}: bad pattern {p:?}: {e}"))
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            name,
            role,
            patterns,
        })
    }

    pub fn matches(&self, detail: &str) -> bool {
        self.patterns.iter().any(|p| p.is_match(detail))
    }
}

/// Condensed, human-actionable summary surfaced on escalation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EscalationSummary {
    pub stage: StageId,
    pub category: String,
    pub attempts: u32,
    pub last_failure: String,
    pub prompt: String,
}

impl fmt::Display for EscalationSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "stage {} still failing after {} attempts ({}): {}. {}",
            self.stage, self.attempts, self.category, self.last_failure, self.prompt
        )
    }
}

/// What to do after a recoverable failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    /// Run the same stage again with its own role.
    RetryHere { role: RoleId },
    /// Run the same stage again, with the role overridden for this attempt.
    RerouteTo { stage: StageId, role: RoleId },
    Escalate(EscalationSummary),
}

/// Bounded retry policy with category-based role routing.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    categories: Vec<FailureCategory>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            categories: Vec::new(),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, categories: Vec<FailureCategory>) -> Result<Self> {
        for (i, c) in categories.iter().enumerate() {
            if c.name == UNCATEGORIZED || categories[..i].iter().any(|o| o.name == c.name) {
                return Err(FlowError::InvalidConfig(format!(
                    "duplicate or reserved failure category: {}",
                    c.name
                )));
            }
        }
        Ok(Self {
            max_attempts,
            categories,
        })
    }

    pub fn categories(&self) -> &[FailureCategory] {
        &self.categories
    }

    /// Category for `failure`: the executor's own category when it is a
    /// configured one, else the first category whose patterns match.
    pub fn classify(&self, failure: &FailureReport) -> Option<&FailureCategory> {
        if let Some(named) = failure
            .category
            .as_deref()
            .and_then(|n| self.categories.iter().find(|c| c.name == n))
        {
            return Some(named);
        }
        self.categories.iter().find(|c| c.matches(&failure.detail))
    }

    pub fn category_name(&self, failure: &FailureReport) -> String {
        self.classify(failure)
            .map(|c| c.name.clone())
            .unwrap_or_else(|| UNCATEGORIZED.to_string())
    }

    /// Decide how to continue after the `attempt`-th consecutive recoverable
    /// failure of `stage` (1-based).
    ///
    /// Attempts `1..=max_attempts` are retried at the same stage position;
    /// attempt `max_attempts + 1` escalates, so a stage runs at most
    /// `max_attempts + 1` times before a human is asked.
    pub fn handle(
        &self,
        stage: &StageDefinition,
        failure: &FailureReport,
        attempt: u32,
    ) -> RetryDecision {
        let category = self.classify(failure);
        let category_name = category
            .map(|c| c.name.clone())
            .unwrap_or_else(|| UNCATEGORIZED.to_string());

        if attempt > self.max_attempts {
            return RetryDecision::Escalate(EscalationSummary {
                stage: stage.id.clone(),
                category: category_name,
                attempts: attempt,
                last_failure: failure.detail.clone(),
                prompt: format!(
                    "Fix the underlying problem, then resume the workflow to retry stage {} \
                     (or reset it to start over).",
                    stage.id
                ),
            });
        }

        match category {
            Some(c) if c.role != stage.role => RetryDecision::RerouteTo {
                stage: stage.id.clone(),
                role: c.role.clone(),
            },
            _ => RetryDecision::RetryHere {
                role: stage.role.clone(),
            },
        }
    }
}

/// Consecutive recoverable failures of `stage` since it last completed,
/// was reset, or escalated.
pub fn consecutive_failures(doc: &Document, stage: &StageId) -> u32 {
    doc.handoff_log()
        .iter()
        .rev()
        .filter(|e| &e.stage_id == stage)
        .take_while(|e| matches!(e.outcome, HandoffOutcome::RecoverableFailure { .. }))
        .count() as u32
}
