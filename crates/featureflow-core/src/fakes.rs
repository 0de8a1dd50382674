//! In-process test doubles.
//!
//! [`ScriptedExecutor`] plays back canned results per stage, records every
//! invocation and needs no external processes, so dispatcher behaviour can
//! be tested deterministically.

use std::collections::{BTreeMap, VecDeque};
use std::sync::Mutex;

use async_trait::async_trait;

use crate::dispatch::executor::{ExecutorError, StageExecutor, StageResult, TaskInput};
use crate::domain::{ProposedUpdate, RoleId, StageId};

/// One scripted response.
#[derive(Debug, Clone)]
pub enum Scripted {
    Result(StageResult),
    /// Fail the invocation itself, as a crashed executor would.
    Error(String),
    /// Never return; for cancellation tests.
    Hang,
}

/// A recorded invocation.
#[derive(Debug, Clone)]
pub struct Call {
    pub role: RoleId,
    pub stage: StageId,
    pub input: TaskInput,
}

/// Executor that answers from a per-stage script.
///
/// Stages with an exhausted or empty script succeed with a one-line summary.
#[derive(Debug, Default)]
pub struct ScriptedExecutor {
    script: Mutex<BTreeMap<StageId, VecDeque<Scripted>>>,
    calls: Mutex<Vec<Call>>,
}

impl ScriptedExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue `step` for the next unanswered invocation of `stage`.
    pub fn then(self, stage: &str, step: Scripted) -> Self {
        self.push(stage, step);
        self
    }

    pub fn push(&self, stage: &str, step: Scripted) {
        let Ok(stage) = StageId::new(stage) else {
            return;
        };
        if let Ok(mut script) = self.script.lock() {
            script.entry(stage).or_default().push_back(step);
        }
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }

    pub fn calls_for(&self, stage: &str) -> Vec<Call> {
        self.calls()
            .into_iter()
            .filter(|c| c.stage.as_str() == stage)
            .collect()
    }

    fn next_step(&self, stage: &StageId) -> Option<Scripted> {
        self.script
            .lock()
            .ok()
            .and_then(|mut s| s.get_mut(stage).and_then(VecDeque::pop_front))
    }
}

#[async_trait]
impl StageExecutor for ScriptedExecutor {
    async fn invoke(
        &self,
        role: &RoleId,
        stage: &StageId,
        input: TaskInput,
    ) -> Result<StageResult, ExecutorError> {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(Call {
                role: role.clone(),
                stage: stage.clone(),
                input,
            });
        }
        match self.next_step(stage) {
            Some(Scripted::Result(r)) => Ok(r),
            Some(Scripted::Error(msg)) => Err(ExecutorError::Failed(msg)),
            Some(Scripted::Hang) => std::future::pending().await,
            None => Ok(StageResult::success(ProposedUpdate::summary(format!(
                "{stage} done"
            )))),
        }
    }
}
