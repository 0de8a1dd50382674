//! Command-backed stage executor.
//!
//! Each role maps to a configured command line. The command receives the
//! `TaskInput` as JSON on stdin and must print a `StageResult` as JSON on
//! stdout.

use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use featureflow_core::{
    ExecutorError, ExecutorSpec, RoleId, StageExecutor, StageId, StageResult, TaskInput,
    WorkflowDefinition,
};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

/// Longest stderr excerpt carried in an error.
const STDERR_EXCERPT: usize = 2000;

pub struct CommandExecutor {
    def: Arc<WorkflowDefinition>,
}

impl CommandExecutor {
    pub fn new(def: Arc<WorkflowDefinition>) -> Self {
        Self { def }
    }

    fn spec_for(&self, role: &RoleId) -> Result<&ExecutorSpec, ExecutorError> {
        self.def
            .executor_for(role)
            .ok_or_else(|| ExecutorError::NotConfigured(role.clone()))
    }
}

#[async_trait]
impl StageExecutor for CommandExecutor {
    async fn invoke(
        &self,
        role: &RoleId,
        stage: &StageId,
        input: TaskInput,
    ) -> Result<StageResult, ExecutorError> {
        let spec = self.spec_for(role)?;
        let Some((exe, args)) = spec.command.split_first() else {
            return Err(ExecutorError::NotConfigured(role.clone()));
        };
        let payload =
            serde_json::to_vec(&input).map_err(|e| ExecutorError::Failed(e.to_string()))?;

        let start = Instant::now();
        let mut child = Command::new(exe)
            .args(args)
            .envs(&spec.env)
            .env("FEATUREFLOW_ROLE", role.as_str())
            .env("FEATUREFLOW_STAGE", stage.as_str())
            .env("FEATUREFLOW_TIER", input.escalation_tier.to_string())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        let stdin = child.stdin.take();
        let feed = async move {
            if let Some(mut stdin) = stdin {
                // A command that ignores its input closes the pipe early.
                let _ = stdin.write_all(&payload).await;
            }
        };
        let run = async {
            let (_, output) = tokio::join!(feed, child.wait_with_output());
            output
        };

        let output = match spec.timeout_secs {
            Some(secs) if secs > 0 => tokio::time::timeout(Duration::from_secs(secs), run)
                .await
                .map_err(|_| ExecutorError::Timeout {
                    role: role.clone(),
                    secs,
                })??,
            _ => run.await?,
        };

        debug!(
            role = %role,
            stage = %stage,
            duration_ms = start.elapsed().as_millis() as u64,
            exit = ?output.status.code(),
            "executor command finished"
        );

        if !output.status.success() {
            let code = output
                .status
                .code()
                .map(|c| c.to_string())
                .unwrap_or_else(|| "signal".to_string());
            return Err(ExecutorError::NonZeroExit {
                role: role.clone(),
                code,
                stderr: excerpt(&String::from_utf8_lossy(&output.stderr)),
            });
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        serde_json::from_str(stdout.trim()).map_err(|e| {
            ExecutorError::InvalidOutput(format!("{e}: {}", excerpt(&stdout)))
        })
    }
}

fn excerpt(text: &str) -> String {
    let text = text.trim();
    match text.char_indices().nth(STDERR_EXCERPT) {
        Some((cut, _)) => format!("{}...", &text[..cut]),
        None => text.to_string(),
    }
}
