//! Concurrent execution of disjoint sections of one stage.
//!
//! A stage that declares `sections` (a documentation stage producing an
//! overview, a usage guide and an API reference, for example) is split into
//! one sub-task per section. Sub-tasks run as independent tokio tasks bounded
//! by a semaphore. Each returns its own result; nothing is shared between
//! them, and the merge happens on the caller's task after every join.

use std::future::Future;
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::{debug, instrument, warn};

use crate::dispatch::executor::{StageOutcome, StageResult};
use crate::domain::ProposedUpdate;
use crate::retry::FailureReport;

/// Errors raised before any sub-task runs.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FanOutError {
    #[error("fan-out requires at least one sub-task")]
    Empty,

    #[error("duplicate fan-out region: {0}")]
    DuplicateRegion(String),

    #[error("max_concurrent must be at least 1")]
    ZeroConcurrency,
}

/// Fan-out tuning.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FanOutConfig {
    /// Maximum number of sub-tasks running at once.
    pub max_concurrent: usize,
}

impl Default for FanOutConfig {
    fn default() -> Self {
        Self { max_concurrent: 4 }
    }
}

/// One unit of parallel work, owning a single region of the output.
pub struct SubTask<T> {
    region: String,
    task: BoxFuture<'static, Result<T, String>>,
}

impl<T> SubTask<T> {
    pub fn new<F>(region: impl Into<String>, task: F) -> Self
    where
        F: Future<Output = Result<T, String>> + Send + 'static,
    {
        Self {
            region: region.into(),
            task: task.boxed(),
        }
    }

    pub fn region(&self) -> &str {
        &self.region
    }
}

/// Result of one region; `Gap` marks a region with no usable output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SectionOutcome<T> {
    Filled(T),
    Gap { reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Section<T> {
    pub region: String,
    pub outcome: SectionOutcome<T>,
}

/// All regions, in the order the sub-tasks were supplied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergedResult<T> {
    pub sections: Vec<Section<T>>,
}

impl<T> MergedResult<T> {
    pub fn gaps(&self) -> impl Iterator<Item = (&str, &str)> {
        self.sections.iter().filter_map(|s| match &s.outcome {
            SectionOutcome::Gap { reason } => Some((s.region.as_str(), reason.as_str())),
            SectionOutcome::Filled(_) => None,
        })
    }

    pub fn is_complete(&self) -> bool {
        self.gaps().next().is_none()
    }

    pub fn filled_count(&self) -> usize {
        self.sections
            .iter()
            .filter(|s| matches!(s.outcome, SectionOutcome::Filled(_)))
            .count()
    }
}

/// How to treat a merge that has gaps.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PartialMergePolicy {
    /// Commit what was produced; gaps are named in the summary.
    Accept,
    /// Any gap turns the whole stage into a recoverable failure.
    #[default]
    TreatAsRecoverable,
}

impl MergedResult<StageResult> {
    /// Fold per-section stage results into one result for the stage.
    ///
    /// A fatal section makes the whole stage fatal. Non-success sections
    /// become gaps; a merge with no filled section is always recoverable.
    pub fn into_stage_result(self, policy: PartialMergePolicy) -> StageResult {
        let mut merged = ProposedUpdate::default();
        let mut summaries = Vec::new();
        let mut gaps = Vec::new();

        for section in self.sections {
            match section.outcome {
                SectionOutcome::Filled(result) => match result.status {
                    StageOutcome::Success => {
                        let update = result.updates;
                        summaries.push(format!("[{}] {}", section.region, update.summary));
                        merged.artifact_refs.extend(update.artifact_refs);
                        merged.advisories.extend(update.advisories);
                        merged.stage_status.extend(update.stage_status);
                        if merged.next_stage_hint.is_none() {
                            merged.next_stage_hint = update.next_stage_hint;
                        }
                    }
                    StageOutcome::FatalFailure => {
                        let detail = result
                            .failure
                            .map(|f| f.detail)
                            .unwrap_or_else(|| "fatal failure".to_string());
                        return StageResult::fatal(format!("[{}] {detail}", section.region));
                    }
                    StageOutcome::RecoverableFailure => {
                        let detail = result
                            .failure
                            .map(|f| f.detail)
                            .unwrap_or_else(|| "recoverable failure".to_string());
                        gaps.push(format!("{}: {detail}", section.region));
                    }
                },
                SectionOutcome::Gap { reason } => {
                    gaps.push(format!("{}: {reason}", section.region));
                }
            }
        }

        let reject_partial = policy == PartialMergePolicy::TreatAsRecoverable;
        if !gaps.is_empty() && (summaries.is_empty() || reject_partial) {
            return StageResult::recoverable(FailureReport::new(format!(
                "sections incomplete: {}",
                gaps.join("; ")
            )));
        }

        merged.summary = summaries.join("\n");
        if !gaps.is_empty() {
            merged.summary.push_str(&format!("\ngaps: {}", gaps.join("; ")));
        }
        StageResult::success(merged)
    }
}

/// Aborts still-running sub-tasks if the fan-out future is dropped early.
struct AbortOnDrop<T>(Vec<(String, JoinHandle<Result<T, String>>)>);

impl<T> Drop for AbortOnDrop<T> {
    fn drop(&mut self) {
        for (_, handle) in &self.0 {
            handle.abort();
        }
    }
}

/// Run `tasks` concurrently and merge their results in input order.
///
/// Regions must be unique; a duplicate is rejected before anything is
/// spawned. A failing or panicking sub-task becomes a gap and never cancels
/// its siblings.
#[instrument(skip(tasks, config), fields(sections = tasks.len(), max_concurrent = config.max_concurrent))]
pub async fn fan_out<T>(
    tasks: Vec<SubTask<T>>,
    config: &FanOutConfig,
) -> Result<MergedResult<T>, FanOutError>
where
    T: Send + 'static,
{
    if tasks.is_empty() {
        return Err(FanOutError::Empty);
    }
    if config.max_concurrent == 0 {
        return Err(FanOutError::ZeroConcurrency);
    }
    for (i, t) in tasks.iter().enumerate() {
        if tasks[..i].iter().any(|o| o.region == t.region) {
            return Err(FanOutError::DuplicateRegion(t.region.clone()));
        }
    }

    let sem = Arc::new(Semaphore::new(config.max_concurrent));
    let mut handles = AbortOnDrop(Vec::with_capacity(tasks.len()));

    for SubTask { region, task } in tasks {
        let sem = Arc::clone(&sem);
        let handle = tokio::spawn(async move {
            let _permit = sem
                .acquire_owned()
                .await
                .map_err(|e| format!("semaphore closed: {e}"))?;
            task.await
        });
        handles.0.push((region, handle));
    }

    let mut sections = Vec::with_capacity(handles.0.len());
    for (region, handle) in handles.0.iter_mut() {
        let outcome = match handle.await {
            Ok(Ok(value)) => SectionOutcome::Filled(value),
            Ok(Err(reason)) => {
                warn!(region = %region, reason = %reason, "fan-out section failed");
                SectionOutcome::Gap { reason }
            }
            Err(e) => {
                warn!(region = %region, error = %e, "fan-out section panicked");
                SectionOutcome::Gap {
                    reason: format!("sub-task aborted: {e}"),
                }
            }
        };
        sections.push(Section {
            region: region.clone(),
            outcome,
        });
    }

    let merged = MergedResult { sections };
    debug!(filled = merged.filled_count(), "fan-out joined");
    Ok(merged)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn test_results_merge_in_input_order() {
        let tasks = vec![
            SubTask::new("overview", async {
                tokio::time::sleep(Duration::from_millis(30)).await;
                Ok::<_, String>("o")
            }),
            SubTask::new("usage", async { Ok("u") }),
            SubTask::new("api", async {
                tokio::time::sleep(Duration::from_millis(10)).await;
                Ok("a")
            }),
        ];
        let merged = fan_out(tasks, &FanOutConfig::default()).await.unwrap();
        let regions: Vec<_> = merged.sections.iter().map(|s| s.region.as_str()).collect();
        assert_eq!(regions, ["overview", "usage", "api"]);
        assert!(merged.is_complete());
        assert_eq!(merged.sections[0].outcome, SectionOutcome::Filled("o"));
    }

    #[tokio::test]
    async fn test_duplicate_region_rejected_before_running() {
        let ran = Arc::new(AtomicUsize::new(0));
        let make = |ran: Arc<AtomicUsize>| async move {
            ran.fetch_add(1, Ordering::SeqCst);
            Ok::<_, String>(())
        };
        let tasks = vec![
            SubTask::new("api", make(Arc::clone(&ran))),
            SubTask::new("api", make(Arc::clone(&ran))),
        ];
        let err = fan_out(tasks, &FanOutConfig::default()).await.unwrap_err();
        assert_eq!(err, FanOutError::DuplicateRegion("api".to_string()));
        tokio::task::yield_now().await;
        assert_eq!(ran.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_failure_and_panic_do_not_cancel_siblings() {
        let tasks: Vec<SubTask<u32>> = vec![
            SubTask::new("a", async { Err("model refused".to_string()) }),
            SubTask::new("b", async {
                if "b".len() == 1 {
                    panic!("section b exploded");
                }
                Ok(2)
            }),
            SubTask::new("c", async {
                tokio::time::sleep(Duration::from_millis(20)).await;
                Ok(3)
            }),
        ];
        let merged = fan_out(tasks, &FanOutConfig::default()).await.unwrap();
        let gaps: Vec<_> = merged.gaps().map(|(r, _)| r).collect();
        assert_eq!(gaps, ["a", "b"]);
        assert_eq!(merged.sections[2].outcome, SectionOutcome::Filled(3));
        assert_eq!(merged.filled_count(), 1);
    }

    #[tokio::test]
    async fn test_concurrency_is_bounded() {
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let tasks = (0..6)
            .map(|i| {
                let running = Arc::clone(&running);
                let peak = Arc::clone(&peak);
                SubTask::new(format!("s{i}"), async move {
                    let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    running.fetch_sub(1, Ordering::SeqCst);
                    Ok::<_, String>(i)
                })
            })
            .collect();
        let merged = fan_out(tasks, &FanOutConfig { max_concurrent: 2 }).await.unwrap();
        assert!(merged.is_complete());
        assert!(peak.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn test_empty_and_zero_concurrency_are_errors() {
        let none: Vec<SubTask<()>> = Vec::new();
        assert_eq!(
            fan_out(none, &FanOutConfig::default()).await.unwrap_err(),
            FanOutError::Empty
        );
        let one = vec![SubTask::new("x", async { Ok::<_, String>(()) })];
        assert_eq!(
            fan_out(one, &FanOutConfig { max_concurrent: 0 }).await.unwrap_err(),
            FanOutError::ZeroConcurrency
        );
    }

    fn merged(sections: Vec<(&str, SectionOutcome<StageResult>)>) -> MergedResult<StageResult> {
        MergedResult {
            sections: sections
                .into_iter()
                .map(|(region, outcome)| Section {
                    region: region.to_string(),
                    outcome,
                })
                .collect(),
        }
    }

    fn ok(summary: &str, artifact: &str) -> SectionOutcome<StageResult> {
        SectionOutcome::Filled(StageResult::success(
            ProposedUpdate::summary(summary)
                .with_artifacts([artifact])
                .unwrap(),
        ))
    }

    #[test]
    fn test_complete_merge_combines_updates() {
        let result = merged(vec![
            ("overview", ok("wrote overview", "docs/overview.md")),
            ("api", ok("wrote api", "docs/api.md")),
        ])
        .into_stage_result(PartialMergePolicy::TreatAsRecoverable);
        assert_eq!(result.status, StageOutcome::Success);
        assert_eq!(result.updates.artifact_refs.len(), 2);
        assert_eq!(result.updates.summary, "[overview] wrote overview\n[api] wrote api");
    }

    #[test]
    fn test_partial_merge_follows_policy() {
        let sections = || {
            merged(vec![
                ("overview", ok("wrote overview", "docs/overview.md")),
                (
                    "api",
                    SectionOutcome::Gap {
                        reason: "timed out".to_string(),
                    },
                ),
            ])
        };

        let accepted = sections().into_stage_result(PartialMergePolicy::Accept);
        assert_eq!(accepted.status, StageOutcome::Success);
        assert!(accepted.updates.summary.contains("gaps: api: timed out"));

        let retried = sections().into_stage_result(PartialMergePolicy::TreatAsRecoverable);
        assert_eq!(retried.status, StageOutcome::RecoverableFailure);
        assert!(retried.failure.unwrap().detail.contains("api: timed out"));
    }

    #[test]
    fn test_fatal_section_makes_stage_fatal() {
        let result = merged(vec![
            ("overview", ok("wrote overview", "docs/overview.md")),
            ("api", SectionOutcome::Filled(StageResult::fatal("no API surface"))),
        ])
        .into_stage_result(PartialMergePolicy::Accept);
        assert_eq!(result.status, StageOutcome::FatalFailure);
        assert!(result.failure.unwrap().detail.contains("[api] no API surface"));
    }
}
