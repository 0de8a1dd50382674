//! featureflow - multi-role feature-development workflow coordinator
//!
//! Runs a feature request through the configured stage graph, one executor
//! invocation at a time, recording every step in a versioned document that
//! any later command can resume from.
//!
//! ## Commands
//!
//! - `full-workflow`, `plan-only`: start (or resume with `--feature`) a run
//! - `test-only`, `build-only`, `review-only`, `modernize-only`: run one stage
//! - `status`: stage table, branch decision and recent handoffs
//! - `decide`: choose the path for a branch stage that left it open
//! - `reset`: return a stage (and optionally its descendants) to pending
//! - `list`, `config`: stored documents and the effective configuration

mod executor;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use featureflow_core::{
    BlockReason, BranchValue, Dispatcher, Document, EntryPoint, FeatureId, HandoffEntry,
    RunOptions, StageId, WorkflowConfig, WorkflowDefinition, WorkflowReport, WorkflowState,
};
use featureflow_store::FsDocumentStore;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{info, warn, Level};

use crate::executor::CommandExecutor;

#[derive(Parser)]
#[command(name = "featureflow")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Multi-role feature-development workflow coordinator", long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit JSON-formatted log lines
    #[arg(long, global = true)]
    json: bool,

    /// Workflow configuration file (default: built-in pipeline)
    #[arg(long, global = true, env = "FEATUREFLOW_CONFIG")]
    config: Option<PathBuf>,

    /// Directory holding stored documents
    #[arg(
        long,
        global = true,
        env = "FEATUREFLOW_HOME",
        default_value = ".featureflow/documents"
    )]
    home: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct StartArgs {
    /// Feature request to work on
    #[arg(required_unless_present = "feature")]
    description: Option<String>,

    /// Resume an existing document instead of starting a new one
    #[arg(long)]
    feature: Option<String>,

    /// Also run optional stages
    #[arg(long)]
    with_optional: bool,
}

#[derive(Args)]
struct StageArgs {
    /// Document to run the stage against
    #[arg(long)]
    feature: String,

    /// Also run optional stages
    #[arg(long)]
    with_optional: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Run every stage of the workflow
    FullWorkflow(StartArgs),

    /// Run the planning stage and everything it depends on
    PlanOnly(StartArgs),

    /// Run only the test stage of an existing document
    TestOnly(StageArgs),

    /// Run only the build stage of an existing document
    BuildOnly(StageArgs),

    /// Run only the review stage of an existing document
    ReviewOnly(StageArgs),

    /// Run only the modernize stage of an existing document
    ModernizeOnly(StageArgs),

    /// Show a stored document
    Status {
        /// Feature id
        feature: String,

        /// Number of handoff entries to show
        #[arg(short, long, default_value = "10")]
        tail: usize,
    },

    /// Choose the path for a branch stage awaiting a decision
    Decide {
        /// Feature id
        feature: String,

        /// Path to take (A or B)
        value: BranchValue,
    },

    /// Return a stage to pending so it runs again
    Reset {
        /// Feature id
        feature: String,

        /// Stage to reset
        stage: String,

        /// Also reset completed descendants
        #[arg(long)]
        cascade: bool,
    },

    /// List stored documents
    List,

    /// Inspect the workflow configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Print the effective configuration as TOML
    Show,
    /// Print the built-in pipeline as TOML
    Default,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging
    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    featureflow_core::init_tracing(cli.json, level);

    let config = WorkflowConfig::load_or_default(cli.config.as_deref())
        .context("Failed to load workflow configuration")?;

    if let Commands::Config { action } = &cli.command {
        return cmd_config(&config, action);
    }

    let def = Arc::new(
        config
            .build()
            .context("Invalid workflow configuration")?,
    );
    let dispatcher = build_dispatcher(def, &cli.home)?.with_cancellation(cancel_on_ctrl_c());

    match cli.command {
        Commands::FullWorkflow(args) => {
            cmd_start(&dispatcher, EntryPoint::FullWorkflow, &args).await
        }
        Commands::PlanOnly(args) => cmd_start(&dispatcher, EntryPoint::PlanOnly, &args).await,
        Commands::TestOnly(args) => cmd_stage(&dispatcher, EntryPoint::TestOnly, &args).await,
        Commands::BuildOnly(args) => cmd_stage(&dispatcher, EntryPoint::BuildOnly, &args).await,
        Commands::ReviewOnly(args) => cmd_stage(&dispatcher, EntryPoint::ReviewOnly, &args).await,
        Commands::ModernizeOnly(args) => {
            cmd_stage(&dispatcher, EntryPoint::ModernizeOnly, &args).await
        }
        Commands::Status { feature, tail } => cmd_status(&dispatcher, &feature, tail).await,
        Commands::Decide { feature, value } => cmd_decide(&dispatcher, &feature, value).await,
        Commands::Reset {
            feature,
            stage,
            cascade,
        } => cmd_reset(&dispatcher, &feature, &stage, cascade).await,
        Commands::List => cmd_list(&dispatcher).await,
        Commands::Config { .. } => Ok(()),
    }
}

fn build_dispatcher(def: Arc<WorkflowDefinition>, home: &Path) -> Result<Dispatcher> {
    let store = FsDocumentStore::new(home)
        .with_context(|| format!("Failed to open document store at {}", home.display()))?;
    let executor = Arc::new(CommandExecutor::new(def.clone()));
    Ok(Dispatcher::new(def, executor, Arc::new(store)))
}

/// First Ctrl-C cancels the run between (or during) stage invocations.
fn cancel_on_ctrl_c() -> watch::Receiver<bool> {
    let (tx, rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, cancelling workflow");
            let _ = tx.send(true);
        }
    });
    rx
}

fn parse_feature(feature: &str) -> Result<FeatureId> {
    FeatureId::new(feature).with_context(|| format!("Invalid feature id: {feature}"))
}

/// Start a new document, or resume one with `--feature`.
async fn cmd_start(dispatcher: &Dispatcher, entry: EntryPoint, args: &StartArgs) -> Result<()> {
    let options = RunOptions {
        with_optional: args.with_optional,
    };
    let report = match (&args.feature, &args.description) {
        (Some(feature), _) => {
            let id = parse_feature(feature)?;
            dispatcher
                .resume(&id, entry, options)
                .await
                .with_context(|| format!("Failed to resume {id}"))?
        }
        (None, Some(description)) => dispatcher
            .start(entry, description, options)
            .await
            .context("Failed to start workflow")?,
        (None, None) => anyhow::bail!("Either a description or --feature is required"),
    };
    finish(&report)
}

/// Run a single-stage entry point against a stored document.
async fn cmd_stage(dispatcher: &Dispatcher, entry: EntryPoint, args: &StageArgs) -> Result<()> {
    let id = parse_feature(&args.feature)?;
    let options = RunOptions {
        with_optional: args.with_optional,
    };
    let report = dispatcher
        .resume(&id, entry, options)
        .await
        .with_context(|| format!("Failed to run {entry} for {id}"))?;
    finish(&report)
}

/// Print a run report; a halted run is a command failure.
fn finish(report: &WorkflowReport) -> Result<()> {
    print!("{}", render_report(report));
    match &report.state {
        WorkflowState::Halted(reason) => anyhow::bail!("Workflow halted: {reason}"),
        _ => Ok(()),
    }
}

fn render_report(report: &WorkflowReport) -> String {
    let mut out = String::new();
    out.push_str(&format!("Feature: {}\n", report.feature_id));
    out.push_str(&format!("Entry point: {}\n", report.entry_point));
    out.push_str(&format!("Version: {}\n", report.version));
    out.push_str(&format!("State: {}\n", report.state.label()));

    match &report.state {
        WorkflowState::Blocked(reason) => {
            out.push_str(&format!("Needs input: {reason}\n"));
            out.push_str(&format!("Next step: {}\n", next_step(&report.feature_id, reason)));
        }
        WorkflowState::Halted(reason) => {
            out.push_str(&format!("Reason: {reason}\n"));
            out.push_str("Recent handoffs:\n");
            for entry in &report.log_tail {
                out.push_str(&render_entry(entry));
            }
        }
        WorkflowState::Done | WorkflowState::Running => {}
    }
    out
}

/// Command that unblocks the workflow.
fn next_step(feature: &FeatureId, reason: &BlockReason) -> String {
    match reason {
        BlockReason::BranchUndecided { .. } => {
            format!("featureflow decide {feature} <A|B>, then resume with --feature {feature}")
        }
        BlockReason::MissingPredecessors { missing, .. } => {
            let names: Vec<&str> = missing.iter().map(StageId::as_str).collect();
            format!(
                "complete {} first (featureflow full-workflow --feature {feature})",
                names.join(", ")
            )
        }
        BlockReason::NeedsUserInput(summary) => format!(
            "fix the failure, then featureflow full-workflow --feature {feature} \
             (or featureflow reset {feature} {})",
            summary.stage
        ),
    }
}

fn render_entry(entry: &HandoffEntry) -> String {
    format!(
        "  #{:<3} {:<16} {:<22} [{}] {}\n",
        entry.seq,
        entry.stage_id,
        entry.outcome.label(),
        entry.executor_role,
        entry.summary
    )
}

fn render_status(doc: &Document, tail: usize) -> String {
    let mut out = String::new();
    out.push_str(&format!("Feature: {}\n", doc.feature_id()));
    out.push_str(&format!("Description: {}\n", doc.description()));
    out.push_str(&format!("Version: {}\n", doc.version()));
    out.push_str(&format!("Updated: {}\n", doc.updated_at().to_rfc3339()));
    let branch = doc
        .branch_decision()
        .map(|v| v.to_string())
        .unwrap_or_else(|| "undecided".to_string());
    out.push_str(&format!("Branch: {branch}\n\nStages:\n"));
    for entry in doc.stage_statuses() {
        out.push_str(&format!("  {:<16} {}\n", entry.stage, entry.status));
    }
    if !doc.artifact_refs().is_empty() {
        out.push_str("\nArtifacts:\n");
        for r in doc.artifact_refs() {
            out.push_str(&format!("  {r}\n"));
        }
    }
    let log = doc.handoff_tail(tail);
    if !log.is_empty() {
        out.push_str(&format!("\nLast {} handoffs:\n", log.len()));
        for entry in log {
            out.push_str(&render_entry(entry));
        }
    }
    out
}

async fn cmd_status(dispatcher: &Dispatcher, feature: &str, tail: usize) -> Result<()> {
    let id = parse_feature(feature)?;
    let doc = dispatcher
        .load(&id)
        .await
        .with_context(|| format!("Failed to load {id}"))?;
    print!("{}", render_status(&doc, tail));
    Ok(())
}

async fn cmd_decide(dispatcher: &Dispatcher, feature: &str, value: BranchValue) -> Result<()> {
    let id = parse_feature(feature)?;
    let doc = dispatcher
        .decide_branch(&id, value)
        .await
        .with_context(|| format!("Failed to record decision for {id}"))?;
    info!(feature_id = %id, %value, version = doc.version(), "branch decided");
    println!("Path {value} chosen for {id} (version {})", doc.version());
    println!("Resume with: featureflow full-workflow --feature {id}");
    Ok(())
}

async fn cmd_reset(
    dispatcher: &Dispatcher,
    feature: &str,
    stage: &str,
    cascade: bool,
) -> Result<()> {
    let id = parse_feature(feature)?;
    let stage = StageId::new(stage).with_context(|| format!("Invalid stage id: {stage}"))?;
    let (doc, reset) = dispatcher
        .reset_stage(&id, &stage, cascade)
        .await
        .with_context(|| format!("Failed to reset {stage} in {id}"))?;
    let names: Vec<&str> = reset.iter().map(StageId::as_str).collect();
    println!(
        "Reset {} (version {}): {}",
        id,
        doc.version(),
        names.join(", ")
    );
    Ok(())
}

async fn cmd_list(dispatcher: &Dispatcher) -> Result<()> {
    let ids = dispatcher
        .repo()
        .list()
        .await
        .context("Failed to list documents")?;
    if ids.is_empty() {
        println!("No documents.");
    }
    for id in ids {
        println!("{id}");
    }
    Ok(())
}

fn cmd_config(config: &WorkflowConfig, action: &ConfigAction) -> Result<()> {
    match action {
        ConfigAction::Show => {
            config.build().context("Invalid workflow configuration")?;
            print!("{}", config.to_toml().context("Failed to render configuration")?);
        }
        ConfigAction::Default => print!("{}", featureflow_core::DEFAULT_TOML),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use featureflow_core::fakes::{Scripted, ScriptedExecutor};
    use featureflow_core::{ProposedUpdate, StageResult, StageStatus};
    use featureflow_store::fakes::MemoryDocumentStore;

    fn definition() -> Arc<WorkflowDefinition> {
        Arc::new(WorkflowConfig::default_pipeline().unwrap().build().unwrap())
    }

    fn scripted_dispatcher(exec: ScriptedExecutor) -> Dispatcher {
        Dispatcher::new(
            definition(),
            Arc::new(exec),
            Arc::new(MemoryDocumentStore::new()),
        )
    }

    fn start_args(description: &str) -> StartArgs {
        StartArgs {
            description: Some(description.to_string()),
            feature: None,
            with_optional: false,
        }
    }

    async fn only_feature(dispatcher: &Dispatcher) -> FeatureId {
        let ids = dispatcher.repo().list().await.unwrap();
        assert_eq!(ids.len(), 1);
        ids.into_iter().next().unwrap()
    }

    #[test]
    fn test_cli_parses_start_and_stage_commands() {
        let cli = Cli::try_parse_from(["featureflow", "full-workflow", "dark mode"]).unwrap();
        assert!(matches!(
            cli.command,
            Commands::FullWorkflow(StartArgs { description: Some(_), feature: None, .. })
        ));

        let cli =
            Cli::try_parse_from(["featureflow", "plan-only", "--feature", "feat-1"]).unwrap();
        assert!(matches!(cli.command, Commands::PlanOnly(StartArgs { feature: Some(_), .. })));

        let cli = Cli::try_parse_from([
            "featureflow",
            "build-only",
            "--feature",
            "feat-1",
            "--with-optional",
        ])
        .unwrap();
        assert!(matches!(
            cli.command,
            Commands::BuildOnly(StageArgs { with_optional: true, .. })
        ));
    }

    #[test]
    fn test_cli_requires_description_or_feature() {
        assert!(Cli::try_parse_from(["featureflow", "full-workflow"]).is_err());
        assert!(Cli::try_parse_from(["featureflow", "test-only"]).is_err());
    }

    #[test]
    fn test_cli_parses_decide_value() {
        let cli = Cli::try_parse_from(["featureflow", "decide", "feat-1", "b"]).unwrap();
        assert!(matches!(
            cli.command,
            Commands::Decide { value: BranchValue::B, .. }
        ));
        assert!(Cli::try_parse_from(["featureflow", "decide", "feat-1", "C"]).is_err());
    }

    #[tokio::test]
    async fn test_cmd_start_then_decide_then_resume() {
        let dispatcher = scripted_dispatcher(ScriptedExecutor::new());

        cmd_start(&dispatcher, EntryPoint::FullWorkflow, &start_args("dark mode"))
            .await
            .unwrap();
        let id = only_feature(&dispatcher).await;
        let doc = dispatcher.load(&id).await.unwrap();
        assert_eq!(doc.branch_decision(), None);

        cmd_decide(&dispatcher, id.as_str(), BranchValue::A)
            .await
            .unwrap();
        let resume = StartArgs {
            description: None,
            feature: Some(id.to_string()),
            with_optional: false,
        };
        cmd_start(&dispatcher, EntryPoint::FullWorkflow, &resume)
            .await
            .unwrap();

        let doc = dispatcher.load(&id).await.unwrap();
        assert_eq!(doc.status(&StageId::new("review").unwrap()), Some(StageStatus::Complete));
        assert_eq!(doc.status(&StageId::new("modernize").unwrap()), Some(StageStatus::Skipped));
    }

    #[tokio::test]
    async fn test_cmd_start_fails_when_workflow_halts() {
        let exec = ScriptedExecutor::new().then("plan", Scripted::Error("spawn failed".into()));
        let dispatcher = scripted_dispatcher(exec);
        let err = cmd_start(&dispatcher, EntryPoint::PlanOnly, &start_args("x"))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("halted"));
    }

    #[tokio::test]
    async fn test_cmd_stage_and_reset_round() {
        let exec = ScriptedExecutor::new().then(
            "choose-approach",
            Scripted::Result(
                StageResult::success(ProposedUpdate::summary("direct")).with_branch(BranchValue::A),
            ),
        );
        let dispatcher = scripted_dispatcher(exec);
        cmd_start(&dispatcher, EntryPoint::FullWorkflow, &start_args("offline sync"))
            .await
            .unwrap();
        let id = only_feature(&dispatcher).await;

        cmd_reset(&dispatcher, id.as_str(), "build", false)
            .await
            .unwrap();
        let build = StageId::new("build").unwrap();
        assert_eq!(
            dispatcher.load(&id).await.unwrap().status(&build),
            Some(StageStatus::Pending)
        );

        let args = StageArgs {
            feature: id.to_string(),
            with_optional: false,
        };
        cmd_stage(&dispatcher, EntryPoint::BuildOnly, &args)
            .await
            .unwrap();
        assert_eq!(
            dispatcher.load(&id).await.unwrap().status(&build),
            Some(StageStatus::Complete)
        );
    }

    #[tokio::test]
    async fn test_cmd_decide_rejects_when_not_awaiting() {
        let dispatcher = scripted_dispatcher(ScriptedExecutor::new());
        cmd_start(&dispatcher, EntryPoint::PlanOnly, &start_args("x"))
            .await
            .unwrap();
        let id = only_feature(&dispatcher).await;
        assert!(cmd_decide(&dispatcher, id.as_str(), BranchValue::B)
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_render_status_lists_stages_and_log() {
        let dispatcher = scripted_dispatcher(ScriptedExecutor::new());
        cmd_start(&dispatcher, EntryPoint::PlanOnly, &start_args("widgets"))
            .await
            .unwrap();
        let id = only_feature(&dispatcher).await;
        let doc = dispatcher.load(&id).await.unwrap();

        let text = render_status(&doc, 5);
        assert!(text.contains("Description: widgets"));
        assert!(text.contains("Branch: undecided"));
        assert!(text.contains("plan             complete"));
        assert!(text.contains("Last 1 handoffs:"));
    }

    #[tokio::test]
    async fn test_blocked_report_names_the_next_step() {
        let dispatcher = scripted_dispatcher(ScriptedExecutor::new());
        let report = dispatcher
            .start(EntryPoint::FullWorkflow, "x", RunOptions::default())
            .await
            .unwrap();
        let text = render_report(&report);
        assert!(text.contains("State: blocked"));
        assert!(text.contains(&format!("featureflow decide {}", report.feature_id)));
    }

    #[tokio::test]
    async fn test_build_dispatcher_uses_filesystem_home() {
        let dir = tempfile::tempdir().unwrap();
        let dispatcher = build_dispatcher(definition(), dir.path()).unwrap();
        assert!(dispatcher.repo().list().await.unwrap().is_empty());
    }

    #[test]
    fn test_config_show_renders_effective_config() {
        let config = WorkflowConfig::default_pipeline().unwrap();
        cmd_config(&config, &ConfigAction::Show).unwrap();
        cmd_config(&config, &ConfigAction::Default).unwrap();
    }
}
