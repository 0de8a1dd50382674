//! featureflow core library
//!
//! Coordinates a fixed pipeline of specialised executors through one shared,
//! versioned document: the stage graph decides what runs next, the role
//! registry decides what each executor may change, and the dispatcher is the
//! only place the document is ever committed.

pub mod config;
pub mod dispatch;
pub mod domain;
pub mod fakes;
pub mod fanout;
pub mod graph;
pub mod obs;
pub mod persist;
pub mod retry;
pub mod roles;
pub mod telemetry;

pub use config::{
    ConfigError, ConfigResult, ExecutorSpec, WorkflowConfig, WorkflowDefinition, DEFAULT_EXECUTOR,
    DEFAULT_TOML,
};

pub use dispatch::{
    DispatchError, DispatchResult, Dispatcher, EntryBindings, EntryPoint, ExecutorError,
    HaltReason, RunOptions, StageExecutor, StageOutcome, StageResult, TaskInput, WorkflowReport,
    WorkflowState,
};

pub use domain::{
    ArtifactRef, BranchValue, Document, DocumentError, FeatureId, FlowError, HandoffEntry,
    HandoffOutcome, ProposedUpdate, Result, RoleId, StageId, StageStatus, StatusChange,
};

pub use fanout::{fan_out, FanOutConfig, FanOutError, MergedResult, PartialMergePolicy, SubTask};

pub use graph::{BlockReason, GraphView, Next, StageDefinition, StageGraph, StageKind};

pub use persist::DocumentRepo;

pub use retry::{EscalationSummary, FailureReport, RetryDecision, RetryPolicy};

pub use roles::{
    Authorization, EscalationTier, MutationPermission, RejectReason, RoleDefinition, RoleRegistry,
};

pub use obs::{
    emit_retry_decided, emit_stage_committed, emit_stage_dispatched, emit_stage_failed,
    emit_stage_phase, emit_workflow_finished, emit_workflow_started, workflow_span,
};

pub use telemetry::init_tracing;
