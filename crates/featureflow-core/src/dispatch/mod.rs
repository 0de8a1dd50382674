//! The dispatcher: resolves the next stage, invokes its executor and is the
//! single commit point for the document.

pub mod dispatcher;
pub mod entry;
pub mod error;
pub mod executor;
pub mod state;

pub use dispatcher::{Dispatcher, RunOptions};
pub use entry::{EntryBindings, EntryPoint};
pub use error::{DispatchError, DispatchResult};
pub use executor::{ExecutorError, StageExecutor, StageOutcome, StageResult, TaskInput};
pub use state::{HaltReason, StageMachine, StagePhase, WorkflowReport, WorkflowState};
