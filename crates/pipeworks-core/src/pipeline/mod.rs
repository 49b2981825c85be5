//! Linear, checkpointed pipeline engine.
//!
//! - `step` -- steps, the handler contract and output validation
//! - `path` -- dot-path accessor used to pick a fan-out source
//! - `state` -- shared blackboard and fan-out progress tracking
//! - `executor` -- builder, run lifecycle, fan-out and resume
//! - `monitor` -- periodic progress sampling beside a run

pub mod error;
pub mod executor;
pub mod monitor;
pub mod path;
pub mod state;
pub mod step;

pub use error::PipelineError;
pub use executor::{Pipeline, PipelineBuilder, RunOutcome};
pub use monitor::{MonitorError, MonitorExit, MonitorHandle, MonitorSnapshot, ProgressMonitor};
pub use path::{FieldPath, PathError};
pub use state::{LoopTracker, SharedState};
pub use step::{handler_fn, validate_output, FnHandler, HandlerResult, Step, StepHandler, StepHandlerDyn, StepInvocation};
