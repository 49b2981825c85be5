//! Pipeline executor: linear step execution with fan-out and checkpointing.
//!
//! # Execution flow
//!
//! 1. Write the initial status record (`running`, no step yet).
//! 2. For each step, in declaration order:
//!    - write status with the step label (`name [ordinal]`)
//!    - hydrate the output from the resume source, or run the handler once,
//!      sequentially per item, or concurrently per item
//!    - write the `{in, out}` checkpoint and status again
//! 3. From a single finalisation point, write the terminal status
//!    (`finished`, `killed` or `fatal_error`) whatever the exit path.
//!
//! Cancellation is driven by a `CancellationToken`; dropping the in-flight
//! step future aborts any outstanding concurrent iterations.

use std::any::Any;
use std::collections::HashSet;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures_util::FutureExt;
use pipeworks_types::pipeline::{
    format_duration, CheckpointRecord, FanoutMode, LoopProgress, ResumeConfig, RunStatus,
    StatusRecord,
};
use pipeworks_types::throttle::MonitorConfig;
use serde_json::Value;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::checkpoint::{CheckpointError, CheckpointReader, CheckpointStoreDyn};
use crate::throttle::Throttle;

use super::error::PipelineError;
use super::monitor::{MonitorSnapshot, ProgressMonitor};
use super::path::value_kind;
use super::state::{LoopTracker, SharedState};
use super::step::{validate_output, HandlerResult, Step, StepInvocation};

// ---------------------------------------------------------------------------
// RunOutcome
// ---------------------------------------------------------------------------

/// Result of a run that reached the end of its steps.
#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub execution_id: Uuid,
    /// Output of the last step (`null` for an empty pipeline).
    pub output: Value,
    pub status: RunStatus,
}

// ---------------------------------------------------------------------------
// PipelineBuilder
// ---------------------------------------------------------------------------

/// Assembles a [`Pipeline`]: `Pipeline::builder(store).then(a).then(b).build()`.
pub struct PipelineBuilder {
    store: Arc<dyn CheckpointStoreDyn>,
    steps: Vec<Step>,
    resume: Option<ResumeConfig>,
    shared: SharedState,
    throttle: Option<Arc<Throttle>>,
    monitor_interval: Duration,
    execution_id: Option<Uuid>,
}

impl PipelineBuilder {
    /// Append a step.
    pub fn then(mut self, step: Step) -> Self {
        self.steps.push(step);
        self
    }

    /// Hydrate the named steps from another execution's checkpoints.
    pub fn resume_from(mut self, resume: ResumeConfig) -> Self {
        self.resume = Some(resume);
        self
    }

    pub fn with_shared_state(mut self, shared: SharedState) -> Self {
        self.shared = shared;
        self
    }

    /// Throttle whose counters the progress monitor reports.
    pub fn with_throttle(mut self, throttle: Arc<Throttle>) -> Self {
        self.throttle = Some(throttle);
        self
    }

    pub fn with_monitor_interval(mut self, interval: Duration) -> Self {
        self.monitor_interval = interval;
        self
    }

    /// Use a pre-allocated execution id instead of generating one.
    pub fn with_execution_id(mut self, execution_id: Uuid) -> Self {
        self.execution_id = Some(execution_id);
        self
    }

    /// Validate step names and the resume selection.
    pub fn build(self) -> Result<Pipeline, PipelineError> {
        let mut names = HashSet::new();
        for step in &self.steps {
            if !names.insert(step.name()) {
                return Err(PipelineError::Configuration {
                    step: step.name().to_string(),
                    message: "duplicate step name".to_string(),
                });
            }
        }

        if let Some(resume) = &self.resume {
            if let Some(unknown) = resume.steps.iter().find(|name| !names.contains(name.as_str())) {
                return Err(PipelineError::Configuration {
                    step: unknown.clone(),
                    message: "resume requested for a step that is not part of the pipeline"
                        .to_string(),
                });
            }
        }

        Ok(Pipeline {
            execution_id: self.execution_id.unwrap_or_else(Uuid::now_v7),
            steps: self.steps,
            store: self.store,
            resume: self.resume,
            shared: self.shared,
            progress: LoopTracker::new(),
            throttle: self.throttle,
            monitor_interval: self.monitor_interval,
            cancel: CancellationToken::new(),
            last_status: None,
        })
    }
}

// ---------------------------------------------------------------------------
// Pipeline
// ---------------------------------------------------------------------------

/// A fixed, ordered list of steps bound to one execution id.
///
/// A pipeline runs at most once: `Idle -> Running -> Finished | Killed | FatalError`.
pub struct Pipeline {
    execution_id: Uuid,
    steps: Vec<Step>,
    store: Arc<dyn CheckpointStoreDyn>,
    resume: Option<ResumeConfig>,
    shared: SharedState,
    progress: LoopTracker,
    throttle: Option<Arc<Throttle>>,
    monitor_interval: Duration,
    cancel: CancellationToken,
    last_status: Option<RunStatus>,
}

impl Pipeline {
    pub fn builder(store: Arc<dyn CheckpointStoreDyn>) -> PipelineBuilder {
        PipelineBuilder {
            store,
            steps: Vec::new(),
            resume: None,
            shared: SharedState::new(),
            throttle: None,
            monitor_interval: MonitorConfig::default().interval(),
            execution_id: None,
        }
    }

    pub fn execution_id(&self) -> Uuid {
        self.execution_id
    }

    pub fn steps(&self) -> &[Step] {
        &self.steps
    }

    /// Cancel this token to kill the run.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// `None` until `run` is called.
    pub fn last_status(&self) -> Option<RunStatus> {
        self.last_status
    }

    pub fn shared_state(&self) -> &SharedState {
        &self.shared
    }

    /// Progress of the fan-out step currently executing.
    pub fn loop_progress(&self) -> Option<LoopProgress> {
        self.progress.snapshot()
    }

    /// Run every step. Only the first call on a pipeline runs anything.
    pub async fn run(&mut self, name: &str) -> Result<RunOutcome, PipelineError> {
        if self.last_status.is_some() {
            return Err(PipelineError::AlreadyStarted {
                execution_id: self.execution_id,
            });
        }
        self.last_status = Some(RunStatus::Running);

        let mut status = StatusWriter::new(Arc::clone(&self.store), self.execution_id, name);
        tracing::info!(
            execution_id = %self.execution_id,
            name,
            steps = self.steps.len(),
            "starting execution"
        );

        let result = match status.write(RunStatus::Running).await {
            Ok(()) => {
                let cancel = self.cancel.clone();
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => Err(PipelineError::Killed),
                    result = self.execute(&mut status) => result,
                }
            }
            Err(e) => Err(e.into()),
        };

        self.finalize(&status, result).await
    }

    /// Run with a [`ProgressMonitor`] sampling alongside. The monitor stops
    /// when the run ends.
    pub async fn run_with_monitor<F>(
        &mut self,
        name: &str,
        callback: F,
    ) -> Result<RunOutcome, PipelineError>
    where
        F: FnMut(&MonitorSnapshot) -> anyhow::Result<()> + Send + 'static,
    {
        let monitor = ProgressMonitor::new(
            self.execution_id,
            self.monitor_interval,
            self.progress.clone(),
            self.throttle.clone(),
        )
        .spawn(callback);

        let result = self.run(name).await;

        match monitor.stop().await {
            Ok(exit) => tracing::debug!(execution_id = %self.execution_id, ?exit, "monitor stopped"),
            Err(e) => tracing::warn!(execution_id = %self.execution_id, error = %e, "monitor ended abnormally"),
        }
        result
    }

    async fn finalize(
        &mut self,
        status: &StatusWriter,
        result: Result<Value, PipelineError>,
    ) -> Result<RunOutcome, PipelineError> {
        self.progress.end();

        let final_status = match &result {
            Ok(_) => RunStatus::Finished,
            Err(PipelineError::Killed) => RunStatus::Killed,
            Err(_) => RunStatus::FatalError,
        };

        match &result {
            Ok(_) => tracing::info!(
                execution_id = %self.execution_id,
                duration = %status.duration(),
                "execution finished"
            ),
            Err(PipelineError::Killed) => tracing::warn!(
                execution_id = %self.execution_id,
                last_step = status.last_step.as_deref().unwrap_or("-"),
                "execution killed"
            ),
            Err(e) => tracing::error!(
                execution_id = %self.execution_id,
                step = e.step().unwrap_or("-"),
                error = %e,
                "execution failed"
            ),
        }

        if let Err(e) = status.write(final_status).await {
            tracing::error!(
                execution_id = %self.execution_id,
                error = %e,
                "failed to write final status"
            );
            // An earlier error takes precedence over the status write failure.
            if result.is_ok() {
                self.last_status = Some(RunStatus::FatalError);
                return Err(e.into());
            }
        }

        self.last_status = Some(final_status);
        result.map(|output| RunOutcome {
            execution_id: self.execution_id,
            output,
            status: final_status,
        })
    }

    async fn execute(&self, status: &mut StatusWriter) -> Result<Value, PipelineError> {
        let mut previous = Value::Null;

        for (index, step) in self.steps.iter().enumerate() {
            let ordinal = index + 1;
            status.last_step = Some(format!("{} [{}]", step.name(), ordinal));
            status.write(RunStatus::Running).await?;

            let started = Instant::now();
            let output = match self.resume_source(step) {
                Some(source) => self.hydrate(step, ordinal, source).await?,
                None => {
                    tracing::info!(
                        execution_id = %self.execution_id,
                        step = step.name(),
                        ordinal,
                        mode = %step.fanout(),
                        "step started"
                    );
                    self.run_step(step, ordinal, &previous).await?
                }
            };

            let record = CheckpointRecord::new(std::mem::take(&mut previous), output);
            self.store
                .write_checkpoint_boxed(self.execution_id, ordinal, &record)
                .await?;
            tracing::info!(
                execution_id = %self.execution_id,
                step = step.name(),
                ordinal,
                elapsed_ms = started.elapsed().as_millis() as u64,
                "step finished"
            );
            status.write(RunStatus::Running).await?;

            previous = record.output;
        }

        Ok(previous)
    }

    fn resume_source(&self, step: &Step) -> Option<Uuid> {
        self.resume
            .as_ref()
            .filter(|resume| resume.skips(step.name()))
            .map(|resume| resume.source_execution_id)
    }

    async fn hydrate(&self, step: &Step, ordinal: usize, source: Uuid) -> Result<Value, PipelineError> {
        match self.store.read_checkpoint_boxed(source, ordinal).await? {
            Some(record) => {
                tracing::info!(
                    execution_id = %self.execution_id,
                    step = step.name(),
                    ordinal,
                    source_execution_id = %source,
                    "step hydrated from checkpoint"
                );
                Ok(record.output)
            }
            None => Err(PipelineError::MissingResumeCheckpoint {
                step: step.name().to_string(),
                source_execution_id: source,
                ordinal,
            }),
        }
    }

    async fn run_step(&self, step: &Step, ordinal: usize, previous: &Value) -> Result<Value, PipelineError> {
        let mode = step.fanout();
        if !mode.is_fanout() {
            let invocation = self.invocation(step, ordinal, previous.clone(), None);
            let output = call_handler(step, invocation)
                .await
                .map_err(|e| {
                    let error = format!("{e:#}");
                    tracing::error!(
                        execution_id = %self.execution_id,
                        step = step.name(),
                        ordinal,
                        error = %error,
                        "step failed"
                    );
                    PipelineError::StepFailed {
                        step: step.name().to_string(),
                        error,
                    }
                })?;
            validate_output(step.name(), &output)?;
            return Ok(output);
        }

        let items = fanout_items(step, previous)?;
        self.progress.begin(step.name(), items.len());

        let invocations: Vec<StepInvocation> = items
            .into_iter()
            .enumerate()
            .map(|(i, item)| self.invocation(step, ordinal, item, Some(i)))
            .collect();

        let results = match mode {
            FanoutMode::Concurrent => self.run_concurrent(step, invocations).await,
            _ => self.run_sequential(step, invocations).await,
        };
        self.progress.end();

        Ok(Value::Array(results))
    }

    async fn run_sequential(&self, step: &Step, invocations: Vec<StepInvocation>) -> Vec<Value> {
        let mut results = Vec::with_capacity(invocations.len());
        for invocation in invocations {
            if let Some(value) = run_iteration(step.clone(), invocation, self.progress.clone()).await {
                results.push(value);
            }
        }
        results
    }

    /// All iterations in flight together; results are put back in input
    /// order by index before failed items are dropped.
    async fn run_concurrent(&self, step: &Step, invocations: Vec<StepInvocation>) -> Vec<Value> {
        let mut slots: Vec<Option<Value>> = vec![None; invocations.len()];
        let mut join_set = JoinSet::new();

        for (index, invocation) in invocations.into_iter().enumerate() {
            let iteration = run_iteration(step.clone(), invocation, self.progress.clone());
            join_set.spawn(async move { (index, iteration.await) });
        }

        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok((index, value)) => slots[index] = value,
                Err(e) => tracing::warn!(
                    execution_id = %self.execution_id,
                    step = step.name(),
                    error = %e,
                    "iteration task aborted"
                ),
            }
        }

        slots.into_iter().flatten().collect()
    }

    fn invocation(&self, step: &Step, ordinal: usize, input: Value, iteration: Option<usize>) -> StepInvocation {
        StepInvocation {
            input,
            checkpoints: CheckpointReader::new(Arc::clone(&self.store), self.execution_id),
            config: Arc::clone(step.config()),
            shared: self.shared.clone(),
            iteration,
            ordinal,
            execution_id: self.execution_id,
        }
    }
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("execution_id", &self.execution_id)
            .field("steps", &self.steps)
            .field("resume", &self.resume)
            .field("last_status", &self.last_status)
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// The array a fan-out step iterates over.
fn fanout_items(step: &Step, previous: &Value) -> Result<Vec<Value>, PipelineError> {
    let source = match step.extract() {
        Some(path) => path.resolve(previous).map_err(|e| PipelineError::Configuration {
            step: step.name().to_string(),
            message: e.to_string(),
        })?,
        None => previous,
    };

    match source {
        Value::Array(items) => Ok(items.clone()),
        other => Err(PipelineError::Configuration {
            step: step.name().to_string(),
            message: format!("fan-out input must be an array, got {}", value_kind(other)),
        }),
    }
}

/// Invoke the step's handler, turning a panic into an ordinary error.
async fn call_handler(step: &Step, invocation: StepInvocation) -> HandlerResult {
    AssertUnwindSafe(async { step.handler().call_boxed(invocation).await })
        .catch_unwind()
        .await
        .unwrap_or_else(|payload| Err(anyhow::anyhow!("handler panicked: {}", panic_message(&*payload))))
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// One fan-out item. Failures are logged and yield `None`, as does a `null`
/// result.
async fn run_iteration(step: Step, invocation: StepInvocation, progress: LoopTracker) -> Option<Value> {
    let _guard = progress.iteration();
    let execution_id = invocation.execution_id;
    let iteration = invocation.iteration.unwrap_or_default();

    tracing::debug!(execution_id = %execution_id, step = step.name(), iteration, "iteration started");
    let outcome = match call_handler(&step, invocation).await {
        Ok(value) => validate_output(step.name(), &value)
            .map(|()| value)
            .map_err(|e| e.to_string()),
        Err(e) => Err(format!("{e:#}")),
    };

    match outcome {
        Ok(Value::Null) => None,
        Ok(value) => Some(value),
        Err(error) => {
            tracing::warn!(
                execution_id = %execution_id,
                step = step.name(),
                iteration,
                error = %error,
                "iteration failed"
            );
            None
        }
    }
}

/// Builds and persists status records for one run.
struct StatusWriter {
    store: Arc<dyn CheckpointStoreDyn>,
    execution_id: Uuid,
    name: String,
    start: DateTime<Utc>,
    last_step: Option<String>,
}

impl StatusWriter {
    fn new(store: Arc<dyn CheckpointStoreDyn>, execution_id: Uuid, name: &str) -> Self {
        Self {
            store,
            execution_id,
            name: name.to_string(),
            start: Utc::now(),
            last_step: None,
        }
    }

    fn duration(&self) -> String {
        format_duration(Utc::now() - self.start)
    }

    async fn write(&self, status: RunStatus) -> Result<(), CheckpointError> {
        let record = StatusRecord {
            id: self.execution_id,
            name: self.name.clone(),
            start: self.start,
            duration: self.duration(),
            finished: status == RunStatus::Finished,
            last_step: self.last_step.clone(),
            status,
        };
        self.store.write_status_boxed(&record).await
    }
}
