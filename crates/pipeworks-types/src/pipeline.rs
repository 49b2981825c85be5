//! Pipeline domain types.
//!
//! Execution modes for steps, the lifecycle status of a run, the fan-out
//! progress snapshot sampled by the monitor, and the two record shapes that
//! are persisted per execution: one checkpoint per step and one status file.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// FanoutMode
// ---------------------------------------------------------------------------

/// How a step consumes the previous step's output.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FanoutMode {
    /// The handler runs once with the full previous output.
    #[default]
    None,
    /// The handler runs once per item, one item at a time, in order.
    Sequential,
    /// The handler runs once per item, all items in flight together.
    Concurrent,
}

impl FanoutMode {
    /// Whether this mode iterates over a sequence.
    pub fn is_fanout(self) -> bool {
        !matches!(self, FanoutMode::None)
    }
}

impl fmt::Display for FanoutMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FanoutMode::None => write!(f, "none"),
            FanoutMode::Sequential => write!(f, "sequential"),
            FanoutMode::Concurrent => write!(f, "concurrent"),
        }
    }
}

/// Returned when a fan-out mode string is not recognised.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown fan-out mode '{0}' (expected none, sequential or concurrent)")]
pub struct UnknownFanoutMode(pub String);

impl FromStr for FanoutMode {
    type Err = UnknownFanoutMode;

    /// Accepts the canonical names plus the short `loop` / `aloop` aliases.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "none" | "" => Ok(FanoutMode::None),
            "sequential" | "loop" => Ok(FanoutMode::Sequential),
            "concurrent" | "aloop" => Ok(FanoutMode::Concurrent),
            other => Err(UnknownFanoutMode(other.to_string())),
        }
    }
}

// ---------------------------------------------------------------------------
// RunStatus
// ---------------------------------------------------------------------------

/// Lifecycle status of one pipeline execution.
///
/// `Running` is entered on start; every other variant is terminal.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    #[default]
    Running,
    Finished,
    Killed,
    FatalError,
}

impl RunStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, RunStatus::Running)
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunStatus::Running => write!(f, "running"),
            RunStatus::Finished => write!(f, "finished"),
            RunStatus::Killed => write!(f, "killed"),
            RunStatus::FatalError => write!(f, "fatal error"),
        }
    }
}

// ---------------------------------------------------------------------------
// LoopProgress
// ---------------------------------------------------------------------------

/// Progress of the fan-out step currently executing.
///
/// `active` counts invocations in flight, `finished` counts invocations that
/// returned (successfully or not).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoopProgress {
    pub step_name: String,
    pub max: usize,
    pub active: usize,
    pub finished: usize,
}

impl LoopProgress {
    pub fn new(step_name: impl Into<String>, max: usize) -> Self {
        Self {
            step_name: step_name.into(),
            max,
            active: 0,
            finished: 0,
        }
    }

    /// Items neither started nor finished yet.
    pub fn pending(&self) -> usize {
        self.max.saturating_sub(self.active + self.finished)
    }
}

// ---------------------------------------------------------------------------
// CheckpointRecord
// ---------------------------------------------------------------------------

/// The persisted `{in, out}` record of one step of one execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointRecord {
    /// The previous step's output (what this step received).
    #[serde(rename = "in")]
    pub input: Value,
    /// This step's output.
    #[serde(rename = "out")]
    pub output: Value,
}

impl CheckpointRecord {
    pub fn new(input: Value, output: Value) -> Self {
        Self { input, output }
    }
}

// ---------------------------------------------------------------------------
// StatusRecord
// ---------------------------------------------------------------------------

/// Liveness/progress record of one execution, overwritten in place.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusRecord {
    pub id: Uuid,
    pub name: String,
    pub start: DateTime<Utc>,
    /// Wall-clock time since `start`, rendered as `H:MM:SS.ffffff`.
    pub duration: String,
    pub finished: bool,
    pub last_step: Option<String>,
    /// Absent in records written before run status was tracked.
    #[serde(default)]
    pub status: RunStatus,
}

impl StatusRecord {
    /// Age of the execution relative to `now`.
    pub fn age(&self, now: DateTime<Utc>) -> TimeDelta {
        now - self.start
    }
}

/// Render a duration as `H:MM:SS.ffffff`.
///
/// Negative durations are clamped to zero.
pub fn format_duration(delta: TimeDelta) -> String {
    let micros = delta.num_microseconds().unwrap_or(i64::MAX).max(0);
    let total_secs = micros / 1_000_000;
    let frac = micros % 1_000_000;
    let hours = total_secs / 3600;
    let minutes = (total_secs % 3600) / 60;
    let seconds = total_secs % 60;
    format!("{hours}:{minutes:02}:{seconds:02}.{frac:06}")
}

// ---------------------------------------------------------------------------
// ResumeConfig
// ---------------------------------------------------------------------------

/// Replays named steps from a prior execution's checkpoints instead of running them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResumeConfig {
    pub source_execution_id: Uuid,
    pub steps: BTreeSet<String>,
}

impl ResumeConfig {
    pub fn new<I, S>(source_execution_id: Uuid, steps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            source_execution_id,
            steps: steps.into_iter().map(Into::into).collect(),
        }
    }

    /// Whether the step with this name should be hydrated instead of run.
    pub fn skips(&self, step_name: &str) -> bool {
        self.steps.contains(step_name)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
