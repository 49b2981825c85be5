//! Progress monitor.
//!
//! Runs as its own task next to a pipeline run and hands a
//! [`MonitorSnapshot`] to a callback once per interval. The first sample is
//! taken immediately. A failing callback stops the monitor; the run itself
//! is never affected.

use std::sync::Arc;
use std::time::Duration;

use pipeworks_types::pipeline::LoopProgress;
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::throttle::{Throttle, ThrottleSnapshot};

use super::state::LoopTracker;

/// What the callback sees on every tick.
#[derive(Debug, Clone, Serialize)]
pub struct MonitorSnapshot {
    pub execution_id: Uuid,
    /// Wall-clock time since the monitor started.
    pub elapsed: Duration,
    /// Set only while a fan-out step is executing.
    pub loop_progress: Option<LoopProgress>,
    pub throttle: Option<ThrottleSnapshot>,
}

/// Why the monitor task ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MonitorExit {
    /// Stopped by its owner, normally when the run ended.
    Stopped,
    /// The callback returned an error.
    CallbackFailed(String),
}

#[derive(Debug, thiserror::Error)]
pub enum MonitorError {
    #[error("monitor task failed: {0}")]
    Join(String),
}

#[derive(Debug, Clone)]
pub struct ProgressMonitor {
    execution_id: Uuid,
    interval: Duration,
    progress: LoopTracker,
    throttle: Option<Arc<Throttle>>,
}

impl ProgressMonitor {
    pub fn new(
        execution_id: Uuid,
        interval: Duration,
        progress: LoopTracker,
        throttle: Option<Arc<Throttle>>,
    ) -> Self {
        Self {
            execution_id,
            interval,
            progress,
            throttle,
        }
    }

    pub fn sample(&self, elapsed: Duration) -> MonitorSnapshot {
        MonitorSnapshot {
            execution_id: self.execution_id,
            elapsed,
            loop_progress: self.progress.snapshot(),
            throttle: self.throttle.as_ref().map(|t| t.snapshot()),
        }
    }

    /// Start sampling on a background task.
    pub fn spawn<F>(self, mut callback: F) -> MonitorHandle
    where
        F: FnMut(&MonitorSnapshot) -> anyhow::Result<()> + Send + 'static,
    {
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let task = tokio::spawn(async move {
            let started = Instant::now();
            let mut ticker = tokio::time::interval(self.interval.max(Duration::from_millis(1)));
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    biased;
                    _ = token.cancelled() => return MonitorExit::Stopped,
                    _ = ticker.tick() => {}
                }

                let snapshot = self.sample(started.elapsed());
                if let Err(e) = callback(&snapshot) {
                    let message = format!("{e:#}");
                    tracing::warn!(
                        execution_id = %self.execution_id,
                        error = %message,
                        "progress callback failed, stopping monitor"
                    );
                    return MonitorExit::CallbackFailed(message);
                }
            }
        });

        MonitorHandle { cancel, task }
    }
}

/// Owner side of a running monitor.
#[derive(Debug)]
pub struct MonitorHandle {
    cancel: CancellationToken,
    task: JoinHandle<MonitorExit>,
}

impl MonitorHandle {
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Stop the monitor and wait for its task to end.
    pub async fn stop(self) -> Result<MonitorExit, MonitorError> {
        self.cancel.cancel();
        self.task
            .await
            .map_err(|e| MonitorError::Join(e.to_string()))
    }
}
