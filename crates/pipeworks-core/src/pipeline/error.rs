use uuid::Uuid;

use crate::checkpoint::CheckpointError;

/// Errors that end a pipeline run.
///
/// Fan-out iteration failures never surface here; they are logged and the
/// item is dropped from the step's output.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    /// The pipeline or one of its steps is misconfigured, or a fan-out step
    /// received input it cannot iterate.
    #[error("configuration error in step '{step}': {message}")]
    Configuration { step: String, message: String },

    /// A non-fan-out handler returned something other than an object, an
    /// array or null.
    #[error("step '{step}' returned {kind}, expected an object, an array or null")]
    InvalidOutput { step: String, kind: &'static str },

    /// A non-fan-out handler returned an error.
    #[error("step '{step}' failed: {error}")]
    StepFailed { step: String, error: String },

    #[error(transparent)]
    Checkpoint(#[from] CheckpointError),

    /// Resume was requested for a step the source execution never checkpointed.
    #[error("cannot resume step '{step}': execution {source_execution_id} has no checkpoint {ordinal}")]
    MissingResumeCheckpoint {
        step: String,
        source_execution_id: Uuid,
        ordinal: usize,
    },

    /// The run was cancelled from outside.
    #[error("pipeline killed")]
    Killed,

    /// `run` was called on a pipeline that already ran.
    #[error("execution {execution_id} has already been started")]
    AlreadyStarted { execution_id: Uuid },
}

impl PipelineError {
    /// The step the error is attributed to, if any.
    pub fn step(&self) -> Option<&str> {
        match self {
            PipelineError::Configuration { step, .. }
            | PipelineError::InvalidOutput { step, .. }
            | PipelineError::StepFailed { step, .. }
            | PipelineError::MissingResumeCheckpoint { step, .. } => Some(step),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn messages_name_the_step() {
        let err = PipelineError::InvalidOutput {
            step: "seed".to_string(),
            kind: "number",
        };
        assert_eq!(
            err.to_string(),
            "step 'seed' returned number, expected an object, an array or null"
        );
        assert_eq!(err.step(), Some("seed"));
        assert_eq!(PipelineError::Killed.step(), None);
    }

    #[test]
    fn checkpoint_errors_convert() {
        let err: PipelineError = CheckpointError::Storage("disk full".to_string()).into();
        assert!(matches!(err, PipelineError::Checkpoint(_)));
        assert!(err.to_string().contains("disk full"));
    }
}
