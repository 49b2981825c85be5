//! Steps and the handler contract.
//!
//! A handler receives a [`StepInvocation`] and returns a JSON object, a JSON
//! array, or `null` for "no result". Anything else is rejected by
//! [`validate_output`].

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use futures_util::future::BoxFuture;
use pipeworks_types::pipeline::FanoutMode;
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::checkpoint::CheckpointReader;

use super::error::PipelineError;
use super::path::{value_kind, FieldPath, PathError};
use super::state::SharedState;

pub type HandlerResult = anyhow::Result<Value>;

// ---------------------------------------------------------------------------
// StepInvocation
// ---------------------------------------------------------------------------

/// Everything a handler receives for one invocation.
#[derive(Debug, Clone)]
pub struct StepInvocation {
    /// The fan-out item, or the previous step's full output.
    pub input: Value,
    /// Checkpoints of the current execution.
    pub checkpoints: CheckpointReader,
    /// The step's immutable configuration.
    pub config: Arc<Map<String, Value>>,
    pub shared: SharedState,
    /// 0-based item index for fan-out steps, `None` otherwise.
    pub iteration: Option<usize>,
    /// 1-based position of the step in the pipeline.
    pub ordinal: usize,
    pub execution_id: Uuid,
}

impl StepInvocation {
    /// A configuration value by key.
    pub fn config_value(&self, key: &str) -> Option<&Value> {
        self.config.get(key)
    }
}

// ---------------------------------------------------------------------------
// StepHandler
// ---------------------------------------------------------------------------

/// A step's unit of work.
pub trait StepHandler: Send + Sync + 'static {
    fn call(&self, invocation: StepInvocation) -> impl Future<Output = HandlerResult> + Send;
}

/// Object-safe version of [`StepHandler`], implemented for every handler.
pub trait StepHandlerDyn: Send + Sync {
    fn call_boxed(&self, invocation: StepInvocation) -> BoxFuture<'_, HandlerResult>;
}

impl<T: StepHandler> StepHandlerDyn for T {
    fn call_boxed(&self, invocation: StepInvocation) -> BoxFuture<'_, HandlerResult> {
        Box::pin(self.call(invocation))
    }
}

/// Handler backed by an async closure. Built by [`handler_fn`].
pub struct FnHandler<F> {
    f: F,
}

impl<F, Fut> StepHandler for FnHandler<F>
where
    F: Fn(StepInvocation) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    fn call(&self, invocation: StepInvocation) -> impl Future<Output = HandlerResult> + Send {
        (self.f)(invocation)
    }
}

/// Adapt an async closure into a [`StepHandler`].
pub fn handler_fn<F, Fut>(f: F) -> FnHandler<F>
where
    F: Fn(StepInvocation) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    FnHandler { f }
}

/// Accept objects, arrays and null; reject scalars.
pub fn validate_output(step: &str, value: &Value) -> Result<(), PipelineError> {
    match value {
        Value::Null | Value::Array(_) | Value::Object(_) => Ok(()),
        other => Err(PipelineError::InvalidOutput {
            step: step.to_string(),
            kind: value_kind(other),
        }),
    }
}

// ---------------------------------------------------------------------------
// Step
// ---------------------------------------------------------------------------

/// A named handler plus its fan-out mode, extraction path and configuration.
///
/// Cloning is cheap; clones share the handler and the configuration.
#[derive(Clone)]
pub struct Step {
    name: String,
    handler: Arc<dyn StepHandlerDyn>,
    fanout: FanoutMode,
    extract: Option<FieldPath>,
    config: Arc<Map<String, Value>>,
}

impl Step {
    pub fn new(name: impl Into<String>, handler: impl StepHandler) -> Self {
        Self {
            name: name.into(),
            handler: Arc::new(handler),
            fanout: FanoutMode::None,
            extract: None,
            config: Arc::new(Map::new()),
        }
    }

    /// Shorthand for `Step::new(name, handler_fn(f))`.
    pub fn from_fn<F, Fut>(name: impl Into<String>, f: F) -> Self
    where
        F: Fn(StepInvocation) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        Self::new(name, handler_fn(f))
    }

    pub fn with_fanout(mut self, mode: FanoutMode) -> Self {
        self.fanout = mode;
        self
    }

    /// Fan out over the value at `path` in the previous output instead of
    /// the output itself. Ignored for non-fan-out steps.
    pub fn with_extract(mut self, path: &str) -> Result<Self, PathError> {
        self.extract = Some(FieldPath::parse(path)?);
        Ok(self)
    }

    pub fn with_config(mut self, config: Map<String, Value>) -> Self {
        self.config = Arc::new(config);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn fanout(&self) -> FanoutMode {
        self.fanout
    }

    pub fn extract(&self) -> Option<&FieldPath> {
        self.extract.as_ref()
    }

    pub fn config(&self) -> &Arc<Map<String, Value>> {
        &self.config
    }

    pub(crate) fn handler(&self) -> &Arc<dyn StepHandlerDyn> {
        &self.handler
    }
}

impl fmt::Debug for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Step")
            .field("name", &self.name)
            .field("fanout", &self.fanout)
            .field("extract", &self.extract)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::InMemoryCheckpointStore;
    use serde_json::json;

    fn invocation(input: Value) -> StepInvocation {
        let execution_id = Uuid::now_v7();
        StepInvocation {
            input,
            checkpoints: CheckpointReader::new(Arc::new(InMemoryCheckpointStore::new()), execution_id),
            config: Arc::new(Map::new()),
            shared: SharedState::new(),
            iteration: None,
            ordinal: 1,
            execution_id,
        }
    }

    #[test]
    fn output_shapes() {
        assert!(validate_output("s", &json!(null)).is_ok());
        assert!(validate_output("s", &json!([1])).is_ok());
        assert!(validate_output("s", &json!({"a": 1})).is_ok());
        assert!(matches!(
            validate_output("s", &json!(3)),
            Err(PipelineError::InvalidOutput { kind: "number", .. })
        ));
        assert!(validate_output("s", &json!("x")).is_err());
        assert!(validate_output("s", &json!(true)).is_err());
    }

    #[tokio::test]
    async fn closure_handlers_receive_the_invocation() {
        let step = Step::from_fn("double", |inv: StepInvocation| async move {
            let n = inv.input.as_i64().unwrap_or_default();
            Ok(json!([n * 2]))
        });
        let out = step.handler().call_boxed(invocation(json!(21))).await.unwrap();
        assert_eq!(out, json!([42]));
    }

    #[test]
    fn builder_methods() {
        let mut config = Map::new();
        config.insert("min_likes".to_string(), json!(50));

        let step = Step::from_fn("filter", |_inv| async { Ok(Value::Null) })
            .with_fanout(FanoutMode::Concurrent)
            .with_extract("data.items")
            .unwrap()
            .with_config(config);

        assert_eq!(step.name(), "filter");
        assert_eq!(step.fanout(), FanoutMode::Concurrent);
        assert_eq!(step.extract().unwrap().to_string(), "data.items");
        assert_eq!(step.config().get("min_likes"), Some(&json!(50)));
        assert!(Step::from_fn("x", |_inv| async { Ok(Value::Null) })
            .with_extract("a..b")
            .is_err());
    }
}
