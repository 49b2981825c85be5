//! `pipeworks run`: the bundled demo pipeline.
//!
//! Three steps: `seed` returns a fixed set of users, `filter` keeps users
//! with more than `min_likes` likes and `summarise` reports what survived.
//! The filter step fans out per user unless the mode is `none`, and every
//! per-user call passes a tracked rate limiter so the monitor has throttle
//! counters to show.

use std::future::Future;
use std::sync::Arc;

use anyhow::{Context, Result};
use console::style;
use indicatif::{ProgressBar, ProgressStyle};
use pipeworks_core::checkpoint::CheckpointStoreDyn;
use pipeworks_core::pipeline::{MonitorSnapshot, Pipeline, Step, StepInvocation};
use pipeworks_core::throttle::{RateLimiter, Throttle};
use pipeworks_types::config::GlobalConfig;
use pipeworks_types::pipeline::{FanoutMode, ResumeConfig};
use serde_json::{json, Map, Value};
use uuid::Uuid;

use crate::state::AppState;

pub const SEED_STEP: &str = "seed";
pub const FILTER_STEP: &str = "filter";
pub const SUMMARY_STEP: &str = "summarise";

/// Throttle tag of the filter step's per-user calls.
const DEMO_TAG: &str = "demo";
const DEFAULT_MIN_LIKES: i64 = 50;

/// Arguments of `pipeworks run`.
#[derive(Debug, Clone)]
pub struct RunArgs {
    pub mode: FanoutMode,
    pub resume_from: Option<Uuid>,
    pub skip: Vec<String>,
    pub name: String,
}

impl RunArgs {
    fn resume(&self) -> Option<ResumeConfig> {
        self.resume_from
            .map(|source| ResumeConfig::new(source, self.skip.iter().cloned()))
    }
}

/// Run the demo pipeline under `execution_id` until it ends or `shutdown`
/// resolves.
///
/// Returns an error unless the execution finished.
pub async fn run_demo<S>(
    state: &AppState,
    args: RunArgs,
    execution_id: Uuid,
    shutdown: S,
    json: bool,
    quiet: bool,
) -> Result<()>
where
    S: Future<Output = ()> + Send + 'static,
{
    let mut pipeline = build_demo_pipeline(
        state.store.clone(),
        Arc::clone(&state.throttle),
        &state.config,
        args.mode,
        execution_id,
        args.resume(),
    )?;

    let cancel = pipeline.cancellation_token();
    let watcher = tokio::spawn(async move {
        shutdown.await;
        tracing::warn!(execution_id = %execution_id, "shutdown requested, stopping execution");
        cancel.cancel();
    });

    let bar = progress_bar(json || quiet)?;
    let monitor_bar = bar.clone();
    let result = pipeline
        .run_with_monitor(&args.name, move |snapshot: &MonitorSnapshot| {
            render_snapshot(&monitor_bar, snapshot);
            Ok(())
        })
        .await;

    watcher.abort();
    bar.finish_and_clear();

    let outcome = result.with_context(|| format!("execution {execution_id} did not finish"))?;

    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(&json!({
                "execution_id": outcome.execution_id,
                "status": outcome.status,
                "output": outcome.output,
            }))?
        );
        return Ok(());
    }

    if !quiet {
        println!();
        println!(
            "  {} Execution {} {}",
            style("✓").green().bold(),
            style(outcome.execution_id).cyan(),
            outcome.status
        );
        println!();
        println!("{}", serde_json::to_string_pretty(&outcome.output)?);
        println!();
    }

    Ok(())
}

/// Assemble the demo pipeline against the given store and throttle.
pub fn build_demo_pipeline(
    store: Arc<dyn CheckpointStoreDyn>,
    throttle: Arc<Throttle>,
    config: &GlobalConfig,
    mode: FanoutMode,
    execution_id: Uuid,
    resume: Option<ResumeConfig>,
) -> Result<Pipeline> {
    let limiter = Arc::new(
        RateLimiter::new(DEMO_TAG, config.upstream.interval(), Arc::clone(&throttle)).tracked(),
    );

    let mut filter_config = Map::new();
    filter_config.insert("min_likes".to_string(), json!(DEFAULT_MIN_LIKES));

    let filter = Step::from_fn(FILTER_STEP, move |invocation: StepInvocation| {
        let limiter = Arc::clone(&limiter);
        async move { filter_users(&limiter, invocation).await }
    })
    .with_fanout(mode)
    .with_extract("users")?
    .with_config(filter_config);

    let mut builder = Pipeline::builder(store)
        .with_execution_id(execution_id)
        .with_throttle(throttle)
        .with_monitor_interval(config.monitor.interval())
        .then(Step::from_fn(SEED_STEP, |_invocation| async {
            Ok::<_, anyhow::Error>(json!({ "users": demo_users() }))
        }))
        .then(filter)
        .then(Step::from_fn(SUMMARY_STEP, summarise));

    if let Some(resume) = resume {
        builder = builder.resume_from(resume);
    }

    Ok(builder.build()?)
}

/// The users the seed step returns.
pub fn demo_users() -> Value {
    json!([
        { "id": 1, "user": "A", "likes": 24 },
        { "id": 2, "user": "B", "likes": 55 },
        { "id": 3, "user": "C", "likes": 132 },
        { "id": 4, "user": "D", "likes": 7 },
        { "id": 5, "user": "E", "likes": 51 },
        { "id": 6, "user": "F", "likes": 50 },
        { "id": 7, "user": "G", "likes": 88 },
        { "id": 8, "user": "H", "likes": 13 },
    ])
}

async fn filter_users(limiter: &RateLimiter, invocation: StepInvocation) -> Result<Value> {
    let min_likes = invocation
        .config_value("min_likes")
        .and_then(Value::as_i64)
        .unwrap_or(DEFAULT_MIN_LIKES);

    if let Some(iteration) = invocation.iteration {
        tracing::debug!(iteration, user = %invocation.input, "checking user");
        return limiter
            .call(|| async { keep_if_popular(invocation.input, min_likes) })
            .await;
    }

    let users = invocation
        .input
        .get("users")
        .and_then(Value::as_array)
        .context("expected a 'users' array")?;

    let mut kept = Vec::new();
    for user in users {
        let user = keep_if_popular(user.clone(), min_likes)?;
        if !user.is_null() {
            kept.push(user);
        }
    }
    Ok(Value::Array(kept))
}

/// The user itself when it has more than `min_likes` likes, `null` otherwise.
fn keep_if_popular(user: Value, min_likes: i64) -> Result<Value> {
    let likes = user
        .get("likes")
        .and_then(Value::as_i64)
        .with_context(|| format!("user has no numeric likes: {user}"))?;

    Ok(if likes > min_likes { user } else { Value::Null })
}

async fn summarise(invocation: StepInvocation) -> Result<Value> {
    let kept = invocation.input.as_array().cloned().unwrap_or_default();

    let seeded = invocation
        .checkpoints
        .get(1)
        .await
        .and_then(|record| record.output.get("users").and_then(Value::as_array).map(Vec::len))
        .unwrap_or(0);

    let total_likes: i64 = kept
        .iter()
        .filter_map(|user| user.get("likes").and_then(Value::as_i64))
        .sum();
    let names: Vec<Value> = kept.iter().filter_map(|user| user.get("user").cloned()).collect();

    let summary = json!({
        "seeded": seeded,
        "kept": kept.len(),
        "total_likes": total_likes,
        "users": names,
    });
    invocation.shared.insert("summary", summary.clone());
    Ok(summary)
}

fn progress_bar(hidden: bool) -> Result<ProgressBar> {
    if hidden {
        return Ok(ProgressBar::hidden());
    }

    let bar = ProgressBar::new(0);
    bar.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.cyan} [{elapsed_precise}] {bar:30.cyan/blue} {pos}/{len} {msg}")?
            .progress_chars("=> "),
    );
    bar.set_message("starting");
    Ok(bar)
}

fn render_snapshot(bar: &ProgressBar, snapshot: &MonitorSnapshot) {
    match &snapshot.loop_progress {
        Some(progress) => {
            bar.set_length(progress.max as u64);
            bar.set_position(progress.finished as u64);
        }
        None => {
            bar.set_length(0);
            bar.set_position(0);
        }
    }
    bar.set_message(describe(snapshot));
    bar.tick();
}

/// One-line summary of a monitor sample.
fn describe(snapshot: &MonitorSnapshot) -> String {
    let mut parts = Vec::new();

    match &snapshot.loop_progress {
        Some(progress) => parts.push(format!(
            "{}: {} active, {} pending",
            progress.step_name,
            progress.active,
            progress.pending()
        )),
        None => parts.push("running".to_string()),
    }

    if let Some(throttle) = &snapshot.throttle {
        parts.push(format!(
            "{}/{} in flight",
            throttle.active, throttle.max_active_requests
        ));
        if throttle.stop {
            parts.push("cooling down".to_string());
        }
    }

    parts.join(" | ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use pipeworks_core::checkpoint::InMemoryCheckpointStore;
    use pipeworks_core::throttle::ThrottleSnapshot;
    use pipeworks_types::pipeline::{LoopProgress, RunStatus};
    use std::time::Duration;

    fn expected_summary() -> Value {
        json!({
            "seeded": 8,
            "kept": 4,
            "total_likes": 326,
            "users": ["B", "C", "E", "G"],
        })
    }

    async fn run_mode(mode: FanoutMode) -> Value {
        let store = Arc::new(InMemoryCheckpointStore::new());
        let throttle = Throttle::shared(Default::default());
        let mut pipeline = build_demo_pipeline(
            store,
            Arc::clone(&throttle),
            &GlobalConfig::default(),
            mode,
            Uuid::now_v7(),
            None,
        )
        .unwrap();

        let outcome = pipeline.run("demo").await.unwrap();
        assert_eq!(outcome.status, RunStatus::Finished);
        assert_eq!(pipeline.shared_state().get("summary"), Some(outcome.output.clone()));
        outcome.output
    }

    #[tokio::test(start_paused = true)]
    async fn every_mode_produces_the_same_summary() {
        for mode in [FanoutMode::None, FanoutMode::Sequential, FanoutMode::Concurrent] {
            assert_eq!(run_mode(mode).await, expected_summary(), "mode {mode}");
        }
    }

    #[tokio::test(start_paused = true)]
    async fn fanout_calls_pass_the_tracked_limiter() {
        let store = Arc::new(InMemoryCheckpointStore::new());
        let throttle = Throttle::shared(Default::default());
        let mut pipeline = build_demo_pipeline(
            store,
            Arc::clone(&throttle),
            &GlobalConfig::default(),
            FanoutMode::Concurrent,
            Uuid::now_v7(),
            None,
        )
        .unwrap();

        pipeline.run("demo").await.unwrap();

        let snapshot = throttle.snapshot();
        assert_eq!(snapshot.started, 8);
        assert_eq!(snapshot.ended, 8);
        assert_eq!(snapshot.active, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn resumed_run_reuses_seed_and_filter() {
        let store = Arc::new(InMemoryCheckpointStore::new());
        let throttle = Throttle::shared(Default::default());
        let config = GlobalConfig::default();

        let first = Uuid::now_v7();
        build_demo_pipeline(
            store.clone(),
            Arc::clone(&throttle),
            &config,
            FanoutMode::Concurrent,
            first,
            None,
        )
        .unwrap()
        .run("first")
        .await
        .unwrap();
        let admitted = throttle.snapshot().started;

        let args = RunArgs {
            mode: FanoutMode::Concurrent,
            resume_from: Some(first),
            skip: vec![SEED_STEP.to_string(), FILTER_STEP.to_string()],
            name: "second".to_string(),
        };
        let second = Uuid::now_v7();
        let outcome = build_demo_pipeline(
            store.clone(),
            Arc::clone(&throttle),
            &config,
            args.mode,
            second,
            args.resume(),
        )
        .unwrap()
        .run(&args.name)
        .await
        .unwrap();

        assert_eq!(outcome.output, expected_summary());
        assert_eq!(throttle.snapshot().started, admitted);
        assert_eq!(store.checkpoint_count(second), 3);
    }

    #[test]
    fn keep_if_popular_filters_and_rejects_malformed_users() {
        let popular = json!({ "user": "C", "likes": 132 });
        assert_eq!(keep_if_popular(popular.clone(), 50).unwrap(), popular);
        assert_eq!(keep_if_popular(json!({ "likes": 50 }), 50).unwrap(), Value::Null);

        let err = keep_if_popular(json!({ "user": "X" }), 50).unwrap_err();
        assert!(err.to_string().contains("no numeric likes"));
    }

    #[test]
    fn resume_requires_a_source() {
        let args = RunArgs {
            mode: FanoutMode::None,
            resume_from: None,
            skip: vec![SEED_STEP.to_string()],
            name: "demo".to_string(),
        };
        assert!(args.resume().is_none());
    }

    #[test]
    fn describe_mentions_loop_and_throttle() {
        let mut progress = LoopProgress::new(FILTER_STEP, 8);
        progress.active = 3;
        progress.finished = 2;

        let snapshot = MonitorSnapshot {
            execution_id: Uuid::nil(),
            elapsed: Duration::from_secs(4),
            loop_progress: Some(progress),
            throttle: Some(ThrottleSnapshot {
                started: 5,
                ended: 2,
                active: 3,
                max_active_requests: 10,
                stop: true,
            }),
        };

        assert_eq!(
            describe(&snapshot),
            "filter: 3 active, 3 pending | 3/10 in flight | cooling down"
        );

        let idle = MonitorSnapshot {
            loop_progress: None,
            throttle: None,
            ..snapshot
        };
        assert_eq!(describe(&idle), "running");
    }
}
