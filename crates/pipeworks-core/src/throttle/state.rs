//! Process-wide throttle state.
//!
//! Holds the `started` / `ended` request counters, the configurable
//! in-flight ceiling, the transient anomaly (`stop`) flag, and one async
//! mutex per rate-limiter tag guarding that tag's last-call timestamp.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use dashmap::DashMap;
use pipeworks_types::throttle::ThrottleConfig;
use serde::Serialize;
use tokio::time::Instant;

/// Point-in-time view of the throttle counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ThrottleSnapshot {
    pub started: u64,
    pub ended: u64,
    /// `started - ended`: requests currently in flight.
    pub active: u64,
    pub max_active_requests: u64,
    /// Set while a collective cool-down is pending.
    pub stop: bool,
}

#[derive(Debug)]
struct Counters {
    started: u64,
    ended: u64,
    max_active_requests: u64,
    stop: bool,
}

impl Counters {
    fn active(&self) -> u64 {
        self.started.saturating_sub(self.ended)
    }
}

/// Per-tag gate: the mutex serialises gating decisions, the value is the
/// instant the last call under the tag was admitted.
pub(crate) type TagGate = Arc<tokio::sync::Mutex<Option<Instant>>>;

/// Shared counter block consumed by every [`RateLimiter`](super::RateLimiter).
#[derive(Debug)]
pub struct Throttle {
    config: ThrottleConfig,
    counters: Mutex<Counters>,
    gates: DashMap<String, TagGate>,
}

impl Throttle {
    pub fn new(config: ThrottleConfig) -> Self {
        let counters = Counters {
            started: 0,
            ended: 0,
            max_active_requests: config.max_active_requests,
            stop: false,
        };
        Self {
            config,
            counters: Mutex::new(counters),
            gates: DashMap::new(),
        }
    }

    /// Convenience constructor returning the shared handle.
    pub fn shared(config: ThrottleConfig) -> Arc<Self> {
        Arc::new(Self::new(config))
    }

    pub fn config(&self) -> &ThrottleConfig {
        &self.config
    }

    fn counters(&self) -> MutexGuard<'_, Counters> {
        self.counters.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn snapshot(&self) -> ThrottleSnapshot {
        let counters = self.counters();
        ThrottleSnapshot {
            started: counters.started,
            ended: counters.ended,
            active: counters.active(),
            max_active_requests: counters.max_active_requests,
            stop: counters.stop,
        }
    }

    /// Requests currently in flight.
    pub fn active(&self) -> u64 {
        self.counters().active()
    }

    /// Change the in-flight ceiling at runtime.
    pub fn set_max_active_requests(&self, max: u64) {
        self.counters().max_active_requests = max;
    }

    pub fn has_capacity(&self) -> bool {
        let counters = self.counters();
        counters.active() < counters.max_active_requests
    }

    /// Admit one tracked request if the ceiling allows it.
    ///
    /// The capacity check and the `started` increment happen under the same
    /// lock, so concurrent callers on different tags cannot overshoot.
    pub fn try_admit(self: &Arc<Self>) -> Option<RequestGuard> {
        let mut counters = self.counters();
        if counters.active() >= counters.max_active_requests {
            return None;
        }
        counters.started += 1;
        Some(RequestGuard {
            throttle: Arc::clone(self),
            admitted_at: Instant::now(),
        })
    }

    pub fn stop_requested(&self) -> bool {
        self.counters().stop
    }

    /// Raise the anomaly flag; the next gated caller starts a cool-down.
    pub fn flag_anomaly(&self) {
        self.counters().stop = true;
    }

    pub(crate) fn clear_stop(&self) {
        self.counters().stop = false;
    }

    pub(crate) fn gate(&self, tag: &str) -> TagGate {
        if let Some(gate) = self.gates.get(tag) {
            return Arc::clone(gate.value());
        }
        Arc::clone(
            self.gates
                .entry(tag.to_string())
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(None)))
                .value(),
        )
    }

    fn finish(&self, elapsed: std::time::Duration) {
        let mut counters = self.counters();
        counters.ended += 1;
        if elapsed > self.config.anomaly_threshold() {
            counters.stop = true;
            drop(counters);
            tracing::warn!(
                elapsed_secs = elapsed.as_secs_f64(),
                threshold_secs = self.config.anomaly_threshold_secs,
                "request exceeded latency ceiling, scheduling collective cool-down"
            );
        }
    }
}

/// One admitted, in-flight request.
///
/// Dropping the guard counts the request as ended (whether it succeeded,
/// failed or was cancelled) and raises the anomaly flag if it ran longer
/// than the configured ceiling.
#[derive(Debug)]
pub struct RequestGuard {
    throttle: Arc<Throttle>,
    admitted_at: Instant,
}

impl RequestGuard {
    pub fn elapsed(&self) -> std::time::Duration {
        self.admitted_at.elapsed()
    }
}

impl Drop for RequestGuard {
    fn drop(&mut self) {
        self.throttle.finish(self.admitted_at.elapsed());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn throttle(max: u64) -> Arc<Throttle> {
        Throttle::shared(ThrottleConfig {
            max_active_requests: max,
            ..ThrottleConfig::default()
        })
    }

    #[test]
    fn admit_respects_ceiling() {
        let throttle = throttle(2);
        let a = throttle.try_admit().unwrap();
        let _b = throttle.try_admit().unwrap();
        assert!(throttle.try_admit().is_none());
        assert!(!throttle.has_capacity());

        drop(a);
        assert!(throttle.has_capacity());
        let snapshot = throttle.snapshot();
        assert_eq!(snapshot.started, 2);
        assert_eq!(snapshot.ended, 1);
        assert_eq!(snapshot.active, 1);
    }

    #[test]
    fn ceiling_can_change_at_runtime() {
        let throttle = throttle(1);
        let _a = throttle.try_admit().unwrap();
        assert!(throttle.try_admit().is_none());
        throttle.set_max_active_requests(2);
        assert!(throttle.try_admit().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn slow_request_raises_anomaly_flag() {
        let throttle = throttle(10);
        let guard = throttle.try_admit().unwrap();
        tokio::time::advance(Duration::from_secs(36)).await;
        drop(guard);
        assert!(throttle.stop_requested());

        throttle.clear_stop();
        assert!(!throttle.stop_requested());
    }

    #[tokio::test(start_paused = true)]
    async fn fast_request_leaves_flag_clear() {
        let throttle = throttle(10);
        let guard = throttle.try_admit().unwrap();
        tokio::time::advance(Duration::from_secs(5)).await;
        drop(guard);
        assert!(!throttle.stop_requested());
        assert_eq!(throttle.snapshot().ended, 1);
    }

    #[test]
    fn gates_are_shared_per_tag() {
        let throttle = throttle(1);
        let a = throttle.gate("upstream");
        let b = throttle.gate("upstream");
        let c = throttle.gate("repeats");
        assert!(Arc::ptr_eq(&a, &b));
        assert!(!Arc::ptr_eq(&a, &c));
    }
}
