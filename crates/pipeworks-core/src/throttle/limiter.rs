//! Per-tag rate limiter.
//!
//! Gating for a call under `tag` runs while holding that tag's mutex:
//!
//! 1. wait out the remainder of the minimum interval since the tag's last call
//! 2. (tracked limiters) poll until the in-flight count is below the ceiling
//! 3. if the anomaly flag is set, sleep the cool-down and clear the flag
//! 4. (tracked limiters) admit the request against the shared counters
//! 5. record the new last-call instant and release the mutex
//!
//! The wrapped call itself runs outside the mutex.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;

use super::state::{RequestGuard, Throttle};

/// Rate limiter bound to one throttle tag.
#[derive(Debug, Clone)]
pub struct RateLimiter {
    tag: String,
    interval: Duration,
    throttle: Arc<Throttle>,
    tracked: bool,
}

/// Proof that a call passed the gate.
///
/// For tracked limiters the permit owns the [`RequestGuard`]; the request
/// counts as in flight until the permit is dropped.
#[derive(Debug)]
pub struct Permit {
    request: Option<RequestGuard>,
}

impl Permit {
    pub fn is_tracked(&self) -> bool {
        self.request.is_some()
    }
}

impl RateLimiter {
    /// Interval-only limiter. Still honours the anomaly cool-down.
    pub fn new(tag: impl Into<String>, interval: Duration, throttle: Arc<Throttle>) -> Self {
        Self {
            tag: tag.into(),
            interval,
            throttle,
            tracked: false,
        }
    }

    /// Count calls through this limiter against the in-flight ceiling.
    pub fn tracked(mut self) -> Self {
        self.tracked = true;
        self
    }

    pub fn tag(&self) -> &str {
        &self.tag
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn throttle(&self) -> &Arc<Throttle> {
        &self.throttle
    }

    /// Pass the gate. Hold the returned permit for the duration of the call.
    pub async fn acquire(&self) -> Permit {
        let gate = self.throttle.gate(&self.tag);
        let mut last_call = gate.lock().await;

        if let Some(last) = *last_call {
            let since = last.elapsed();
            if since < self.interval {
                tokio::time::sleep(self.interval - since).await;
            }
        }

        let request = if self.tracked {
            Some(self.admit().await)
        } else {
            self.cool_down_if_flagged().await;
            None
        };

        *last_call = Some(Instant::now());
        Permit { request }
    }

    /// Gate, then run `call` outside the tag mutex.
    pub async fn call<F, Fut, T>(&self, call: F) -> T
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let _permit = self.acquire().await;
        call().await
    }

    async fn admit(&self) -> RequestGuard {
        let poll = self.throttle.config().poll_interval();
        loop {
            while !self.throttle.has_capacity() {
                tokio::time::sleep(poll).await;
            }
            self.cool_down_if_flagged().await;
            // Another tag may have taken the last slot while we slept.
            if let Some(guard) = self.throttle.try_admit() {
                return guard;
            }
        }
    }

    async fn cool_down_if_flagged(&self) {
        if !self.throttle.stop_requested() {
            return;
        }
        let cooldown = self.throttle.config().cooldown();
        tracing::warn!(
            tag = %self.tag,
            cooldown_secs = cooldown.as_secs(),
            "upstream latency anomaly, cooling down"
        );
        tokio::time::sleep(cooldown).await;
        self.throttle.clear_stop();
        tracing::info!(tag = %self.tag, "cool-down finished");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pipeworks_types::throttle::ThrottleConfig;
    use std::sync::atomic::{AtomicU64, Ordering};
    use tokio::task::JoinSet;

    fn throttle(max: u64) -> Arc<Throttle> {
        Throttle::shared(ThrottleConfig {
            max_active_requests: max,
            ..ThrottleConfig::default()
        })
    }

    #[tokio::test(start_paused = true)]
    async fn calls_under_one_tag_respect_interval() {
        let limiter = RateLimiter::new("t", Duration::from_millis(250), throttle(10));
        let mut starts = Vec::new();
        for _ in 0..5 {
            starts.push(limiter.call(|| async { Instant::now() }).await);
        }
        let span = starts[4] - starts[0];
        assert!(span >= Duration::from_millis(250) * 4, "span was {span:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn different_tags_do_not_wait_on_each_other() {
        let throttle = throttle(10);
        let a = RateLimiter::new("a", Duration::from_secs(10), Arc::clone(&throttle));
        let b = RateLimiter::new("b", Duration::from_secs(10), throttle);
        let start = Instant::now();
        a.acquire().await;
        b.acquire().await;
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn tracked_calls_never_exceed_ceiling() {
        let throttle = throttle(2);
        let peak = Arc::new(AtomicU64::new(0));
        let mut tasks = JoinSet::new();

        for i in 0..5 {
            let limiter =
                RateLimiter::new(format!("tag-{i}"), Duration::ZERO, Arc::clone(&throttle)).tracked();
            let throttle = Arc::clone(&throttle);
            let peak = Arc::clone(&peak);
            tasks.spawn(async move {
                limiter
                    .call(|| async {
                        peak.fetch_max(throttle.active(), Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_secs(1)).await;
                        peak.fetch_max(throttle.active(), Ordering::SeqCst);
                    })
                    .await;
            });
        }
        while let Some(joined) = tasks.join_next().await {
            joined.unwrap();
        }

        assert!(peak.load(Ordering::SeqCst) <= 2);
        let snapshot = throttle.snapshot();
        assert_eq!(snapshot.started, 5);
        assert_eq!(snapshot.ended, 5);
    }

    #[tokio::test(start_paused = true)]
    async fn anomaly_flag_triggers_cooldown() {
        let throttle = throttle(10);
        throttle.flag_anomaly();
        let limiter = RateLimiter::new("t", Duration::ZERO, Arc::clone(&throttle)).tracked();

        let start = Instant::now();
        let permit = limiter.acquire().await;
        assert!(start.elapsed() >= Duration::from_secs(35));
        assert!(permit.is_tracked());
        assert!(!throttle.stop_requested());
    }

    #[tokio::test(start_paused = true)]
    async fn untracked_limiter_does_not_count_requests() {
        let throttle = throttle(1);
        let limiter = RateLimiter::new("t", Duration::ZERO, Arc::clone(&throttle));
        let _first = limiter.acquire().await;
        let second = limiter.acquire().await;
        assert!(!second.is_tracked());
        assert_eq!(throttle.snapshot().started, 0);
    }
}
