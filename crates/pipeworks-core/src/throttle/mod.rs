//! Shared throttling for outbound calls.
//!
//! - `state` -- process-wide request counters, anomaly flag and per-tag gates
//! - `limiter` -- per-tag minimum interval, concurrency cap and anomaly cool-down
//! - `retry` -- bounded retry of transient (429 / 5xx) upstream responses
//!
//! A single [`Throttle`] is created per process and injected (as
//! `Arc<Throttle>`) into every rate-limited call site. There are no
//! module-level singletons.

pub mod limiter;
pub mod retry;
pub mod state;

pub use limiter::{Permit, RateLimiter};
pub use retry::{is_transient, HttpStatus, RetryPolicy};
pub use state::{RequestGuard, Throttle, ThrottleSnapshot};
