//! Observability setup for Pipeworks: console logging, per-execution log
//! files and optional OpenTelemetry export.

pub mod tracing_setup;
