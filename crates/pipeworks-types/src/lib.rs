//! Shared domain types for Pipeworks.
//!
//! This crate contains the plain data that flows between the engine, the
//! storage adapters and the CLI: step execution modes, run status, checkpoint
//! and status records, resume configuration and the global configuration.
//!
//! Zero infrastructure dependencies -- only serde, uuid, chrono, thiserror.

pub mod config;
pub mod pipeline;
pub mod throttle;
