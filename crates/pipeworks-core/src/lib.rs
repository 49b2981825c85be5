//! Pipeline engine and backpressure layer for Pipeworks.
//!
//! This crate defines the "ports" the infrastructure layer implements (the
//! [`checkpoint::CheckpointStore`] trait) together with everything that runs
//! in-process: the linear step pipeline with its fan-out modes, the progress
//! monitor, and the shared throttle that every outbound call passes through.
//! It never touches the filesystem or the network directly.

pub mod checkpoint;
pub mod pipeline;
pub mod throttle;
