//! Infrastructure layer for Pipeworks.
//!
//! Contains the filesystem implementation of the `CheckpointStore` trait
//! defined in `pipeworks-core`, the data-directory layout, the `config.toml`
//! loader, the rate-limited upstream HTTP client, and the execution manager
//! used to inspect and prune recorded runs.

pub mod config;
pub mod filesystem;
pub mod manager;
pub mod upstream;
