//! Filesystem adapters for Pipeworks.
//!
//! Owns the data-directory layout and implements the `CheckpointStore`
//! trait from `pipeworks-core` on top of plain JSON files:
//!
//! ```text
//! {data_dir}/
//!   config.toml
//!   pipeline/{execution_id}/step_{n}.json
//!   pipeline/{execution_id}/status.json
//!   requests/{execution_id}/{request_id}.req
//!   log/executions/{execution_id}/execution.log
//! ```

pub mod checkpoint;

use std::path::{Path, PathBuf};

use uuid::Uuid;

pub use checkpoint::FsCheckpointStore;

/// Paths inside a Pipeworks data directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataLayout {
    root: PathBuf,
}

impl DataLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn config_path(&self) -> PathBuf {
        self.root.join("config.toml")
    }

    /// `{root}/pipeline/`, one subdirectory per execution.
    pub fn pipeline_dir(&self) -> PathBuf {
        self.root.join("pipeline")
    }

    pub fn execution_dir(&self, execution_id: Uuid) -> PathBuf {
        self.pipeline_dir().join(execution_id.to_string())
    }

    /// Checkpoint file of the 1-based step `ordinal`.
    pub fn checkpoint_path(&self, execution_id: Uuid, ordinal: usize) -> PathBuf {
        self.execution_dir(execution_id)
            .join(format!("step_{ordinal}.json"))
    }

    pub fn status_path(&self, execution_id: Uuid) -> PathBuf {
        self.execution_dir(execution_id).join("status.json")
    }

    /// Recorded upstream responses of one execution.
    pub fn requests_dir(&self, execution_id: Uuid) -> PathBuf {
        self.root.join("requests").join(execution_id.to_string())
    }

    pub fn execution_log_dir(&self, execution_id: Uuid) -> PathBuf {
        self.root
            .join("log")
            .join("executions")
            .join(execution_id.to_string())
    }

    pub fn execution_log_path(&self, execution_id: Uuid) -> PathBuf {
        self.execution_log_dir(execution_id).join("execution.log")
    }

    /// Create the top-level directories if they are missing.
    pub async fn ensure(&self) -> std::io::Result<()> {
        tokio::fs::create_dir_all(self.pipeline_dir()).await?;
        tokio::fs::create_dir_all(self.root.join("requests")).await?;
        tokio::fs::create_dir_all(self.root.join("log").join("executions")).await
    }
}

/// Resolve the data directory from environment or platform defaults.
///
/// Priority:
/// 1. `PIPEWORKS_DATA_DIR` environment variable
/// 2. `~/.pipeworks`
/// 3. `./.pipeworks`
pub fn resolve_data_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("PIPEWORKS_DATA_DIR") {
        return PathBuf::from(dir);
    }

    if let Some(home) = dirs::home_dir() {
        return home.join(".pipeworks");
    }

    PathBuf::from(".pipeworks")
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn layout_paths() {
        let layout = DataLayout::new("/home/user/.pipeworks");
        let id = Uuid::nil();
        assert_eq!(
            layout.checkpoint_path(id, 2),
            PathBuf::from(format!("/home/user/.pipeworks/pipeline/{id}/step_2.json"))
        );
        assert_eq!(
            layout.status_path(id),
            PathBuf::from(format!("/home/user/.pipeworks/pipeline/{id}/status.json"))
        );
        assert_eq!(
            layout.requests_dir(id),
            PathBuf::from(format!("/home/user/.pipeworks/requests/{id}"))
        );
        assert_eq!(
            layout.execution_log_path(id),
            PathBuf::from(format!(
                "/home/user/.pipeworks/log/executions/{id}/execution.log"
            ))
        );
        assert_eq!(
            layout.config_path(),
            PathBuf::from("/home/user/.pipeworks/config.toml")
        );
    }

    #[tokio::test]
    async fn ensure_creates_directories() {
        let dir = tempdir().unwrap();
        let layout = DataLayout::new(dir.path());
        layout.ensure().await.unwrap();
        assert!(layout.pipeline_dir().is_dir());
        assert!(dir.path().join("requests").is_dir());
        assert!(dir.path().join("log/executions").is_dir());
    }

    #[test]
    fn test_resolve_data_dir_from_env() {
        // SAFETY: This test is single-threaded and restores the env var immediately.
        unsafe {
            std::env::set_var("PIPEWORKS_DATA_DIR", "/tmp/test-pipeworks");
        }
        let dir = resolve_data_dir();
        assert_eq!(dir, PathBuf::from("/tmp/test-pipeworks"));
        unsafe {
            std::env::remove_var("PIPEWORKS_DATA_DIR");
        }
    }
}
