//! JSON-file checkpoint store.
//!
//! Every file is first written to a uniquely named temporary file in the
//! same directory. Checkpoints are then hard-linked into place, which fails
//! if the target already exists, so a checkpoint can be created exactly
//! once. Status files are renamed over the previous version.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use pipeworks_core::checkpoint::{CheckpointError, CheckpointStore};
use pipeworks_types::pipeline::{CheckpointRecord, StatusRecord};
use serde::Serialize;
use serde::de::DeserializeOwned;
use uuid::Uuid;

use super::DataLayout;

#[derive(Debug, Clone)]
pub struct FsCheckpointStore {
    layout: DataLayout,
}

impl FsCheckpointStore {
    pub fn new(layout: DataLayout) -> Self {
        Self { layout }
    }

    pub fn layout(&self) -> &DataLayout {
        &self.layout
    }

    /// Serialize `value` into a temporary sibling of `target`.
    async fn write_temp<T: Serialize>(target: &Path, value: &T) -> Result<PathBuf, CheckpointError> {
        let dir = target
            .parent()
            .ok_or_else(|| CheckpointError::Storage(format!("{} has no parent", target.display())))?;
        tokio::fs::create_dir_all(dir).await?;

        let json = serde_json::to_string_pretty(value)?;
        let tmp = dir.join(format!(".{}.tmp", Uuid::new_v4()));
        tokio::fs::write(&tmp, json).await?;
        Ok(tmp)
    }

    async fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>, CheckpointError> {
        match tokio::fs::read_to_string(path).await {
            Ok(content) => Ok(Some(serde_json::from_str(&content)?)),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }
}

impl CheckpointStore for FsCheckpointStore {
    async fn write_checkpoint(
        &self,
        execution_id: Uuid,
        ordinal: usize,
        record: &CheckpointRecord,
    ) -> Result<(), CheckpointError> {
        let target = self.layout.checkpoint_path(execution_id, ordinal);
        let tmp = Self::write_temp(&target, record).await?;

        let linked = tokio::fs::hard_link(&tmp, &target).await;
        if let Err(err) = tokio::fs::remove_file(&tmp).await {
            tracing::warn!(path = %tmp.display(), error = %err, "failed to remove temporary checkpoint");
        }

        match linked {
            Ok(()) => {
                tracing::debug!(
                    execution_id = %execution_id,
                    ordinal,
                    path = %target.display(),
                    "checkpoint written"
                );
                Ok(())
            }
            Err(err) if err.kind() == ErrorKind::AlreadyExists => Err(CheckpointError::AlreadyWritten {
                execution_id,
                ordinal,
            }),
            Err(err) => Err(err.into()),
        }
    }

    async fn read_checkpoint(
        &self,
        execution_id: Uuid,
        ordinal: usize,
    ) -> Result<Option<CheckpointRecord>, CheckpointError> {
        Self::read_json(&self.layout.checkpoint_path(execution_id, ordinal)).await
    }

    async fn write_status(&self, record: &StatusRecord) -> Result<(), CheckpointError> {
        let target = self.layout.status_path(record.id);
        let tmp = Self::write_temp(&target, record).await?;
        if let Err(err) = tokio::fs::rename(&tmp, &target).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(err.into());
        }
        Ok(())
    }

    async fn read_status(&self, execution_id: Uuid) -> Result<Option<StatusRecord>, CheckpointError> {
        Self::read_json(&self.layout.status_path(execution_id)).await
    }
}
