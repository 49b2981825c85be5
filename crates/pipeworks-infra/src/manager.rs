//! Inspection and pruning of recorded executions.
//!
//! Works purely from the data directory: every `pipeline/{id}/status.json`
//! is one execution. Directories without a readable status file are skipped
//! with a warning.

use std::io::ErrorKind;
use std::path::Path;

use chrono::{DateTime, TimeDelta, Utc};
use pipeworks_core::checkpoint::CheckpointStore;
use pipeworks_types::pipeline::StatusRecord;
use uuid::Uuid;

use crate::filesystem::{DataLayout, FsCheckpointStore};

#[derive(Debug, thiserror::Error)]
pub enum ManagerError {
    #[error("no execution with id {0}")]
    NotFound(Uuid),

    #[error("status of execution {id} is unreadable: {message}")]
    Unreadable { id: Uuid, message: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone)]
pub struct ExecutionManager {
    store: FsCheckpointStore,
}

impl ExecutionManager {
    pub fn new(layout: DataLayout) -> Self {
        Self {
            store: FsCheckpointStore::new(layout),
        }
    }

    pub fn layout(&self) -> &DataLayout {
        self.store.layout()
    }

    /// Every readable execution, oldest first.
    pub async fn list(&self) -> Result<Vec<StatusRecord>, ManagerError> {
        let mut entries = match tokio::fs::read_dir(self.layout().pipeline_dir()).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err.into()),
        };

        let mut records = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_dir() {
                continue;
            }
            let Some(id) = parse_execution_id(&entry.path()) else {
                tracing::debug!(path = %entry.path().display(), "skipping non-execution directory");
                continue;
            };
            match self.store.read_status(id).await {
                Ok(Some(record)) => records.push(record),
                Ok(None) => tracing::warn!(execution_id = %id, "execution has no status file"),
                Err(e) => tracing::warn!(execution_id = %id, error = %e, "skipping unreadable status file"),
            }
        }

        records.sort_by_key(|record| record.start);
        Ok(records)
    }

    pub async fn get(&self, id: Uuid) -> Result<StatusRecord, ManagerError> {
        match self.store.read_status(id).await {
            Ok(Some(record)) => Ok(record),
            Ok(None) => Err(ManagerError::NotFound(id)),
            Err(e) => Err(ManagerError::Unreadable {
                id,
                message: e.to_string(),
            }),
        }
    }

    /// Executions whose status is not `finished`.
    pub async fn active(&self) -> Result<Vec<StatusRecord>, ManagerError> {
        let mut records = self.list().await?;
        records.retain(|record| !record.finished);
        Ok(records)
    }

    /// Executions started within the 24 hours before `now`.
    pub async fn today(&self, now: DateTime<Utc>) -> Result<Vec<StatusRecord>, ManagerError> {
        let mut records = self.list().await?;
        records.retain(|record| record.age(now) <= TimeDelta::hours(24));
        Ok(records)
    }

    /// Delete checkpoints, recorded responses and logs of every execution at
    /// least `hours` old. Returns the removed ids.
    pub async fn clear_older_than(&self, hours: u32, now: DateTime<Utc>) -> Result<Vec<Uuid>, ManagerError> {
        let cutoff = TimeDelta::hours(i64::from(hours));
        let mut removed = Vec::new();

        for record in self.list().await? {
            if record.age(now) < cutoff {
                continue;
            }
            let layout = self.layout();
            for dir in [
                layout.execution_log_dir(record.id),
                layout.requests_dir(record.id),
                layout.execution_dir(record.id),
            ] {
                remove_dir_if_present(&dir).await?;
            }
            tracing::info!(execution_id = %record.id, "removed execution");
            removed.push(record.id);
        }

        Ok(removed)
    }
}

fn parse_execution_id(path: &Path) -> Option<Uuid> {
    path.file_name()?.to_str()?.parse().ok()
}

async fn remove_dir_if_present(dir: &Path) -> Result<(), ManagerError> {
    match tokio::fs::remove_dir_all(dir).await {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pipeworks_types::pipeline::RunStatus;
    use tempfile::tempdir;

    async fn seed(manager: &ExecutionManager, start: DateTime<Utc>, finished: bool) -> Uuid {
        let id = Uuid::now_v7();
        let record = StatusRecord {
            id,
            name: format!("run {id}"),
            start,
            duration: "0:00:01.000000".to_string(),
            finished,
            last_step: Some("seed [1]".to_string()),
            status: if finished { RunStatus::Finished } else { RunStatus::Running },
        };
        manager.store.write_status(&record).await.unwrap();
        id
    }

    #[tokio::test]
    async fn list_is_sorted_and_skips_garbage() {
        let dir = tempdir().unwrap();
        let manager = ExecutionManager::new(DataLayout::new(dir.path()));
        let now = Utc::now();

        let newer = seed(&manager, now - TimeDelta::hours(1), true).await;
        let older = seed(&manager, now - TimeDelta::hours(5), true).await;

        let broken = Uuid::now_v7();
        let broken_dir = manager.layout().execution_dir(broken);
        std::fs::create_dir_all(&broken_dir).unwrap();
        std::fs::write(broken_dir.join("status.json"), "garbage").unwrap();
        std::fs::create_dir_all(manager.layout().pipeline_dir().join("not-a-uuid")).unwrap();

        let ids: Vec<Uuid> = manager.list().await.unwrap().iter().map(|r| r.id).collect();
        assert_eq!(ids, vec![older, newer]);
        assert!(matches!(
            manager.get(broken).await,
            Err(ManagerError::Unreadable { .. })
        ));
    }

    #[tokio::test]
    async fn empty_data_dir_lists_nothing() {
        let dir = tempdir().unwrap();
        let manager = ExecutionManager::new(DataLayout::new(dir.path().join("missing")));
        assert!(manager.list().await.unwrap().is_empty());
        assert!(matches!(
            manager.get(Uuid::nil()).await,
            Err(ManagerError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn active_and_today_filters() {
        let dir = tempdir().unwrap();
        let manager = ExecutionManager::new(DataLayout::new(dir.path()));
        let now = Utc::now();

        let running = seed(&manager, now - TimeDelta::hours(2), false).await;
        let _done = seed(&manager, now - TimeDelta::hours(3), true).await;
        let stale = seed(&manager, now - TimeDelta::hours(48), false).await;

        let active: Vec<Uuid> = manager.active().await.unwrap().iter().map(|r| r.id).collect();
        assert_eq!(active, vec![stale, running]);

        let today = manager.today(now).await.unwrap();
        assert_eq!(today.len(), 2);
        assert!(today.iter().all(|r| r.id != stale));
    }

    #[tokio::test]
    async fn clear_removes_every_trace_of_old_runs() {
        let dir = tempdir().unwrap();
        let manager = ExecutionManager::new(DataLayout::new(dir.path()));
        let now = Utc::now();

        let old = seed(&manager, now - TimeDelta::hours(30), true).await;
        let recent = seed(&manager, now - TimeDelta::hours(1), true).await;
        let layout = manager.layout().clone();
        for id in [old, recent] {
            std::fs::create_dir_all(layout.requests_dir(id)).unwrap();
            std::fs::write(layout.requests_dir(id).join("r.req"), "{}").unwrap();
            std::fs::create_dir_all(layout.execution_log_dir(id)).unwrap();
        }

        let removed = manager.clear_older_than(24, now).await.unwrap();
        assert_eq!(removed, vec![old]);
        assert!(!layout.execution_dir(old).exists());
        assert!(!layout.requests_dir(old).exists());
        assert!(!layout.execution_log_dir(old).exists());
        assert!(layout.execution_dir(recent).exists());
        assert!(layout.requests_dir(recent).exists());
    }
}
