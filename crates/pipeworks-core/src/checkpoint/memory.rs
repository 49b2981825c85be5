//! In-memory checkpoint store.
//!
//! Keeps every record in `DashMap`s. Useful for tests and dry runs where
//! nothing should reach the disk. Status writes are kept as a history so
//! callers can inspect every boundary a run went through.

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use pipeworks_types::pipeline::{CheckpointRecord, StatusRecord};
use uuid::Uuid;

use super::{CheckpointError, CheckpointStore};

#[derive(Debug, Default)]
pub struct InMemoryCheckpointStore {
    checkpoints: DashMap<(Uuid, usize), CheckpointRecord>,
    statuses: DashMap<Uuid, Vec<StatusRecord>>,
}

impl InMemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of checkpoints recorded for an execution.
    pub fn checkpoint_count(&self, execution_id: Uuid) -> usize {
        self.checkpoints
            .iter()
            .filter(|entry| entry.key().0 == execution_id)
            .count()
    }

    /// Every status record written for an execution, oldest first.
    pub fn status_history(&self, execution_id: Uuid) -> Vec<StatusRecord> {
        self.statuses
            .get(&execution_id)
            .map(|history| history.clone())
            .unwrap_or_default()
    }
}

impl CheckpointStore for InMemoryCheckpointStore {
    async fn write_checkpoint(
        &self,
        execution_id: Uuid,
        ordinal: usize,
        record: &CheckpointRecord,
    ) -> Result<(), CheckpointError> {
        match self.checkpoints.entry((execution_id, ordinal)) {
            Entry::Occupied(_) => Err(CheckpointError::AlreadyWritten {
                execution_id,
                ordinal,
            }),
            Entry::Vacant(slot) => {
                slot.insert(record.clone());
                Ok(())
            }
        }
    }

    async fn read_checkpoint(
        &self,
        execution_id: Uuid,
        ordinal: usize,
    ) -> Result<Option<CheckpointRecord>, CheckpointError> {
        Ok(self
            .checkpoints
            .get(&(execution_id, ordinal))
            .map(|record| record.clone()))
    }

    async fn write_status(&self, record: &StatusRecord) -> Result<(), CheckpointError> {
        self.statuses
            .entry(record.id)
            .or_default()
            .push(record.clone());
        Ok(())
    }

    async fn read_status(&self, execution_id: Uuid) -> Result<Option<StatusRecord>, CheckpointError> {
        Ok(self
            .statuses
            .get(&execution_id)
            .and_then(|history| history.last().cloned()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use pipeworks_types::pipeline::RunStatus;
    use serde_json::json;

    fn status(id: Uuid, last_step: Option<&str>) -> StatusRecord {
        StatusRecord {
            id,
            name: "test".to_string(),
            start: Utc::now(),
            duration: "0:00:00.000000".to_string(),
            finished: false,
            last_step: last_step.map(str::to_string),
            status: RunStatus::Running,
        }
    }

    #[tokio::test]
    async fn checkpoints_are_written_once() {
        let store = InMemoryCheckpointStore::new();
        let id = Uuid::now_v7();
        let record = CheckpointRecord::new(json!(null), json!({"a": 1}));

        store.write_checkpoint(id, 1, &record).await.unwrap();
        let err = store.write_checkpoint(id, 1, &record).await.unwrap_err();
        assert!(matches!(err, CheckpointError::AlreadyWritten { ordinal: 1, .. }));
        assert_eq!(store.checkpoint_count(id), 1);
    }

    #[tokio::test]
    async fn missing_checkpoint_reads_as_none() {
        let store = InMemoryCheckpointStore::new();
        assert!(store.read_checkpoint(Uuid::now_v7(), 1).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn status_reads_return_latest_write() {
        let store = InMemoryCheckpointStore::new();
        let id = Uuid::now_v7();
        store.write_status(&status(id, None)).await.unwrap();
        store.write_status(&status(id, Some("seed [1]"))).await.unwrap();

        let latest = store.read_status(id).await.unwrap().unwrap();
        assert_eq!(latest.last_step.as_deref(), Some("seed [1]"));
        assert_eq!(store.status_history(id).len(), 2);
    }
}
