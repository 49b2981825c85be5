//! Checkpoint store contract.
//!
//! Every execution owns a set of `{in, out}` checkpoint records (one per
//! 1-based step ordinal) and a single status record. Checkpoints are written
//! once and never revised; status records are overwritten at every step
//! boundary. A later, unrelated execution can read another execution's
//! checkpoints to resume from them.
//!
//! The trait uses native async fn in traits (RPITIT). [`CheckpointStoreDyn`]
//! is its object-safe twin so the pipeline and the handler-facing
//! [`CheckpointReader`] can hold `Arc<dyn CheckpointStoreDyn>`.

pub mod memory;

use std::future::Future;
use std::sync::Arc;

use futures_util::future::BoxFuture;
use pipeworks_types::pipeline::{CheckpointRecord, StatusRecord};
use uuid::Uuid;

pub use memory::InMemoryCheckpointStore;

// ---------------------------------------------------------------------------
// CheckpointStore
// ---------------------------------------------------------------------------

/// Durable storage for checkpoint and status records.
///
/// Implementations live in pipeworks-infra (filesystem) and in
/// [`memory`] (tests, dry runs).
pub trait CheckpointStore: Send + Sync {
    /// Persist the checkpoint of step `ordinal`.
    ///
    /// Must fail with [`CheckpointError::AlreadyWritten`] if a record for the
    /// same `(execution_id, ordinal)` already exists.
    fn write_checkpoint(
        &self,
        execution_id: Uuid,
        ordinal: usize,
        record: &CheckpointRecord,
    ) -> impl Future<Output = Result<(), CheckpointError>> + Send;

    /// Read the checkpoint of step `ordinal`, `None` if it was never written.
    fn read_checkpoint(
        &self,
        execution_id: Uuid,
        ordinal: usize,
    ) -> impl Future<Output = Result<Option<CheckpointRecord>, CheckpointError>> + Send;

    /// Overwrite the status record of `record.id`.
    fn write_status(
        &self,
        record: &StatusRecord,
    ) -> impl Future<Output = Result<(), CheckpointError>> + Send;

    /// Read the status record of an execution, `None` if absent.
    fn read_status(
        &self,
        execution_id: Uuid,
    ) -> impl Future<Output = Result<Option<StatusRecord>, CheckpointError>> + Send;
}

/// Object-safe version of [`CheckpointStore`] with boxed futures.
///
/// A blanket implementation covers every `CheckpointStore`.
pub trait CheckpointStoreDyn: Send + Sync {
    fn write_checkpoint_boxed<'a>(
        &'a self,
        execution_id: Uuid,
        ordinal: usize,
        record: &'a CheckpointRecord,
    ) -> BoxFuture<'a, Result<(), CheckpointError>>;

    fn read_checkpoint_boxed(
        &self,
        execution_id: Uuid,
        ordinal: usize,
    ) -> BoxFuture<'_, Result<Option<CheckpointRecord>, CheckpointError>>;

    fn write_status_boxed<'a>(
        &'a self,
        record: &'a StatusRecord,
    ) -> BoxFuture<'a, Result<(), CheckpointError>>;

    fn read_status_boxed(
        &self,
        execution_id: Uuid,
    ) -> BoxFuture<'_, Result<Option<StatusRecord>, CheckpointError>>;
}

impl<T: CheckpointStore> CheckpointStoreDyn for T {
    fn write_checkpoint_boxed<'a>(
        &'a self,
        execution_id: Uuid,
        ordinal: usize,
        record: &'a CheckpointRecord,
    ) -> BoxFuture<'a, Result<(), CheckpointError>> {
        Box::pin(self.write_checkpoint(execution_id, ordinal, record))
    }

    fn read_checkpoint_boxed(
        &self,
        execution_id: Uuid,
        ordinal: usize,
    ) -> BoxFuture<'_, Result<Option<CheckpointRecord>, CheckpointError>> {
        Box::pin(self.read_checkpoint(execution_id, ordinal))
    }

    fn write_status_boxed<'a>(
        &'a self,
        record: &'a StatusRecord,
    ) -> BoxFuture<'a, Result<(), CheckpointError>> {
        Box::pin(self.write_status(record))
    }

    fn read_status_boxed(
        &self,
        execution_id: Uuid,
    ) -> BoxFuture<'_, Result<Option<StatusRecord>, CheckpointError>> {
        Box::pin(self.read_status(execution_id))
    }
}

// ---------------------------------------------------------------------------
// CheckpointReader
// ---------------------------------------------------------------------------

/// Read-only view of the current execution's checkpoints, handed to step handlers.
///
/// Lets a later step read another step's raw output rather than only the
/// immediately preceding one.
#[derive(Clone)]
pub struct CheckpointReader {
    store: Arc<dyn CheckpointStoreDyn>,
    execution_id: Uuid,
}

impl CheckpointReader {
    pub fn new(store: Arc<dyn CheckpointStoreDyn>, execution_id: Uuid) -> Self {
        Self {
            store,
            execution_id,
        }
    }

    pub fn execution_id(&self) -> Uuid {
        self.execution_id
    }

    /// The persisted `{in, out}` of step `ordinal` (1-based), if present.
    ///
    /// Read failures are logged and reported as absent.
    pub async fn get(&self, ordinal: usize) -> Option<CheckpointRecord> {
        match self
            .store
            .read_checkpoint_boxed(self.execution_id, ordinal)
            .await
        {
            Ok(record) => record,
            Err(e) => {
                tracing::warn!(
                    execution_id = %self.execution_id,
                    ordinal,
                    error = %e,
                    "failed to read checkpoint"
                );
                None
            }
        }
    }
}

impl std::fmt::Debug for CheckpointReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CheckpointReader")
            .field("execution_id", &self.execution_id)
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Errors that can occur during checkpoint operations.
#[derive(Debug, thiserror::Error)]
pub enum CheckpointError {
    /// Underlying storage operation failed.
    #[error("checkpoint storage error: {0}")]
    Storage(String),

    /// A record could not be encoded or decoded.
    #[error("checkpoint serialization error: {0}")]
    Serialization(String),

    /// Checkpoints are immutable once written.
    #[error("checkpoint {ordinal} of execution {execution_id} already written")]
    AlreadyWritten { execution_id: Uuid, ordinal: usize },
}

impl From<std::io::Error> for CheckpointError {
    fn from(err: std::io::Error) -> Self {
        CheckpointError::Storage(err.to_string())
    }
}

impl From<serde_json::Error> for CheckpointError {
    fn from(err: serde_json::Error) -> Self {
        CheckpointError::Serialization(err.to_string())
    }
}
