//! Run-scoped mutable state: the shared blackboard and fan-out progress.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use dashmap::DashMap;
use pipeworks_types::pipeline::LoopProgress;
use serde_json::{Map, Value};

// ---------------------------------------------------------------------------
// SharedState
// ---------------------------------------------------------------------------

/// Key/value blackboard shared by every handler invocation of a run.
///
/// The engine never writes to it. Concurrent writers to the same key during
/// a concurrent fan-out get last-write-wins.
#[derive(Debug, Clone, Default)]
pub struct SharedState {
    entries: Arc<DashMap<String, Value>>,
}

impl SharedState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        self.entries.get(key).map(|entry| entry.value().clone())
    }

    /// Store `value` under `key`, returning the previous value.
    pub fn insert(&self, key: impl Into<String>, value: Value) -> Option<Value> {
        self.entries.insert(key.into(), value)
    }

    pub fn remove(&self, key: &str) -> Option<Value> {
        self.entries.remove(key).map(|(_, value)| value)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Copy of the current contents as a JSON object.
    pub fn to_json(&self) -> Value {
        let map: Map<String, Value> = self
            .entries
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect();
        Value::Object(map)
    }
}

// ---------------------------------------------------------------------------
// LoopTracker
// ---------------------------------------------------------------------------

/// Progress of the fan-out step currently executing, if any.
///
/// Written by the executor, sampled by the progress monitor.
#[derive(Debug, Clone, Default)]
pub struct LoopTracker {
    inner: Arc<Mutex<Option<LoopProgress>>>,
}

impl LoopTracker {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Option<LoopProgress>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn begin(&self, step_name: &str, max: usize) {
        *self.lock() = Some(LoopProgress::new(step_name, max));
    }

    pub(crate) fn end(&self) {
        *self.lock() = None;
    }

    pub fn snapshot(&self) -> Option<LoopProgress> {
        self.lock().clone()
    }

    /// Mark one iteration as in flight until the guard is dropped.
    pub(crate) fn iteration(&self) -> IterationGuard {
        if let Some(progress) = self.lock().as_mut() {
            progress.active += 1;
        }
        IterationGuard {
            tracker: self.clone(),
        }
    }
}

/// Moves one iteration from `active` to `finished` on drop, whatever the
/// iteration's outcome.
#[derive(Debug)]
pub(crate) struct IterationGuard {
    tracker: LoopTracker,
}

impl Drop for IterationGuard {
    fn drop(&mut self) {
        if let Some(progress) = self.tracker.lock().as_mut() {
            progress.active = progress.active.saturating_sub(1);
            progress.finished += 1;
        }
    }
}
