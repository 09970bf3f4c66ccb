use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use futures::future::BoxFuture;
use tracing::debug;

use weft_core::error::{Result, WeftError};
use weft_core::traits::StateStore;
use weft_core::types::{ExecutionId, SharedState};

/// In-process state store.
///
/// One mutex guards the whole map, so every operation (including the
/// read-modify-write in `merge`) is a single critical section.
#[derive(Default)]
pub struct MemoryStateStore {
    entries: Mutex<HashMap<ExecutionId, SharedState>>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        self.lock().map(|entries| entries.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> Result<MutexGuard<'_, HashMap<ExecutionId, SharedState>>> {
        self.entries
            .lock()
            .map_err(|e| WeftError::Store(format!("state store lock poisoned: {}", e)))
    }
}

impl StateStore for MemoryStateStore {
    fn name(&self) -> &str {
        "memory"
    }

    fn get<'a>(&'a self, id: &'a ExecutionId) -> BoxFuture<'a, Result<SharedState>> {
        Box::pin(async move {
            let entries = self.lock()?;
            Ok(entries.get(id).cloned().unwrap_or_default())
        })
    }

    fn replace<'a>(&'a self, id: &'a ExecutionId, state: SharedState) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let mut entries = self.lock()?;
            entries.insert(id.clone(), state);
            Ok(())
        })
    }

    fn merge<'a>(
        &'a self,
        id: &'a ExecutionId,
        partial: SharedState,
    ) -> BoxFuture<'a, Result<SharedState>> {
        Box::pin(async move {
            let mut entries = self.lock()?;
            let entry = entries.entry(id.clone()).or_default();
            entry.merge(&partial);
            debug!(execution_id = %id, keys = partial.len(), "Merged into state store");
            Ok(entry.clone())
        })
    }

    fn delete<'a>(&'a self, id: &'a ExecutionId) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let mut entries = self.lock()?;
            if entries.remove(id).is_some() {
                debug!(execution_id = %id, "Deleted state store entry");
            }
            Ok(())
        })
    }
}
