use std::time::Duration;

use futures::future::BoxFuture;
use serde_json::Value;

use crate::error::{NodeError, NodeResult, Result};
use crate::types::*;

/// One processing unit of a flow.
///
/// The engine runs `prepare` → `execute` (retried) → `finalize` and follows
/// the action `finalize` returns. Everything except `name` and `execute`
/// has a default.
pub trait Node: Send + Sync + 'static {
    /// Node name (used as its id when registered in a flow).
    fn name(&self) -> &str;

    /// Read what `execute` needs from the state. Must not mutate anything.
    fn prepare<'a>(&'a self, state: &'a SharedState) -> BoxFuture<'a, NodeResult<Value>> {
        let _ = state;
        Box::pin(async { Ok(Value::Null) })
    }

    /// The unit of work; retried up to `max_attempts` times.
    fn execute(&self, prep: Value) -> BoxFuture<'_, NodeResult<Value>>;

    /// Produce the next action and a complete new state.
    fn finalize(
        &self,
        state: SharedState,
        prep: Value,
        result: Value,
    ) -> BoxFuture<'_, NodeResult<Transition>> {
        let _ = (prep, result);
        Box::pin(async move { Ok(Transition::default_action(state)) })
    }

    /// Degraded result once retries are exhausted. `None` means the node has
    /// no fallback and the last error propagates.
    fn fallback(
        &self,
        prep: Value,
        error: NodeError,
    ) -> Option<BoxFuture<'_, NodeResult<Value>>> {
        let _ = (prep, error);
        None
    }

    /// Total execute attempts (default: 1, no retry).
    fn max_attempts(&self) -> u32 {
        1
    }

    /// Delay between execute attempts (default: none).
    fn retry_delay(&self) -> Duration {
        Duration::ZERO
    }

    /// Called with the flow's parameters before every lifecycle run.
    fn set_params(&self, params: &Params) {
        let _ = params;
    }

    /// Whether `execute` runs inline or on its own task.
    fn dispatch(&self) -> Dispatch {
        Dispatch::Inline
    }
}

/// Keyed execution state shared between concurrent writers.
pub trait StateStore: Send + Sync + 'static {
    /// Backend name (e.g., "memory").
    fn name(&self) -> &str;

    /// Current state for `id`; empty if absent.
    fn get<'a>(&'a self, id: &'a ExecutionId) -> BoxFuture<'a, Result<SharedState>>;

    /// Overwrite the state for `id` (last writer wins).
    fn replace<'a>(&'a self, id: &'a ExecutionId, state: SharedState) -> BoxFuture<'a, Result<()>>;

    /// Shallow-merge `partial` into the state for `id` and return the result.
    /// Must be atomic per id: concurrent merges never lose keys.
    fn merge<'a>(
        &'a self,
        id: &'a ExecutionId,
        partial: SharedState,
    ) -> BoxFuture<'a, Result<SharedState>>;

    /// Drop the entry for `id`.
    fn delete<'a>(&'a self, id: &'a ExecutionId) -> BoxFuture<'a, Result<()>>;
}
