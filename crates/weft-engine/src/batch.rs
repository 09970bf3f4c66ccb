//! Sequential batch orchestration.
//!
//! The start node's prepare yields a list of items; each item runs the start
//! node's execute/finalize and then the rest of the flow, one after another,
//! each item starting from the state the previous one produced.

use std::sync::Arc;

use serde_json::{json, Value};
use tracing::{debug, info, warn};

use weft_core::config::BatchConfig;
use weft_core::error::{Result, WeftError};
use weft_core::traits::Node;
use weft_core::types::{ExecutionId, FlowEvent, SharedState};

use crate::engine::FlowEngine;
use crate::flow::Flow;
use crate::lifecycle;
use crate::monitor::StepStatus;
use crate::resolver::resolve;

/// Result of a batch invocation.
#[derive(Debug, Clone, PartialEq)]
pub struct BatchRun {
    pub execution_id: ExecutionId,
    pub state: SharedState,
    /// Items the batch processed (0 when it was skipped).
    pub items: usize,
}

pub struct SequentialBatch {
    engine: FlowEngine,
    item_key: String,
}

impl SequentialBatch {
    pub fn new(engine: FlowEngine) -> Self {
        Self::from_config(engine, &BatchConfig::default())
    }

    pub fn from_config(engine: FlowEngine, config: &BatchConfig) -> Self {
        Self {
            engine,
            item_key: config.item_key.clone(),
        }
    }

    /// State key each item is exposed under.
    pub fn with_item_key(mut self, key: &str) -> Self {
        self.item_key = key.to_string();
        self
    }

    pub async fn run(&self, flow: &Flow, base: SharedState) -> Result<BatchRun> {
        let execution_id = ExecutionId::new();
        let node = start_node(flow)?;
        if let Some(monitor) = self.engine.monitor() {
            monitor.start(&execution_id, flow.name());
        }

        let outcome = self.run_items(flow, &execution_id, node, base).await;

        if let Err(e) = self.engine.store().delete(&execution_id).await {
            warn!(execution_id = %execution_id, error = %e, "Failed to clean up batch state");
        }
        finish(&self.engine, execution_id, outcome)
    }

    async fn run_items(
        &self,
        flow: &Flow,
        id: &ExecutionId,
        node: &Arc<dyn Node>,
        base: SharedState,
    ) -> Result<(SharedState, usize)> {
        let Some(items) = load_items(flow, node, &base).await? else {
            info!(execution_id = %id, node = %node.name(), "Batch has no items, skipping");
            return Ok((base, 0));
        };
        info!(execution_id = %id, node = %node.name(), items = items.len(), "Sequential batch started");

        let store = self.engine.store();
        let events = self.engine.events();
        store.replace(id, base.clone()).await?;

        let count = items.len();
        let mut state = base;
        for (index, item) in items.into_iter().enumerate() {
            events.publish(FlowEvent::BatchItemStarted {
                execution_id: id.clone(),
                index,
            });
            let outcome = self.run_item(flow, node, state, item).await;
            events.publish(FlowEvent::BatchItemCompleted {
                execution_id: id.clone(),
                index,
                succeeded: outcome.is_ok(),
            });

            state = outcome?;
            debug!(execution_id = %id, index, "Batch item complete");
            if let Some(monitor) = self.engine.monitor() {
                monitor.update(id, node.name(), StepStatus::Completed, json!({ "index": index }));
            }
            store.replace(id, state.clone()).await?;
        }

        Ok((state, count))
    }

    async fn run_item(
        &self,
        flow: &Flow,
        node: &Arc<dyn Node>,
        state: SharedState,
        item: Value,
    ) -> Result<SharedState> {
        node.set_params(flow.params());
        let item_state = state.with(self.item_key.clone(), item.clone());
        let run = lifecycle::run_with_prep(node, item_state, item, self.engine.events()).await?;

        let next = resolve(flow.edges_from(flow.start()), run.action.as_deref())
            .into_next(flow.start(), self.engine.events());
        match next {
            Some(next) => Ok(self.engine.run_from(flow, &next, run.state).await?.state),
            None => Ok(run.state),
        }
    }
}

pub(crate) fn start_node(flow: &Flow) -> Result<&Arc<dyn Node>> {
    flow.node(flow.start())
        .ok_or_else(|| WeftError::NodeNotFound(flow.start().to_string()))
}

/// Items from the start node's prepare: `None` for null or an empty list.
pub(crate) async fn load_items(
    flow: &Flow,
    node: &Arc<dyn Node>,
    base: &SharedState,
) -> Result<Option<Vec<Value>>> {
    node.set_params(flow.params());
    let prepared = node
        .prepare(base)
        .await
        .map_err(|source| WeftError::Prepare {
            node: node.name().to_string(),
            source,
        })?;

    match prepared {
        Value::Null => Ok(None),
        Value::Array(items) if items.is_empty() => Ok(None),
        Value::Array(items) => Ok(Some(items)),
        other => Err(WeftError::Config(format!(
            "batch node '{}' must prepare a list of items, got {}",
            node.name(),
            other
        ))),
    }
}

/// Close out monitoring for a batch invocation and shape its result.
pub(crate) fn finish(
    engine: &FlowEngine,
    execution_id: ExecutionId,
    outcome: Result<(SharedState, usize)>,
) -> Result<BatchRun> {
    match outcome {
        Ok((state, items)) => {
            info!(execution_id = %execution_id, items, "Batch completed");
            if let Some(monitor) = engine.monitor() {
                monitor.complete(&execution_id, Some(state.clone().into_value()));
            }
            Ok(BatchRun {
                execution_id,
                state,
                items,
            })
        }
        Err(e) => {
            warn!(execution_id = %execution_id, error = %e, "Batch failed");
            if let Some(monitor) = engine.monitor() {
                monitor.record_error(&execution_id, e.node(), e.phase(), &e.to_string());
                monitor.complete(&execution_id, None);
            }
            Err(e)
        }
    }
}
