//! Parallel batch orchestration.
//!
//! One task per item. Tasks reconcile through the state store: each merges
//! the keys its item added or changed, and records the successor it selected
//! under [`CONTINUATION_KEY`]. Once every task is done (or the timeout
//! passes) the batch closes, later merges are dropped, and the merged state
//! continues through the flow from that successor.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use futures::stream::{FuturesUnordered, StreamExt};
use futures::FutureExt;
use serde_json::{json, Value};
use tokio::sync::{RwLock, Semaphore};
use tracing::{debug, info, warn};

use weft_core::config::BatchConfig;
use weft_core::error::{Result, WeftError};
use weft_core::event::EventBus;
use weft_core::traits::{Node, StateStore};
use weft_core::types::{ExecutionId, FlowEvent, NodeId, Params, SharedState};

use crate::batch::{finish, load_items, start_node, BatchRun};
use crate::engine::FlowEngine;
use crate::flow::{Edges, Flow};
use crate::lifecycle;
use crate::monitor::StepStatus;
use crate::resolver::resolve;

/// Reserved store key holding the successor selected by item tasks.
pub const CONTINUATION_KEY: &str = "__weft_next_node";

pub struct ParallelBatch {
    engine: FlowEngine,
    item_key: String,
    timeout: Duration,
    max_concurrency: usize,
}

impl ParallelBatch {
    pub fn new(engine: FlowEngine) -> Self {
        Self::from_config(engine, &BatchConfig::default())
    }

    pub fn from_config(engine: FlowEngine, config: &BatchConfig) -> Self {
        Self {
            engine,
            item_key: config.item_key.clone(),
            timeout: config.parallel_timeout(),
            max_concurrency: config.max_concurrency,
        }
    }

    pub fn with_item_key(mut self, key: &str) -> Self {
        self.item_key = key.to_string();
        self
    }

    /// How long to wait for item tasks before reading the merged state.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Item tasks allowed to run at once (0 = unbounded).
    pub fn with_max_concurrency(mut self, n: usize) -> Self {
        self.max_concurrency = n;
        self
    }

    /// Run every item concurrently and continue the flow with the merged
    /// state.
    ///
    /// Item failures do not stop the other items; the first failure is
    /// returned once waiting ends. The timeout only stops the waiting: tasks
    /// still running keep running detached, but their results are discarded.
    pub async fn run(&self, flow: &Flow, base: SharedState) -> Result<BatchRun> {
        let execution_id = ExecutionId::new();
        let node = Arc::clone(start_node(flow)?);
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
        node: Arc<dyn Node>,
        base: SharedState,
    ) -> Result<(SharedState, usize)> {
        let Some(items) = load_items(flow, &node, &base).await? else {
            info!(execution_id = %id, node = %node.name(), "Batch has no items, skipping");
            return Ok((base, 0));
        };
        let count = items.len();
        info!(
            execution_id = %id,
            node = %node.name(),
            items = count,
            max_concurrency = self.max_concurrency,
            "Parallel batch started"
        );

        let store = Arc::clone(self.engine.store());
        store.replace(id, base).await?;

        let edges = Arc::new(flow.edges_from(flow.start()).cloned().unwrap_or_default());
        let params = Arc::new(flow.params().clone());
        let limiter = (self.max_concurrency > 0).then(|| Arc::new(Semaphore::new(self.max_concurrency)));
        let closed = Arc::new(RwLock::new(false));

        let mut pending: FuturesUnordered<_> = items
            .into_iter()
            .enumerate()
            .map(|(index, item)| {
                let task = ItemTask {
                    index,
                    item,
                    execution_id: id.clone(),
                    item_key: self.item_key.clone(),
                    node: Arc::clone(&node),
                    store: Arc::clone(&store),
                    events: Arc::clone(self.engine.events()),
                    edges: Arc::clone(&edges),
                    params: Arc::clone(&params),
                    limiter: limiter.clone(),
                    closed: Arc::clone(&closed),
                };
                tokio::spawn(task.run()).map(move |joined| (index, joined))
            })
            .collect();

        let deadline = tokio::time::Instant::now() + self.timeout;
        let mut first_failure: Option<WeftError> = None;
        let mut successors = BTreeSet::new();

        loop {
            match tokio::time::timeout_at(deadline, pending.next()).await {
                Ok(Some((index, joined))) => {
                    let outcome = match joined {
                        Ok(outcome) => outcome,
                        Err(e) => Err(WeftError::Join(e.to_string())),
                    };
                    let succeeded = outcome.is_ok();
                    self.engine.events().publish(FlowEvent::BatchItemCompleted {
                        execution_id: id.clone(),
                        index,
                        succeeded,
                    });
                    match outcome {
                        Ok(next) => {
                            debug!(execution_id = %id, index, "Batch item complete");
                            if let Some(monitor) = self.engine.monitor() {
                                monitor.update(id, node.name(), StepStatus::Completed, json!({ "index": index }));
                            }
                            successors.extend(next);
                        }
                        Err(e) => {
                            warn!(execution_id = %id, index, error = %e, "Batch item failed");
                            if let Some(monitor) = self.engine.monitor() {
                                monitor.record_error(id, Some(node.name()), e.phase(), &e.to_string());
                            }
                            first_failure.get_or_insert(e);
                        }
                    }
                }
                Ok(None) => break,
                Err(_) => {
                    warn!(
                        execution_id = %id,
                        remaining = pending.len(),
                        timeout_ms = self.timeout.as_millis() as u64,
                        "Parallel batch timed out, leaving remaining items running"
                    );
                    break;
                }
            }
        }
        // Dropping the join handles detaches the tasks; it does not abort them.
        drop(pending);
        *closed.write().await = true;

        let mut merged = store.get(id).await?;
        let next = merged
            .remove(CONTINUATION_KEY)
            .and_then(|v| v.as_str().map(String::from));

        if let Some(e) = first_failure {
            return Err(e);
        }
        if successors.len() > 1 {
            warn!(
                execution_id = %id,
                candidates = ?successors,
                chosen = ?next,
                "Batch items selected different successors, last write wins"
            );
        }

        let state = match next {
            Some(next) => self.engine.run_from(flow, &next, merged).await?.state,
            None => merged,
        };
        Ok((state, count))
    }
}

/// Everything one item task owns.
struct ItemTask {
    index: usize,
    item: Value,
    execution_id: ExecutionId,
    item_key: String,
    node: Arc<dyn Node>,
    store: Arc<dyn StateStore>,
    events: Arc<EventBus>,
    edges: Arc<Edges>,
    params: Arc<Params>,
    limiter: Option<Arc<Semaphore>>,
    /// Set once the orchestrator stops waiting; no merges after that.
    closed: Arc<RwLock<bool>>,
}

impl ItemTask {
    async fn run(self) -> Result<Option<NodeId>> {
        let _permit = match &self.limiter {
            Some(limiter) => Some(
                Arc::clone(limiter)
                    .acquire_owned()
                    .await
                    .map_err(|e| WeftError::Join(e.to_string()))?,
            ),
            None => None,
        };
        self.events.publish(FlowEvent::BatchItemStarted {
            execution_id: self.execution_id.clone(),
            index: self.index,
        });

        let mut current = self.store.get(&self.execution_id).await?;
        current.remove(CONTINUATION_KEY);
        let item_state = current.with(self.item_key.clone(), self.item.clone());

        self.node.set_params(&self.params);
        let run = lifecycle::run_with_prep(&self.node, item_state.clone(), self.item, &self.events).await?;
        let next = resolve(Some(self.edges.as_ref()), run.action.as_deref()).into_next(self.node.name(), &self.events);

        let mut changes = run.state.changes_since(&item_state);
        changes.remove(&self.item_key);
        if let Some(next) = &next {
            changes.set(CONTINUATION_KEY, Value::String(next.clone()));
        }
        let closed = self.closed.read().await;
        if *closed {
            debug!(execution_id = %self.execution_id, index = self.index, "Batch closed, dropping late item result");
            return Ok(next);
        }
        self.store.merge(&self.execution_id, changes).await?;
        drop(closed);

        Ok(next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::Ordering;
    use std::time::Instant;
    use weft_store::MemoryStateStore;
    use weft_test_utils::{state, ItemNode, SetNode};

    fn batch() -> (ParallelBatch, Arc<MemoryStateStore>) {
        let store = Arc::new(MemoryStateStore::new());
        (ParallelBatch::new(FlowEngine::new(store.clone())), store)
    }

    fn flow_with(node: ItemNode) -> Flow {
        Flow::builder("par")
            .add_node(node)
            .set_start("each")
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn test_every_item_merged() {
        let (batch, store) = batch();
        let node = ItemNode::new("each", "rows");
        let visited = node.visited();
        let flow = flow_with(node);

        let run = batch
            .run(&flow, state(json!({"rows": [1, 2, 3], "keep": true})))
            .await
            .unwrap();
        let mut seen = visited.lock().unwrap().clone();
        seen.sort_by_key(|v| v.as_i64());
        assert_eq!(seen, vec![json!(1), json!(2), json!(3)]);

        assert_eq!(run.items, 3);
        assert_eq!(run.state.get("item_1"), Some(&json!(10)));
        assert_eq!(run.state.get("item_2"), Some(&json!(20)));
        assert_eq!(run.state.get("item_3"), Some(&json!(30)));
        assert_eq!(run.state.get("keep"), Some(&json!(true)));
        assert!(!run.state.contains_key("current_item"));
        assert!(!run.state.contains_key(CONTINUATION_KEY));
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_items_run_concurrently() {
        let (batch, _) = batch();
        let flow = flow_with(ItemNode::new("each", "rows").with_delay_per_item(Duration::from_millis(50)));

        let started = Instant::now();
        batch
            .run(&flow, state(json!({"rows": [2, 2, 2, 2]})))
            .await
            .unwrap();
        assert!(started.elapsed() < Duration::from_millis(350));
    }

    #[tokio::test]
    async fn test_continuation_runs_once_with_merged_state() {
        let (batch, _) = batch();
        let tail = SetNode::new("tail", None).set("tail_ran", json!(true));
        let tail_visits = tail.visits();
        let flow = Flow::builder("par")
            .add_node(ItemNode::new("each", "rows"))
            .add_node(tail)
            .connect("each", "tail")
            .set_start("each")
            .build()
            .unwrap();

        let run = batch
            .run(&flow, state(json!({"rows": [1, 2]})))
            .await
            .unwrap();
        assert_eq!(tail_visits.load(Ordering::SeqCst), 1);
        assert_eq!(run.state.get("item_1"), Some(&json!(10)));
        assert_eq!(run.state.get("item_2"), Some(&json!(20)));
        assert_eq!(run.state.get("tail_ran"), Some(&json!(true)));
    }

    #[tokio::test]
    async fn test_failure_returned_after_others_finish() {
        let (batch, store) = batch();
        let node = ItemNode::new("each", "rows").failing_on(json!(2));
        let visited = node.visited();
        let flow = flow_with(node);

        let err = batch
            .run(&flow, state(json!({"rows": [1, 2, 3]})))
            .await
            .unwrap_err();
        assert!(matches!(err, WeftError::Execution { .. }));
        assert_eq!(visited.lock().unwrap().len(), 2);
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_timeout_keeps_completed_items() {
        let (batch, store) = batch();
        let batch = batch.with_timeout(Duration::from_millis(100));
        let flow = flow_with(ItemNode::new("each", "rows").with_delay_per_item(Duration::from_millis(10)));

        let run = batch
            .run(&flow, state(json!({"rows": [1, 50]})))
            .await
            .unwrap();
        assert_eq!(run.state.get("item_1"), Some(&json!(10)));
        assert!(!run.state.contains_key("item_50"));

        // The slow item finishes after the batch closed and must not
        // recreate its entry.
        tokio::time::sleep(Duration::from_millis(600)).await;
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_panicking_item_reported() {
        let (batch, store) = batch();
        let engine = batch.engine.clone();
        let mut rx = engine.events().subscribe();
        let flow = flow_with(ItemNode::new("each", "rows").panicking_on(json!(2)));

        let err = batch
            .run(&flow, state(json!({"rows": [1, 2]})))
            .await
            .unwrap_err();
        assert!(matches!(err, WeftError::Join(_)));
        assert!(store.is_empty());

        let mut failed = Vec::new();
        while let Ok(event) = rx.try_recv() {
            if let FlowEvent::BatchItemCompleted { index, succeeded: false, .. } = event {
                failed.push(index);
            }
        }
        assert_eq!(failed, vec![1]);

        let monitor = engine.monitor().unwrap();
        let records: Vec<_> = monitor
            .active()
            .iter()
            .filter_map(|id| monitor.snapshot(id))
            .filter(|r| r.flow == "par")
            .collect();
        assert_eq!(records.len(), 1);
        assert!(records[0].errors.iter().any(|e| e.node.as_deref() == Some("each")));
    }

    #[tokio::test]
    async fn test_diverging_successors_continue_once() {
        let (batch, _) = batch();
        let left = SetNode::new("left", None).set("went", json!("left"));
        let right = SetNode::new("right", None).set("went", json!("right"));
        let (left_visits, right_visits) = (left.visits(), right.visits());
        let flow = Flow::builder("par")
            .add_node(ItemNode::new("each", "rows").routing_by_item())
            .add_node(left)
            .add_node(right)
            .connect_on("each", "a", "left")
            .connect_on("each", "b", "right")
            .set_start("each")
            .build()
            .unwrap();

        let run = batch
            .run(&flow, state(json!({"rows": ["a", "b"]})))
            .await
            .unwrap();
        let visits = left_visits.load(Ordering::SeqCst) + right_visits.load(Ordering::SeqCst);
        assert_eq!(visits, 1);
        assert_eq!(run.state.get("item_a"), Some(&json!("a")));
        assert_eq!(run.state.get("item_b"), Some(&json!("b")));
        assert!(run.state.get_str("went").is_some());
        assert!(!run.state.contains_key(CONTINUATION_KEY));
    }

    #[tokio::test]
    async fn test_max_concurrency_serializes_items() {
        let (batch, _) = batch();
        let batch = batch.with_max_concurrency(1);
        let flow = flow_with(ItemNode::new("each", "rows").with_delay_per_item(Duration::from_millis(30)));

        let started = Instant::now();
        let run = batch
            .run(&flow, state(json!({"rows": [1, 1, 1]})))
            .await
            .unwrap();
        assert!(started.elapsed() >= Duration::from_millis(90));
        assert_eq!(run.state.get("item_1"), Some(&json!(10)));
    }

    #[tokio::test]
    async fn test_empty_items_skip() {
        let (batch, _) = batch();
        let flow = flow_with(ItemNode::new("each", "rows"));

        let base = state(json!({"rows": null}));
        let run = batch.run(&flow, base.clone()).await.unwrap();
        assert_eq!(run.state, base);
        assert_eq!(run.items, 0);
    }
}
