use std::sync::Arc;
use std::time::Instant;

use serde_json::{json, Value};
use tracing::{debug, error, info, warn};

use weft_core::config::EngineConfig;
use weft_core::error::{Result, WeftError};
use weft_core::event::EventBus;
use weft_core::traits::{Node, StateStore};
use weft_core::types::{ExecutionId, FlowEvent, NodeId, SharedState, DEFAULT_ACTION};

use crate::flow::Flow;
use crate::lifecycle;
use crate::monitor::{MonitoringRecorder, StepStatus};
use crate::recovery::{Recovered, Recovery};
use crate::resolver::resolve;

/// Result of one engine invocation.
#[derive(Debug, Clone, PartialEq)]
pub struct FlowRun {
    pub execution_id: ExecutionId,
    pub state: SharedState,
    /// Nodes in the order they ran.
    pub path: Vec<NodeId>,
}

/// Traversal state of one invocation.
#[derive(Debug)]
pub enum FlowState {
    Running { node: NodeId, state: SharedState },
    Terminated(SharedState),
    Failed(WeftError),
}

/// Drives a flow: prepare → retried execute → finalize → resolve, node by
/// node, until the flow terminates or a node fails.
///
/// Cheap to clone; every collaborator is shared.
#[derive(Clone)]
pub struct FlowEngine {
    store: Arc<dyn StateStore>,
    events: Arc<EventBus>,
    monitor: Option<Arc<MonitoringRecorder>>,
    recovery: Option<Arc<Recovery>>,
    max_steps: usize,
}

impl FlowEngine {
    pub fn new(store: Arc<dyn StateStore>) -> Self {
        Self {
            store,
            events: Arc::new(EventBus::default()),
            monitor: Some(Arc::new(MonitoringRecorder::new())),
            recovery: None,
            max_steps: 0,
        }
    }

    /// Build an engine from config: store backend, event capacity,
    /// monitoring, step limit, and recovery rules (if any).
    pub fn from_config(config: &EngineConfig) -> Result<Self> {
        let store = weft_store::create_store(&config.store)?;
        let mut engine = Self::new(store)
            .with_event_bus(Arc::new(EventBus::new(config.events.capacity)))
            .with_max_steps(config.engine.max_steps);

        engine = engine.with_monitor(
            config
                .monitoring
                .enabled
                .then(|| Arc::new(MonitoringRecorder::with_max_records(config.monitoring.max_records))),
        );
        if !config.recovery.rules.is_empty() {
            engine = engine.with_recovery(Recovery::from_config(&config.recovery));
        }
        Ok(engine)
    }

    pub fn with_event_bus(mut self, events: Arc<EventBus>) -> Self {
        self.events = events;
        self
    }

    pub fn with_monitor(mut self, monitor: Option<Arc<MonitoringRecorder>>) -> Self {
        self.monitor = monitor;
        self
    }

    pub fn with_recovery(mut self, recovery: Recovery) -> Self {
        self.recovery = Some(Arc::new(recovery));
        self
    }

    /// Node runs allowed per invocation (0 = unlimited).
    pub fn with_max_steps(mut self, max_steps: usize) -> Self {
        self.max_steps = max_steps;
        self
    }

    pub fn store(&self) -> &Arc<dyn StateStore> {
        &self.store
    }

    pub fn events(&self) -> &Arc<EventBus> {
        &self.events
    }

    pub fn monitor(&self) -> Option<&Arc<MonitoringRecorder>> {
        self.monitor.as_ref()
    }

    /// Run `flow` from its start node.
    pub async fn run(&self, flow: &Flow, input: SharedState) -> Result<FlowRun> {
        self.run_from(flow, flow.start(), input).await
    }

    /// Run `flow` from `node`.
    ///
    /// The invocation gets its own execution id; its store entry is removed
    /// when the run ends, whatever the outcome.
    pub async fn run_from(&self, flow: &Flow, node: &str, input: SharedState) -> Result<FlowRun> {
        let execution_id = ExecutionId::new();
        info!(execution_id = %execution_id, flow = %flow.name(), start = %node, "Flow started");
        self.events.publish(FlowEvent::FlowStarted {
            execution_id: execution_id.clone(),
            start: node.to_string(),
        });
        if let Some(monitor) = &self.monitor {
            monitor.start(&execution_id, flow.name());
        }

        let mut path = Vec::new();
        let outcome = self.drive(flow, &execution_id, node, input, &mut path).await;

        if let Err(e) = self.store.delete(&execution_id).await {
            warn!(execution_id = %execution_id, error = %e, "Failed to clean up execution state");
        }

        match outcome {
            Ok(state) => {
                info!(execution_id = %execution_id, steps = path.len(), "Flow completed");
                self.events.publish(FlowEvent::FlowCompleted {
                    execution_id: execution_id.clone(),
                    steps: path.len(),
                });
                if let Some(monitor) = &self.monitor {
                    monitor.complete(&execution_id, Some(state.clone().into_value()));
                }
                Ok(FlowRun {
                    execution_id,
                    state,
                    path,
                })
            }
            Err(e) => {
                error!(execution_id = %execution_id, error = %e, "Flow failed");
                self.events.publish(FlowEvent::FlowFailed {
                    execution_id: execution_id.clone(),
                    error: e.to_string(),
                });
                if let Some(monitor) = &self.monitor {
                    // Node failures were already recorded where they happened.
                    if !is_node_failure(&e) {
                        monitor.record_error(&execution_id, e.node(), e.phase(), &e.to_string());
                    }
                    monitor.complete(&execution_id, None);
                }
                Err(e)
            }
        }
    }

    async fn drive(
        &self,
        flow: &Flow,
        id: &ExecutionId,
        start: &str,
        input: SharedState,
        path: &mut Vec<NodeId>,
    ) -> Result<SharedState> {
        self.store.replace(id, input.clone()).await?;

        let mut current = FlowState::Running {
            node: start.to_string(),
            state: input,
        };
        loop {
            current = match current {
                FlowState::Running { node, state } => self
                    .advance(flow, id, node, state, path)
                    .await
                    .unwrap_or_else(FlowState::Failed),
                FlowState::Terminated(state) => return Ok(state),
                FlowState::Failed(e) => return Err(e),
            };
        }
    }

    /// One transition of the state machine.
    async fn advance(
        &self,
        flow: &Flow,
        id: &ExecutionId,
        node_id: NodeId,
        state: SharedState,
        path: &mut Vec<NodeId>,
    ) -> Result<FlowState> {
        if self.max_steps > 0 && path.len() >= self.max_steps {
            return Err(WeftError::MaxStepsExceeded(self.max_steps));
        }
        let node = flow
            .node(&node_id)
            .ok_or_else(|| WeftError::NodeNotFound(node_id.clone()))?;
        path.push(node_id.clone());

        let (action, state) = self.run_step(flow, id, node, state).await?;
        self.store.replace(id, state.clone()).await?;

        let next = resolve(flow.edges_from(&node_id), action.as_deref()).into_next(&node_id, &self.events);
        Ok(match next {
            Some(next) => {
                debug!(execution_id = %id, from = %node_id, to = %next, "Transition");
                FlowState::Running { node: next, state }
            }
            None => {
                debug!(execution_id = %id, node = %node_id, "No successor, flow terminates");
                FlowState::Terminated(state)
            }
        })
    }

    /// Run one node, applying recovery if it fails.
    async fn run_step(
        &self,
        flow: &Flow,
        id: &ExecutionId,
        node: &Arc<dyn Node>,
        state: SharedState,
    ) -> Result<(Option<String>, SharedState)> {
        let name = node.name().to_string();
        node.set_params(flow.params());
        self.events.publish(FlowEvent::NodeStarted {
            execution_id: id.clone(),
            node: name.clone(),
        });
        self.record_step(id, &name, StepStatus::Started, Value::Null);

        let started = Instant::now();
        let error = match lifecycle::run_node(node, state.clone(), &self.events).await {
            Ok(run) => {
                let elapsed_ms = started.elapsed().as_millis() as u64;
                self.events.publish(FlowEvent::NodeCompleted {
                    execution_id: id.clone(),
                    node: name.clone(),
                    action: run.action.clone(),
                });
                self.record_step(
                    id,
                    &name,
                    StepStatus::Completed,
                    json!({
                        "action": run.action,
                        "attempts": run.attempts,
                        "fallback": run.used_fallback,
                        "elapsed_ms": elapsed_ms,
                    }),
                );
                return Ok((run.action, run.state));
            }
            Err(e) => e,
        };

        warn!(execution_id = %id, node = %name, phase = %error.phase(), error = %error, "Node failed");
        self.events.publish(FlowEvent::NodeFailed {
            execution_id: id.clone(),
            node: name.clone(),
            phase: error.phase(),
            error: error.to_string(),
        });
        if let Some(monitor) = &self.monitor {
            monitor.record_error(id, Some(&name), error.phase(), &error.to_string());
            monitor.update(id, &name, StepStatus::Failed, Value::Null);
        }

        let Some(recovery) = &self.recovery else {
            return Err(error);
        };

        let events = self.events.as_ref();
        let input = &state;
        let recovered = recovery
            .attempt_recovery(&error, &state, move || lifecycle::run_node(node, input.clone(), events))
            .await?;

        info!(execution_id = %id, node = %name, strategy = recovered.label(), "Node recovered");
        self.events.publish(FlowEvent::Recovered {
            execution_id: id.clone(),
            node: name.clone(),
            strategy: recovered.label().to_string(),
        });
        self.record_step(id, &name, StepStatus::Recovered, json!({ "strategy": recovered.label() }));

        Ok(match recovered {
            Recovered::Retried(run) => (run.action, run.state),
            Recovered::Fallback(state) | Recovered::Skipped(state) => (Some(DEFAULT_ACTION.to_string()), state),
        })
    }

    fn record_step(&self, id: &ExecutionId, node: &str, status: StepStatus, metadata: Value) {
        if let Some(monitor) = &self.monitor {
            monitor.update(id, node, status, metadata);
        }
    }
}

fn is_node_failure(error: &WeftError) -> bool {
    matches!(
        error,
        WeftError::Prepare { .. } | WeftError::Execution { .. } | WeftError::Finalize { .. }
    )
}
