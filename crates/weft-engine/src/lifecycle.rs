//! Single-node lifecycle: prepare → retried execute → finalize.

use std::sync::Arc;

use serde_json::Value;
use tracing::debug;

use weft_core::error::{ErrorKind, NodeError, Result, WeftError};
use weft_core::event::EventBus;
use weft_core::traits::Node;
use weft_core::types::SharedState;

use crate::retry::execute_node;

/// Outcome of one node lifecycle run.
#[derive(Debug, Clone, PartialEq)]
pub struct NodeRun {
    /// Action selected by finalize (`None` terminates the flow).
    pub action: Option<String>,
    pub state: SharedState,
    pub attempts: u32,
    pub used_fallback: bool,
}

/// Run the full lifecycle of `node` over `state`.
///
/// A prepare failure stops the run before execute is invoked.
pub async fn run_node(node: &Arc<dyn Node>, state: SharedState, events: &EventBus) -> Result<NodeRun> {
    let prep = node
        .prepare(&state)
        .await
        .map_err(|source| WeftError::Prepare {
            node: node.name().to_string(),
            source,
        })?;

    run_with_prep(node, state, prep, events).await
}

/// Run execute and finalize with an already prepared value.
///
/// Batch orchestrators use this with each item as the prepared value.
pub async fn run_with_prep(
    node: &Arc<dyn Node>,
    state: SharedState,
    prep: Value,
    events: &EventBus,
) -> Result<NodeRun> {
    let name = node.name();
    let executed = execute_node(node, &prep, events)
        .await
        .map_err(|failure| WeftError::Execution {
            node: name.to_string(),
            failure,
        })?;

    let transition = node
        .finalize(state, prep, executed.result)
        .await
        .map_err(|source| WeftError::Finalize {
            node: name.to_string(),
            source,
        })?;

    let state = SharedState::try_from(transition.state).map_err(|value| WeftError::Finalize {
        node: name.to_string(),
        source: NodeError::with_kind(
            ErrorKind::PatternMismatch,
            format!("finalize must return a state map, got {}", json_type(&value)),
        ),
    })?;

    debug!(
        node = %name,
        action = ?transition.action,
        attempts = executed.attempts,
        "Node lifecycle complete"
    );

    Ok(NodeRun {
        action: transition.action,
        state,
        attempts: executed.attempts,
        used_fallback: executed.used_fallback,
    })
}

fn json_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::future::BoxFuture;
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};
    use weft_core::error::NodeResult;
    use weft_core::types::{Phase, Transition};
    use weft_test_utils::{state, BrokenNode, BrokenStage, ScriptedNode, SetNode};

    struct PrepareFails {
        executed: AtomicU32,
    }

    impl Node for PrepareFails {
        fn name(&self) -> &str {
            "guarded"
        }

        fn prepare<'a>(&'a self, _state: &'a SharedState) -> BoxFuture<'a, NodeResult<Value>> {
            Box::pin(async { Err(NodeError::key_not_found("user")) })
        }

        fn execute(&self, _prep: Value) -> BoxFuture<'_, NodeResult<Value>> {
            self.executed.fetch_add(1, Ordering::SeqCst);
            Box::pin(async { Ok(Value::Null) })
        }

        fn finalize(
            &self,
            state: SharedState,
            _prep: Value,
            _result: Value,
        ) -> BoxFuture<'_, NodeResult<Transition>> {
            Box::pin(async move { Ok(Transition::end(state)) })
        }
    }

    #[tokio::test]
    async fn test_happy_path() {
        let node: Arc<dyn Node> = Arc::new(
            ScriptedNode::new("greet")
                .with_output(json!("hi"))
                .with_action(Some("next")),
        );

        let run = run_node(&node, state(json!({"a": 1})), &EventBus::default())
            .await
            .unwrap();
        assert_eq!(run.action.as_deref(), Some("next"));
        assert_eq!(run.state, state(json!({"a": 1, "greet": "hi"})));
        assert_eq!(run.attempts, 1);
    }

    #[tokio::test]
    async fn test_default_finalize_keeps_state() {
        struct Plain;
        impl Node for Plain {
            fn name(&self) -> &str {
                "plain"
            }
            fn execute(&self, _prep: Value) -> BoxFuture<'_, NodeResult<Value>> {
                Box::pin(async { Ok(json!(1)) })
            }
        }

        let node: Arc<dyn Node> = Arc::new(Plain);
        let run = run_node(&node, state(json!({"k": "v"})), &EventBus::default())
            .await
            .unwrap();
        assert_eq!(run.action.as_deref(), Some("default"));
        assert_eq!(run.state, state(json!({"k": "v"})));
    }

    #[tokio::test]
    async fn test_prepare_failure_skips_execute() {
        let inner = Arc::new(PrepareFails {
            executed: AtomicU32::new(0),
        });
        let node: Arc<dyn Node> = inner.clone();

        let err = run_node(&node, SharedState::new(), &EventBus::default())
            .await
            .unwrap_err();
        assert!(matches!(err, WeftError::Prepare { ref node, .. } if node == "guarded"));
        assert_eq!(err.phase(), Phase::Prepare);
        assert_eq!(inner.executed.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_finalize_failure() {
        let node: Arc<dyn Node> = Arc::new(BrokenNode::new("f", BrokenStage::Finalize));

        let err = run_node(&node, SharedState::new(), &EventBus::default())
            .await
            .unwrap_err();
        assert!(matches!(err, WeftError::Finalize { .. }));
        assert!(err.to_string().contains("finalize rejected result"));
    }

    #[tokio::test]
    async fn test_scalar_state_is_finalize_error() {
        let node: Arc<dyn Node> = Arc::new(BrokenNode::new("s", BrokenStage::ScalarState));

        let err = run_node(&node, SharedState::new(), &EventBus::default())
            .await
            .unwrap_err();
        let source = err.node_error().unwrap();
        assert_eq!(source.kind, Some(ErrorKind::PatternMismatch));
        assert!(source.message.contains("got a number"));
    }

    #[tokio::test]
    async fn test_execution_error_tagged() {
        let node: Arc<dyn Node> = Arc::new(
            ScriptedNode::new("x").always_failing(NodeError::new("nope")),
        );

        let err = run_node(&node, SharedState::new(), &EventBus::default())
            .await
            .unwrap_err();
        assert_eq!(err.node(), Some("x"));
        assert_eq!(err.phase(), Phase::Execute);
    }

    #[tokio::test]
    async fn test_run_with_prep_uses_given_value() {
        let node: Arc<dyn Node> = Arc::new(SetNode::new("item", None).set("seen", json!(true)));

        let run = run_with_prep(&node, SharedState::new(), json!(7), &EventBus::default())
            .await
            .unwrap();
        assert!(run.action.is_none());
        assert_eq!(run.state.get("seen"), Some(&json!(true)));
    }
}
