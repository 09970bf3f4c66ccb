use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tracing::{info, warn};

use weft_core::error::{ExecFailure, NodeError, NodeResult};
use weft_core::event::EventBus;
use weft_core::traits::Node;
use weft_core::types::{Dispatch, FlowEvent};

/// A value (or the final error) together with the attempts it took.
#[derive(Debug, Clone, PartialEq)]
pub struct Attempted<T> {
    pub value: T,
    pub attempts: u32,
}

/// Run `op` until it succeeds or `max_attempts` attempts have been made.
///
/// `max_attempts = 0` is treated as 1. `op` receives the 1-based attempt
/// number. A zero `delay` retries immediately.
pub async fn retry<T, F, Fut>(
    label: &str,
    max_attempts: u32,
    delay: Duration,
    events: &EventBus,
    mut op: F,
) -> Result<Attempted<T>, Attempted<NodeError>>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = NodeResult<T>>,
{
    let max_attempts = max_attempts.max(1);
    let mut attempt = 0;

    loop {
        attempt += 1;
        match op(attempt).await {
            Ok(value) => {
                return Ok(Attempted {
                    value,
                    attempts: attempt,
                })
            }
            Err(e) if attempt < max_attempts => {
                warn!(
                    node = %label,
                    attempt,
                    max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "Execute attempt failed, retrying"
                );
                events.publish(FlowEvent::RetryScheduled {
                    node: label.to_string(),
                    attempt,
                    max_attempts,
                    error: e.to_string(),
                });
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
            }
            Err(e) => {
                return Err(Attempted {
                    value: e,
                    attempts: attempt,
                })
            }
        }
    }
}

/// Outcome of a node's retried execute stage.
#[derive(Debug, Clone, PartialEq)]
pub struct Executed {
    pub result: Value,
    pub attempts: u32,
    pub used_fallback: bool,
}

/// Retried execute for one node, falling back once retries are exhausted.
pub async fn execute_node(
    node: &Arc<dyn Node>,
    prep: &Value,
    events: &EventBus,
) -> Result<Executed, ExecFailure> {
    let name = node.name();
    let outcome = retry(
        name,
        node.max_attempts(),
        node.retry_delay(),
        events,
        move |_| dispatch_execute(node, prep.clone()),
    )
    .await;

    let failed = match outcome {
        Ok(done) => {
            return Ok(Executed {
                result: done.value,
                attempts: done.attempts,
                used_fallback: false,
            })
        }
        Err(failed) => failed,
    };

    let Some(fallback) = node.fallback(prep.clone(), failed.value.clone()) else {
        return Err(ExecFailure::MaxRetriesExceeded {
            attempts: failed.attempts,
            last: failed.value,
        });
    };

    match fallback.await {
        Ok(result) => {
            info!(node = %name, attempts = failed.attempts, "Retries exhausted, using fallback result");
            events.publish(FlowEvent::FallbackUsed {
                node: name.to_string(),
            });
            Ok(Executed {
                result,
                attempts: failed.attempts,
                used_fallback: true,
            })
        }
        Err(e) => {
            warn!(node = %name, error = %e, "Fallback failed");
            Err(ExecFailure::FallbackFailed {
                original: failed.value,
                fallback: e,
            })
        }
    }
}

/// Run one execute attempt, on its own task if the node asks for it.
async fn dispatch_execute(node: &Arc<dyn Node>, prep: Value) -> NodeResult<Value> {
    match node.dispatch() {
        Dispatch::Inline => node.execute(prep).await,
        Dispatch::Spawned => {
            let node = Arc::clone(node);
            tokio::spawn(async move { node.execute(prep).await })
                .await
                .unwrap_or_else(|e| Err(NodeError::new(format!("execute task failed: {}", e))))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::Ordering;
    use std::time::Instant;
    use weft_test_utils::{BrokenNode, BrokenStage, ScriptedNode};

    #[tokio::test]
    async fn test_succeeds_after_failures() {
        let node = ScriptedNode::new("flaky")
            .failing(2, NodeError::new("not yet"))
            .with_max_attempts(3);
        let counter = node.attempts();
        let node: Arc<dyn Node> = Arc::new(node);

        let done = execute_node(&node, &Value::Null, &EventBus::default())
            .await
            .unwrap();
        assert_eq!(done.result, json!("ok"));
        assert_eq!(done.attempts, 3);
        assert!(!done.used_fallback);
        assert_eq!(counter.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_exhausted_wraps_last_error() {
        let node: Arc<dyn Node> = Arc::new(
            ScriptedNode::new("down")
                .always_failing(NodeError::network("connection refused"))
                .with_max_attempts(4),
        );

        let err = execute_node(&node, &Value::Null, &EventBus::default())
            .await
            .unwrap_err();
        match err {
            ExecFailure::MaxRetriesExceeded { attempts, last } => {
                assert_eq!(attempts, 4);
                assert_eq!(last.message, "connection refused");
            }
            other => panic!("unexpected failure: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_zero_attempts_runs_once() {
        let node = ScriptedNode::new("once")
            .always_failing(NodeError::new("nope"))
            .with_max_attempts(0);
        let counter = node.attempts();
        let node: Arc<dyn Node> = Arc::new(node);

        let err = execute_node(&node, &Value::Null, &EventBus::default())
            .await
            .unwrap_err();
        assert!(matches!(err, ExecFailure::MaxRetriesExceeded { attempts: 1, .. }));
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_fallback_result_used() {
        let node: Arc<dyn Node> = Arc::new(
            ScriptedNode::new("degraded")
                .always_failing(NodeError::new("primary down"))
                .with_max_attempts(2)
                .with_fallback(Ok(json!("cached"))),
        );
        let bus = EventBus::default();
        let mut rx = bus.subscribe();

        let done = execute_node(&node, &Value::Null, &bus).await.unwrap();
        assert_eq!(done.result, json!("cached"));
        assert!(done.used_fallback);

        let mut saw_fallback = false;
        while let Ok(event) = rx.try_recv() {
            if matches!(event, FlowEvent::FallbackUsed { .. }) {
                saw_fallback = true;
            }
        }
        assert!(saw_fallback);
    }

    #[tokio::test]
    async fn test_fallback_failure_is_distinct() {
        let node: Arc<dyn Node> = Arc::new(
            ScriptedNode::new("broken")
                .always_failing(NodeError::new("primary down"))
                .with_fallback(Err(NodeError::new("cache empty"))),
        );

        let err = execute_node(&node, &Value::Null, &EventBus::default())
            .await
            .unwrap_err();
        match err {
            ExecFailure::FallbackFailed { original, fallback } => {
                assert_eq!(original.message, "primary down");
                assert_eq!(fallback.message, "cache empty");
            }
            other => panic!("unexpected failure: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_retry_events_and_delay() {
        let node: Arc<dyn Node> = Arc::new(
            ScriptedNode::new("slow")
                .failing(2, NodeError::timeout("timed out"))
                .with_max_attempts(3)
                .with_retry_delay(Duration::from_millis(20)),
        );
        let bus = EventBus::default();
        let mut rx = bus.subscribe();

        let started = Instant::now();
        execute_node(&node, &Value::Null, &bus).await.unwrap();
        assert!(started.elapsed() >= Duration::from_millis(40));

        let mut retries = Vec::new();
        while let Ok(event) = rx.try_recv() {
            if let FlowEvent::RetryScheduled { attempt, .. } = event {
                retries.push(attempt);
            }
        }
        assert_eq!(retries, vec![1, 2]);
    }

    #[tokio::test]
    async fn test_spawned_panic_is_attempt_failure() {
        let node: Arc<dyn Node> = Arc::new(BrokenNode::new("boom", BrokenStage::Panic));

        let err = execute_node(&node, &Value::Null, &EventBus::default())
            .await
            .unwrap_err();
        assert!(err.last_error().message.contains("execute task failed"));
    }

    #[tokio::test]
    async fn test_spawned_dispatch_succeeds() {
        let node: Arc<dyn Node> = Arc::new(ScriptedNode::new("remote").spawned());

        let done = execute_node(&node, &Value::Null, &EventBus::default())
            .await
            .unwrap();
        assert_eq!(done.result, json!("ok"));
    }

    #[tokio::test]
    async fn test_generic_retry_counts_attempts() {
        let bus = EventBus::default();
        let out = retry("calc", 5, Duration::ZERO, &bus, |attempt| async move {
            if attempt < 4 {
                Err(NodeError::new("again"))
            } else {
                Ok(attempt * 10)
            }
        })
        .await
        .unwrap();
        assert_eq!(out, Attempted { value: 40, attempts: 4 });
    }
}
