use std::collections::BTreeMap;
use std::convert::Infallible;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Name a node is registered under in a flow.
pub type NodeId = String;

/// Flow-level parameters handed to every node before it runs.
pub type Params = BTreeMap<String, Value>;

/// Action label used when a more specific label has no registered edge.
pub const DEFAULT_ACTION: &str = "default";

/// Unique identifier for one engine or orchestrator invocation.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
pub struct ExecutionId(pub String);

impl ExecutionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }
}

impl From<&str> for ExecutionId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for ExecutionId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl FromStr for ExecutionId {
    type Err = Infallible;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(Self::from(s))
    }
}

impl Default for ExecutionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ExecutionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Ordered key/value map threaded through one flow traversal.
///
/// Stages receive it by value; finalize hands back a new one.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SharedState {
    data: BTreeMap<String, Value>,
}

impl SharedState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_map(data: BTreeMap<String, Value>) -> Self {
        Self { data }
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.data.get(key)
    }

    /// Get a value as a string, if it's a string.
    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.data.get(key).and_then(|v| v.as_str())
    }

    pub fn get_i64(&self, key: &str) -> Option<i64> {
        self.data.get(key).and_then(|v| v.as_i64())
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.data.contains_key(key)
    }

    pub fn set(&mut self, key: impl Into<String>, value: Value) {
        self.data.insert(key.into(), value);
    }

    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.data.remove(key)
    }

    /// Builder-style `set` for constructing a new state from an old one.
    pub fn with(mut self, key: impl Into<String>, value: Value) -> Self {
        self.set(key, value);
        self
    }

    /// Shallow key union; `other` wins on conflicts.
    pub fn merge(&mut self, other: &SharedState) {
        for (k, v) in &other.data {
            self.data.insert(k.clone(), v.clone());
        }
    }

    /// Entries of `self` that are new or changed relative to `base`.
    pub fn changes_since(&self, base: &SharedState) -> SharedState {
        let data = self
            .data
            .iter()
            .filter(|(k, v)| base.data.get(*k) != Some(*v))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        Self { data }
    }

    pub fn keys(&self) -> impl Iterator<Item = &String> {
        self.data.keys()
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn data(&self) -> &BTreeMap<String, Value> {
        &self.data
    }

    pub fn into_value(self) -> Value {
        Value::Object(self.data.into_iter().collect())
    }
}

impl TryFrom<Value> for SharedState {
    type Error = Value;

    /// Only JSON objects are valid states; anything else is handed back.
    fn try_from(value: Value) -> std::result::Result<Self, Self::Error> {
        match value {
            Value::Object(map) => Ok(Self {
                data: map.into_iter().collect(),
            }),
            other => Err(other),
        }
    }
}

impl From<SharedState> for Value {
    fn from(state: SharedState) -> Self {
        state.into_value()
    }
}

impl FromIterator<(String, Value)> for SharedState {
    fn from_iter<I: IntoIterator<Item = (String, Value)>>(iter: I) -> Self {
        Self {
            data: iter.into_iter().collect(),
        }
    }
}

/// What a node's finalize stage hands back to the engine.
///
/// `state` is kept as a raw JSON value: the engine accepts it only if it is
/// a map, so a node returning a bare value fails with a finalize error.
#[derive(Debug, Clone, PartialEq)]
pub struct Transition {
    pub action: Option<String>,
    pub state: Value,
}

impl Transition {
    /// Continue along the edge labelled `action`.
    pub fn next(action: impl Into<String>, state: SharedState) -> Self {
        Self {
            action: Some(action.into()),
            state: state.into_value(),
        }
    }

    /// Continue along the `"default"` edge.
    pub fn default_action(state: SharedState) -> Self {
        Self::next(DEFAULT_ACTION, state)
    }

    /// Terminate the flow after this node.
    pub fn end(state: SharedState) -> Self {
        Self {
            action: None,
            state: state.into_value(),
        }
    }

    /// Hand back an arbitrary value as the state. Only maps are accepted.
    pub fn raw(action: Option<String>, state: Value) -> Self {
        Self { action, state }
    }
}

/// Lifecycle phase a failure belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Prepare,
    Execute,
    Finalize,
    /// Anything outside a single node stage (store, resolution, batch setup).
    Generic,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Phase::Prepare => write!(f, "prepare"),
            Phase::Execute => write!(f, "execute"),
            Phase::Finalize => write!(f, "finalize"),
            Phase::Generic => write!(f, "generic_execution"),
        }
    }
}

/// How the execute stage of a node is dispatched.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Dispatch {
    /// Run on the caller's task.
    #[default]
    Inline,
    /// Run on a freshly spawned tokio task and await its completion.
    Spawned,
}

/// Lifecycle events published to the event bus.
#[derive(Debug, Clone)]
pub enum FlowEvent {
    /// An engine invocation started.
    FlowStarted { execution_id: ExecutionId, start: NodeId },
    /// A node lifecycle run started.
    NodeStarted { execution_id: ExecutionId, node: NodeId },
    /// A node finished and selected an action.
    NodeCompleted {
        execution_id: ExecutionId,
        node: NodeId,
        action: Option<String>,
    },
    /// A node lifecycle run failed.
    NodeFailed {
        execution_id: ExecutionId,
        node: NodeId,
        phase: Phase,
        error: String,
    },
    /// An execute attempt failed and another one is scheduled.
    RetryScheduled {
        node: NodeId,
        attempt: u32,
        max_attempts: u32,
        error: String,
    },
    /// Retries exhausted; the node's fallback produced the result.
    FallbackUsed { node: NodeId },
    /// The action had no edge although the node has outgoing edges.
    ActionUnmatched { node: NodeId, action: String },
    /// A batch item started.
    BatchItemStarted { execution_id: ExecutionId, index: usize },
    /// A batch item finished (successfully or not).
    BatchItemCompleted {
        execution_id: ExecutionId,
        index: usize,
        succeeded: bool,
    },
    /// A failure was handled by a recovery strategy.
    Recovered {
        execution_id: ExecutionId,
        node: NodeId,
        strategy: String,
    },
    /// The invocation terminated normally.
    FlowCompleted { execution_id: ExecutionId, steps: usize },
    /// The invocation failed.
    FlowFailed { execution_id: ExecutionId, error: String },
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_basic_operations() {
        let mut state = SharedState::new();
        state.set("name", json!("Alice"));
        state.set("count", json!(42));

        assert_eq!(state.get_str("name"), Some("Alice"));
        assert_eq!(state.get_i64("count"), Some(42));
        assert_eq!(state.get("missing"), None);
    }

    #[test]
    fn test_merge_overwrites() {
        let mut a = SharedState::new().with("a", json!(1)).with("b", json!(2));
        let b = SharedState::new().with("b", json!("over")).with("c", json!(3));
        a.merge(&b);

        assert_eq!(a.get("a"), Some(&json!(1)));
        assert_eq!(a.get("b"), Some(&json!("over")));
        assert_eq!(a.get("c"), Some(&json!(3)));
    }

    #[test]
    fn test_changes_since() {
        let base = SharedState::new().with("a", json!(1)).with("b", json!(2));
        let after = base.clone().with("b", json!(5)).with("c", json!(3));
        let diff = after.changes_since(&base);

        assert!(!diff.contains_key("a"));
        assert_eq!(diff.get("b"), Some(&json!(5)));
        assert_eq!(diff.get("c"), Some(&json!(3)));
    }

    #[test]
    fn test_try_from_rejects_non_map() {
        assert!(SharedState::try_from(json!({"x": 1})).is_ok());
        assert_eq!(SharedState::try_from(json!(7)), Err(json!(7)));
        assert!(SharedState::try_from(json!([1, 2])).is_err());
    }

    #[test]
    fn test_state_keys_are_ordered() {
        let state = SharedState::new()
            .with("zeta", json!(1))
            .with("alpha", json!(2));
        let keys: Vec<_> = state.keys().cloned().collect();
        assert_eq!(keys, vec!["alpha", "zeta"]);
    }

    #[test]
    fn test_transition_constructors() {
        let t = Transition::default_action(SharedState::new());
        assert_eq!(t.action.as_deref(), Some(DEFAULT_ACTION));
        let t = Transition::end(SharedState::new().with("k", json!(true)));
        assert!(t.action.is_none());
        assert_eq!(t.state, json!({"k": true}));
    }

    #[test]
    fn test_execution_ids_unique() {
        assert_ne!(ExecutionId::new(), ExecutionId::new());
        assert_eq!(ExecutionId::from("abc").to_string(), "abc");
        let parsed: ExecutionId = "run-7".parse().unwrap();
        assert_eq!(parsed, ExecutionId::from(String::from("run-7")));
    }
}
