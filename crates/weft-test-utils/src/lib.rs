//! Mock nodes and fixtures shared by the Weft crates' tests.

use std::io::Write;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::BoxFuture;
use serde_json::{json, Value};

use weft_core::config::EngineConfig;
use weft_core::error::{NodeError, NodeResult};
use weft_core::traits::Node;
use weft_core::types::{Dispatch, Params, SharedState, Transition};

/// Node whose execute fails a fixed number of times before succeeding.
///
/// On success it writes the execute result under `output_key` and returns
/// `action`.
pub struct ScriptedNode {
    name: String,
    failures: u32,
    error: NodeError,
    output: Value,
    output_key: String,
    action: Option<String>,
    max_attempts: u32,
    retry_delay: Duration,
    fallback: Option<NodeResult<Value>>,
    dispatch: Dispatch,
    attempts: Arc<AtomicU32>,
}

impl ScriptedNode {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            failures: 0,
            error: NodeError::new("scripted failure"),
            output: json!("ok"),
            output_key: name.to_string(),
            action: Some("default".to_string()),
            max_attempts: 1,
            retry_delay: Duration::ZERO,
            fallback: None,
            dispatch: Dispatch::Inline,
            attempts: Arc::new(AtomicU32::new(0)),
        }
    }

    /// Fail the first `n` attempts with `error`.
    pub fn failing(mut self, n: u32, error: NodeError) -> Self {
        self.failures = n;
        self.error = error;
        self
    }

    /// Fail on every attempt.
    pub fn always_failing(self, error: NodeError) -> Self {
        self.failing(u32::MAX, error)
    }

    pub fn with_output(mut self, output: Value) -> Self {
        self.output = output;
        self
    }

    pub fn with_output_key(mut self, key: &str) -> Self {
        self.output_key = key.to_string();
        self
    }

    pub fn with_action(mut self, action: Option<&str>) -> Self {
        self.action = action.map(String::from);
        self
    }

    pub fn with_max_attempts(mut self, n: u32) -> Self {
        self.max_attempts = n;
        self
    }

    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    pub fn with_fallback(mut self, result: NodeResult<Value>) -> Self {
        self.fallback = Some(result);
        self
    }

    pub fn spawned(mut self) -> Self {
        self.dispatch = Dispatch::Spawned;
        self
    }

    /// Shared attempt counter; clone it before handing the node to a flow.
    pub fn attempts(&self) -> Arc<AtomicU32> {
        Arc::clone(&self.attempts)
    }
}

impl Node for ScriptedNode {
    fn name(&self) -> &str {
        &self.name
    }

    fn execute(&self, _prep: Value) -> BoxFuture<'_, NodeResult<Value>> {
        Box::pin(async move {
            let attempt = self.attempts.fetch_add(1, Ordering::SeqCst);
            if attempt < self.failures {
                Err(self.error.clone())
            } else {
                Ok(self.output.clone())
            }
        })
    }

    fn finalize(
        &self,
        state: SharedState,
        _prep: Value,
        result: Value,
    ) -> BoxFuture<'_, NodeResult<Transition>> {
        Box::pin(async move {
            let state = state.with(self.output_key.clone(), result);
            Ok(Transition::raw(self.action.clone(), state.into_value()))
        })
    }

    fn fallback(&self, _prep: Value, _error: NodeError) -> Option<BoxFuture<'_, NodeResult<Value>>> {
        let result = self.fallback.clone()?;
        Some(Box::pin(async move { result }))
    }

    fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    fn retry_delay(&self) -> Duration {
        self.retry_delay
    }

    fn dispatch(&self) -> Dispatch {
        self.dispatch
    }
}

/// Node that writes fixed keys into the state and returns a fixed action.
pub struct SetNode {
    name: String,
    writes: Vec<(String, Value)>,
    action: Option<String>,
    visits: Arc<AtomicU32>,
}

impl SetNode {
    pub fn new(name: &str, action: Option<&str>) -> Self {
        Self {
            name: name.to_string(),
            writes: Vec::new(),
            action: action.map(String::from),
            visits: Arc::new(AtomicU32::new(0)),
        }
    }

    pub fn set(mut self, key: &str, value: Value) -> Self {
        self.writes.push((key.to_string(), value));
        self
    }

    pub fn visits(&self) -> Arc<AtomicU32> {
        Arc::clone(&self.visits)
    }
}

impl Node for SetNode {
    fn name(&self) -> &str {
        &self.name
    }

    fn execute(&self, _prep: Value) -> BoxFuture<'_, NodeResult<Value>> {
        self.visits.fetch_add(1, Ordering::SeqCst);
        Box::pin(async { Ok(Value::Null) })
    }

    fn finalize(
        &self,
        mut state: SharedState,
        _prep: Value,
        _result: Value,
    ) -> BoxFuture<'_, NodeResult<Transition>> {
        Box::pin(async move {
            for (key, value) in &self.writes {
                state.set(key.clone(), value.clone());
            }
            Ok(Transition::raw(self.action.clone(), state.into_value()))
        })
    }
}

/// Batch start node: prepare yields `state[source_key]`, each item is
/// recorded in visit order and written back as `item_<item>` = `item * 10`.
pub struct ItemNode {
    name: String,
    source_key: String,
    action: Option<String>,
    delay_per_item: Duration,
    fail_on: Option<Value>,
    panic_on: Option<Value>,
    route_by_item: bool,
    visited: Arc<Mutex<Vec<Value>>>,
}

impl ItemNode {
    pub fn new(name: &str, source_key: &str) -> Self {
        Self {
            name: name.to_string(),
            source_key: source_key.to_string(),
            action: Some("default".to_string()),
            delay_per_item: Duration::ZERO,
            fail_on: None,
            panic_on: None,
            route_by_item: false,
            visited: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn with_action(mut self, action: Option<&str>) -> Self {
        self.action = action.map(String::from);
        self
    }

    /// Sleep `item * delay` during execute (items must be integers).
    pub fn with_delay_per_item(mut self, delay: Duration) -> Self {
        self.delay_per_item = delay;
        self
    }

    /// Fail execute for this item.
    pub fn failing_on(mut self, item: Value) -> Self {
        self.fail_on = Some(item);
        self
    }

    /// Panic in finalize for this item.
    pub fn panicking_on(mut self, item: Value) -> Self {
        self.panic_on = Some(item);
        self
    }

    /// Use each item's label as its action.
    pub fn routing_by_item(mut self) -> Self {
        self.route_by_item = true;
        self
    }

    pub fn visited(&self) -> Arc<Mutex<Vec<Value>>> {
        Arc::clone(&self.visited)
    }
}

fn item_label(item: &Value) -> String {
    match item {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

impl Node for ItemNode {
    fn name(&self) -> &str {
        &self.name
    }

    fn prepare<'a>(&'a self, state: &'a SharedState) -> BoxFuture<'a, NodeResult<Value>> {
        Box::pin(async move { Ok(state.get(&self.source_key).cloned().unwrap_or(Value::Null)) })
    }

    fn execute(&self, prep: Value) -> BoxFuture<'_, NodeResult<Value>> {
        Box::pin(async move {
            if self.fail_on.as_ref() == Some(&prep) {
                return Err(NodeError::new(format!("item {} rejected", prep)));
            }
            if let Some(n) = prep.as_u64() {
                tokio::time::sleep(self.delay_per_item * n as u32).await;
            }
            self.visited.lock().unwrap().push(prep.clone());
            Ok(match prep.as_i64() {
                Some(n) => json!(n * 10),
                None => prep,
            })
        })
    }

    fn finalize(
        &self,
        state: SharedState,
        prep: Value,
        result: Value,
    ) -> BoxFuture<'_, NodeResult<Transition>> {
        Box::pin(async move {
            if self.panic_on.as_ref() == Some(&prep) {
                panic!("finalize blew up on {prep}");
            }
            let label = item_label(&prep);
            let action = if self.route_by_item {
                Some(label.clone())
            } else {
                self.action.clone()
            };
            let state = state.with(format!("item_{label}"), result);
            Ok(Transition::raw(action, state.into_value()))
        })
    }
}

/// Node that fails in a chosen stage, or returns a non-map state.
pub struct BrokenNode {
    name: String,
    stage: BrokenStage,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BrokenStage {
    Prepare,
    Finalize,
    /// Finalize hands back a bare scalar instead of a state map.
    ScalarState,
    /// Execute panics.
    Panic,
}

impl BrokenNode {
    pub fn new(name: &str, stage: BrokenStage) -> Self {
        Self {
            name: name.to_string(),
            stage,
        }
    }
}

impl Node for BrokenNode {
    fn name(&self) -> &str {
        &self.name
    }

    fn prepare<'a>(&'a self, _state: &'a SharedState) -> BoxFuture<'a, NodeResult<Value>> {
        Box::pin(async move {
            match self.stage {
                BrokenStage::Prepare => Err(NodeError::key_not_found("input")),
                _ => Ok(Value::Null),
            }
        })
    }

    fn execute(&self, _prep: Value) -> BoxFuture<'_, NodeResult<Value>> {
        Box::pin(async move {
            if self.stage == BrokenStage::Panic {
                panic!("execute blew up");
            }
            Ok(json!("executed"))
        })
    }

    fn finalize(
        &self,
        state: SharedState,
        _prep: Value,
        _result: Value,
    ) -> BoxFuture<'_, NodeResult<Transition>> {
        Box::pin(async move {
            match self.stage {
                BrokenStage::Finalize => Err(NodeError::new("finalize rejected result")),
                BrokenStage::ScalarState => Ok(Transition::raw(Some("default".into()), json!(42))),
                _ => Ok(Transition::default_action(state)),
            }
        })
    }

    fn dispatch(&self) -> Dispatch {
        match self.stage {
            BrokenStage::Panic => Dispatch::Spawned,
            _ => Dispatch::Inline,
        }
    }
}

/// Node that copies the flow parameters it was given into the state.
#[derive(Default)]
pub struct ParamsNode {
    seen: Mutex<Params>,
}

impl Node for ParamsNode {
    fn name(&self) -> &str {
        "params"
    }

    fn execute(&self, _prep: Value) -> BoxFuture<'_, NodeResult<Value>> {
        Box::pin(async { Ok(Value::Null) })
    }

    fn finalize(
        &self,
        mut state: SharedState,
        _prep: Value,
        _result: Value,
    ) -> BoxFuture<'_, NodeResult<Transition>> {
        Box::pin(async move {
            let seen = self.seen.lock().unwrap().clone();
            for (key, value) in seen {
                state.set(format!("param_{}", key), value);
            }
            Ok(Transition::end(state))
        })
    }

    fn set_params(&self, params: &Params) {
        *self.seen.lock().unwrap() = params.clone();
    }
}

/// Build a state from `json!({...})`.
pub fn state(value: Value) -> SharedState {
    SharedState::try_from(value).expect("state fixture must be a JSON object")
}

/// Write `toml` to a temp file for `EngineConfig::load` tests.
pub fn config_file(toml: &str) -> tempfile::NamedTempFile {
    let mut tmp = tempfile::NamedTempFile::new().expect("create temp config");
    tmp.write_all(toml.as_bytes()).expect("write temp config");
    tmp
}

/// Config with recovery backoff shrunk so tests stay fast.
pub fn fast_config() -> EngineConfig {
    let mut config = EngineConfig::default();
    config.recovery.initial_backoff_ms = 1;
    config.recovery.max_backoff_ms = 5;
    config.recovery.jitter = false;
    config.batch.parallel_timeout_ms = 2_000;
    config
}
