use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use serde_json::Value;
use tracing::warn;

use weft_core::error::{Result, WeftError};
use weft_core::traits::Node;
use weft_core::types::{NodeId, Params, DEFAULT_ACTION};

/// Outgoing edges of one node: action label → destination.
pub type Edges = HashMap<String, NodeId>;

/// A directed graph of nodes connected by action-labelled edges.
///
/// Flows are immutable once built and carry no run-specific state, so one
/// flow can be run any number of times, concurrently.
pub struct Flow {
    name: String,
    start: NodeId,
    nodes: HashMap<NodeId, Arc<dyn Node>>,
    edges: HashMap<NodeId, Edges>,
    params: Params,
}

impl Flow {
    pub fn builder(name: impl Into<String>) -> FlowBuilder {
        FlowBuilder::new(name)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn start(&self) -> &str {
        &self.start
    }

    pub fn node(&self, id: &str) -> Option<&Arc<dyn Node>> {
        self.nodes.get(id)
    }

    /// Outgoing edges of `id`, if it has any.
    pub fn edges_from(&self, id: &str) -> Option<&Edges> {
        self.edges.get(id)
    }

    pub fn params(&self) -> &Params {
        &self.params
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }
}

impl fmt::Debug for Flow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut nodes: Vec<_> = self.nodes.keys().collect();
        nodes.sort();
        f.debug_struct("Flow")
            .field("name", &self.name)
            .field("start", &self.start)
            .field("nodes", &nodes)
            .field("edges", &self.edges)
            .finish()
    }
}

/// Incremental builder for a [`Flow`].
pub struct FlowBuilder {
    name: String,
    start: Option<NodeId>,
    nodes: HashMap<NodeId, Arc<dyn Node>>,
    edges: HashMap<NodeId, Edges>,
    params: Params,
}

impl FlowBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            start: None,
            nodes: HashMap::new(),
            edges: HashMap::new(),
            params: Params::new(),
        }
    }

    /// Register a node under its own name.
    pub fn add_node(self, node: impl Node) -> Self {
        self.add_shared(Arc::new(node))
    }

    /// Register an already shared node.
    pub fn add_shared(mut self, node: Arc<dyn Node>) -> Self {
        let id = node.name().to_string();
        if self.nodes.insert(id.clone(), node).is_some() {
            warn!(flow = %self.name, node = %id, "Node registered twice, keeping the last one");
        }
        self
    }

    /// Connect `from` to `to` on the default action.
    pub fn connect(self, from: &str, to: &str) -> Self {
        self.connect_on(from, DEFAULT_ACTION, to)
    }

    /// Connect `from` to `to` on `action`.
    pub fn connect_on(mut self, from: &str, action: &str, to: &str) -> Self {
        self.edges
            .entry(from.to_string())
            .or_default()
            .insert(action.to_string(), to.to_string());
        self
    }

    pub fn set_start(mut self, id: &str) -> Self {
        self.start = Some(id.to_string());
        self
    }

    pub fn param(mut self, key: &str, value: Value) -> Self {
        self.params.insert(key.to_string(), value);
        self
    }

    /// Validate and freeze the flow.
    ///
    /// The start node and every edge endpoint must be registered.
    pub fn build(self) -> Result<Flow> {
        let start = self
            .start
            .ok_or_else(|| WeftError::Config(format!("flow '{}' has no start node", self.name)))?;

        if !self.nodes.contains_key(&start) {
            return Err(WeftError::Config(format!(
                "flow '{}': start node '{}' is not registered",
                self.name, start
            )));
        }

        for (from, edges) in &self.edges {
            if !self.nodes.contains_key(from) {
                return Err(WeftError::Config(format!(
                    "flow '{}': edge source '{}' is not registered",
                    self.name, from
                )));
            }
            for (action, to) in edges {
                if !self.nodes.contains_key(to) {
                    return Err(WeftError::Config(format!(
                        "flow '{}': edge '{}' --{}--> '{}' points at an unregistered node",
                        self.name, from, action, to
                    )));
                }
            }
        }

        Ok(Flow {
            name: self.name,
            start,
            nodes: self.nodes,
            edges: self.edges,
            params: self.params,
        })
    }
}
