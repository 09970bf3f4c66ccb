use tracing::warn;

use weft_core::event::EventBus;
use weft_core::types::{FlowEvent, NodeId, DEFAULT_ACTION};

use crate::flow::Edges;

/// Where a flow goes after a node finalizes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    Next(NodeId),
    /// No action, or the node has no outgoing edges.
    End,
    /// The action (and `"default"`) has no edge although the node has
    /// outgoing edges. Terminates like `End`.
    Unmatched(String),
}

/// Resolve `action` against a node's outgoing edges.
///
/// Exact label first, then `"default"`. An absent action terminates without
/// looking at the table.
pub fn resolve(edges: Option<&Edges>, action: Option<&str>) -> Resolution {
    let Some(action) = action else {
        return Resolution::End;
    };
    let Some(edges) = edges.filter(|e| !e.is_empty()) else {
        return Resolution::End;
    };

    match edges.get(action).or_else(|| edges.get(DEFAULT_ACTION)) {
        Some(next) => Resolution::Next(next.clone()),
        None => Resolution::Unmatched(action.to_string()),
    }
}

impl Resolution {
    /// Successor to continue with, warning about unmatched actions.
    pub fn into_next(self, node: &str, events: &EventBus) -> Option<NodeId> {
        match self {
            Resolution::Next(next) => Some(next),
            Resolution::End => None,
            Resolution::Unmatched(action) => {
                warn!(node = %node, action = %action, "No edge for action, flow ends here");
                events.publish(FlowEvent::ActionUnmatched {
                    node: node.to_string(),
                    action,
                });
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn edges(pairs: &[(&str, &str)]) -> Edges {
        pairs
            .iter()
            .map(|(a, n)| (a.to_string(), n.to_string()))
            .collect()
    }

    #[test]
    fn test_exact_action() {
        let table = edges(&[("x", "B"), ("default", "C")]);
        assert_eq!(resolve(Some(&table), Some("x")), Resolution::Next("B".into()));
    }

    #[test]
    fn test_falls_back_to_default() {
        let table = edges(&[("x", "B"), ("default", "C")]);
        assert_eq!(resolve(Some(&table), Some("y")), Resolution::Next("C".into()));
    }

    #[test]
    fn test_no_outgoing_edges_terminates() {
        assert_eq!(resolve(None, Some("anything")), Resolution::End);
        assert_eq!(resolve(Some(&Edges::new()), Some("default")), Resolution::End);
    }

    #[test]
    fn test_absent_action_terminates() {
        let table = edges(&[("default", "C")]);
        assert_eq!(resolve(Some(&table), None), Resolution::End);
    }

    #[test]
    fn test_unmatched_action() {
        let table = edges(&[("x", "B")]);
        assert_eq!(resolve(Some(&table), Some("y")), Resolution::Unmatched("y".into()));
    }

    #[tokio::test]
    async fn test_unmatched_publishes_warning_event() {
        let bus = EventBus::default();
        let mut rx = bus.subscribe();

        let next = Resolution::Unmatched("y".into()).into_next("A", &bus);
        assert!(next.is_none());
        match rx.recv().await.unwrap() {
            FlowEvent::ActionUnmatched { node, action } => {
                assert_eq!(node, "A");
                assert_eq!(action, "y");
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }
}
