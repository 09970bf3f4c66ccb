use crate::types::FlowEvent;

/// Event bus using tokio broadcast channel.
/// All subscribers receive all events.
pub struct EventBus {
    tx: tokio::sync::broadcast::Sender<FlowEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = tokio::sync::broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn publish(&self, event: FlowEvent) {
        // Ignore error if no receivers
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<FlowEvent> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ExecutionId;

    #[tokio::test]
    async fn test_publish_without_subscribers() {
        let bus = EventBus::default();
        bus.publish(FlowEvent::FallbackUsed { node: "a".into() });
    }

    #[tokio::test]
    async fn test_subscriber_receives_events() {
        let bus = EventBus::new(8);
        let mut rx = bus.subscribe();
        let id = ExecutionId::from("run-1");
        bus.publish(FlowEvent::FlowCompleted {
            execution_id: id.clone(),
            steps: 2,
        });

        match rx.recv().await.unwrap() {
            FlowEvent::FlowCompleted { execution_id, steps } => {
                assert_eq!(execution_id, id);
                assert_eq!(steps, 2);
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }
}
