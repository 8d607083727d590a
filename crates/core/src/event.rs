//! Domain event system: decoupled observation of conversation turns.
//!
//! Events are published when something interesting happens in a turn.
//! Other components (CLI, telemetry sinks) can subscribe without coupling
//! to the run loop.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::broadcast;
use crate::message::ErrorKind;

/// All domain events in the system.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum DomainEvent {
    /// A turn started for a conversation
    TurnStarted {
        conversation_id: String,
        context_origin: Option<String>,
        timestamp: DateTime<Utc>,
    },

    /// The model service produced a response
    ResponseGenerated {
        conversation_id: String,
        model: String,
        tokens_used: u32,
        timestamp: DateTime<Utc>,
    },

    /// A declared function was executed or served from cache
    FunctionExecuted {
        function_name: String,
        cached: bool,
        success: bool,
        duration_ms: u64,
        timestamp: DateTime<Utc>,
    },

    /// A turn finished with a final answer
    TurnCompleted {
        conversation_id: String,
        steps: usize,
        timestamp: DateTime<Utc>,
    },

    /// A turn ended with a terminal error
    TurnFailed {
        conversation_id: String,
        kind: ErrorKind,
        message: String,
        timestamp: DateTime<Utc>,
    },
}

/// A broadcast-based event bus for domain events.
///
/// Uses `tokio::sync::broadcast` for multi-consumer pub/sub.
pub struct EventBus {
    sender: broadcast::Sender<Arc<DomainEvent>>,
}

impl EventBus {
    /// Create a new event bus with the given capacity.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Publish an event to all subscribers.
    pub fn publish(&self, event: DomainEvent) {
        // No subscribers is fine
        let _ = self.sender.send(Arc::new(event));
    }

    /// Subscribe to receive events.
    pub fn subscribe(&self) -> broadcast::Receiver<Arc<DomainEvent>> {
        self.sender.subscribe()
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

    #[tokio::test]
    async fn event_bus_publish_subscribe() {
        let bus = EventBus::new(16);
        let mut rx = bus.subscribe();

        bus.publish(DomainEvent::FunctionExecuted {
            function_name: "getEventByKey".into(),
            cached: false,
            success: true,
            duration_ms: 42,
            timestamp: Utc::now(),
        });

        let event = rx.recv().await.unwrap();
        match event.as_ref() {
            DomainEvent::FunctionExecuted { function_name, success, .. } => {
                assert_eq!(function_name, "getEventByKey");
                assert!(success);
            }
            _ => panic!("Expected FunctionExecuted event"),
        }
    }

    #[test]
    fn event_bus_no_subscribers_doesnt_panic() {
        let bus = EventBus::new(16);
        bus.publish(DomainEvent::TurnFailed {
            conversation_id: "c".into(),
            kind: ErrorKind::Unknown,
            message: "no subscribers".into(),
            timestamp: Utc::now(),
        });
    }
}
