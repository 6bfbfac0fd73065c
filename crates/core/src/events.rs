use crate::types::{ExecutionId, SkipReason, StepId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::broadcast;

/// A progress event emitted while an execution runs
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub id: String,
    pub execution_id: ExecutionId,
    pub timestamp: DateTime<Utc>,
    pub event_type: EventType,
}

impl Event {
    pub fn new(execution_id: ExecutionId, event_type: EventType) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            execution_id,
            timestamp: Utc::now(),
            event_type,
        }
    }
}

/// Types of events that can occur during an execution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventType {
    // Step lifecycle events
    StepStarted {
        step_id: StepId,
        name: String,
        order: usize,
        total: usize,
    },
    StepCompleted {
        step_id: StepId,
        name: String,
        success: bool,
        result: serde_json::Value,
    },
    StepSkipped {
        step_id: StepId,
        reason: SkipReason,
    },
    StepRetrying {
        step_id: StepId,
        attempt: u32,
        delay_ms: u64,
        error: String,
    },
    ProgressUpdate {
        percent: u8,
        current: usize,
        total: usize,
    },

    // Execution lifecycle events
    ExecutionComplete {
        success: bool,
        output: serde_json::Value,
    },
    ExecutionError {
        message: String,
        error: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        step_id: Option<StepId>,
    },
    ExecutionPaused,
    ExecutionResumed,
    ExecutionCancelled,
}

/// Destination for progress events. Delivery is fire-and-forget: the
/// executor logs publish failures and carries on.
#[async_trait::async_trait]
pub trait EventSink: Send + Sync {
    async fn publish(&self, event: Event) -> anyhow::Result<()>;
}

/// Publish an event, logging instead of failing when the sink errors
pub async fn emit(sink: &dyn EventSink, execution_id: ExecutionId, event_type: EventType) {
    if let Err(e) = sink.publish(Event::new(execution_id, event_type)).await {
        tracing::warn!(
            execution_id = %execution_id,
            error = %e,
            "Failed to publish event"
        );
    }
}

/// Sink that drops every event
pub struct NullEventSink;

#[async_trait::async_trait]
impl EventSink for NullEventSink {
    async fn publish(&self, _event: Event) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Fans events out to live subscribers (status UIs, websockets)
#[derive(Clone)]
pub struct BroadcastEventSink {
    sender: broadcast::Sender<Event>,
}

impl BroadcastEventSink {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.sender.subscribe()
    }
}

#[async_trait::async_trait]
impl EventSink for BroadcastEventSink {
    async fn publish(&self, event: Event) -> anyhow::Result<()> {
        // No subscribers is not an error
        let _ = self.sender.send(event);
        Ok(())
    }
}

/// Publishes every event to several sinks, failing if any sink fails
pub struct FanoutEventSink {
    sinks: Vec<Arc<dyn EventSink>>,
}

impl FanoutEventSink {
    pub fn new(sinks: Vec<Arc<dyn EventSink>>) -> Self {
        Self { sinks }
    }
}

#[async_trait::async_trait]
impl EventSink for FanoutEventSink {
    async fn publish(&self, event: Event) -> anyhow::Result<()> {
        let mut first_error = None;
        for sink in &self.sinks {
            if let Err(e) = sink.publish(event.clone()).await {
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_type_is_tagged() {
        let event = EventType::ProgressUpdate {
            percent: 50,
            current: 1,
            total: 2,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "progress_update");
        assert_eq!(json["percent"], 50);
    }

    #[tokio::test]
    async fn test_broadcast_sink_delivers() {
        let sink = BroadcastEventSink::new(8);
        let mut rx = sink.subscribe();
        let execution_id = ExecutionId::new();

        sink.publish(Event::new(execution_id, EventType::ExecutionPaused))
            .await
            .unwrap();

        let received = rx.recv().await.unwrap();
        assert_eq!(received.execution_id, execution_id);
        assert_eq!(received.event_type, EventType::ExecutionPaused);
    }

    struct FailingSink;

    #[async_trait::async_trait]
    impl EventSink for FailingSink {
        async fn publish(&self, _event: Event) -> anyhow::Result<()> {
            anyhow::bail!("sink down")
        }
    }

    #[tokio::test]
    async fn test_emit_swallows_sink_errors() {
        emit(&FailingSink, ExecutionId::new(), EventType::ExecutionPaused).await;

        let fanout = FanoutEventSink::new(vec![Arc::new(FailingSink), Arc::new(NullEventSink)]);
        assert!(fanout
            .publish(Event::new(ExecutionId::new(), EventType::ExecutionPaused))
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_broadcast_without_subscribers_is_ok() {
        let sink = BroadcastEventSink::new(1);
        assert!(sink
            .publish(Event::new(ExecutionId::new(), EventType::ExecutionResumed))
            .await
            .is_ok());
    }
}
