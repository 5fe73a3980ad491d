//! Event types and EventBus for the CardVault engine
//!
//! Events are broadcast via EventBus and can be serialized for SSE
//! transmission to downstream subscribers (notification, analytics).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

/// Terminal status carried by a completion event
///
/// `Partial` means exactly one analysis branch permanently failed while
/// the other succeeded; the persisted record has the failed branch's
/// fields absent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompletionStatus {
    Complete,
    Partial,
}

/// Which analysis branch an event refers to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BranchKind {
    Pricing,
    Authenticity,
}

impl BranchKind {
    pub fn as_str(self) -> &'static str {
        match self {
            BranchKind::Pricing => "pricing",
            BranchKind::Authenticity => "authenticity",
        }
    }
}

/// Engine event types
///
/// All events use this central enum for type safety and exhaustive
/// matching across the engine and its SSE surface.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EngineEvent {
    /// A submitted request was admitted and an execution started
    ExecutionStarted {
        execution_id: Uuid,
        card_id: String,
        timestamp: DateTime<Utc>,
    },

    /// Feature extraction produced an envelope; branches are starting
    ExtractionCompleted {
        execution_id: Uuid,
        card_id: String,
        timestamp: DateTime<Utc>,
    },

    /// One analysis branch reached a terminal state
    BranchCompleted {
        execution_id: Uuid,
        branch: BranchKind,
        success: bool,
        attempts: u32,
        timestamp: DateTime<Utc>,
    },

    /// The aggregated record was persisted; the execution is complete
    ///
    /// This is the completion event external collaborators consume.
    ExecutionCompleted {
        execution_id: Uuid,
        card_id: String,
        status: CompletionStatus,
        completed_at: DateTime<Utc>,
    },

    /// The execution failed terminally before producing a record
    ExecutionFailed {
        execution_id: Uuid,
        card_id: String,
        step: String,
        error: String,
        failed_at: DateTime<Utc>,
    },
}

impl EngineEvent {
    /// SSE event name for this event
    pub fn event_type(&self) -> &'static str {
        match self {
            EngineEvent::ExecutionStarted { .. } => "execution_started",
            EngineEvent::ExtractionCompleted { .. } => "extraction_completed",
            EngineEvent::BranchCompleted { .. } => "branch_completed",
            EngineEvent::ExecutionCompleted { .. } => "execution_completed",
            EngineEvent::ExecutionFailed { .. } => "execution_failed",
        }
    }
}

/// Central event distribution bus for engine-wide events
///
/// Uses tokio::broadcast internally, providing:
/// - Non-blocking publish (slow subscribers don't block producers)
/// - Multiple concurrent subscribers
/// - Automatic cleanup when subscribers drop
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<EngineEvent>,
    capacity: usize,
}

impl EventBus {
    /// Creates a new EventBus with the given channel capacity
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx, capacity }
    }

    /// Subscribe to all future events
    ///
    /// Events emitted before subscription are not received.
    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.tx.subscribe()
    }

    /// Emit an event to all subscribers
    ///
    /// Returns the subscriber count, or an error if no subscriber
    /// exists. Publishing with zero subscribers is not a fault for the
    /// engine, so callers typically ignore the result.
    pub fn emit(
        &self,
        event: EngineEvent,
    ) -> std::result::Result<usize, broadcast::error::SendError<EngineEvent>> {
        self.tx.send(event)
    }

    /// Configured channel capacity
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_emit_and_receive() {
        let bus = EventBus::new(16);
        let mut rx = bus.subscribe();

        let id = Uuid::new_v4();
        bus.emit(EngineEvent::ExecutionStarted {
            execution_id: id,
            card_id: "c1".to_string(),
            timestamp: Utc::now(),
        })
        .unwrap();

        match rx.recv().await.unwrap() {
            EngineEvent::ExecutionStarted { execution_id, .. } => {
                assert_eq!(execution_id, id);
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[test]
    fn test_completion_status_serializes_snake_case() {
        let json = serde_json::to_string(&CompletionStatus::Partial).unwrap();
        assert_eq!(json, "\"partial\"");
    }

    #[test]
    fn test_event_tagged_serialization() {
        let event = EngineEvent::ExecutionCompleted {
            execution_id: Uuid::new_v4(),
            card_id: "c9".to_string(),
            status: CompletionStatus::Complete,
            completed_at: Utc::now(),
        };
        let value: serde_json::Value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["type"], "execution_completed");
        assert_eq!(value["status"], "complete");
    }
}
