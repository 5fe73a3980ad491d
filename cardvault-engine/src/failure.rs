//! Terminal failure handling
//!
//! Every unrecoverable execution failure passes through here exactly
//! once: an audit record is written, the full execution context goes to
//! the dead-letter table for follow-up, and subscribers (including any
//! drain worker) are notified over an mpsc channel. Nothing fails
//! silently.

use crate::db::audit::{self, AuditRecord};
use crate::models::WorkflowExecution;
use cardvault_common::events::{EngineEvent, EventBus};
use cardvault_common::Result;
use chrono::Utc;
use sqlx::SqlitePool;
use tokio::sync::mpsc;
use tracing::error;

/// Context forwarded to the dead-letter channel on terminal failure
#[derive(Debug, Clone)]
pub struct DeadLetter {
    pub execution: WorkflowExecution,
    pub step: String,
    pub error: String,
}

pub struct FailureHandler {
    pool: SqlitePool,
    event_bus: EventBus,
    dead_letter_tx: mpsc::UnboundedSender<DeadLetter>,
}

impl FailureHandler {
    /// Create the handler and the receiving end of its dead-letter
    /// channel; the caller decides what drains it
    pub fn new(
        pool: SqlitePool,
        event_bus: EventBus,
    ) -> (Self, mpsc::UnboundedReceiver<DeadLetter>) {
        let (dead_letter_tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                pool,
                event_bus,
                dead_letter_tx,
            },
            rx,
        )
    }

    /// Record a terminal failure durably, then notify
    ///
    /// Ordering matters: the audit and dead-letter rows land before the
    /// event fires, so a subscriber reacting to the event always finds
    /// the durable records present.
    pub async fn handle_terminal_failure(
        &self,
        execution: &WorkflowExecution,
        step: &str,
        error_text: &str,
    ) -> Result<()> {
        error!(
            execution_id = %execution.execution_id,
            card_id = %execution.card_id,
            step,
            "Execution failed terminally: {}",
            error_text
        );

        audit::write_audit(
            &self.pool,
            &AuditRecord {
                execution_id: execution.execution_id,
                card_id: execution.card_id.clone(),
                step: step.to_string(),
                error: error_text.to_string(),
            },
        )
        .await?;

        let context = serde_json::json!({
            "execution": execution,
            "step": step,
            "error": error_text,
        });
        audit::write_dead_letter(&self.pool, execution.execution_id, &execution.card_id, &context)
            .await?;

        let _ = self.dead_letter_tx.send(DeadLetter {
            execution: execution.clone(),
            step: step.to_string(),
            error: error_text.to_string(),
        });

        let _ = self.event_bus.emit(EngineEvent::ExecutionFailed {
            execution_id: execution.execution_id,
            card_id: execution.card_id.clone(),
            step: step.to_string(),
            error: error_text.to_string(),
            failed_at: Utc::now(),
        });

        Ok(())
    }
}

/// Drain the dead-letter channel, logging each entry
///
/// Placeholder consumer for deployments without an external follow-up
/// system; the durable rows in `dead_letters` remain the source of
/// truth for tooling.
pub async fn drain_dead_letters(mut rx: mpsc::UnboundedReceiver<DeadLetter>) {
    while let Some(letter) = rx.recv().await {
        error!(
            execution_id = %letter.execution.execution_id,
            card_id = %letter.execution.card_id,
            step = %letter.step,
            "Dead-lettered execution awaiting follow-up: {}",
            letter.error
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_pool;
    use uuid::Uuid;

    fn execution() -> WorkflowExecution {
        WorkflowExecution::new(Uuid::new_v4(), "c1".into(), "img1".into(), false)
    }

    #[tokio::test]
    async fn test_terminal_failure_writes_audit_and_dead_letter() {
        let pool = test_pool().await;
        let bus = EventBus::new(16);
        let mut events = bus.subscribe();
        let (handler, mut dead_letters) = FailureHandler::new(pool.clone(), bus);

        let exec = execution();
        handler
            .handle_terminal_failure(&exec, "extraction", "unreadable image")
            .await
            .unwrap();

        assert_eq!(
            audit::count_audit_for_execution(&pool, exec.execution_id).await.unwrap(),
            1
        );

        let contexts = audit::load_dead_letters(&pool, exec.execution_id).await.unwrap();
        assert_eq!(contexts.len(), 1);
        assert_eq!(contexts[0]["step"], "extraction");
        assert_eq!(contexts[0]["execution"]["card_id"], "c1");

        let letter = dead_letters.recv().await.unwrap();
        assert_eq!(letter.execution.execution_id, exec.execution_id);
        assert_eq!(letter.error, "unreadable image");

        match events.recv().await.unwrap() {
            EngineEvent::ExecutionFailed { execution_id, step, .. } => {
                assert_eq!(execution_id, exec.execution_id);
                assert_eq!(step, "extraction");
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_failure_recorded_even_with_no_listeners() {
        let pool = test_pool().await;
        let (handler, rx) = FailureHandler::new(pool.clone(), EventBus::new(16));
        drop(rx);

        let exec = execution();
        handler
            .handle_terminal_failure(&exec, "aggregation", "record upsert failed")
            .await
            .unwrap();

        assert_eq!(
            audit::count_audit_for_execution(&pool, exec.execution_id).await.unwrap(),
            1
        );
    }
}
