//! Workflow execution persistence
//!
//! The orchestrator saves the execution record on every state
//! transition; the record is the durable source of truth for an
//! execution's progress.

use crate::models::{StepAttempts, WorkflowExecution, WorkflowState};
use cardvault_common::{Error, Result};
use chrono::{DateTime, Utc};
use sqlx::{Row, SqlitePool};
use uuid::Uuid;

/// Save an execution record (insert or update keyed by execution id)
pub async fn save_execution(pool: &SqlitePool, exec: &WorkflowExecution) -> Result<()> {
    let state = serde_json::to_string(&exec.state)
        .map_err(|e| Error::Internal(format!("Failed to serialize state: {}", e)))?;

    sqlx::query(
        r#"
        INSERT INTO executions (
            execution_id, card_id, image_ref, force_refresh, state, current_step,
            extraction_attempts, pricing_attempts, authenticity_attempts,
            aggregation_attempts, last_error, started_at, updated_at
        ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT(execution_id) DO UPDATE SET
            state = excluded.state,
            current_step = excluded.current_step,
            extraction_attempts = excluded.extraction_attempts,
            pricing_attempts = excluded.pricing_attempts,
            authenticity_attempts = excluded.authenticity_attempts,
            aggregation_attempts = excluded.aggregation_attempts,
            last_error = excluded.last_error,
            updated_at = excluded.updated_at
        "#,
    )
    .bind(exec.execution_id.to_string())
    .bind(&exec.card_id)
    .bind(&exec.image_ref)
    .bind(exec.force_refresh as i64)
    .bind(&state)
    .bind(&exec.current_step)
    .bind(exec.attempts.extraction as i64)
    .bind(exec.attempts.pricing as i64)
    .bind(exec.attempts.authenticity as i64)
    .bind(exec.attempts.aggregation as i64)
    .bind(&exec.last_error)
    .bind(exec.started_at.to_rfc3339())
    .bind(exec.updated_at.to_rfc3339())
    .execute(pool)
    .await?;

    Ok(())
}

/// Load an execution record by id
pub async fn load_execution(pool: &SqlitePool, execution_id: Uuid) -> Result<Option<WorkflowExecution>> {
    let row = sqlx::query(
        r#"
        SELECT execution_id, card_id, image_ref, force_refresh, state, current_step,
               extraction_attempts, pricing_attempts, authenticity_attempts,
               aggregation_attempts, last_error, started_at, updated_at
        FROM executions
        WHERE execution_id = ?
        "#,
    )
    .bind(execution_id.to_string())
    .fetch_optional(pool)
    .await?;

    let Some(row) = row else {
        return Ok(None);
    };

    let state: WorkflowState = serde_json::from_str(row.get("state"))
        .map_err(|e| Error::Internal(format!("Failed to parse state: {}", e)))?;

    let parse_time = |col: &str| -> Result<DateTime<Utc>> {
        let raw: String = row.get(col);
        DateTime::parse_from_rfc3339(&raw)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(|e| Error::Internal(format!("Failed to parse {}: {}", col, e)))
    };

    Ok(Some(WorkflowExecution {
        execution_id,
        card_id: row.get("card_id"),
        image_ref: row.get("image_ref"),
        force_refresh: row.get::<i64, _>("force_refresh") != 0,
        state,
        current_step: row.get("current_step"),
        attempts: StepAttempts {
            extraction: row.get::<i64, _>("extraction_attempts") as u32,
            pricing: row.get::<i64, _>("pricing_attempts") as u32,
            authenticity: row.get::<i64, _>("authenticity_attempts") as u32,
            aggregation: row.get::<i64, _>("aggregation_attempts") as u32,
        },
        last_error: row.get("last_error"),
        started_at: parse_time("started_at")?,
        updated_at: parse_time("updated_at")?,
    }))
}

/// Count executions for a card (used by tests and diagnostics)
pub async fn count_executions_for_card(pool: &SqlitePool, card_id: &str) -> Result<i64> {
    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM executions WHERE card_id = ?")
        .bind(card_id)
        .fetch_one(pool)
        .await?;
    Ok(count)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_pool;

    #[tokio::test]
    async fn test_save_and_load_roundtrip() {
        let pool = test_pool().await;

        let mut exec =
            WorkflowExecution::new(Uuid::new_v4(), "c1".into(), "img1".into(), true);
        exec.transition_to(WorkflowState::Extracting);
        exec.attempts.extraction = 2;
        exec.last_error = Some("transient timeout".to_string());

        save_execution(&pool, &exec).await.unwrap();

        let loaded = load_execution(&pool, exec.execution_id).await.unwrap().unwrap();
        assert_eq!(loaded.state, WorkflowState::Extracting);
        assert_eq!(loaded.card_id, "c1");
        assert!(loaded.force_refresh);
        assert_eq!(loaded.attempts.extraction, 2);
        assert_eq!(loaded.last_error.as_deref(), Some("transient timeout"));
    }

    #[tokio::test]
    async fn test_save_is_upsert() {
        let pool = test_pool().await;

        let mut exec =
            WorkflowExecution::new(Uuid::new_v4(), "c2".into(), "img2".into(), false);
        save_execution(&pool, &exec).await.unwrap();

        exec.transition_to(WorkflowState::Completed);
        save_execution(&pool, &exec).await.unwrap();

        let loaded = load_execution(&pool, exec.execution_id).await.unwrap().unwrap();
        assert_eq!(loaded.state, WorkflowState::Completed);
        assert_eq!(count_executions_for_card(&pool, "c2").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_load_missing_returns_none() {
        let pool = test_pool().await;
        let loaded = load_execution(&pool, Uuid::new_v4()).await.unwrap();
        assert!(loaded.is_none());
    }
}
