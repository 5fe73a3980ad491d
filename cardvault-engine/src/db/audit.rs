//! Audit and dead-letter persistence
//!
//! Terminal execution failures are durably recorded here before the
//! execution is considered closed. Nothing fails silently.

use cardvault_common::Result;
use chrono::Utc;
use sqlx::{Row, SqlitePool};
use uuid::Uuid;

/// One terminal-failure audit record
#[derive(Debug, Clone)]
pub struct AuditRecord {
    pub execution_id: Uuid,
    pub card_id: String,
    pub step: String,
    pub error: String,
}

/// Write an audit record for a terminal failure
pub async fn write_audit(pool: &SqlitePool, record: &AuditRecord) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO audit_log (execution_id, card_id, step, error, created_at)
        VALUES (?, ?, ?, ?, ?)
        "#,
    )
    .bind(record.execution_id.to_string())
    .bind(&record.card_id)
    .bind(&record.step)
    .bind(&record.error)
    .bind(Utc::now().to_rfc3339())
    .execute(pool)
    .await?;
    Ok(())
}

/// Count audit records for an execution
pub async fn count_audit_for_execution(pool: &SqlitePool, execution_id: Uuid) -> Result<i64> {
    let count: i64 =
        sqlx::query_scalar("SELECT COUNT(*) FROM audit_log WHERE execution_id = ?")
            .bind(execution_id.to_string())
            .fetch_one(pool)
            .await?;
    Ok(count)
}

/// Persist the execution context to the dead-letter table
///
/// `context` is the serialized execution record plus whatever error
/// detail the failure handler attached; kept as JSON for follow-up
/// tooling.
pub async fn write_dead_letter(
    pool: &SqlitePool,
    execution_id: Uuid,
    card_id: &str,
    context: &serde_json::Value,
) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO dead_letters (execution_id, card_id, context, created_at)
        VALUES (?, ?, ?, ?)
        "#,
    )
    .bind(execution_id.to_string())
    .bind(card_id)
    .bind(context.to_string())
    .bind(Utc::now().to_rfc3339())
    .execute(pool)
    .await?;
    Ok(())
}

/// Load dead-letter contexts for an execution
pub async fn load_dead_letters(
    pool: &SqlitePool,
    execution_id: Uuid,
) -> Result<Vec<serde_json::Value>> {
    let rows = sqlx::query("SELECT context FROM dead_letters WHERE execution_id = ? ORDER BY id")
        .bind(execution_id.to_string())
        .fetch_all(pool)
        .await?;

    rows.iter()
        .map(|row| {
            let raw: String = row.get("context");
            serde_json::from_str(&raw).map_err(|e| {
                cardvault_common::Error::Internal(format!("Failed to parse dead letter: {}", e))
            })
        })
        .collect()
}
