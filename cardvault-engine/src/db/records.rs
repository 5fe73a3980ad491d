//! Card record store
//!
//! The durable record clients poll for results. Writes are upserts
//! keyed by card id, so orchestrator-level retries of the aggregation
//! step never produce duplicate rows. The version is allocated inside
//! the write itself: a revalue by a new execution bumps it, a retry of
//! the same execution keeps it.

use crate::types::{AggregatedResult, AuthenticityPayload, CardIdentity, PricingPayload};
use cardvault_common::events::CompletionStatus;
use cardvault_common::{Error, Result};
use chrono::{DateTime, Utc};
use sqlx::{Row, SqlitePool};
use uuid::Uuid;

fn to_json<T: serde::Serialize>(label: &str, value: &T) -> Result<String> {
    serde_json::to_string(value)
        .map_err(|e| Error::Internal(format!("Failed to serialize {}: {}", label, e)))
}

fn from_json<T: serde::de::DeserializeOwned>(label: &str, raw: &str) -> Result<T> {
    serde_json::from_str(raw)
        .map_err(|e| Error::Internal(format!("Failed to parse {}: {}", label, e)))
}

/// Upsert the aggregated record (idempotent write keyed by card id)
///
/// Returns the persisted version. The version is computed in the same
/// statement as the write: concurrent executions for one card each get
/// a distinct version, without a read-then-write window between them.
/// The SET expressions read the pre-update row, so the execution-id
/// comparison sees the previously persisted execution.
pub async fn upsert_record(pool: &SqlitePool, record: &AggregatedResult) -> Result<i64> {
    let identity = to_json("identity", &record.identity)?;
    let authenticity = record
        .authenticity
        .as_ref()
        .map(|a| to_json("authenticity", a))
        .transpose()?;
    let valuation = record
        .valuation
        .as_ref()
        .map(|v| to_json("valuation", v))
        .transpose()?;
    let status = to_json("status", &record.status)?;

    let version: i64 = sqlx::query_scalar(
        r#"
        INSERT INTO card_records (
            card_id, execution_id, version, identity, identification_confidence,
            authenticity, valuation, status, completed_at
        ) VALUES (?, ?, 1, ?, ?, ?, ?, ?, ?)
        ON CONFLICT(card_id) DO UPDATE SET
            version = CASE
                WHEN card_records.execution_id = excluded.execution_id
                THEN card_records.version
                ELSE card_records.version + 1
            END,
            execution_id = excluded.execution_id,
            identity = excluded.identity,
            identification_confidence = excluded.identification_confidence,
            authenticity = excluded.authenticity,
            valuation = excluded.valuation,
            status = excluded.status,
            completed_at = excluded.completed_at
        RETURNING version
        "#,
    )
    .bind(&record.card_id)
    .bind(record.execution_id.to_string())
    .bind(&identity)
    .bind(record.identification_confidence)
    .bind(&authenticity)
    .bind(&valuation)
    .bind(&status)
    .bind(record.completed_at.to_rfc3339())
    .fetch_one(pool)
    .await?;

    Ok(version)
}

/// Load the record for a card, if one has been persisted
pub async fn load_record(pool: &SqlitePool, card_id: &str) -> Result<Option<AggregatedResult>> {
    let row = sqlx::query(
        r#"
        SELECT card_id, execution_id, version, identity, identification_confidence,
               authenticity, valuation, status, completed_at
        FROM card_records
        WHERE card_id = ?
        "#,
    )
    .bind(card_id)
    .fetch_optional(pool)
    .await?;

    let Some(row) = row else {
        return Ok(None);
    };

    let execution_id: String = row.get("execution_id");
    let execution_id = Uuid::parse_str(&execution_id)
        .map_err(|e| Error::Internal(format!("Failed to parse execution_id: {}", e)))?;

    let identity: CardIdentity = from_json("identity", row.get("identity"))?;
    let authenticity: Option<AuthenticityPayload> = row
        .get::<Option<String>, _>("authenticity")
        .map(|raw| from_json("authenticity", &raw))
        .transpose()?;
    let valuation: Option<PricingPayload> = row
        .get::<Option<String>, _>("valuation")
        .map(|raw| from_json("valuation", &raw))
        .transpose()?;
    let status: CompletionStatus = from_json("status", row.get("status"))?;

    let completed_at: String = row.get("completed_at");
    let completed_at = DateTime::parse_from_rfc3339(&completed_at)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| Error::Internal(format!("Failed to parse completed_at: {}", e)))?;

    Ok(Some(AggregatedResult {
        card_id: row.get("card_id"),
        execution_id,
        version: row.get("version"),
        identity,
        identification_confidence: row.get("identification_confidence"),
        authenticity,
        valuation,
        status,
        completed_at,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_pool;
    use crate::types::{ConditionBucket, SignalScores, Valuation};

    fn sample_record(card_id: &str) -> AggregatedResult {
        AggregatedResult {
            card_id: card_id.to_string(),
            execution_id: Uuid::new_v4(),
            version: 0,
            identity: CardIdentity {
                name: "Blastoise".into(),
                set_name: "Base Set".into(),
                number: "2/102".into(),
                rarity: "Holo Rare".into(),
                condition: ConditionBucket::Played,
            },
            identification_confidence: 0.93,
            authenticity: Some(AuthenticityPayload {
                score: 0.88,
                signals: SignalScores {
                    text: 0.9,
                    visual: 0.85,
                    hologram: 0.9,
                    border: 0.88,
                    font: 0.87,
                },
                likely_counterfeit: false,
                rationale: String::new(),
            }),
            valuation: Some(PricingPayload {
                valuation: Valuation {
                    low: 90.0,
                    median: 120.0,
                    high: 150.0,
                    confidence: 0.8,
                },
                sources_used: vec!["tcg_portal".into()],
                comps_count: 12,
                summary: String::new(),
            }),
            status: CompletionStatus::Complete,
            completed_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_upsert_and_load_roundtrip() {
        let pool = test_pool().await;
        let record = sample_record("c1");
        let version = upsert_record(&pool, &record).await.unwrap();
        assert_eq!(version, 1);

        let loaded = load_record(&pool, "c1").await.unwrap().unwrap();
        assert_eq!(loaded.version, 1);
        assert_eq!(loaded.identity.name, "Blastoise");
        assert_eq!(loaded.status, CompletionStatus::Complete);
        assert!(loaded.valuation.is_some());
        assert!(loaded.authenticity.is_some());
    }

    #[tokio::test]
    async fn test_upsert_replaces_not_duplicates() {
        let pool = test_pool().await;
        upsert_record(&pool, &sample_record("c2")).await.unwrap();

        let mut second = sample_record("c2");
        second.valuation = None;
        second.status = CompletionStatus::Partial;
        assert_eq!(upsert_record(&pool, &second).await.unwrap(), 2);

        let loaded = load_record(&pool, "c2").await.unwrap().unwrap();
        assert_eq!(loaded.version, 2);
        assert!(loaded.valuation.is_none());
        assert_eq!(loaded.status, CompletionStatus::Partial);

        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM card_records WHERE card_id = 'c2'")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(count, 1);
    }

    #[tokio::test]
    async fn test_retry_of_same_execution_keeps_version() {
        let pool = test_pool().await;
        let record = sample_record("c3");
        assert_eq!(upsert_record(&pool, &record).await.unwrap(), 1);
        // Aggregation-step retries replay the same execution's write
        assert_eq!(upsert_record(&pool, &record).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_writers_get_distinct_versions() {
        let pool = test_pool().await;

        let writer = |pool: SqlitePool| {
            tokio::spawn(async move { upsert_record(&pool, &sample_record("c4")).await.unwrap() })
        };
        let first = writer(pool.clone());
        let second = writer(pool.clone());
        let mut versions = vec![first.await.unwrap(), second.await.unwrap()];
        versions.sort_unstable();
        assert_eq!(versions, vec![1, 2]);

        let loaded = load_record(&pool, "c4").await.unwrap().unwrap();
        assert_eq!(loaded.version, 2);
    }
}
