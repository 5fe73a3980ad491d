//! Result aggregation
//!
//! The synchronization point after both branches terminate. Merges the
//! two branch outcomes into one record, upserts it keyed by card id
//! (so orchestrator-level retries never duplicate rows), and publishes
//! the completion event only after the write lands. The orchestrator
//! guarantees at least one outcome succeeded before calling in; the
//! both-failed path terminates at the failure handler instead.

use crate::db::records;
use crate::types::{
    AggregatedResult, AuthenticityPayload, BranchOutcome, CompletionStatus, FeatureEnvelope,
    PricingPayload, StepError,
};
use cardvault_common::events::{EngineEvent, EventBus};
use chrono::Utc;
use sqlx::SqlitePool;
use tracing::info;
use uuid::Uuid;

pub struct Aggregator {
    pool: SqlitePool,
    event_bus: EventBus,
}

impl Aggregator {
    pub fn new(pool: SqlitePool, event_bus: EventBus) -> Self {
        Self { pool, event_bus }
    }

    /// Merge branch outcomes, persist the record, publish completion
    ///
    /// Unwrapping happens exclusively through [`BranchOutcome::payload`];
    /// a failed branch contributes genuinely absent fields, never zeros
    /// or sentinels. Both outcomes failed is a contract violation the
    /// orchestrator must have intercepted.
    pub async fn aggregate(
        &self,
        execution_id: Uuid,
        card_id: &str,
        envelope: &FeatureEnvelope,
        pricing: &BranchOutcome<PricingPayload>,
        authenticity: &BranchOutcome<AuthenticityPayload>,
    ) -> Result<AggregatedResult, StepError> {
        if !pricing.is_success() && !authenticity.is_success() {
            return Err(StepError::Internal(
                "aggregation invoked with both branches failed".to_string(),
            ));
        }

        let status = if pricing.is_success() && authenticity.is_success() {
            CompletionStatus::Complete
        } else {
            CompletionStatus::Partial
        };

        let mut record = AggregatedResult {
            card_id: card_id.to_string(),
            execution_id,
            version: 0,
            identity: envelope.identity.clone(),
            identification_confidence: envelope.identification_confidence,
            authenticity: authenticity.payload().cloned(),
            valuation: pricing.payload().cloned(),
            status,
            completed_at: Utc::now(),
        };

        // The version is allocated by the write itself, so concurrent
        // executions for the same card never race a read-then-write
        record.version = records::upsert_record(&self.pool, &record)
            .await
            .map_err(|e| StepError::Internal(format!("record upsert: {}", e)))?;

        info!(
            execution_id = %execution_id,
            card_id,
            version = record.version,
            status = ?status,
            "Aggregated record persisted"
        );

        // Publish only after the record is durable; subscribers polling
        // on the event will find the record present
        let _ = self.event_bus.emit(EngineEvent::ExecutionCompleted {
            execution_id,
            card_id: card_id.to_string(),
            status,
            completed_at: record.completed_at,
        });

        Ok(record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_pool;
    use crate::types::{
        BranchKind, CardIdentity, ConditionBucket, ErrorClass, SignalScores, Valuation,
    };
    use std::sync::Arc;

    fn envelope() -> FeatureEnvelope {
        FeatureEnvelope {
            image_ref: "img1".into(),
            identity: CardIdentity {
                name: "Alakazam".into(),
                set_name: "Base Set".into(),
                number: "1/102".into(),
                rarity: "Holo Rare".into(),
                condition: ConditionBucket::NearMint,
            },
            identification_confidence: 0.94,
            ocr_text: "Alakazam".into(),
            holo_variance: 0.6,
            border_score: 0.9,
            font_score: 0.9,
            image_quality: 0.85,
        }
    }

    fn pricing_ok() -> BranchOutcome<PricingPayload> {
        BranchOutcome::succeeded(
            BranchKind::Pricing,
            1,
            PricingPayload {
                valuation: Valuation {
                    low: 80.0,
                    median: 100.0,
                    high: 130.0,
                    confidence: 0.7,
                },
                sources_used: vec!["tcg_portal".into()],
                comps_count: 8,
                summary: String::new(),
            },
        )
    }

    fn authenticity_ok() -> BranchOutcome<AuthenticityPayload> {
        BranchOutcome::succeeded(
            BranchKind::Authenticity,
            1,
            AuthenticityPayload {
                score: 0.9,
                signals: SignalScores {
                    text: 0.9,
                    visual: 0.85,
                    hologram: 0.95,
                    border: 0.9,
                    font: 0.9,
                },
                likely_counterfeit: false,
                rationale: String::new(),
            },
        )
    }

    fn pricing_failed() -> BranchOutcome<PricingPayload> {
        BranchOutcome::failed(
            BranchKind::Pricing,
            3,
            StepError::AllSourcesUnavailable("all down".into()).into_failure(),
        )
    }

    fn authenticity_failed() -> BranchOutcome<AuthenticityPayload> {
        BranchOutcome::failed(
            BranchKind::Authenticity,
            3,
            StepError::Timeout("deadline".into()).into_failure(),
        )
    }

    #[tokio::test]
    async fn test_both_branches_complete() {
        let pool = test_pool().await;
        let bus = EventBus::new(16);
        let mut rx = bus.subscribe();
        let aggregator = Aggregator::new(pool.clone(), bus);

        let execution_id = Uuid::new_v4();
        let record = aggregator
            .aggregate(execution_id, "c1", &envelope(), &pricing_ok(), &authenticity_ok())
            .await
            .unwrap();

        assert_eq!(record.status, CompletionStatus::Complete);
        assert_eq!(record.version, 1);
        assert!(record.valuation.is_some());
        assert!(record.authenticity.is_some());

        let loaded = records::load_record(&pool, "c1").await.unwrap().unwrap();
        assert_eq!(loaded.execution_id, execution_id);

        match rx.recv().await.unwrap() {
            EngineEvent::ExecutionCompleted { status, .. } => {
                assert_eq!(status, CompletionStatus::Complete);
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_failed_pricing_yields_partial_with_absent_valuation() {
        let pool = test_pool().await;
        let bus = EventBus::new(16);
        let mut rx = bus.subscribe();
        let aggregator = Aggregator::new(pool, bus);

        let record = aggregator
            .aggregate(Uuid::new_v4(), "c2", &envelope(), &pricing_failed(), &authenticity_ok())
            .await
            .unwrap();

        assert_eq!(record.status, CompletionStatus::Partial);
        assert!(record.valuation.is_none());
        assert!(record.authenticity.is_some());
        assert_eq!(pricing_failed().failure().unwrap().class, ErrorClass::Transient);

        match rx.recv().await.unwrap() {
            EngineEvent::ExecutionCompleted { status, .. } => {
                assert_eq!(status, CompletionStatus::Partial);
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_revalue_bumps_version_without_duplicating_rows() {
        let pool = test_pool().await;
        let aggregator = Aggregator::new(pool.clone(), EventBus::new(16));

        aggregator
            .aggregate(Uuid::new_v4(), "c3", &envelope(), &pricing_ok(), &authenticity_ok())
            .await
            .unwrap();
        let second = aggregator
            .aggregate(Uuid::new_v4(), "c3", &envelope(), &pricing_ok(), &authenticity_failed())
            .await
            .unwrap();

        assert_eq!(second.version, 2);
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM card_records WHERE card_id = 'c3'")
                .fetch_one(&pool)
                .await
                .unwrap();
        assert_eq!(count, 1);
    }

    #[tokio::test]
    async fn test_concurrent_revalues_allocate_distinct_versions() {
        let pool = test_pool().await;
        let aggregator = Arc::new(Aggregator::new(pool.clone(), EventBus::new(16)));

        let revalue = |agg: Arc<Aggregator>| {
            tokio::spawn(async move {
                agg.aggregate(Uuid::new_v4(), "c5", &envelope(), &pricing_ok(), &authenticity_ok())
                    .await
                    .unwrap()
                    .version
            })
        };
        let first = revalue(Arc::clone(&aggregator));
        let second = revalue(aggregator);

        let mut versions = vec![first.await.unwrap(), second.await.unwrap()];
        versions.sort_unstable();
        assert_eq!(versions, vec![1, 2]);

        let loaded = records::load_record(&pool, "c5").await.unwrap().unwrap();
        assert_eq!(loaded.version, 2);
    }

    #[tokio::test]
    async fn test_both_failed_is_rejected() {
        let aggregator = Aggregator::new(test_pool().await, EventBus::new(16));
        let err = aggregator
            .aggregate(
                Uuid::new_v4(),
                "c4",
                &envelope(),
                &pricing_failed(),
                &authenticity_failed(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, StepError::Internal(_)));
    }
}
