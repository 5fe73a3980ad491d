//! Workflow orchestrator
//!
//! Drives one execution through the state machine:
//! STARTED → EXTRACTING → (EXTRACTION_FAILED | BRANCHES_RUNNING) →
//! AGGREGATING → (COMPLETED | FAILED)
//!
//! Each execution is an independent unit of work; many run concurrently
//! and share nothing mutable except the pricing cache and the
//! idempotency store, both behind the database. The execution record is
//! persisted on every transition. A permanent extraction failure
//! short-circuits before any branch task is started; there is no
//! mid-branch cancellation, branches run to their own bounded
//! completion.

use crate::agents::{AuthenticityAgent, PricingAgent};
use crate::aggregator::Aggregator;
use crate::db::executions;
use crate::extraction::FeatureExtractor;
use crate::failure::FailureHandler;
use crate::models::{WorkflowExecution, WorkflowState};
use crate::retry::{run_with_retry, RetryPolicy};
use crate::types::{
    AuthenticityPayload, BranchKind, BranchOutcome, FeatureEnvelope, PricingPayload,
};
use cardvault_common::events::{EngineEvent, EventBus};
use cardvault_common::Result;
use chrono::Utc;
use sqlx::SqlitePool;
use std::sync::Arc;
use tracing::info;

pub struct Orchestrator {
    pool: SqlitePool,
    event_bus: EventBus,
    extractor: Arc<FeatureExtractor>,
    pricing: Arc<PricingAgent>,
    authenticity: Arc<AuthenticityAgent>,
    aggregator: Arc<Aggregator>,
    failure: Arc<FailureHandler>,
    retry: RetryPolicy,
}

impl Orchestrator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        pool: SqlitePool,
        event_bus: EventBus,
        extractor: Arc<FeatureExtractor>,
        pricing: Arc<PricingAgent>,
        authenticity: Arc<AuthenticityAgent>,
        aggregator: Arc<Aggregator>,
        failure: Arc<FailureHandler>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            pool,
            event_bus,
            extractor,
            pricing,
            authenticity,
            aggregator,
            failure,
            retry,
        }
    }

    /// Drive an execution from admission to a terminal state
    ///
    /// Always leaves the execution record in a terminal state; the
    /// returned error covers only storage failures, never workflow
    /// failures (those terminate in `Failed` with an audit trail).
    pub async fn run(&self, mut exec: WorkflowExecution) -> Result<WorkflowExecution> {
        info!(
            execution_id = %exec.execution_id,
            card_id = %exec.card_id,
            "Starting workflow execution"
        );
        executions::save_execution(&self.pool, &exec).await?;
        let _ = self.event_bus.emit(EngineEvent::ExecutionStarted {
            execution_id: exec.execution_id,
            card_id: exec.card_id.clone(),
            timestamp: Utc::now(),
        });

        // ---- Extraction ----
        exec.transition_to(WorkflowState::Extracting);
        exec.current_step = Some("extraction".to_string());
        executions::save_execution(&self.pool, &exec).await?;

        let extraction = run_with_retry("extraction", &self.retry, || {
            self.extractor.extract(&exec.image_ref)
        })
        .await;
        let envelope = match extraction {
            Ok(retried) => {
                exec.attempts.extraction = retried.attempts;
                retried.value
            }
            Err(exhausted) => {
                exec.attempts.extraction = exhausted.attempts;
                exec.last_error = Some(exhausted.error.to_string());
                exec.transition_to(WorkflowState::ExtractionFailed);
                executions::save_execution(&self.pool, &exec).await?;
                return self
                    .fail_execution(exec, "extraction", &exhausted.error.to_string())
                    .await;
            }
        };

        let _ = self.event_bus.emit(EngineEvent::ExtractionCompleted {
            execution_id: exec.execution_id,
            card_id: exec.card_id.clone(),
            timestamp: Utc::now(),
        });

        // ---- Parallel branches ----
        exec.transition_to(WorkflowState::BranchesRunning);
        exec.current_step = Some("branches".to_string());
        executions::save_execution(&self.pool, &exec).await?;

        let (pricing_outcome, authenticity_outcome) =
            self.run_branches(&envelope, exec.force_refresh).await;

        exec.attempts.pricing = pricing_outcome.attempts;
        exec.attempts.authenticity = authenticity_outcome.attempts;
        for (branch, success, attempts) in [
            (
                BranchKind::Pricing,
                pricing_outcome.is_success(),
                pricing_outcome.attempts,
            ),
            (
                BranchKind::Authenticity,
                authenticity_outcome.is_success(),
                authenticity_outcome.attempts,
            ),
        ] {
            let _ = self.event_bus.emit(EngineEvent::BranchCompleted {
                execution_id: exec.execution_id,
                branch,
                success,
                attempts,
                timestamp: Utc::now(),
            });
        }

        if !pricing_outcome.is_success() && !authenticity_outcome.is_success() {
            let detail = format!(
                "pricing: {}; authenticity: {}",
                pricing_outcome.failure().map(|f| f.error.as_str()).unwrap_or("?"),
                authenticity_outcome.failure().map(|f| f.error.as_str()).unwrap_or("?"),
            );
            exec.last_error = Some(detail.clone());
            return self.fail_execution(exec, "branches", &detail).await;
        }

        // ---- Aggregation ----
        exec.transition_to(WorkflowState::Aggregating);
        exec.current_step = Some("aggregation".to_string());
        executions::save_execution(&self.pool, &exec).await?;

        let aggregation = run_with_retry("aggregation", &self.retry, || {
            self.aggregator.aggregate(
                exec.execution_id,
                &exec.card_id,
                &envelope,
                &pricing_outcome,
                &authenticity_outcome,
            )
        })
        .await;
        match aggregation {
            Ok(retried) => {
                exec.attempts.aggregation = retried.attempts;
                exec.transition_to(WorkflowState::Completed);
                executions::save_execution(&self.pool, &exec).await?;
                info!(
                    execution_id = %exec.execution_id,
                    card_id = %exec.card_id,
                    status = ?retried.value.status,
                    "Workflow execution completed"
                );
                Ok(exec)
            }
            Err(exhausted) => {
                exec.attempts.aggregation = exhausted.attempts;
                exec.last_error = Some(exhausted.error.to_string());
                self.fail_execution(exec, "aggregation", &exhausted.error.to_string())
                    .await
            }
        }
    }

    /// Run both analysis branches as concurrent tasks and join them
    ///
    /// Each branch owns its retry loop; a panic in a branch task is
    /// captured as an internal failure rather than unwinding the
    /// orchestrator.
    async fn run_branches(
        &self,
        envelope: &FeatureEnvelope,
        force_refresh: bool,
    ) -> (
        BranchOutcome<PricingPayload>,
        BranchOutcome<AuthenticityPayload>,
    ) {
        let pricing_task = {
            let agent = Arc::clone(&self.pricing);
            let envelope = envelope.clone();
            let retry = self.retry;
            tokio::spawn(async move {
                let result = run_with_retry("pricing", &retry, || {
                    agent.price(&envelope.identity, &envelope, force_refresh)
                })
                .await;
                match result {
                    Ok(r) => BranchOutcome::succeeded(BranchKind::Pricing, r.attempts, r.value),
                    Err(e) => BranchOutcome::failed(
                        BranchKind::Pricing,
                        e.attempts,
                        e.error.into_failure(),
                    ),
                }
            })
        };

        let authenticity_task = {
            let agent = Arc::clone(&self.authenticity);
            let envelope = envelope.clone();
            let retry = self.retry;
            tokio::spawn(async move {
                let result =
                    run_with_retry("authenticity", &retry, || agent.assess(&envelope)).await;
                match result {
                    Ok(r) => {
                        BranchOutcome::succeeded(BranchKind::Authenticity, r.attempts, r.value)
                    }
                    Err(e) => BranchOutcome::failed(
                        BranchKind::Authenticity,
                        e.attempts,
                        e.error.into_failure(),
                    ),
                }
            })
        };

        let (pricing, authenticity) = tokio::join!(pricing_task, authenticity_task);

        let pricing = pricing.unwrap_or_else(|e| {
            BranchOutcome::failed(
                BranchKind::Pricing,
                0,
                crate::types::StepError::Internal(format!("pricing task panicked: {}", e))
                    .into_failure(),
            )
        });
        let authenticity = authenticity.unwrap_or_else(|e| {
            BranchOutcome::failed(
                BranchKind::Authenticity,
                0,
                crate::types::StepError::Internal(format!("authenticity task panicked: {}", e))
                    .into_failure(),
            )
        });

        (pricing, authenticity)
    }

    /// Close an execution as Failed with a durable audit trail
    async fn fail_execution(
        &self,
        mut exec: WorkflowExecution,
        step: &str,
        error_text: &str,
    ) -> Result<WorkflowExecution> {
        exec.transition_to(WorkflowState::Failed);
        executions::save_execution(&self.pool, &exec).await?;
        self.failure
            .handle_terminal_failure(&exec, step, error_text)
            .await?;
        Ok(exec)
    }
}
