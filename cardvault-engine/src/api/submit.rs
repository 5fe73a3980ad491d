//! Card submission endpoint
//!
//! The only write entry point: validates the request, runs it through
//! the idempotency guard, and (for fresh admissions) spawns the
//! orchestrator as a detached task. Clients discover completion by
//! polling the record store.

use crate::error::{ApiError, ApiResult};
use crate::idempotency::request_hash;
use crate::models::WorkflowExecution;
use crate::AppState;
use axum::{extract::State, routing::post, Json, Router};
use serde::{Deserialize, Serialize};
use tracing::{error, info};
use uuid::Uuid;

#[derive(Debug, Deserialize)]
pub struct SubmitRequest {
    pub idempotency_key: String,
    pub card_id: String,
    pub image_ref: String,
    #[serde(default)]
    pub force_refresh: bool,
}

#[derive(Debug, Serialize)]
pub struct SubmitResponse {
    /// True when this request started a fresh execution; false when the
    /// idempotency key resolved to an existing one
    pub accepted: bool,
    pub execution_id: Uuid,
}

/// POST /cards/submit
///
/// Admits a create-or-revalue request. Duplicate submissions with the
/// same key and payload resolve to the original execution id; the same
/// key with a different payload is rejected with 409.
pub async fn submit_card(
    State(state): State<AppState>,
    Json(request): Json<SubmitRequest>,
) -> ApiResult<Json<SubmitResponse>> {
    // Malformed requests never enter the workflow
    if request.idempotency_key.trim().is_empty() {
        return Err(ApiError::BadRequest("idempotency_key must not be empty".into()));
    }
    if request.card_id.trim().is_empty() {
        return Err(ApiError::BadRequest("card_id must not be empty".into()));
    }
    if request.image_ref.trim().is_empty() {
        return Err(ApiError::BadRequest("image_ref must not be empty".into()));
    }

    let hash = request_hash(&request.card_id, &request.image_ref, request.force_refresh);
    let admission = state.guard.admit(&request.idempotency_key, &hash).await?;

    if admission.admitted {
        info!(
            execution_id = %admission.execution_id,
            card_id = %request.card_id,
            "Submission admitted, starting execution"
        );
        let execution = WorkflowExecution::new(
            admission.execution_id,
            request.card_id.clone(),
            request.image_ref.clone(),
            request.force_refresh,
        );
        let orchestrator = state.orchestrator.clone();
        let last_error = state.last_error.clone();
        tokio::spawn(async move {
            if let Err(e) = orchestrator.run(execution).await {
                error!("Execution storage failure: {}", e);
                *last_error.write().await = Some(e.to_string());
            }
        });
    } else {
        info!(
            execution_id = %admission.execution_id,
            card_id = %request.card_id,
            "Duplicate submission resolved to existing execution"
        );
    }

    Ok(Json(SubmitResponse {
        accepted: admission.admitted,
        execution_id: admission.execution_id,
    }))
}

/// Build submission routes
pub fn submit_routes() -> Router<AppState> {
    Router::new().route("/cards/submit", post(submit_card))
}
