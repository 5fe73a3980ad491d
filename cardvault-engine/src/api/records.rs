//! Record and execution read endpoints
//!
//! The record store is the single source of truth toward clients: a
//! record with both branches present means full completion, one branch
//! absent means partial. The execution endpoint surfaces outright
//! failures explicitly so a failed submission never looks like
//! indefinite "still processing".

use crate::db::{executions, records};
use crate::error::{ApiError, ApiResult};
use crate::models::WorkflowExecution;
use crate::types::AggregatedResult;
use crate::AppState;
use axum::{
    extract::{Path, State},
    routing::get,
    Json, Router,
};
use uuid::Uuid;

/// GET /cards/:card_id/record
///
/// The persisted aggregated record for a card, 404 until one exists.
pub async fn get_record(
    State(state): State<AppState>,
    Path(card_id): Path<String>,
) -> ApiResult<Json<AggregatedResult>> {
    let record = records::load_record(&state.db, &card_id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("No record for card {}", card_id)))?;
    Ok(Json(record))
}

/// GET /executions/:execution_id
///
/// Execution progress for diagnostics: state, per-step attempts, and
/// the last captured error.
pub async fn get_execution(
    State(state): State<AppState>,
    Path(execution_id): Path<String>,
) -> ApiResult<Json<WorkflowExecution>> {
    let execution_id = Uuid::parse_str(&execution_id)
        .map_err(|e| ApiError::BadRequest(format!("Invalid execution id: {}", e)))?;
    let execution = executions::load_execution(&state.db, execution_id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("No execution {}", execution_id)))?;
    Ok(Json(execution))
}

/// Build record/execution read routes
pub fn record_routes() -> Router<AppState> {
    Router::new()
        .route("/cards/:card_id/record", get(get_record))
        .route("/executions/:execution_id", get(get_execution))
}
