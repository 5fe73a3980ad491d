//! cardvault-engine library interface
//!
//! The orchestration core for collectible-card appraisal: one submitted
//! request becomes a durable workflow execution that extracts visual
//! features, runs pricing and authenticity analysis concurrently, and
//! aggregates both outcomes into a persisted record.

pub mod adapters;
pub mod agents;
pub mod aggregator;
pub mod api;
pub mod cache;
pub mod db;
pub mod error;
pub mod extraction;
pub mod failure;
pub mod idempotency;
pub mod models;
pub mod orchestrator;
pub mod retry;
pub mod types;

pub use crate::error::{ApiError, ApiResult};

use crate::idempotency::IdempotencyGuard;
use crate::orchestrator::Orchestrator;
use axum::Router;
use cardvault_common::events::EventBus;
use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use std::sync::Arc;
use tokio::sync::RwLock;
use tower_http::trace::TraceLayer;

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    /// Database connection pool
    pub db: SqlitePool,
    /// Event bus for SSE broadcasting
    pub event_bus: EventBus,
    /// Idempotency guard over submitted requests
    pub guard: IdempotencyGuard,
    /// Workflow orchestrator driving executions
    pub orchestrator: Arc<Orchestrator>,
    /// Service startup timestamp for uptime tracking
    pub startup_time: DateTime<Utc>,
    /// Last background error for diagnostic purposes
    pub last_error: Arc<RwLock<Option<String>>>,
}

impl AppState {
    pub fn new(
        db: SqlitePool,
        event_bus: EventBus,
        guard: IdempotencyGuard,
        orchestrator: Arc<Orchestrator>,
    ) -> Self {
        Self {
            db,
            event_bus,
            guard,
            orchestrator,
            startup_time: Utc::now(),
            last_error: Arc::new(RwLock::new(None)),
        }
    }
}

/// Build application router
pub fn build_router(state: AppState) -> Router {
    use axum::routing::get;

    Router::new()
        .merge(api::submit_routes())
        .merge(api::record_routes())
        .route("/events", get(api::event_stream))
        .merge(api::health_routes())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
