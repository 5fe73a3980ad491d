//! Integration tests for the cardvault-engine HTTP API

use axum::{
    body::Body,
    http::{Request, StatusCode},
};
use cardvault_common::events::EventBus;
use cardvault_engine::agents::authenticity::ReferenceCatalog;
use cardvault_engine::agents::{AuthenticityAgent, PricingAgent};
use cardvault_engine::aggregator::Aggregator;
use cardvault_engine::cache::PricingCache;
use cardvault_engine::db;
use cardvault_engine::extraction::FeatureExtractor;
use cardvault_engine::failure::FailureHandler;
use cardvault_engine::idempotency::IdempotencyGuard;
use cardvault_engine::orchestrator::Orchestrator;
use cardvault_engine::retry::RetryPolicy;
use cardvault_engine::types::{
    CardIdentity, ComparableSale, ConditionBucket, FeatureEnvelope, ReasoningAdapter,
    SourceAdapter, StepError, VisionAdapter,
};
use cardvault_engine::AppState;
use chrono::Utc;
use http_body_util::BodyExt;
use serde_json::{json, Value};
use std::result::Result;
use std::sync::Arc;
use std::time::Duration;
use tower::util::ServiceExt;

struct TestVision;

#[async_trait::async_trait]
impl VisionAdapter for TestVision {
    async fn extract(&self, image_ref: &str) -> Result<FeatureEnvelope, StepError> {
        Ok(FeatureEnvelope {
            image_ref: image_ref.to_string(),
            identity: CardIdentity {
                name: "Mewtwo".into(),
                set_name: "Base Set".into(),
                number: "10/102".into(),
                rarity: "Holo Rare".into(),
                condition: ConditionBucket::NearMint,
            },
            identification_confidence: 0.95,
            ocr_text: "Mewtwo 60 HP Psychic".into(),
            holo_variance: 0.5,
            border_score: 0.9,
            font_score: 0.9,
            image_quality: 0.85,
        })
    }
}

struct TestSource;

#[async_trait::async_trait]
impl SourceAdapter for TestSource {
    fn name(&self) -> &'static str {
        "test_source"
    }

    async fn fetch_comparables(
        &self,
        _identity: &CardIdentity,
    ) -> Result<Vec<ComparableSale>, StepError> {
        Ok([120.0, 130.0, 125.0]
            .iter()
            .map(|&price| ComparableSale {
                price,
                date: Utc::now(),
                condition: "near_mint".into(),
                source_name: "test_source".into(),
            })
            .collect())
    }
}

struct TestReasoning;

#[async_trait::async_trait]
impl ReasoningAdapter for TestReasoning {
    async fn infer(&self, _prompt: &str) -> Result<String, StepError> {
        Ok("summary".into())
    }
}

/// Test helper: create a test app backed by a temporary database
async fn create_test_app() -> (axum::Router, sqlx::SqlitePool, tempfile::TempDir) {
    let dir = tempfile::tempdir().expect("tempdir");
    let pool = db::init_database(&dir.path().join("test.db"))
        .await
        .expect("init database");

    let event_bus = EventBus::new(64);
    let reasoning: Arc<dyn ReasoningAdapter> = Arc::new(TestReasoning);
    let pricing = Arc::new(PricingAgent::new(
        PricingCache::new(pool.clone(), 86_400),
        vec![Arc::new(TestSource) as Arc<dyn SourceAdapter>],
        Arc::clone(&reasoning),
        Duration::from_secs(5),
    ));
    let authenticity = Arc::new(AuthenticityAgent::new(
        Arc::new(ReferenceCatalog::new()),
        reasoning,
        0.5,
    ));
    let aggregator = Arc::new(Aggregator::new(pool.clone(), event_bus.clone()));
    let (failure, _dead_letters) = FailureHandler::new(pool.clone(), event_bus.clone());
    let orchestrator = Arc::new(Orchestrator::new(
        pool.clone(),
        event_bus.clone(),
        Arc::new(FeatureExtractor::new(Arc::new(TestVision), Duration::from_secs(5))),
        pricing,
        authenticity,
        aggregator,
        Arc::new(failure),
        RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
        },
    ));
    let guard = IdempotencyGuard::new(pool.clone(), 600);

    let state = AppState::new(pool.clone(), event_bus, guard, orchestrator);
    (cardvault_engine::build_router(state), pool, dir)
}

fn submit_request(body: Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri("/cards/submit")
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

async fn response_json(response: axum::response::Response) -> Value {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}

/// Poll the record endpoint until the background execution lands
async fn wait_for_record(app: &axum::Router, card_id: &str) -> Value {
    for _ in 0..100 {
        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .uri(format!("/cards/{}/record", card_id))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        if response.status() == StatusCode::OK {
            return response_json(response).await;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("record for {} never appeared", card_id);
}

#[tokio::test]
async fn test_health_endpoint() {
    let (app, _pool, _dir) = create_test_app().await;

    let response = app
        .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let body = response_json(response).await;
    assert_eq!(body["status"], "ok");
    assert_eq!(body["module"], "cardvault-engine");
}

#[tokio::test]
async fn test_submit_rejects_malformed_request() {
    let (app, pool, _dir) = create_test_app().await;

    let response = app
        .oneshot(submit_request(json!({
            "idempotency_key": "abc",
            "card_id": "",
            "image_ref": "img1",
        })))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    // A rejected request never enters the workflow
    let count = db::executions::count_executions_for_card(&pool, "").await.unwrap();
    assert_eq!(count, 0);
}

#[tokio::test]
async fn test_submit_and_poll_record() {
    let (app, _pool, _dir) = create_test_app().await;

    let response = app
        .clone()
        .oneshot(submit_request(json!({
            "idempotency_key": "abc",
            "card_id": "c1",
            "image_ref": "img1",
        })))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = response_json(response).await;
    assert_eq!(body["accepted"], true);
    let execution_id = body["execution_id"].as_str().unwrap().to_string();

    let record = wait_for_record(&app, "c1").await;
    assert_eq!(record["status"], "complete");
    assert_eq!(record["execution_id"].as_str().unwrap(), execution_id);
    assert!(record["authenticity"]["score"].as_f64().unwrap() > 0.0);
    assert_eq!(record["valuation"]["valuation"]["median"], 125.0);

    // Execution record reaches its terminal state (the record lands
    // just before the final transition is saved, so poll briefly)
    let mut state = Value::Null;
    for _ in 0..100 {
        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .uri(format!("/executions/{}", execution_id))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        state = response_json(response).await["state"].clone();
        if state == "COMPLETED" {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(state, "COMPLETED");
}

#[tokio::test]
async fn test_duplicate_submission_resolves_to_same_execution() {
    let (app, pool, _dir) = create_test_app().await;

    let request = json!({
        "idempotency_key": "dup",
        "card_id": "c2",
        "image_ref": "img1",
    });

    let first = response_json(
        app.clone().oneshot(submit_request(request.clone())).await.unwrap(),
    )
    .await;
    let second = response_json(app.clone().oneshot(submit_request(request)).await.unwrap()).await;

    assert_eq!(first["accepted"], true);
    assert_eq!(second["accepted"], false);
    assert_eq!(first["execution_id"], second["execution_id"]);

    wait_for_record(&app, "c2").await;
    let count = db::executions::count_executions_for_card(&pool, "c2").await.unwrap();
    assert_eq!(count, 1, "exactly one execution for the duplicated key");
}

#[tokio::test]
async fn test_key_reuse_with_different_payload_conflicts() {
    let (app, _pool, _dir) = create_test_app().await;

    let first = app
        .clone()
        .oneshot(submit_request(json!({
            "idempotency_key": "reused",
            "card_id": "c3",
            "image_ref": "img1",
        })))
        .await
        .unwrap();
    assert_eq!(first.status(), StatusCode::OK);

    let second = app
        .clone()
        .oneshot(submit_request(json!({
            "idempotency_key": "reused",
            "card_id": "c4",
            "image_ref": "img9",
        })))
        .await
        .unwrap();
    assert_eq!(second.status(), StatusCode::CONFLICT);
    let body = response_json(second).await;
    assert_eq!(body["error"]["code"], "DUPLICATE_KEY_CONFLICT");
}

#[tokio::test]
async fn test_missing_record_returns_404() {
    let (app, _pool, _dir) = create_test_app().await;

    let response = app
        .oneshot(
            Request::builder()
                .uri("/cards/nope/record")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_unknown_execution_returns_404() {
    let (app, _pool, _dir) = create_test_app().await;

    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .uri(format!("/executions/{}", uuid::Uuid::new_v4()))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    let response = app
        .oneshot(
            Request::builder()
                .uri("/executions/not-a-uuid")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}
