//! cardvault-engine - Card appraisal orchestration service
//!
//! Accepts card submission requests over HTTP, drives each admitted
//! request through the appraisal workflow (vision feature extraction,
//! concurrent pricing and authenticity analysis, aggregation), and
//! serves the resulting records and an SSE event stream.

use anyhow::Result;
use cardvault_common::config::EngineConfig;
use cardvault_common::events::EventBus;
use cardvault_engine::adapters::{
    AuctionArchiveAdapter, HttpReasoningAdapter, HttpVisionAdapter, TcgPortalAdapter,
};
use cardvault_engine::agents::authenticity::ReferenceCatalog;
use cardvault_engine::agents::{AuthenticityAgent, PricingAgent};
use cardvault_engine::aggregator::Aggregator;
use cardvault_engine::cache::PricingCache;
use cardvault_engine::extraction::FeatureExtractor;
use cardvault_engine::failure::{drain_dead_letters, FailureHandler};
use cardvault_engine::idempotency::IdempotencyGuard;
use cardvault_engine::orchestrator::Orchestrator;
use cardvault_engine::retry::RetryPolicy;
use cardvault_engine::types::{ReasoningAdapter, SourceAdapter};
use cardvault_engine::AppState;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser)]
#[command(name = "cardvault-engine", about = "Card appraisal orchestration service")]
struct Args {
    /// Path to a TOML configuration file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Listen port (overrides config)
    #[arg(long)]
    port: Option<u16>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let subscriber = FmtSubscriber::builder()
        .with_max_level(Level::INFO)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let args = Args::parse();

    let mut config = EngineConfig::load(args.config.as_deref())?;
    if let Some(port) = args.port {
        config.port = port;
    }

    info!("Starting cardvault-engine");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));
    info!("Database: {}", config.database_path.display());

    let pool = cardvault_engine::db::init_database(&config.database_path).await?;
    info!("Database connection established");

    let event_bus = EventBus::new(config.event_capacity);

    let vision = Arc::new(HttpVisionAdapter::new(
        config.vision_base_url.clone(),
        Duration::from_secs(config.extraction_timeout_secs),
    )?);
    let reasoning: Arc<dyn ReasoningAdapter> = Arc::new(HttpReasoningAdapter::new(
        config.reasoning_base_url.clone(),
        Duration::from_secs(config.reasoning_timeout_secs),
    )?);
    let sources: Vec<Arc<dyn SourceAdapter>> = vec![
        Arc::new(TcgPortalAdapter::new(
            config.tcg_portal_base_url.clone(),
            Duration::from_secs(config.source_timeout_secs),
        )?),
        Arc::new(AuctionArchiveAdapter::new(
            config.auction_archive_base_url.clone(),
            Duration::from_secs(config.source_timeout_secs),
        )?),
    ];

    let extractor = Arc::new(FeatureExtractor::new(
        vision,
        Duration::from_secs(config.extraction_timeout_secs),
    ));
    let pricing = Arc::new(PricingAgent::new(
        PricingCache::new(pool.clone(), config.pricing_cache_ttl_secs),
        sources,
        Arc::clone(&reasoning),
        Duration::from_secs(config.source_timeout_secs),
    ));
    let authenticity = Arc::new(AuthenticityAgent::new(
        Arc::new(ReferenceCatalog::new()),
        reasoning,
        config.counterfeit_threshold,
    ));
    let aggregator = Arc::new(Aggregator::new(pool.clone(), event_bus.clone()));
    let (failure, dead_letters) = FailureHandler::new(pool.clone(), event_bus.clone());
    tokio::spawn(drain_dead_letters(dead_letters));

    let orchestrator = Arc::new(Orchestrator::new(
        pool.clone(),
        event_bus.clone(),
        extractor,
        pricing,
        authenticity,
        aggregator,
        Arc::new(failure),
        RetryPolicy::from_config(&config),
    ));

    let guard = IdempotencyGuard::new(pool.clone(), config.idempotency_ttl_secs);
    let state = AppState::new(pool, event_bus, guard, orchestrator);
    let app = cardvault_engine::build_router(state);

    let listener = tokio::net::TcpListener::bind(("127.0.0.1", config.port)).await?;
    info!("Listening on http://127.0.0.1:{}", config.port);
    info!("Health check: http://127.0.0.1:{}/health", config.port);

    axum::serve(listener, app).await?;

    Ok(())
}
