//! Process entry point: init tracing, load config, wire the in-memory
//! reference substrate into an `AppState`, and serve the HTTP/SSE router.
//! Mirrors the teacher's `main.rs` init-flow shape (logging first, then
//! config, then subsystems, then serve) without its startup banner, which
//! doesn't carry over to a library-first crate meant to be embedded.

use std::sync::Arc;

use livequery_engine::api::{self, AppState};
use livequery_engine::batch::BatchApplyGuard;
use livequery_engine::changelog::Changelog;
use livequery_engine::config::EngineConfig;
use livequery_engine::db::{Database, InMemoryDb};
use livequery_engine::filter::FilterCache;
use livequery_engine::kv::{self, KvStore};
use livequery_engine::metrics::Metrics;
use livequery_engine::pipeline::{IdempotencyGuard, MutationPipeline};
use livequery_engine::router::EventRouter;
use livequery_engine::schema::{FieldType, ResourceSchema, SchemaRegistry};
use livequery_engine::stream::ResumableStreamManager;
use livequery_engine::subscription::SubscriptionRegistry;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_target(false)
        .with_env_filter(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    tracing::info!(version = livequery_engine::VERSION, "starting livequery-engine");

    let config = Arc::new(EngineConfig::from_env());

    let db: Arc<dyn Database> = Arc::new(InMemoryDb::new());
    let kv: Arc<dyn KvStore> = kv::in_memory();
    let changelog = Arc::new(Changelog::new(config.changelog_retention));
    let registry = Arc::new(SubscriptionRegistry::new());
    let event_router = Arc::new(EventRouter::new(registry.clone(), kv.clone()));
    let pipeline = Arc::new(MutationPipeline::new(db.clone(), changelog.clone(), event_router.clone()));
    let stream_manager = Arc::new(ResumableStreamManager::new(
        registry.clone(),
        event_router.clone(),
        changelog.clone(),
        db.clone(),
        config.clone(),
    ));
    let filter_cache = Arc::new(FilterCache::new(config.filter_cache_capacity));
    let apply_guard = Arc::new(BatchApplyGuard::new(kv.clone()));
    let idempotency = Arc::new(IdempotencyGuard::new(kv.clone(), 24 * 3600));
    let metrics = Arc::new(Metrics::new());

    let schemas = Arc::new(demo_schema_registry());

    let state = AppState {
        config,
        schemas,
        db,
        kv,
        changelog,
        registry,
        event_router,
        pipeline,
        stream_manager,
        filter_cache,
        apply_guard,
        idempotency,
        metrics,
    };

    let app = api::router(state);

    let addr = std::env::var("LQ_LISTEN_ADDR").unwrap_or_else(|_| "0.0.0.0:8080".to_string());
    tracing::info!(%addr, "listening");

    let listener = match tokio::net::TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(e) => {
            tracing::error!(error = %e, %addr, "failed to bind listener");
            std::process::exit(1);
        }
    };

    if let Err(e) = axum::serve(listener, app).await {
        tracing::error!(error = %e, "server stopped with error");
    } else {
        tracing::info!("server stopped gracefully");
    }
}

/// A placeholder resource registered so the server is immediately
/// exercisable; a real deployment registers its own schemas before
/// building `AppState` (schema definition from an external source is out
/// of scope, SPEC_FULL.md §1 Non-goals).
fn demo_schema_registry() -> SchemaRegistry {
    let mut registry = SchemaRegistry::new();
    registry.register(
        ResourceSchema::new("widgets", "id")
            .with_field("id", FieldType::String)
            .with_field("name", FieldType::String)
            .with_field("status", FieldType::String)
            .with_field("score", FieldType::Number)
            .with_field("created_at", FieldType::Timestamp),
    );
    registry
}
