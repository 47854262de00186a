// # HTTP/SSE surface (§6)
//
// Thin Axum wiring over the core engine: observable, not prescriptive of
// routing — auth, rate limiting, and request validation middleware stay
// out of scope (§1 Non-goals) and are expected to sit in front of this
// router in a real deployment. `AppState` bundles the handles every
// handler needs, passed by `Arc` rather than through a global, the same
// explicit-handle convention `EngineConfig` and the filter cache use.

pub mod batch_handlers;
pub mod error_response;
pub mod handlers;
pub mod include;
pub mod pagination;
pub mod projection;
pub mod sse;

use std::sync::Arc;

use axum::routing::{get, post};
use axum::Router;
use tower_http::cors::CorsLayer;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

use crate::batch::BatchApplyGuard;
use crate::changelog::Changelog;
use crate::config::EngineConfig;
use crate::db::Database;
use crate::filter::FilterCache;
use crate::kv::KvStore;
use crate::metrics::Metrics;
use crate::pipeline::{IdempotencyGuard, MutationPipeline};
use crate::router::EventRouter;
use crate::schema::SchemaRegistry;
use crate::stream::ResumableStreamManager;
use crate::subscription::SubscriptionRegistry;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<EngineConfig>,
    pub schemas: Arc<SchemaRegistry>,
    pub db: Arc<dyn Database>,
    pub kv: Arc<dyn KvStore>,
    pub changelog: Arc<Changelog>,
    pub registry: Arc<SubscriptionRegistry>,
    pub event_router: Arc<EventRouter>,
    pub pipeline: Arc<MutationPipeline>,
    pub stream_manager: Arc<ResumableStreamManager>,
    pub filter_cache: Arc<FilterCache>,
    pub apply_guard: Arc<BatchApplyGuard>,
    pub idempotency: Arc<IdempotencyGuard>,
    pub metrics: Arc<Metrics>,
}

/// Builds the full router: one path group per resource operation (§6 HTTP
/// surface table), wrapped in the teacher's CORS/timeout/trace middleware
/// stack (`main.rs`'s `ServiceBuilder` layering, generalized from a fixed
/// admin API to this resource-agnostic surface).
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(handlers::healthz))
        .route("/metrics", get(handlers::metrics_snapshot))
        .route("/{resource}", get(handlers::list).post(handlers::create))
        .route("/{resource}/count", get(handlers::count))
        .route("/{resource}/aggregate", get(handlers::aggregate))
        .route("/{resource}/subscribe", get(sse::subscribe))
        .route("/{resource}/batch", post(batch_handlers::dry_run))
        .route("/{resource}/batch/apply", post(batch_handlers::apply))
        .route(
            "/{resource}/{id}",
            get(handlers::fetch)
                .put(handlers::replace)
                .patch(handlers::update)
                .delete(handlers::delete),
        )
        .layer(TraceLayer::new_for_http())
        .layer(TimeoutLayer::new(std::time::Duration::from_secs(30)))
        .layer(CorsLayer::permissive())
        .with_state(state)
}
