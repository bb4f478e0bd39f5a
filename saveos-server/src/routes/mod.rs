pub mod agents;
pub mod backup;
pub mod jobs;
pub mod middleware;
pub mod system;

use crate::state::AppState;
use axum::routing::get;
use axum::Router;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .nest("/api/v1/agents", agents::router(state.clone()))
        .nest("/api/v1/backup", backup::router(state.clone()))
        .nest("/api/v1/jobs", jobs::router(state.clone()))
        .route("/health", get(system::health))
        .route("/metrics", get(system::metrics))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}
