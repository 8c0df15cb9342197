//! Operator control and status API

use std::sync::Arc;

use axum::{
    routing::{get, post},
    Router,
};
use tower_http::trace::TraceLayer;

use crate::service::LineService;

pub mod handlers;

/// Shared state behind every handler
#[derive(Clone)]
pub struct AppState {
    pub service: Arc<LineService>,
}

pub fn create_api_routes(service: Arc<LineService>) -> Router {
    let state = AppState { service };

    Router::new()
        .route("/health", get(handlers::health_check))
        .route("/api/status", get(handlers::get_status))
        .route("/api/workflow/start", post(handlers::start_workflow))
        .route("/api/workflow/reset", post(handlers::reset_workflow))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
