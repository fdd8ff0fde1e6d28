//! Process wiring for the chat saga coordination core.
//!
//! Builds the sagas, escalation channels and outbox relays from a
//! [`Config`](config::Config), and serves the operational HTTP surface
//! (`/health`, `/metrics`, `/outbox/stats`) with structured logging
//! (tracing) and Prometheus metrics.

pub mod alert;
pub mod config;
pub mod error;
pub mod routes;
pub mod runtime;

use std::sync::Arc;

use axum::Router;
use axum::routing::get;
use metrics_exporter_prometheus::PrometheusHandle;
use store::OutboxReader;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

pub use runtime::ChatRuntime;

/// Shared state of the HTTP handlers.
pub struct AppState {
    pub outbox: Arc<dyn OutboxReader>,
}

/// Creates the Axum application router with all routes and shared state.
pub fn create_app(state: Arc<AppState>, metrics_handle: PrometheusHandle) -> Router {
    let metrics_router = Router::new()
        .route("/metrics", get(routes::metrics::get))
        .with_state(metrics_handle);

    Router::new()
        .route("/health", get(routes::health::check))
        .route("/outbox/stats", get(routes::outbox::stats))
        .with_state(state)
        .merge(metrics_router)
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(TraceLayer::new_for_http())
}
