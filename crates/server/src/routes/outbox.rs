//! Outbox backlog endpoint.

use std::sync::Arc;

use axum::Json;
use axum::extract::State;
use serde::Serialize;

use crate::AppState;
use crate::error::ApiError;

#[derive(Debug, Serialize)]
pub struct OutboxStats {
    /// Rows neither path has relayed yet.
    pub unprocessed: u64,
}

/// GET /outbox/stats
pub async fn stats(State(state): State<Arc<AppState>>) -> Result<Json<OutboxStats>, ApiError> {
    let unprocessed = state.outbox.count_unprocessed().await?;
    metrics::gauge!("outbox_unprocessed").set(unprocessed as f64);
    Ok(Json(OutboxStats { unprocessed }))
}
