//! Health check handler.
//!
//! The probe target for the supervisor's health loop and the client's
//! server-online detection. Must answer 200 even in degraded state, so it
//! touches no storage.

use axum::{Json, extract::State};
use chrono::Utc;

use crate::models::HealthResponse;
use crate::state::AppState;

/// GET /health
pub async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        uptime_secs: state.started_at.elapsed().as_secs(),
        timestamp: Utc::now(),
    })
}
