use std::sync::Arc;

use axum::{extract::State, http::StatusCode, response::IntoResponse, Json};
use serde::Serialize;

use crate::services::eventsub::SessionState;
use crate::AppState;

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub timestamp: String,
    pub has_credentials: bool,
    pub eventsub: SessionState,
}

/// Liveness of the process itself; Twitch being unreachable is not unhealthy.
pub async fn health_check(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let status = state.bridge.status().await;
    let response = HealthResponse {
        status: "healthy".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        timestamp: chrono::Utc::now().to_rfc3339(),
        has_credentials: status.login.is_some(),
        eventsub: status.eventsub,
    };

    (StatusCode::OK, Json(response))
}
