use std::sync::Arc;

use axum::{
    extract::State,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};

use crate::error::AppResult;
use crate::services::bridge::BridgeStatus;
use crate::services::notifications::ClearCredentialsResult;
use crate::services::session::Credentials;
use crate::AppState;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/connect", post(connect))
        .route("/clear", post(clear_credentials))
        .route("/status", get(get_status))
}

// ============================================================================
// Request/Response Types
// ============================================================================

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectRequest {
    #[serde(alias = "username")]
    pub login: String,
    #[serde(alias = "token")]
    pub access_token: String,
    pub client_id: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ClearRequest {
    pub purge_topics: bool,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusResponse {
    pub has_credentials: bool,
    #[serde(flatten)]
    pub status: BridgeStatus,
}

impl From<BridgeStatus> for StatusResponse {
    fn from(status: BridgeStatus) -> Self {
        Self {
            has_credentials: status.login.is_some(),
            status,
        }
    }
}

// ============================================================================
// Handlers
// ============================================================================

async fn connect(
    State(state): State<Arc<AppState>>,
    Json(req): Json<ConnectRequest>,
) -> AppResult<Json<StatusResponse>> {
    let credentials = Credentials::new(&req.login, &req.access_token, &req.client_id);
    let status = state.bridge.connect(credentials).await?;
    Ok(Json(status.into()))
}

async fn clear_credentials(
    State(state): State<Arc<AppState>>,
    Json(req): Json<ClearRequest>,
) -> AppResult<Json<ClearCredentialsResult>> {
    let result = state.bridge.clear_credentials(req.purge_topics).await?;
    Ok(Json(result))
}

async fn get_status(State(state): State<Arc<AppState>>) -> Json<StatusResponse> {
    Json(state.bridge.status().await.into())
}
