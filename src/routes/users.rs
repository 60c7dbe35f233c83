use std::sync::Arc;

use axum::{
    extract::{Path, State},
    routing::get,
    Json, Router,
};

use crate::error::{AppError, AppResult};
use crate::services::bridge::UserChecks;
use crate::AppState;

pub fn router() -> Router<Arc<AppState>> {
    Router::new().route("/:login/checks", get(get_checks))
}

async fn get_checks(
    State(state): State<Arc<AppState>>,
    Path(login): Path<String>,
) -> AppResult<Json<UserChecks>> {
    if login.trim().trim_start_matches('@').is_empty() {
        return Err(AppError::BadRequest("login is required".to_string()));
    }
    Ok(Json(state.bridge.user_checks(&login).await?))
}
