use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::{delete, get},
    Json, Router,
};
use serde::Serialize;

use crate::error::{AppError, AppResult};
use crate::services::twitch::{DeleteOutcome, SubscriptionDescriptor};
use crate::AppState;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/", get(list_subscriptions))
        .route("/:id", delete(delete_subscription))
}

#[derive(Debug, Serialize)]
pub struct SubscriptionRow {
    #[serde(flatten)]
    pub subscription: SubscriptionDescriptor,
    pub owned: bool,
}

async fn list_subscriptions(
    State(state): State<Arc<AppState>>,
) -> AppResult<Json<Vec<SubscriptionRow>>> {
    if !state.bridge.context().has_credentials().await {
        return Err(AppError::NotConnected);
    }

    let rows = state
        .bridge
        .subscriptions()
        .list_with_ownership()
        .await
        .into_iter()
        .map(|(subscription, owned)| SubscriptionRow {
            subscription,
            owned,
        })
        .collect();
    Ok(Json(rows))
}

/// Only subscriptions this process created may be removed from here.
async fn delete_subscription(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> AppResult<StatusCode> {
    let ctx = state.bridge.context();
    if !ctx.has_credentials().await {
        return Err(AppError::NotConnected);
    }
    if !ctx.owned_subscription_ids().await.contains(&id) {
        return Err(AppError::NotFound(format!("No owned subscription {}", id)));
    }

    match state.bridge.subscriptions().delete_owned(&id).await? {
        DeleteOutcome::Failed(e) => Err(AppError::TwitchApi(e)),
        _ => Ok(StatusCode::NO_CONTENT),
    }
}
