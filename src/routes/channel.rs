use std::sync::Arc;

use axum::{extract::State, routing::get, Json, Router};
use serde::Serialize;

use crate::error::{AppError, AppResult};
use crate::services::twitch::{CustomReward, Follower, Subscriber, SubscriberStats};
use crate::AppState;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/stats", get(get_stats))
        .route("/rewards", get(get_rewards))
        .route("/recent", get(get_recent))
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelStats {
    pub viewer_count: Option<u64>,
    pub follower_count: Option<u64>,
    pub subscribers: Option<SubscriberStats>,
}

#[derive(Debug, Serialize)]
pub struct RecentActivity {
    pub followers: Vec<Follower>,
    pub subscribers: Vec<Subscriber>,
}

async fn require_credentials(state: &AppState) -> AppResult<()> {
    if state.bridge.context().has_credentials().await {
        Ok(())
    } else {
        Err(AppError::NotConnected)
    }
}

/// Each figure is independent; one failing lookup leaves only that one null.
async fn get_stats(State(state): State<Arc<AppState>>) -> AppResult<Json<ChannelStats>> {
    require_credentials(&state).await?;
    let api = state.bridge.api();

    let (viewer_count, follower_count, subscribers) = tokio::join!(
        api.viewer_count(),
        api.follower_count(),
        api.subscriber_stats()
    );

    Ok(Json(ChannelStats {
        viewer_count,
        follower_count,
        subscribers,
    }))
}

async fn get_rewards(State(state): State<Arc<AppState>>) -> AppResult<Json<Vec<CustomReward>>> {
    require_credentials(&state).await?;
    Ok(Json(state.bridge.api().channel_rewards().await))
}

async fn get_recent(State(state): State<Arc<AppState>>) -> AppResult<Json<RecentActivity>> {
    require_credentials(&state).await?;
    let api = state.bridge.api();

    let (followers, subscribers) = tokio::join!(api.recent_followers(), api.recent_subscribers());

    Ok(Json(RecentActivity {
        followers: followers.unwrap_or_default(),
        subscribers,
    }))
}
