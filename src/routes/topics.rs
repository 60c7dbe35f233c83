use std::collections::BTreeSet;
use std::sync::Arc;

use axum::{extract::State, routing::get, Json, Router};
use serde::{Deserialize, Serialize};

use crate::db::models::TopicKey;
use crate::db::TopicConfigRepository;
use crate::error::{AppError, AppResult};
use crate::services::subscriptions::ReconcileReport;
use crate::AppState;

pub fn router() -> Router<Arc<AppState>> {
    Router::new().route("/", get(get_topics).put(set_topics))
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TopicView {
    pub key: TopicKey,
    pub subscription_type: &'static str,
    pub enabled: bool,
}

#[derive(Debug, Serialize)]
pub struct TopicsResponse {
    pub topics: Vec<TopicView>,
}

#[derive(Debug, Deserialize)]
pub struct SetTopicsRequest {
    pub topics: Vec<String>,
}

#[derive(Debug, Serialize)]
pub struct SetTopicsResponse {
    pub topics: BTreeSet<TopicKey>,
    pub reconcile: ReconcileReport,
}

async fn get_topics(State(state): State<Arc<AppState>>) -> Json<TopicsResponse> {
    let enabled = TopicConfigRepository::get(&state.bridge.context().topics)
        .await
        .topics;

    Json(TopicsResponse {
        topics: TopicKey::ALL
            .iter()
            .map(|key| TopicView {
                key: *key,
                subscription_type: key.subscription_type(),
                enabled: enabled.contains(key),
            })
            .collect(),
    })
}

/// Replace the desired topic set and reconcile. Unknown names reject the
/// whole request so a typo never silently drops a topic.
async fn set_topics(
    State(state): State<Arc<AppState>>,
    Json(req): Json<SetTopicsRequest>,
) -> AppResult<Json<SetTopicsResponse>> {
    let mut topics = BTreeSet::new();
    for raw in &req.topics {
        let key = TopicKey::parse(raw)
            .ok_or_else(|| AppError::BadRequest(format!("Unknown topic: {}", raw)))?;
        topics.insert(key);
    }

    let reconcile = state.bridge.set_desired_topics(topics.clone()).await?;
    Ok(Json(SetTopicsResponse { topics, reconcile }))
}
