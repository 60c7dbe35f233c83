use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::{get, post, put},
    Json, Router,
};
use serde::Deserialize;

use crate::db::models::{Mapping, MappingInput, MappingRejection};
use crate::db::MappingRepository;
use crate::error::AppResult;
use crate::services::bridge::FiredEvent;
use crate::services::normalizer::TestEvent;
use crate::AppState;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/", get(list_mappings).post(create_mapping))
        .route("/:id", put(update_mapping).delete(delete_mapping))
        .route("/:id/test", post(test_mapping))
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct TestMappingRequest {
    pub user: Option<String>,
    pub test_requirement: Option<String>,
}

/// Push the stored list into the engine after every write.
async fn sync_engine(state: &AppState) {
    let mappings = MappingRepository::list(&state.mappings).await;
    state.bridge.engine().reload(mappings).await;
}

async fn list_mappings(State(state): State<Arc<AppState>>) -> Json<Vec<Mapping>> {
    Json(MappingRepository::list(&state.mappings).await)
}

async fn create_mapping(
    State(state): State<Arc<AppState>>,
    Json(input): Json<MappingInput>,
) -> AppResult<(StatusCode, Json<Mapping>)> {
    let mapping = MappingRepository::create(&state.mappings, input).await?;
    sync_engine(&state).await;
    tracing::info!("Created {:?} mapping {}", mapping.mapping_type, mapping.id);
    Ok((StatusCode::CREATED, Json(mapping)))
}

async fn update_mapping(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(input): Json<MappingInput>,
) -> AppResult<Json<Mapping>> {
    let mapping = MappingRepository::update(&state.mappings, &id, input).await?;
    sync_engine(&state).await;
    Ok(Json(mapping))
}

async fn delete_mapping(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> AppResult<StatusCode> {
    MappingRepository::delete(&state.mappings, &id).await?;
    sync_engine(&state).await;
    Ok(StatusCode::NO_CONTENT)
}

/// Fire a synthetic event built from the mapping through the live pipeline.
async fn test_mapping(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(req): Json<TestMappingRequest>,
) -> AppResult<Json<FiredEvent>> {
    let mapping = MappingRepository::find_by_id(&state.mappings, &id)
        .await
        .ok_or(MappingRejection::NotFound(id))?;

    let test = TestEvent::for_mapping(
        &mapping,
        req.user.as_deref(),
        req.test_requirement.as_deref(),
    );
    Ok(Json(state.bridge.fire_test_event(test).await))
}
