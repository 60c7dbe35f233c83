use std::convert::Infallible;
use std::sync::Arc;

use axum::{
    extract::{Query, State},
    response::sse::{Event, KeepAlive, Sse},
    routing::{get, post},
    Json, Router,
};
use futures::Stream;
use serde::Deserialize;
use tokio_stream::wrappers::{errors::BroadcastStreamRecvError, BroadcastStream};
use tokio_stream::StreamExt;

use crate::error::{AppError, AppResult};
use crate::services::bridge::FiredEvent;
use crate::services::normalizer::{CanonicalEvent, TestEvent};
use crate::AppState;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/test", post(fire_test_event))
        .route("/recent", get(recent_events))
        .route("/stream", get(stream_notifications))
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RecentQuery {
    pub include_tests: bool,
}

async fn fire_test_event(
    State(state): State<Arc<AppState>>,
    Json(test): Json<TestEvent>,
) -> AppResult<Json<FiredEvent>> {
    if test.event_type.trim().is_empty() {
        return Err(AppError::BadRequest("event type is required".to_string()));
    }
    Ok(Json(state.bridge.fire_test_event(test).await))
}

async fn recent_events(
    State(state): State<Arc<AppState>>,
    Query(query): Query<RecentQuery>,
) -> Json<Vec<CanonicalEvent>> {
    Json(state.bridge.bus().recent_events(query.include_tests))
}

/// Every notification as a named SSE event. Slow clients skip what they
/// missed rather than stall the bus.
async fn stream_notifications(
    State(state): State<Arc<AppState>>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let stream = BroadcastStream::new(state.bridge.bus().subscribe()).filter_map(|item| match item {
        Ok(notification) => match Event::default()
            .event(notification.name())
            .json_data(&notification)
        {
            Ok(event) => Some(Ok(event)),
            Err(e) => {
                tracing::warn!("Could not encode {} notification: {}", notification.name(), e);
                None
            }
        },
        Err(BroadcastStreamRecvError::Lagged(skipped)) => {
            tracing::debug!("SSE client lagged; skipped {} notification(s)", skipped);
            None
        }
    });

    Sse::new(stream).keep_alive(KeepAlive::default())
}

#[cfg(test)]
mod tests {
    use crate::routes::test_support::TestApp;
    use crate::services::normalizer::TestEvent;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use http_body_util::BodyExt;
    use serde_json::json;
    use tower::ServiceExt;

    #[tokio::test]
    async fn test_events_are_flagged_and_hidden_by_default() {
        let app = TestApp::connected().await;
        let (status, fired) = app
            .call(
                "POST",
                "/api/events/test",
                Some(json!({ "type": "channel.raid", "user": "Raider", "payload": { "viewers": 12 } })),
            )
            .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(fired["event"]["kind"], "raid");
        assert_eq!(fired["event"]["isTest"], true);

        let (_, hidden) = app.call("GET", "/api/events/recent", None).await;
        assert_eq!(hidden, json!([]));

        let (_, shown) = app
            .call("GET", "/api/events/recent?includeTests=true", None)
            .await;
        assert_eq!(shown.as_array().unwrap().len(), 1);
        assert_eq!(shown[0]["id"], fired["event"]["id"]);
    }

    #[tokio::test]
    async fn empty_event_type_is_rejected() {
        let app = TestApp::connected().await;
        let (status, _) = app
            .call("POST", "/api/events/test", Some(json!({ "type": " " })))
            .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn stream_delivers_named_notifications() {
        let app = TestApp::connected().await;
        let response = app
            .router()
            .oneshot(
                Request::builder()
                    .uri("/api/events/stream")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()["content-type"], "text/event-stream");

        app.state
            .bridge
            .fire_test_event(TestEvent {
                event_type: "channel.follow".to_string(),
                user: Some("fan".to_string()),
                ..Default::default()
            })
            .await;

        let mut body = response.into_body();
        let frame = tokio::time::timeout(std::time::Duration::from_secs(2), body.frame())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        let text = String::from_utf8(frame.into_data().unwrap().to_vec()).unwrap();
        assert!(text.contains("normalized-event"), "{text}");
        let data = text
            .lines()
            .find_map(|l| l.strip_prefix("data:"))
            .unwrap_or_default()
            .trim();
        tokio_test::assert_ok!(serde_json::from_str::<serde_json::Value>(data));
    }
}
