use std::sync::Arc;

use axum::{routing::get, Router};

use crate::AppState;

pub mod channel;
pub mod events;
pub mod health;
pub mod mappings;
pub mod subscriptions;
pub mod topics;
pub mod twitch;
pub mod users;

/// The control API without transport middleware.
pub fn app(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health::health_check))
        .nest("/api/twitch", twitch::router())
        .nest("/api/topics", topics::router())
        .nest("/api/subscriptions", subscriptions::router())
        .nest("/api/channel", channel::router())
        .nest("/api/users", users::router())
        .nest("/api/mappings", mappings::router())
        .nest("/api/events", events::router())
        .with_state(state)
}
