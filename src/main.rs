use std::sync::Arc;
use std::time::Duration;

use http::HeaderValue;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, Layer};

mod config;
mod db;
mod error;
mod routes;
mod services;

use config::Config;
use db::MappingStore;
use services::{bridge::TwitchBridge, init};

pub struct AppState {
    pub config: Config,
    pub bridge: Arc<TwitchBridge>,
    pub mappings: Arc<MappingStore>,
}

fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "soundboard_twitch_bridge=debug,tower_http=info".into());

    // LOG_FORMAT=json for machine-readable output
    let json = std::env::var("LOG_FORMAT").is_ok_and(|v| v.eq_ignore_ascii_case("json"));
    let fmt_layer = if json {
        tracing_subscriber::fmt::layer().json().boxed()
    } else {
        tracing_subscriber::fmt::layer().boxed()
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt_layer)
        .init();
}

/// CORS is only needed when the UI is served from another origin.
fn cors_layer(config: &Config) -> anyhow::Result<Option<CorsLayer>> {
    let Some(origin) = &config.server.allowed_origin else {
        return Ok(None);
    };
    let origin = origin
        .parse::<HeaderValue>()
        .map_err(|_| anyhow::anyhow!("Invalid ALLOWED_ORIGIN for CORS: {}", origin))?;

    Ok(Some(
        CorsLayer::new()
            .allow_origin(origin)
            .allow_methods([
                http::Method::GET,
                http::Method::POST,
                http::Method::PUT,
                http::Method::DELETE,
                http::Method::OPTIONS,
            ])
            .allow_headers([http::header::CONTENT_TYPE, http::header::ACCEPT]),
    ))
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = ctrl_c => {},
                    _ = term.recv() => {},
                }
            }
            Err(e) => {
                tracing::warn!("Failed to bind SIGTERM, only Ctrl+C will stop the server: {}", e);
                ctrl_c.await;
            }
        }
    }

    #[cfg(not(unix))]
    ctrl_c.await;
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    init_tracing();

    let config = Config::from_env()?;

    tracing::info!("Starting soundboard Twitch bridge");

    let (app_state, inbox) = init::build_state(config.clone()).await?;

    let (shutdown_tx, _shutdown_rx) = tokio::sync::broadcast::channel::<()>(1);
    let bg_handles = init::spawn_background_workers(app_state.clone(), inbox, shutdown_tx.clone());

    init::auto_connect(&app_state).await;

    let mut app = routes::app(app_state.clone()).layer(TraceLayer::new_for_http());
    if let Some(cors) = cors_layer(&config)? {
        app = app.layer(cors);
    }

    let addr = format!("{}:{}", config.server.host, config.server.port);
    tracing::info!("Control API listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    let server_fut = axum::serve(listener, app);

    tokio::select! {
        res = server_fut => {
            if let Err(e) = res {
                tracing::error!("Server error: {}", e);
            }
        }
        _ = shutdown_signal() => {
            tracing::info!("Shutdown signal received, notifying background workers");
        }
    }
    let _ = shutdown_tx.send(());

    // Let the bridge close chat and EventSub before exiting.
    let shutdown_wait = Duration::from_secs(15);
    tracing::info!(
        "Waiting up to {}s for background workers to exit",
        shutdown_wait.as_secs()
    );

    let bg_wait = async {
        for h in bg_handles {
            let _ = h.await;
        }
    };
    if tokio::time::timeout(shutdown_wait, bg_wait).await.is_err() {
        tracing::warn!("Background workers did not exit in time");
    }

    tracing::info!("Shutdown complete");
    Ok(())
}
