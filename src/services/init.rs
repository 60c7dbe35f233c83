//! Start-up helpers:
//! - opening the JSON documents
//! - wiring the session context, gateway and bridge into `AppState`
//! - optional auto-connect from environment credentials
//! - spawning the bridge pump as a background worker

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};

use crate::config::Config;
use crate::db::{MappingRepository, MappingStore, TopicConfigStore};
use crate::services::bridge::{BridgeInbox, BridgeSettings, TwitchBridge};
use crate::services::mappings::GatePolicy;
use crate::services::notifications::NotificationBus;
use crate::services::session::{Credentials, SessionContext};
use crate::services::twitch::TwitchService;
use crate::AppState;

/// Open both persisted documents, creating their directories if needed.
pub async fn open_stores(config: &Config) -> Result<(Arc<TopicConfigStore>, Arc<MappingStore>)> {
    let topics = TopicConfigStore::open(&config.storage.topic_config_path)
        .await
        .with_context(|| {
            format!(
                "Failed to open topic config at {}",
                config.storage.topic_config_path.display()
            )
        })?;
    let mappings = MappingStore::open(&config.storage.mappings_path)
        .await
        .with_context(|| {
            format!(
                "Failed to open mappings at {}",
                config.storage.mappings_path.display()
            )
        })?;

    tracing::info!(
        "Using {} and {}",
        config.storage.topic_config_path.display(),
        config.storage.mappings_path.display()
    );
    Ok((Arc::new(topics), Arc::new(mappings)))
}

/// Build the shared state. The returned inbox must be handed to
/// `spawn_background_workers`.
pub async fn build_state(config: Config) -> Result<(Arc<AppState>, BridgeInbox)> {
    let (topics, mappings) = open_stores(&config).await?;

    let ctx = Arc::new(SessionContext::new(
        topics,
        Duration::from_secs(config.gate.sub_tier_cache_ttl_seconds),
        Duration::from_secs(config.gate.badge_ttl_seconds),
    ));
    let twitch = TwitchService::new(&config, ctx.clone())?;
    let bus = Arc::new(NotificationBus::new());

    let settings = BridgeSettings {
        eventsub_ws_url: config.twitch.eventsub_ws_url.clone(),
        irc_addr: config.twitch.irc_addr.clone(),
        follower_poll_interval: Duration::from_secs(config.eventsub.follower_poll_interval_seconds),
        gate: GatePolicy {
            follower_accepts_elevated: config.gate.follower_accepts_elevated,
        },
    };
    let (bridge, inbox) = TwitchBridge::new(settings, ctx, Arc::new(twitch), bus);

    let loaded = MappingRepository::list(&mappings).await;
    tracing::info!("Loaded {} event mapping(s)", loaded.len());
    bridge.engine().reload(loaded).await;

    Ok((
        Arc::new(AppState {
            config,
            bridge,
            mappings,
        }),
        inbox,
    ))
}

/// Connect with credentials from the environment, if all of them are set.
/// Failure is logged; the UI can still connect later.
pub async fn auto_connect(state: &Arc<AppState>) {
    let Some((login, token, client_id)) = state.config.startup_credentials() else {
        tracing::info!("No Twitch credentials in environment; waiting for connect request");
        return;
    };

    tracing::info!("Auto-connecting as {}", login);
    if let Err(e) = state
        .bridge
        .connect(Credentials::new(&login, &token, &client_id))
        .await
    {
        tracing::warn!("Auto-connect failed: {}", e);
    }
}

/// Spawn background workers:
/// - the bridge pump that drains chat, EventSub and poller events
///
/// Each worker listens for shutdown on the broadcast channel, and the handles
/// are returned so the caller can wait for them.
pub fn spawn_background_workers(
    state: Arc<AppState>,
    inbox: BridgeInbox,
    shutdown: tokio::sync::broadcast::Sender<()>,
) -> Vec<tokio::task::JoinHandle<()>> {
    let bridge = state.bridge.clone();
    let shutdown_rx = shutdown.subscribe();
    vec![tokio::spawn(bridge.run(inbox, shutdown_rx))]
}
