//! The bridge owns the live connection: chat, the EventSub session, the
//! follower poller and the reconciler. Everything inbound funnels through
//! `run`, which normalizes and publishes it in arrival order, then gates and
//! dispatches each event on its own task.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{broadcast, mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::db::models::{SubTier, TopicKey};
use crate::db::TopicConfigRepository;
use crate::error::{AppError, AppResult};
use crate::services::chat::ChatHandle;
use crate::services::eventsub::{EventSubHandle, SessionEvent, SessionSignal, SessionState};
use crate::services::followers::FollowerPoller;
use crate::services::irc::ChatMessage;
use crate::services::mappings::{Dispatch, GatePolicy, MappingEngine};
use crate::services::normalizer::{
    normalize_chat, normalize_notification, normalize_test_event, CanonicalEvent, TestEvent,
};
use crate::services::notifications::{
    ClearCredentialsResult, ConnectionState, Notification, NotificationBus, Transport,
};
use crate::services::session::{Credentials, SessionContext};
use crate::services::subscriptions::{
    InFlightTracker, ReconcileReport, ReconcileStatus, SubscriptionManager,
};
use crate::services::twitch::HelixApi;

/// How often a session-open reconcile waits out a run that is still busy.
const RECONCILE_RETRIES: usize = 20;
const RECONCILE_RETRY_DELAY: Duration = Duration::from_millis(250);

#[derive(Debug, Clone)]
pub struct BridgeSettings {
    pub eventsub_ws_url: String,
    pub irc_addr: String,
    pub follower_poll_interval: Duration,
    pub gate: GatePolicy,
}

/// Receiving ends of the channels the transports feed.
pub struct BridgeInbox {
    session: mpsc::UnboundedReceiver<SessionEvent>,
    chat: mpsc::UnboundedReceiver<ChatMessage>,
    events: mpsc::UnboundedReceiver<CanonicalEvent>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BridgeStatus {
    pub login: Option<String>,
    pub broadcaster_user_id: Option<String>,
    pub eventsub: SessionState,
    pub session_id: Option<String>,
    pub chat_connected: bool,
    pub follower_poller_running: bool,
    pub topics: BTreeSet<TopicKey>,
    pub owned_subscription_ids: BTreeSet<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UserChecks {
    pub login: String,
    pub follower: bool,
    pub subscriber: bool,
    pub tier: Option<SubTier>,
    pub vip: bool,
    pub moderator: bool,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FiredEvent {
    pub event: CanonicalEvent,
    pub dispatch: Option<DispatchView>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DispatchView {
    pub mapping_id: String,
    pub selected_label: String,
}

impl From<Dispatch> for DispatchView {
    fn from(d: Dispatch) -> Self {
        Self {
            mapping_id: d.mapping_id,
            selected_label: d.selected_label,
        }
    }
}

pub struct TwitchBridge {
    settings: BridgeSettings,
    ctx: Arc<SessionContext>,
    api: Arc<dyn HelixApi>,
    bus: Arc<NotificationBus>,
    subscriptions: SubscriptionManager,
    followers: Arc<FollowerPoller>,
    engine: MappingEngine,
    eventsub: Mutex<Option<EventSubHandle>>,
    eventsub_state: RwLock<SessionState>,
    /// Bumped whenever the session handle is replaced or dropped.
    eventsub_generation: AtomicU64,
    chat: Mutex<Option<ChatHandle>>,
    session_tx: mpsc::UnboundedSender<SessionEvent>,
    chat_tx: mpsc::UnboundedSender<ChatMessage>,
    event_tx: mpsc::UnboundedSender<CanonicalEvent>,
}

impl TwitchBridge {
    pub fn new(
        settings: BridgeSettings,
        ctx: Arc<SessionContext>,
        api: Arc<dyn HelixApi>,
        bus: Arc<NotificationBus>,
    ) -> (Arc<Self>, BridgeInbox) {
        let (session_tx, session) = mpsc::unbounded_channel();
        let (chat_tx, chat) = mpsc::unbounded_channel();
        let (event_tx, events) = mpsc::unbounded_channel();

        let bridge = Arc::new(Self {
            subscriptions: SubscriptionManager::new(
                api.clone(),
                ctx.clone(),
                InFlightTracker::default(),
            ),
            followers: Arc::new(FollowerPoller::new(
                api.clone(),
                ctx.clone(),
                settings.follower_poll_interval,
            )),
            engine: MappingEngine::new(api.clone(), ctx.clone(), bus.clone(), settings.gate),
            settings,
            ctx,
            api,
            bus,
            eventsub: Mutex::new(None),
            eventsub_state: RwLock::new(SessionState::Disconnected),
            eventsub_generation: AtomicU64::new(0),
            chat: Mutex::new(None),
            session_tx,
            chat_tx,
            event_tx,
        });

        (bridge, BridgeInbox {
            session,
            chat,
            events,
        })
    }

    pub fn api(&self) -> &Arc<dyn HelixApi> {
        &self.api
    }

    pub fn bus(&self) -> &Arc<NotificationBus> {
        &self.bus
    }

    pub fn engine(&self) -> &MappingEngine {
        &self.engine
    }

    pub fn subscriptions(&self) -> &SubscriptionManager {
        &self.subscriptions
    }

    pub fn context(&self) -> &Arc<SessionContext> {
        &self.ctx
    }

    // ========================================================================
    // Commands
    // ========================================================================

    /// Store credentials and open chat and EventSub. Any previous
    /// connection is closed first.
    pub async fn connect(&self, credentials: Credentials) -> AppResult<BridgeStatus> {
        if !credentials.is_complete() {
            return Err(AppError::BadRequest(
                "login, access token and client id are all required".to_string(),
            ));
        }

        self.close_transports().await;
        self.ctx.reset().await;
        self.ctx.set_credentials(credentials.clone()).await;

        match self.api.resolve_user_id(&credentials.login).await {
            Some(id) => {
                info!("Resolved {} to broadcaster id {}", credentials.login, id);
                self.ctx.set_broadcaster_user_id(id).await;
            }
            None => warn!(
                "Could not resolve broadcaster id for {}; subscriptions wait until it resolves",
                credentials.login
            ),
        }

        *self.chat.lock().await = Some(ChatHandle::spawn(
            self.settings.irc_addr.clone(),
            credentials,
            self.bus.clone(),
            self.chat_tx.clone(),
        ));
        *self.eventsub.lock().await = Some(EventSubHandle::spawn(
            self.settings.eventsub_ws_url.clone(),
            self.bump_generation(),
            self.session_tx.clone(),
        ));

        self.sync_follower_poller().await;
        Ok(self.status().await)
    }

    /// Persist the desired topics and converge subscriptions to them.
    pub async fn set_desired_topics(&self, topics: BTreeSet<TopicKey>) -> AppResult<ReconcileReport> {
        let report = self.subscriptions.reconcile(topics).await?;
        self.sync_follower_poller().await;
        Ok(report)
    }

    /// Run a synthetic event through the same pipeline as live ones.
    pub async fn fire_test_event(&self, test: TestEvent) -> FiredEvent {
        let event = normalize_test_event(test);
        let dispatch = self.handle_event(event.clone()).await;
        FiredEvent {
            event,
            dispatch: dispatch.map(DispatchView::from),
        }
    }

    /// Delete every owned subscription, close both transports and forget the
    /// credentials. Topics are kept unless `purge_topics` is set.
    pub async fn clear_credentials(&self, purge_topics: bool) -> AppResult<ClearCredentialsResult> {
        let deletions = self.subscriptions.clear_owned().await;
        if purge_topics {
            TopicConfigRepository::clear_topics(&self.ctx.topics).await?;
        }

        self.followers.stop();
        self.close_transports().await;
        self.ctx.reset().await;
        *self.eventsub_state.write().await = SessionState::Disconnected;

        let failed = deletions.iter().filter(|d| !d.success).count();
        info!(
            "Credentials cleared; {} subscription deletion(s), {} failed",
            deletions.len(),
            failed
        );

        let result = ClearCredentialsResult {
            deletions,
            purged_topics: purge_topics,
        };
        self.bus
            .publish(Notification::ClearCredentialsResult(result.clone()));
        Ok(result)
    }

    pub async fn status(&self) -> BridgeStatus {
        let credentials = self.ctx.credentials().await;
        let config = TopicConfigRepository::get(&self.ctx.topics).await;
        let chat_connected = self
            .chat
            .lock()
            .await
            .as_ref()
            .is_some_and(|c| !c.is_finished());

        BridgeStatus {
            login: credentials.as_ref().map(|c| c.login.clone()),
            broadcaster_user_id: credentials.and_then(|c| c.broadcaster_user_id),
            eventsub: *self.eventsub_state.read().await,
            session_id: self.ctx.session_id().await,
            chat_connected,
            follower_poller_running: self.followers.is_running(),
            topics: config.topics,
            owned_subscription_ids: config.created_subscription_ids,
        }
    }

    /// Live answers to every requirement check for one user.
    pub async fn user_checks(&self, login: &str) -> AppResult<UserChecks> {
        if !self.ctx.has_credentials().await {
            return Err(AppError::NotConnected);
        }
        let login = login.trim().trim_start_matches('@').to_lowercase();
        let tier = self
            .ctx
            .tier_cache
            .resolve(self.api.as_ref(), &login)
            .await;

        Ok(UserChecks {
            follower: self.api.check_follows(&login).await,
            subscriber: tier.is_some() || self.api.check_subscriber(&login).await,
            tier,
            vip: self.ctx.badges.is_vip(&login),
            moderator: self.ctx.badges.is_moderator(&login),
            login,
        })
    }

    // ========================================================================
    // Inbound pipeline
    // ========================================================================

    /// Drain the transport channels until shutdown.
    pub async fn run(self: Arc<Self>, mut inbox: BridgeInbox, mut shutdown: broadcast::Receiver<()>) {
        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    info!("Bridge shutting down");
                    self.followers.stop();
                    self.close_transports().await;
                    break;
                }
                Some(event) = inbox.session.recv() => {
                    self.on_session_event(event).await;
                }
                Some(message) = inbox.chat.recv() => {
                    self.on_chat(message);
                }
                Some(event) = inbox.events.recv() => {
                    self.dispatch_detached(event);
                }
                else => break,
            }
        }
    }

    /// Publish a normalized event and try it against the mappings, waiting
    /// for the outcome.
    pub async fn handle_event(&self, event: CanonicalEvent) -> Option<Dispatch> {
        self.publish_event(&event);
        self.engine.handle(&event).await
    }

    fn publish_event(&self, event: &CanonicalEvent) {
        debug!("{:?} event from {:?} ({})", event.kind, event.user, event.raw_type);
        self.bus.publish(Notification::NormalizedEvent(event.clone()));
    }

    /// Publish now; the gate may call Helix, so matching and dispatch run on
    /// their own task and the next inbound message is not held up.
    fn dispatch_detached(self: &Arc<Self>, event: CanonicalEvent) -> JoinHandle<()> {
        self.publish_event(&event);
        let bridge = self.clone();
        tokio::spawn(async move {
            bridge.engine.handle(&event).await;
        })
    }

    fn on_chat(self: &Arc<Self>, message: ChatMessage) -> JoinHandle<()> {
        self.ctx.badges.observe(&message.user_login, message.badges);
        self.bus.publish(Notification::ChatLine(message.clone()));
        self.dispatch_detached(normalize_chat(&message))
    }

    fn bump_generation(&self) -> u64 {
        self.eventsub_generation.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Signals from a session that has since been replaced or cleared are
    /// dropped so they cannot overwrite the current state.
    async fn on_session_event(self: &Arc<Self>, event: SessionEvent) -> Option<JoinHandle<()>> {
        let current = self.eventsub_generation.load(Ordering::SeqCst);
        if event.generation != current {
            debug!(
                "Dropping {:?} from stale EventSub session (generation {}, current {})",
                event.signal, event.generation, current
            );
            return None;
        }
        self.on_session(event.signal).await
    }

    /// Apply one session signal. Work that may call Helix is spawned and its
    /// handle returned.
    async fn on_session(self: &Arc<Self>, signal: SessionSignal) -> Option<JoinHandle<()>> {
        match signal {
            SessionSignal::Connecting => {
                *self.eventsub_state.write().await = SessionState::Connecting;
                self.bus
                    .connection_state(Transport::EventSub, ConnectionState::Connecting, None);
                None
            }
            SessionSignal::Opened(session_id) => {
                info!("EventSub session {} open", session_id);
                self.ctx.set_session_id(Some(session_id.clone())).await;
                *self.eventsub_state.write().await = SessionState::SessionOpen;
                self.bus.connection_state(
                    Transport::EventSub,
                    ConnectionState::Connected,
                    Some(session_id.clone()),
                );
                let bridge = self.clone();
                Some(tokio::spawn(async move {
                    bridge.reconcile_for_session(&session_id).await;
                }))
            }
            SessionSignal::Notification {
                subscription_type,
                event,
            } => Some(self.dispatch_detached(normalize_notification(&subscription_type, event))),
            SessionSignal::Revoked { id, .. } => {
                if let Err(e) = TopicConfigRepository::remove_owned_id(&self.ctx.topics, &id).await {
                    warn!("Could not forget revoked subscription {}: {}", id, e);
                }
                None
            }
            SessionSignal::Closed(reason) => {
                self.ctx.set_session_id(None).await;
                *self.eventsub_state.write().await = SessionState::Closed;
                self.bus
                    .connection_state(Transport::EventSub, ConnectionState::Closed, reason);
                None
            }
        }
    }

    /// Converge subscriptions onto a newly opened session. A reconcile still
    /// busy with an earlier session is waited out while this one stays current.
    async fn reconcile_for_session(&self, session_id: &str) {
        for _ in 0..RECONCILE_RETRIES {
            match self.subscriptions.reconcile_persisted().await {
                Ok(report) if report.status == ReconcileStatus::AlreadyRunning => {
                    tokio::time::sleep(RECONCILE_RETRY_DELAY).await;
                    if self.ctx.session_id().await.as_deref() != Some(session_id) {
                        debug!("Session {} replaced before it could be reconciled", session_id);
                        return;
                    }
                }
                Ok(report) => {
                    debug!("Session-open reconcile: {:?}", report.status);
                    break;
                }
                Err(e) => {
                    warn!("Reconcile after session open failed: {}", e);
                    break;
                }
            }
        }
        self.sync_follower_poller().await;
    }

    /// Run the follower poller exactly when `follow` is wanted and we have
    /// credentials.
    async fn sync_follower_poller(&self) {
        let wants_follow = TopicConfigRepository::get(&self.ctx.topics)
            .await
            .topics
            .contains(&TopicKey::Follow);

        if wants_follow && self.ctx.has_credentials().await {
            self.followers.start(self.event_tx.clone());
        } else {
            self.followers.stop();
        }
    }

    async fn close_transports(&self) {
        self.bump_generation();
        if let Some(chat) = self.chat.lock().await.take() {
            chat.close().await;
        }
        if let Some(session) = self.eventsub.lock().await.take() {
            session.close().await;
        }
    }
}
