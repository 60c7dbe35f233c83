//! Connection-scoped state shared by the reconciler, the follower poller and
//! the mapping engine.

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::RwLock;

use crate::db::models::SubTier;
use crate::db::{TopicConfigRepository, TopicConfigStore};
use crate::services::twitch::HelixApi;

#[derive(Clone)]
pub struct Credentials {
    pub login: String,
    pub access_token: String,
    pub client_id: String,
    pub broadcaster_user_id: Option<String>,
}

impl Credentials {
    /// Tokens are accepted with or without the IRC-style `oauth:` prefix.
    pub fn new(login: &str, access_token: &str, client_id: &str) -> Self {
        let token = access_token.trim();
        let token = token.strip_prefix("oauth:").unwrap_or(token);
        Self {
            login: login.trim().trim_start_matches('#').to_lowercase(),
            access_token: token.to_string(),
            client_id: client_id.trim().to_string(),
            broadcaster_user_id: None,
        }
    }

    pub fn is_complete(&self) -> bool {
        !self.login.is_empty() && !self.access_token.is_empty() && !self.client_id.is_empty()
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("login", &self.login)
            .field("access_token", &"<redacted>")
            .field("client_id", &self.client_id)
            .field("broadcaster_user_id", &self.broadcaster_user_id)
            .finish()
    }
}

/// The single owner of credentials, the EventSub session id and the caches
/// that hang off them. `reset` is the one place connection state is torn down.
pub struct SessionContext {
    credentials: RwLock<Option<Credentials>>,
    session_id: RwLock<Option<String>>,
    pub topics: Arc<TopicConfigStore>,
    pub tier_cache: SubTierCache,
    pub badges: BadgeTracker,
}

impl SessionContext {
    pub fn new(topics: Arc<TopicConfigStore>, tier_ttl: Duration, badge_ttl: Duration) -> Self {
        Self {
            credentials: RwLock::new(None),
            session_id: RwLock::new(None),
            topics,
            tier_cache: SubTierCache::new(tier_ttl),
            badges: BadgeTracker::new(badge_ttl),
        }
    }

    pub async fn credentials(&self) -> Option<Credentials> {
        self.credentials.read().await.clone()
    }

    pub async fn has_credentials(&self) -> bool {
        self.credentials.read().await.is_some()
    }

    pub async fn set_credentials(&self, credentials: Credentials) {
        *self.credentials.write().await = Some(credentials);
    }

    pub async fn set_broadcaster_user_id(&self, id: String) {
        if let Some(creds) = self.credentials.write().await.as_mut() {
            creds.broadcaster_user_id = Some(id);
        }
    }

    pub async fn broadcaster_user_id(&self) -> Option<String> {
        self.credentials
            .read()
            .await
            .as_ref()
            .and_then(|c| c.broadcaster_user_id.clone())
    }

    pub async fn session_id(&self) -> Option<String> {
        self.session_id.read().await.clone()
    }

    pub async fn set_session_id(&self, id: Option<String>) {
        *self.session_id.write().await = id;
    }

    pub async fn owned_subscription_ids(&self) -> BTreeSet<String> {
        TopicConfigRepository::get(&self.topics)
            .await
            .created_subscription_ids
    }

    /// Forget credentials, the session and every cached lookup.
    pub async fn reset(&self) {
        *self.credentials.write().await = None;
        *self.session_id.write().await = None;
        self.tier_cache.clear();
        self.badges.clear();
    }
}

/// Short-lived cache of subscriber tier lookups keyed by lowercased login.
pub struct SubTierCache {
    ttl: Duration,
    entries: Mutex<HashMap<String, (Option<SubTier>, Instant)>>,
}

impl SubTierCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// `Some(tier)` on a fresh hit, where `tier` may itself be `None` for a
    /// user known not to be subscribed.
    pub fn get(&self, login: &str) -> Option<Option<SubTier>> {
        let entries = self.entries.lock().ok()?;
        entries
            .get(&login.to_lowercase())
            .filter(|(_, at)| at.elapsed() < self.ttl)
            .map(|(tier, _)| *tier)
    }

    pub fn insert(&self, login: &str, tier: Option<SubTier>) {
        if let Ok(mut entries) = self.entries.lock() {
            entries.retain(|_, (_, at)| at.elapsed() < self.ttl);
            entries.insert(login.to_lowercase(), (tier, Instant::now()));
        }
    }

    /// Cached tier for `login`, asking the API only on a miss.
    pub async fn resolve(&self, api: &dyn HelixApi, login: &str) -> Option<SubTier> {
        if let Some(hit) = self.get(login) {
            tracing::trace!("Sub tier cache hit for {}", login);
            return hit;
        }
        let tier = api.fetch_subscriber_tier(login).await;
        self.insert(login, tier);
        tier
    }

    pub fn clear(&self) {
        if let Ok(mut entries) = self.entries.lock() {
            entries.clear();
        }
    }
}

/// Badges carried by a chat line.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UserBadges {
    pub broadcaster: bool,
    pub moderator: bool,
    pub vip: bool,
    pub subscriber: bool,
}

/// Remembers the badges each chatter showed most recently. Twitch has no
/// endpoint for "is this user a VIP", so chat tags are the source.
pub struct BadgeTracker {
    ttl: Duration,
    seen: Mutex<HashMap<String, (UserBadges, Instant)>>,
}

impl BadgeTracker {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            seen: Mutex::new(HashMap::new()),
        }
    }

    pub fn observe(&self, login: &str, badges: UserBadges) {
        if let Ok(mut seen) = self.seen.lock() {
            seen.insert(login.to_lowercase(), (badges, Instant::now()));
        }
    }

    fn lookup(&self, login: &str) -> Option<UserBadges> {
        let seen = self.seen.lock().ok()?;
        seen.get(&login.to_lowercase())
            .filter(|(_, at)| at.elapsed() < self.ttl)
            .map(|(badges, _)| *badges)
    }

    pub fn is_vip(&self, login: &str) -> bool {
        self.lookup(login).is_some_and(|b| b.vip)
    }

    /// The broadcaster counts as a moderator of their own channel.
    pub fn is_moderator(&self, login: &str) -> bool {
        self.lookup(login).is_some_and(|b| b.moderator || b.broadcaster)
    }

    pub fn clear(&self) {
        if let Ok(mut seen) = self.seen.lock() {
            seen.clear();
        }
    }
}
