//! In-process stand-in for Helix used by unit tests.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use crate::db::models::{SubTier, TopicConfig};
use crate::db::TopicConfigStore;
use crate::services::session::{Credentials, SessionContext};
use crate::services::twitch::{
    CreateOutcome, CustomReward, DeleteOutcome, DesiredSubscription, EventSubTransport, Follower,
    HelixApi, Subscriber, SubscriberStats, SubscriptionDescriptor,
};

pub const BROADCASTER_ID: &str = "4242";

pub fn test_context() -> Arc<SessionContext> {
    Arc::new(SessionContext::new(
        Arc::new(TopicConfigStore::in_memory(TopicConfig::default())),
        Duration::from_secs(60),
        Duration::from_secs(3600),
    ))
}

/// Context with credentials, a resolved broadcaster and an open session.
pub async fn connected_context(session_id: &str) -> Arc<SessionContext> {
    let ctx = test_context();
    ctx.set_credentials(Credentials::new("streamer", "token", "client"))
        .await;
    ctx.set_broadcaster_user_id(BROADCASTER_ID.to_string()).await;
    ctx.set_session_id(Some(session_id.to_string())).await;
    ctx
}

#[derive(Default)]
struct FakeState {
    subscriptions: Vec<SubscriptionDescriptor>,
    created: Vec<DesiredSubscription>,
    deleted: Vec<String>,
    delete_overrides: HashMap<String, DeleteOutcome>,
    unavailable_types: HashSet<String>,
    listing_fails: bool,
    next_id: usize,
    followers: HashSet<String>,
    subscribers: HashSet<String>,
    tiers: HashMap<String, Option<SubTier>>,
    tier_lookups: usize,
    recent_followers: Option<Vec<Follower>>,
    check_delay: Duration,
}

#[derive(Default)]
pub struct FakeHelix {
    state: Mutex<FakeState>,
}

impl FakeHelix {
    fn with<R>(&self, f: impl FnOnce(&mut FakeState) -> R) -> R {
        f(&mut self.state.lock().unwrap())
    }

    /// Seed an existing provider subscription and return its id.
    pub fn seed_subscription(
        &self,
        id: &str,
        desired: &DesiredSubscription,
        session_id: &str,
    ) -> String {
        self.with(|s| {
            s.subscriptions
                .push(descriptor(id.to_string(), desired, session_id));
        });
        id.to_string()
    }

    pub fn live_ids(&self) -> Vec<String> {
        self.with(|s| s.subscriptions.iter().map(|d| d.id.clone()).collect())
    }

    pub fn live(&self) -> Vec<SubscriptionDescriptor> {
        self.with(|s| s.subscriptions.clone())
    }

    pub fn created(&self) -> Vec<DesiredSubscription> {
        self.with(|s| s.created.clone())
    }

    pub fn deleted(&self) -> Vec<String> {
        self.with(|s| s.deleted.clone())
    }

    pub fn override_delete(&self, id: &str, outcome: DeleteOutcome) {
        self.with(|s| {
            s.delete_overrides.insert(id.to_string(), outcome);
        });
    }

    pub fn mark_unavailable(&self, subscription_type: &str) {
        self.with(|s| {
            s.unavailable_types.insert(subscription_type.to_string());
        });
    }

    pub fn fail_listing(&self, fails: bool) {
        self.with(|s| s.listing_fails = fails);
    }

    pub fn set_follower(&self, login: &str) {
        self.with(|s| {
            s.followers.insert(login.to_string());
        });
    }

    pub fn set_subscriber(&self, login: &str) {
        self.with(|s| {
            s.subscribers.insert(login.to_string());
        });
    }

    pub fn set_subscriber_tier(&self, login: &str, tier: Option<SubTier>) {
        self.with(|s| {
            s.tiers.insert(login.to_string(), tier);
        });
    }

    /// Make follow checks take `delay`, like a slow or retrying Helix call.
    pub fn delay_checks(&self, delay: Duration) {
        self.with(|s| s.check_delay = delay);
    }

    pub fn tier_lookups(&self) -> usize {
        self.with(|s| s.tier_lookups)
    }

    pub fn set_recent_followers(&self, followers: Option<Vec<Follower>>) {
        self.with(|s| s.recent_followers = followers);
    }
}

fn descriptor(id: String, desired: &DesiredSubscription, session_id: &str) -> SubscriptionDescriptor {
    SubscriptionDescriptor {
        id,
        status: "enabled".to_string(),
        subscription_type: desired.subscription_type.clone(),
        version: desired.version.clone(),
        condition: desired.condition.clone(),
        transport: EventSubTransport {
            method: "websocket".to_string(),
            session_id: Some(session_id.to_string()),
            callback: None,
        },
        created_at: None,
        cost: 0,
    }
}

#[async_trait]
impl HelixApi for FakeHelix {
    async fn list_subscriptions(&self) -> Vec<SubscriptionDescriptor> {
        self.with(|s| {
            if s.listing_fails {
                Vec::new()
            } else {
                s.subscriptions.clone()
            }
        })
    }

    async fn create_subscription(
        &self,
        desired: &DesiredSubscription,
        session_id: &str,
    ) -> CreateOutcome {
        // Let concurrent callers interleave here, the way a network call would.
        tokio::task::yield_now().await;
        self.with(|s| {
            s.created.push(desired.clone());
            if s.unavailable_types.contains(&desired.subscription_type) {
                return CreateOutcome::Unavailable;
            }
            s.next_id += 1;
            let created = descriptor(format!("new-{}", s.next_id), desired, session_id);
            s.subscriptions.push(created.clone());
            CreateOutcome::Created(created)
        })
    }

    async fn delete_subscription(&self, id: &str) -> DeleteOutcome {
        self.with(|s| {
            s.deleted.push(id.to_string());
            if let Some(outcome) = s.delete_overrides.get(id) {
                return outcome.clone();
            }
            let before = s.subscriptions.len();
            s.subscriptions.retain(|d| d.id != id);
            if s.subscriptions.len() < before {
                DeleteOutcome::Deleted
            } else {
                DeleteOutcome::AlreadyGone
            }
        })
    }

    async fn resolve_user_id(&self, _login: &str) -> Option<String> {
        Some(BROADCASTER_ID.to_string())
    }

    async fn check_follows(&self, login: &str) -> bool {
        let delay = self.with(|s| s.check_delay);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        self.with(|s| s.followers.contains(login))
    }

    async fn check_subscriber(&self, login: &str) -> bool {
        self.with(|s| s.subscribers.contains(login))
    }

    async fn fetch_subscriber_tier(&self, login: &str) -> Option<SubTier> {
        self.with(|s| {
            s.tier_lookups += 1;
            s.tiers.get(login).copied().flatten()
        })
    }

    async fn recent_followers(&self) -> Option<Vec<Follower>> {
        self.with(|s| s.recent_followers.clone())
    }

    async fn recent_subscribers(&self) -> Vec<Subscriber> {
        Vec::new()
    }

    async fn follower_count(&self) -> Option<u64> {
        self.with(|s| Some(s.followers.len() as u64))
    }

    async fn subscriber_stats(&self) -> Option<SubscriberStats> {
        None
    }

    async fn viewer_count(&self) -> Option<u64> {
        None
    }

    async fn channel_rewards(&self) -> Vec<CustomReward> {
        Vec::new()
    }
}
