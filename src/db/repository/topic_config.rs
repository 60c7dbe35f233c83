use std::collections::{BTreeSet, HashSet};

use chrono::{DateTime, Utc};

use crate::db::models::{TopicConfig, TopicKey};
use crate::db::TopicConfigStore;
use crate::error::AppResult;

pub struct TopicConfigRepository;

impl TopicConfigRepository {
    pub async fn get(store: &TopicConfigStore) -> TopicConfig {
        store.read().await
    }

    pub async fn set_topics(store: &TopicConfigStore, topics: BTreeSet<TopicKey>) -> AppResult<()> {
        store
            .update(|cfg| {
                cfg.topics = topics;
                Ok(())
            })
            .await
    }

    pub async fn clear_topics(store: &TopicConfigStore) -> AppResult<()> {
        store
            .update(|cfg| {
                cfg.topics.clear();
                Ok(())
            })
            .await
    }

    /// Record a subscription id this process created. Returns false if it was
    /// already tracked.
    pub async fn add_owned_id(store: &TopicConfigStore, id: &str) -> AppResult<bool> {
        store
            .update(|cfg| Ok(cfg.created_subscription_ids.insert(id.to_string())))
            .await
    }

    pub async fn remove_owned_id(store: &TopicConfigStore, id: &str) -> AppResult<bool> {
        store
            .update(|cfg| Ok(cfg.created_subscription_ids.remove(id)))
            .await
    }

    /// Drop owned ids that are absent from `live`. Returns the pruned ids.
    pub async fn retain_owned_ids(
        store: &TopicConfigStore,
        live: &HashSet<&str>,
    ) -> AppResult<Vec<String>> {
        store
            .update(|cfg| {
                let stale: Vec<String> = cfg
                    .created_subscription_ids
                    .iter()
                    .filter(|id| !live.contains(id.as_str()))
                    .cloned()
                    .collect();
                for id in &stale {
                    cfg.created_subscription_ids.remove(id);
                }
                Ok(stale)
            })
            .await
    }

    /// Move the follower watermark to `at`, never backwards. Returns the
    /// watermark actually stored.
    pub async fn advance_follower_watermark(
        store: &TopicConfigStore,
        at: DateTime<Utc>,
    ) -> AppResult<DateTime<Utc>> {
        store
            .update(|cfg| {
                let next = match cfg.last_follower_poll_timestamp {
                    Some(current) if current > at => current,
                    _ => at,
                };
                cfg.last_follower_poll_timestamp = Some(next);
                Ok(next)
            })
            .await
    }
}
