use std::collections::BTreeSet;

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

/// Event categories the user can switch on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TopicKey {
    #[serde(
        alias = "redeem",
        alias = "channel.channel_points_custom_reward_redemption",
        alias = "channel.channel_points_custom_reward_redemption.add"
    )]
    Redemption,
    #[serde(alias = "sub", alias = "channel.subscribe")]
    Subscribe,
    #[serde(alias = "subgift", alias = "channel.subscription.gift")]
    SubscriptionGift,
    #[serde(alias = "channel.follow")]
    Follow,
    #[serde(alias = "channel.raid")]
    Raid,
    #[serde(alias = "bits", alias = "channel.cheer")]
    Cheer,
}

impl TopicKey {
    pub const ALL: [TopicKey; 6] = [
        TopicKey::Redemption,
        TopicKey::Subscribe,
        TopicKey::SubscriptionGift,
        TopicKey::Follow,
        TopicKey::Raid,
        TopicKey::Cheer,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TopicKey::Redemption => "redemption",
            TopicKey::Subscribe => "subscribe",
            TopicKey::SubscriptionGift => "subscription-gift",
            TopicKey::Follow => "follow",
            TopicKey::Raid => "raid",
            TopicKey::Cheer => "cheer",
        }
    }

    /// EventSub subscription type backing this topic.
    pub fn subscription_type(&self) -> &'static str {
        match self {
            TopicKey::Redemption => "channel.channel_points_custom_reward_redemption.add",
            TopicKey::Subscribe => "channel.subscribe",
            TopicKey::SubscriptionGift => "channel.subscription.gift",
            TopicKey::Follow => "channel.follow",
            TopicKey::Raid => "channel.raid",
            TopicKey::Cheer => "channel.cheer",
        }
    }

    pub fn subscription_version(&self) -> &'static str {
        match self {
            TopicKey::Follow => "2",
            _ => "1",
        }
    }

    /// Lenient parse used for persisted documents and API input.
    pub fn parse(raw: &str) -> Option<Self> {
        serde_json::from_value(Value::String(raw.trim().to_lowercase())).ok()
    }
}

/// Durable record of desired topics, owned subscription ids and the follower
/// poll watermark.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct TopicConfig {
    #[serde(deserialize_with = "lenient_topics")]
    pub topics: BTreeSet<TopicKey>,
    #[serde(alias = "createdSubscriptions", deserialize_with = "lenient_ids")]
    pub created_subscription_ids: BTreeSet<String>,
    #[serde(deserialize_with = "lenient_timestamp")]
    pub last_follower_poll_timestamp: Option<DateTime<Utc>>,
}

fn lenient_topics<'de, D>(deserializer: D) -> Result<BTreeSet<TopicKey>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Option::<Vec<Value>>::deserialize(deserializer)?.unwrap_or_default();
    Ok(raw
        .iter()
        .filter_map(Value::as_str)
        .filter_map(TopicKey::parse)
        .collect())
}

fn lenient_ids<'de, D>(deserializer: D) -> Result<BTreeSet<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Option::<Vec<Value>>::deserialize(deserializer)?.unwrap_or_default();
    Ok(raw
        .into_iter()
        .filter_map(|v| match v {
            Value::String(s) if !s.is_empty() => Some(s),
            _ => None,
        })
        .collect())
}

fn lenient_timestamp<'de, D>(deserializer: D) -> Result<Option<DateTime<Utc>>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Option::<Value>::deserialize(deserializer)? {
        Some(Value::String(s)) => DateTime::parse_from_rfc3339(&s)
            .ok()
            .map(|dt| dt.with_timezone(&Utc)),
        Some(Value::Number(n)) => n
            .as_i64()
            .and_then(|ms| Utc.timestamp_millis_opt(ms).single()),
        _ => None,
    })
}
