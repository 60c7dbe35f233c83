//! Turns chat lines, EventSub notifications, polled follows and synthetic test
//! events into one canonical event shape.
//!
//! Provider payloads are inconsistent about where they put the username, the
//! bits amount or the tier, so each event kind gets a `PayloadAdapter` that
//! knows where to look. Matching only ever reads the typed fields the adapter
//! fills in.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use uuid::Uuid;

use crate::db::models::{Mapping, MappingType, Requirement, SubTier};
use crate::services::irc::ChatMessage;

pub const COMMAND_PREFIX: char = '!';
pub const DEFAULT_TEST_USER: &str = "T3stUs3r";
const DEFAULT_TEST_BITS: u64 = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EventKind {
    Chat,
    Command,
    Redeem,
    Follow,
    Subscribe,
    SubscriptionGift,
    Bits,
    Raid,
    /// Anything we could not classify; shown for debugging, never matched.
    Unknown,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CanonicalEvent {
    pub id: String,
    pub kind: EventKind,
    /// Provider topic or source the event came from, kept verbatim.
    pub raw_type: String,
    pub user: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reward_title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bits: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tier: Option<SubTier>,
    pub payload: Map<String, Value>,
    pub timestamp: DateTime<Utc>,
    /// Simulated requirement outcome, only set on synthetic events.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub test_requirement: Option<Requirement>,
    pub is_test: bool,
}

impl CanonicalEvent {
    fn new(kind: EventKind, raw_type: &str, payload: Map<String, Value>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            kind,
            raw_type: raw_type.to_string(),
            user: None,
            command: None,
            reward_title: None,
            bits: None,
            tier: None,
            payload,
            timestamp: Utc::now(),
            test_requirement: None,
            is_test: false,
        }
    }
}

/// Map a provider topic (or a short kind name) onto a canonical kind.
pub fn classify_topic(raw: &str) -> EventKind {
    let t = raw.trim().to_lowercase();
    match t.as_str() {
        "chat" | "message" => return EventKind::Chat,
        "command" => return EventKind::Command,
        "sub" | "resub" => return EventKind::Subscribe,
        _ => {}
    }

    if t.contains("redemption") || t.contains("redeem") || t.contains("reward") {
        EventKind::Redeem
    } else if t.contains("follow") {
        EventKind::Follow
    } else if t.contains("gift") {
        EventKind::SubscriptionGift
    } else if t.contains("subscribe") || t.contains("subscription") {
        EventKind::Subscribe
    } else if t.contains("cheer") || t.contains("bits") {
        EventKind::Bits
    } else if t.contains("raid") {
        EventKind::Raid
    } else {
        EventKind::Unknown
    }
}

/// The command word of a chat line, if it is a command: first token without
/// the prefix, lowercased.
pub fn parse_command(text: &str) -> Option<String> {
    let token = text.trim_start().split_whitespace().next()?;
    let word = token.strip_prefix(COMMAND_PREFIX)?;
    (!word.is_empty()).then(|| word.to_lowercase())
}

// ============================================================================
// Payload adapters
// ============================================================================

const USER_FIELDS: &[&str] = &[
    "user_login",
    "user_name",
    "from_name",
    "from_broadcaster_user_login",
    "from_broadcaster_user_name",
    "sender_login",
    "sender_name",
    "recipient_user_login",
    "recipient_user_name",
    "user",
    "username",
];

const EXPLICIT_BITS_FIELDS: &[&str] = &["bits", "bits_used", "amount", "amount_used"];
const FREE_TEXT_FIELDS: &[&str] = &["user_input", "input", "message", "prompt"];
const TIER_FIELDS: &[&str] = &[
    "tier",
    "sub_plan",
    "sub_plan_name",
    "tier_name",
    "plan",
    "plan_name",
];

/// Where one provider event kind keeps the fields matching cares about.
pub trait PayloadAdapter: Sync {
    fn user(&self, payload: &Map<String, Value>) -> Option<String> {
        first_text(payload, USER_FIELDS)
    }

    fn enrich(&self, _payload: &Map<String, Value>, _event: &mut CanonicalEvent) {}
}

struct DefaultAdapter;
struct RedemptionAdapter;
struct BitsAdapter;
struct SubscribeAdapter;
struct RaidAdapter;

impl PayloadAdapter for DefaultAdapter {}

impl PayloadAdapter for RedemptionAdapter {
    fn enrich(&self, payload: &Map<String, Value>, event: &mut CanonicalEvent) {
        event.reward_title = reward_title(payload);
        // Bit-funded redemptions may carry an amount in their text.
        event.bits = extract_bits_amount(payload);
    }
}

impl PayloadAdapter for BitsAdapter {
    fn enrich(&self, payload: &Map<String, Value>, event: &mut CanonicalEvent) {
        event.bits = extract_bits_amount(payload);
    }
}

impl PayloadAdapter for SubscribeAdapter {
    fn enrich(&self, payload: &Map<String, Value>, event: &mut CanonicalEvent) {
        event.tier = Some(normalize_sub_tier_map(payload));
    }
}

impl PayloadAdapter for RaidAdapter {
    fn user(&self, payload: &Map<String, Value>) -> Option<String> {
        first_text(
            payload,
            &["from_broadcaster_user_login", "from_broadcaster_user_name"],
        )
        .or_else(|| first_text(payload, USER_FIELDS))
    }
}

pub fn adapter_for(kind: EventKind) -> &'static dyn PayloadAdapter {
    match kind {
        EventKind::Redeem => &RedemptionAdapter,
        EventKind::Bits => &BitsAdapter,
        EventKind::Subscribe | EventKind::SubscriptionGift => &SubscribeAdapter,
        EventKind::Raid => &RaidAdapter,
        _ => &DefaultAdapter,
    }
}

fn value_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.trim().to_string()).filter(|s| !s.is_empty()),
        Value::Number(n) => Some(n.to_string()),
        // Chat-style messages arrive as {"text": "..."}.
        Value::Object(o) => o.get("text").and_then(value_text),
        _ => None,
    }
}

fn first_text(payload: &Map<String, Value>, fields: &[&str]) -> Option<String> {
    fields
        .iter()
        .find_map(|f| payload.get(*f).and_then(value_text))
}

fn reward_title(payload: &Map<String, Value>) -> Option<String> {
    match payload.get("reward") {
        Some(Value::Object(reward)) => first_text(reward, &["title", "name"]),
        Some(other) => value_text(other),
        None => None,
    }
    .or_else(|| first_text(payload, &["reward_title", "title"]))
}

/// First run of digits in `text`, capped at seven digits.
fn first_integer(text: &str) -> Option<u64> {
    let start = text.find(|c: char| c.is_ascii_digit())?;
    let digits: String = text[start..]
        .chars()
        .take_while(|c| c.is_ascii_digit())
        .take(7)
        .collect();
    digits.parse().ok()
}

/// Bits amount from an explicit field, else the first integer found in the
/// free-text fields or the reward title.
pub fn extract_bits_amount(payload: &Map<String, Value>) -> Option<u64> {
    let explicit = EXPLICIT_BITS_FIELDS.iter().find_map(|f| match payload.get(*f)? {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.trim().parse::<u64>().ok(),
        _ => None,
    });
    if let Some(amount) = explicit.filter(|a| *a > 0) {
        return Some(amount);
    }

    FREE_TEXT_FIELDS
        .iter()
        .filter_map(|f| payload.get(*f).and_then(value_text))
        .chain(reward_title(payload))
        .find_map(|text| first_integer(&text))
        .filter(|a| *a > 0)
}

fn tier_from_text(raw: &str) -> Option<SubTier> {
    let compact: String = raw
        .to_lowercase()
        .chars()
        .filter(|c| !c.is_whitespace())
        .collect();
    match compact.as_str() {
        "1000" | "1" | "tier1" => Some(SubTier::Tier1),
        "2000" | "2" | "tier2" => Some(SubTier::Tier2),
        "3000" | "3" | "tier3" => Some(SubTier::Tier3),
        "prime" => Some(SubTier::Prime),
        _ => None,
    }
}

fn normalize_sub_tier_map(payload: &Map<String, Value>) -> SubTier {
    let values: Vec<String> = TIER_FIELDS
        .iter()
        .filter_map(|f| payload.get(*f).and_then(value_text))
        .collect();

    if payload.get("is_prime").and_then(Value::as_bool) == Some(true)
        || values.iter().any(|v| v.to_lowercase().contains("prime"))
    {
        return SubTier::Prime;
    }

    values
        .iter()
        .find_map(|v| tier_from_text(v))
        .unwrap_or(SubTier::Any)
}

/// Tier from whichever tier-like field the provider supplied; `Any` when
/// nothing recognisable is present.
pub fn normalize_sub_tier(payload: &Value) -> SubTier {
    payload
        .as_object()
        .map(normalize_sub_tier_map)
        .unwrap_or(SubTier::Any)
}

// ============================================================================
// Normalization entry points
// ============================================================================

fn finish(kind: EventKind, raw_type: &str, payload: Map<String, Value>) -> CanonicalEvent {
    let adapter = adapter_for(kind);
    let mut event = CanonicalEvent::new(kind, raw_type, payload);
    event.user = adapter.user(&event.payload);
    let payload = std::mem::take(&mut event.payload);
    adapter.enrich(&payload, &mut event);
    event.payload = payload;
    event
}

/// EventSub notification or polled record.
pub fn normalize_notification(subscription_type: &str, event: Value) -> CanonicalEvent {
    let payload = match event {
        Value::Object(map) => map,
        other => {
            let mut map = Map::new();
            map.insert("value".to_string(), other);
            map
        }
    };
    finish(classify_topic(subscription_type), subscription_type, payload)
}

pub fn normalize_chat(message: &ChatMessage) -> CanonicalEvent {
    let mut payload = Map::new();
    payload.insert("channel".into(), json!(message.channel));
    payload.insert("user_login".into(), json!(message.user_login));
    payload.insert("user_name".into(), json!(message.display_name));
    payload.insert("user_id".into(), json!(message.user_id));
    payload.insert("message".into(), json!(message.text));
    payload.insert("message_id".into(), json!(message.message_id));

    if let Some(bits) = message.bits {
        payload.insert("bits".into(), json!(bits));
        return finish(EventKind::Bits, "chat.cheer", payload);
    }

    match parse_command(&message.text) {
        Some(command) => {
            let mut event = finish(EventKind::Command, "chat.command", payload);
            event.command = Some(command);
            event
        }
        None => finish(EventKind::Chat, "chat.message", payload),
    }
}

/// Synthetic event submitted by the test UI.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TestEvent {
    #[serde(rename = "type")]
    pub event_type: String,
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default)]
    pub payload: Map<String, Value>,
    #[serde(default)]
    pub test_requirement: Option<String>,
}

impl TestEvent {
    /// An event that the given mapping would match, the way the settings
    /// UI's "fire test" button builds one.
    pub fn for_mapping(mapping: &Mapping, user: Option<&str>, requirement: Option<&str>) -> Self {
        let user = user
            .map(str::trim)
            .filter(|u| !u.is_empty())
            .unwrap_or(DEFAULT_TEST_USER)
            .to_string();
        let mut payload = Map::new();

        let event_type = match mapping.mapping_type {
            MappingType::Command => {
                let command = mapping.command.as_deref().unwrap_or("test");
                payload.insert("message".into(), json!(format!("!{}", command)));
                "chat"
            }
            MappingType::Redeem => {
                let title = mapping.reward_title.as_deref().unwrap_or("Test Reward");
                payload.insert("reward".into(), json!({ "title": title }));
                "channel.channel_points_custom_reward_redemption.add"
            }
            MappingType::Bits => {
                payload.insert(
                    "bits".into(),
                    json!(mapping.bits.unwrap_or(DEFAULT_TEST_BITS)),
                );
                "channel.cheer"
            }
            MappingType::Follow => "channel.follow",
            MappingType::Raid => {
                payload.insert("from_broadcaster_user_login".into(), json!(user));
                payload.insert("viewers".into(), json!(5));
                "channel.raid"
            }
            t => {
                let tier = match t.subscribe_tier() {
                    Some(SubTier::Tier2) => "2000",
                    Some(SubTier::Tier3) => "3000",
                    Some(SubTier::Prime) => "Prime",
                    _ => "1000",
                };
                payload.insert("tier".into(), json!(tier));
                "channel.subscribe"
            }
        };

        Self {
            event_type: event_type.to_string(),
            user: Some(user),
            payload,
            test_requirement: requirement.map(str::to_string),
        }
    }
}

pub fn normalize_test_event(test: TestEvent) -> CanonicalEvent {
    let mut payload = test.payload;
    if let Some(user) = test.user.as_deref().filter(|u| !u.trim().is_empty()) {
        payload
            .entry("user_login")
            .or_insert_with(|| json!(user.to_lowercase()));
        payload.entry("user_name").or_insert_with(|| json!(user));
    }

    let mut kind = classify_topic(&test.event_type);
    let mut command = None;
    if matches!(kind, EventKind::Chat | EventKind::Command) {
        let text = first_text(&payload, &["message", "text"]).unwrap_or_default();
        command = parse_command(&text).or_else(|| first_text(&payload, &["command"]));
        kind = if command.is_some() {
            EventKind::Command
        } else {
            EventKind::Chat
        };
    }

    let mut event = finish(kind, &test.event_type, payload);
    if kind == EventKind::Command {
        event.command = command.map(|c| c.trim_start_matches(COMMAND_PREFIX).to_lowercase());
    }
    event.test_requirement = test.test_requirement.as_deref().and_then(Requirement::parse);
    event.is_test = true;
    event
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::session::UserBadges;

    fn obj(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap()
    }

    fn chat(text: &str, bits: Option<u64>) -> ChatMessage {
        ChatMessage {
            channel: "streamer".to_string(),
            user_login: "viewer".to_string(),
            display_name: "Viewer".to_string(),
            user_id: Some("9".to_string()),
            message_id: None,
            text: text.to_string(),
            badges: UserBadges::default(),
            bits,
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn topics_map_to_canonical_kinds() {
        assert_eq!(
            classify_topic("channel.channel_points_custom_reward_redemption.add"),
            EventKind::Redeem
        );
        assert_eq!(classify_topic("channel.follow"), EventKind::Follow);
        assert_eq!(classify_topic("channel.subscribe"), EventKind::Subscribe);
        assert_eq!(classify_topic("channel.subscription.message"), EventKind::Subscribe);
        assert_eq!(
            classify_topic("channel.subscription.gift"),
            EventKind::SubscriptionGift
        );
        assert_eq!(classify_topic("channel.cheer"), EventKind::Bits);
        assert_eq!(classify_topic("channel.bits.use"), EventKind::Bits);
        assert_eq!(classify_topic("channel.raid"), EventKind::Raid);
        assert_eq!(classify_topic("stream.online"), EventKind::Unknown);
    }

    #[test]
    fn unknown_topics_keep_their_raw_type() {
        let event = normalize_notification("channel.hype_train.begin", json!({"level": 2}));
        assert_eq!(event.kind, EventKind::Unknown);
        assert_eq!(event.raw_type, "channel.hype_train.begin");
    }

    #[test]
    fn chat_commands_are_reclassified() {
        let event = normalize_chat(&chat("!HELLO world", None));
        assert_eq!(event.kind, EventKind::Command);
        assert_eq!(event.command.as_deref(), Some("hello"));
        assert_eq!(event.user.as_deref(), Some("viewer"));

        assert_eq!(normalize_chat(&chat("hello !there", None)).kind, EventKind::Chat);
        assert_eq!(normalize_chat(&chat("!", None)).kind, EventKind::Chat);
    }

    #[test]
    fn chat_cheers_become_bits_events() {
        let event = normalize_chat(&chat("Cheer300 hype", Some(300)));
        assert_eq!(event.kind, EventKind::Bits);
        assert_eq!(event.bits, Some(300));
    }

    #[test]
    fn bits_amount_prefers_explicit_fields() {
        assert_eq!(extract_bits_amount(&obj(json!({"bits": 500}))), Some(500));
        assert_eq!(extract_bits_amount(&obj(json!({"bits_used": "75"}))), Some(75));
        assert_eq!(
            extract_bits_amount(&obj(json!({"amount": 0, "user_input": "here are 20"}))),
            Some(20)
        );
    }

    #[test]
    fn bits_amount_falls_back_to_free_text_and_reward_title() {
        assert_eq!(
            extract_bits_amount(&obj(json!({"reward": {"title": "Spend 250 bits"}}))),
            Some(250)
        );
        assert_eq!(
            extract_bits_amount(&obj(json!({"message": {"text": "cheer 12345678 now"}}))),
            Some(1234567)
        );
        assert_eq!(extract_bits_amount(&obj(json!({"user_input": "none"}))), None);
    }

    #[test]
    fn sub_tiers_normalize_from_any_tier_field() {
        assert_eq!(normalize_sub_tier(&json!({"tier": "1000"})), SubTier::Tier1);
        assert_eq!(normalize_sub_tier(&json!({"tier": "2000"})), SubTier::Tier2);
        assert_eq!(normalize_sub_tier(&json!({"sub_plan": "3000"})), SubTier::Tier3);
        assert_eq!(normalize_sub_tier(&json!({"tier_name": "Tier 2"})), SubTier::Tier2);
        assert_eq!(
            normalize_sub_tier(&json!({"tier": "1000", "plan_name": "Prime"})),
            SubTier::Prime
        );
        assert_eq!(normalize_sub_tier(&json!({"plan": 1})), SubTier::Tier1);
        assert_eq!(normalize_sub_tier(&json!({})), SubTier::Any);
    }

    #[test]
    fn raid_user_comes_from_the_raiding_broadcaster() {
        let event = normalize_notification(
            "channel.raid",
            json!({"from_broadcaster_user_login": "raider", "to_broadcaster_user_login": "me", "viewers": 10}),
        );
        assert_eq!(event.user.as_deref(), Some("raider"));
    }

    #[test]
    fn redemption_extracts_reward_title() {
        let event = normalize_notification(
            "channel.channel_points_custom_reward_redemption.add",
            json!({"user_login": "fan", "user_input": "", "reward": {"title": "Hydrate", "cost": 100}}),
        );
        assert_eq!(event.kind, EventKind::Redeem);
        assert_eq!(event.reward_title.as_deref(), Some("Hydrate"));
        assert_eq!(event.user.as_deref(), Some("fan"));
        assert_eq!(event.bits, None);
    }

    #[test]
    fn test_events_are_flagged_and_carry_requirement_override() {
        let event = normalize_test_event(TestEvent {
            event_type: "chat".to_string(),
            user: Some("Tester".to_string()),
            payload: obj(json!({"message": "!Boom now"})),
            test_requirement: Some("vip".to_string()),
        });
        assert!(event.is_test);
        assert_eq!(event.kind, EventKind::Command);
        assert_eq!(event.command.as_deref(), Some("boom"));
        assert_eq!(event.user.as_deref(), Some("tester"));
        assert_eq!(event.test_requirement, Some(Requirement::Vip));
    }

    #[test]
    fn test_event_for_subscribe_mapping_carries_the_tier() {
        let mapping = Mapping {
            id: "m".to_string(),
            mapping_type: MappingType::SubscribeTier3,
            card_labels: vec!["A".to_string()],
            command: None,
            reward_title: None,
            bits: None,
            requirement: Requirement::None,
        };
        let event = normalize_test_event(TestEvent::for_mapping(&mapping, None, None));
        assert_eq!(event.kind, EventKind::Subscribe);
        assert_eq!(event.tier, Some(SubTier::Tier3));
        assert_eq!(event.user.as_deref(), Some("t3stus3r"));
    }
}
