use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Subscription tier as understood by mappings and requirement checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SubTier {
    Tier1,
    Tier2,
    Tier3,
    Prime,
    Any,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MappingType {
    #[serde(rename = "command")]
    Command,
    #[serde(rename = "redeem")]
    Redeem,
    #[serde(rename = "bits")]
    Bits,
    #[serde(rename = "follow")]
    Follow,
    #[serde(rename = "subscribe-any", alias = "sub_any", alias = "sub")]
    SubscribeAny,
    #[serde(rename = "subscribe-tier1", alias = "sub_tier1")]
    SubscribeTier1,
    #[serde(rename = "subscribe-tier2", alias = "sub_tier2")]
    SubscribeTier2,
    #[serde(rename = "subscribe-tier3", alias = "sub_tier3")]
    SubscribeTier3,
    #[serde(rename = "subscribe-prime", alias = "sub_prime")]
    SubscribePrime,
    #[serde(rename = "raid")]
    Raid,
}

/// Mapping types limited to a single mapping at a time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExclusiveClass {
    Follow,
    Subscribe,
    Raid,
}

impl ExclusiveClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExclusiveClass::Follow => "follow",
            ExclusiveClass::Subscribe => "subscribe",
            ExclusiveClass::Raid => "raid",
        }
    }
}

impl MappingType {
    /// All `subscribe-*` variants share one class.
    pub fn exclusive_class(&self) -> Option<ExclusiveClass> {
        match self {
            MappingType::Follow => Some(ExclusiveClass::Follow),
            MappingType::Raid => Some(ExclusiveClass::Raid),
            t if t.subscribe_tier().is_some() => Some(ExclusiveClass::Subscribe),
            _ => None,
        }
    }

    pub fn subscribe_tier(&self) -> Option<SubTier> {
        match self {
            MappingType::SubscribeAny => Some(SubTier::Any),
            MappingType::SubscribeTier1 => Some(SubTier::Tier1),
            MappingType::SubscribeTier2 => Some(SubTier::Tier2),
            MappingType::SubscribeTier3 => Some(SubTier::Tier3),
            MappingType::SubscribePrime => Some(SubTier::Prime),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Requirement {
    #[default]
    #[serde(rename = "none", alias = "")]
    None,
    #[serde(rename = "follower")]
    Follower,
    #[serde(rename = "subscriber", alias = "sub_any")]
    Subscriber,
    #[serde(rename = "subscriber-tier1", alias = "sub_tier1")]
    SubscriberTier1,
    #[serde(rename = "subscriber-tier2", alias = "sub_tier2")]
    SubscriberTier2,
    #[serde(rename = "subscriber-tier3", alias = "sub_tier3")]
    SubscriberTier3,
    #[serde(rename = "subscriber-prime", alias = "sub_prime")]
    SubscriberPrime,
    #[serde(rename = "vip")]
    Vip,
    #[serde(rename = "moderator", alias = "mod")]
    Moderator,
}

impl Requirement {
    /// Tier demanded by subscriber requirements; `Any` for plain `subscriber`.
    pub fn required_tier(&self) -> Option<SubTier> {
        match self {
            Requirement::Subscriber => Some(SubTier::Any),
            Requirement::SubscriberTier1 => Some(SubTier::Tier1),
            Requirement::SubscriberTier2 => Some(SubTier::Tier2),
            Requirement::SubscriberTier3 => Some(SubTier::Tier3),
            Requirement::SubscriberPrime => Some(SubTier::Prime),
            _ => None,
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        serde_json::from_value(serde_json::Value::String(raw.trim().to_lowercase())).ok()
    }
}

/// A user-authored rule linking an event pattern to sound cards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", from = "StoredMapping")]
pub struct Mapping {
    pub id: String,
    #[serde(rename = "type")]
    pub mapping_type: MappingType,
    pub card_labels: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reward_title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bits: Option<u64>,
    pub requirement: Requirement,
}

/// On-disk shape, including fields written by older builds.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StoredMapping {
    #[serde(default)]
    id: String,
    #[serde(rename = "type")]
    mapping_type: MappingType,
    #[serde(default)]
    card_labels: Vec<String>,
    #[serde(default)]
    card_label: Option<String>,
    #[serde(default)]
    command: Option<String>,
    #[serde(default)]
    reward_title: Option<String>,
    #[serde(default)]
    bits: Option<u64>,
    #[serde(default)]
    requirement: Option<Requirement>,
}

impl From<StoredMapping> for Mapping {
    fn from(stored: StoredMapping) -> Self {
        let mut card_labels = clean_labels(stored.card_labels);
        if card_labels.is_empty() {
            card_labels = clean_labels(stored.card_label.into_iter().collect());
        }

        Mapping {
            id: if stored.id.is_empty() {
                Uuid::new_v4().to_string()
            } else {
                stored.id
            },
            mapping_type: stored.mapping_type,
            card_labels,
            command: stored.command.as_deref().and_then(clean_command),
            reward_title: stored.reward_title.as_deref().and_then(clean_text),
            bits: stored.bits.filter(|b| *b > 0),
            requirement: stored.requirement.unwrap_or_default(),
        }
    }
}

impl Mapping {
    /// What tells this mapping apart from others of the same type, for the
    /// types that allow several. Two mappings sharing a key cannot both fire.
    pub fn trigger_key(&self) -> Option<String> {
        match self.mapping_type {
            MappingType::Command => self
                .command
                .as_deref()
                .map(|c| format!("!{}", c.to_lowercase())),
            MappingType::Redeem => Some(match &self.reward_title {
                Some(title) => format!("reward \"{}\"", title.to_lowercase()),
                None => "any reward".to_string(),
            }),
            MappingType::Bits => Some(match self.bits {
                Some(threshold) => format!("{} bits", threshold),
                None => "any bits".to_string(),
            }),
            _ => None,
        }
    }
}

/// Payload for creating or replacing a mapping.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MappingInput {
    #[serde(rename = "type")]
    pub mapping_type: MappingType,
    #[serde(default)]
    pub card_labels: Vec<String>,
    #[serde(default)]
    pub command: Option<String>,
    #[serde(default)]
    pub reward_title: Option<String>,
    #[serde(default)]
    pub bits: Option<i64>,
    #[serde(default)]
    pub requirement: Requirement,
}

impl MappingInput {
    /// Validates the input in isolation and builds the mapping to store.
    pub fn into_mapping(self, id: String) -> Result<Mapping, MappingRejection> {
        let card_labels = clean_labels(self.card_labels);
        if card_labels.is_empty() {
            return Err(MappingRejection::MissingCardLabels);
        }

        let command = self.command.as_deref().and_then(clean_command);
        if self.mapping_type == MappingType::Command && command.is_none() {
            return Err(MappingRejection::MissingCommand);
        }

        let bits = match self.bits {
            None => None,
            Some(b) if b > 0 => Some(b as u64),
            Some(_) => return Err(MappingRejection::InvalidBitsThreshold),
        };

        Ok(Mapping {
            id,
            mapping_type: self.mapping_type,
            card_labels,
            command: (self.mapping_type == MappingType::Command)
                .then_some(command)
                .flatten(),
            reward_title: (self.mapping_type == MappingType::Redeem)
                .then(|| self.reward_title.as_deref().and_then(clean_text))
                .flatten(),
            bits: (self.mapping_type == MappingType::Bits)
                .then_some(bits)
                .flatten(),
            requirement: self.requirement,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MappingRejection {
    #[error("at least one card label is required")]
    MissingCardLabels,

    #[error("command mappings need a command word")]
    MissingCommand,

    #[error("bits threshold must be a positive integer")]
    InvalidBitsThreshold,

    #[error("a {} mapping already exists", .0.as_str())]
    DuplicateExclusiveType(ExclusiveClass),

    #[error("another mapping already triggers on {0}")]
    DuplicateTrigger(String),

    #[error("mapping {0} does not exist")]
    NotFound(String),
}

impl MappingRejection {
    /// Stable reason code surfaced to the UI.
    pub fn code(&self) -> &'static str {
        match self {
            MappingRejection::MissingCardLabels => "missing_card_labels",
            MappingRejection::MissingCommand => "missing_command",
            MappingRejection::InvalidBitsThreshold => "invalid_bits_threshold",
            MappingRejection::DuplicateExclusiveType(_) => "duplicate_exclusive_type",
            MappingRejection::DuplicateTrigger(_) => "duplicate_trigger",
            MappingRejection::NotFound(_) => "not_found",
        }
    }
}

/// Whole mappings document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MappingDocument {
    #[serde(deserialize_with = "lenient_mappings")]
    pub mappings: Vec<Mapping>,
}

/// Entries that no longer parse are dropped one by one so the rest survive.
fn lenient_mappings<'de, D>(deserializer: D) -> Result<Vec<Mapping>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Option::<Vec<Value>>::deserialize(deserializer)?.unwrap_or_default();
    Ok(raw
        .into_iter()
        .enumerate()
        .filter_map(|(index, entry)| match serde_json::from_value::<Mapping>(entry) {
            Ok(mapping) => Some(mapping),
            Err(e) => {
                tracing::warn!("Skipping unreadable mapping at index {}: {}", index, e);
                None
            }
        })
        .collect())
}

fn clean_labels(labels: Vec<String>) -> Vec<String> {
    let mut out: Vec<String> = Vec::with_capacity(labels.len());
    for label in labels {
        let label = label.trim();
        if !label.is_empty() && !out.iter().any(|l| l == label) {
            out.push(label.to_string());
        }
    }
    out
}

fn clean_text(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}

fn clean_command(raw: &str) -> Option<String> {
    clean_text(raw.trim().trim_start_matches('!'))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn input(mapping_type: MappingType) -> MappingInput {
        MappingInput {
            mapping_type,
            card_labels: vec!["Airhorn".to_string()],
            command: None,
            reward_title: None,
            bits: None,
            requirement: Requirement::None,
        }
    }

    #[test]
    fn legacy_card_label_and_spellings_are_folded() {
        let mapping: Mapping = serde_json::from_str(
            r#"{"id":"m1","type":"sub_tier2","cardLabel":"Drum","requirement":"mod","command":"!Hi"}"#,
        )
        .unwrap();
        assert_eq!(mapping.mapping_type, MappingType::SubscribeTier2);
        assert_eq!(mapping.card_labels, vec!["Drum".to_string()]);
        assert_eq!(mapping.requirement, Requirement::Moderator);
        assert_eq!(mapping.command.as_deref(), Some("Hi"));
    }

    #[test]
    fn unreadable_entries_are_skipped_not_fatal() {
        let doc: MappingDocument = serde_json::from_str(
            r#"{"mappings":[
                {"id":"r","type":"raid","cardLabels":["Horn"]},
                {"id":"h","type":"hosted","cardLabels":["Bell"]},
                {"id":"f","type":"follow","cardLabels":["Drum"],"requirement":"royalty"}
            ]}"#,
        )
        .unwrap();
        assert_eq!(doc.mappings.len(), 1);
        assert_eq!(doc.mappings[0].id, "r");

        let empty: MappingDocument = serde_json::from_str(r#"{"mappings":null}"#).unwrap();
        assert!(empty.mappings.is_empty());
    }

    #[test]
    fn missing_id_gets_generated() {
        let mapping: Mapping =
            serde_json::from_str(r#"{"type":"follow","cardLabels":["A"]}"#).unwrap();
        assert!(!mapping.id.is_empty());
        assert_eq!(mapping.requirement, Requirement::None);
    }

    #[test]
    fn serialized_mapping_uses_kebab_types() {
        let mapping = input(MappingType::SubscribePrime)
            .into_mapping("x".to_string())
            .unwrap();
        let json = serde_json::to_value(&mapping).unwrap();
        assert_eq!(json["type"], "subscribe-prime");
        assert_eq!(json["cardLabels"][0], "Airhorn");
        assert!(json.get("cardLabel").is_none());
    }

    #[test]
    fn command_input_requires_command_and_strips_prefix() {
        let err = input(MappingType::Command)
            .into_mapping("x".to_string())
            .unwrap_err();
        assert_eq!(err.code(), "missing_command");

        let mut with_cmd = input(MappingType::Command);
        with_cmd.command = Some("  !hello ".to_string());
        let mapping = with_cmd.into_mapping("x".to_string()).unwrap();
        assert_eq!(mapping.command.as_deref(), Some("hello"));
    }

    #[test]
    fn labels_are_required_and_deduplicated() {
        let mut empty = input(MappingType::Raid);
        empty.card_labels = vec!["  ".to_string()];
        assert_eq!(
            empty.into_mapping("x".to_string()).unwrap_err(),
            MappingRejection::MissingCardLabels
        );

        let mut dup = input(MappingType::Raid);
        dup.card_labels = vec!["A".to_string(), " A".to_string(), "B".to_string()];
        let mapping = dup.into_mapping("x".to_string()).unwrap();
        assert_eq!(mapping.card_labels, vec!["A".to_string(), "B".to_string()]);
    }

    #[test]
    fn bits_threshold_must_be_positive() {
        let mut bad = input(MappingType::Bits);
        bad.bits = Some(0);
        assert_eq!(
            bad.into_mapping("x".to_string()).unwrap_err().code(),
            "invalid_bits_threshold"
        );

        let mut any = input(MappingType::Bits);
        any.bits = None;
        assert_eq!(any.into_mapping("x".to_string()).unwrap().bits, None);
    }

    #[test]
    fn subscribe_variants_share_one_exclusive_class() {
        assert_eq!(
            MappingType::SubscribeTier1.exclusive_class(),
            MappingType::SubscribePrime.exclusive_class()
        );
        assert_eq!(MappingType::Command.exclusive_class(), None);
        assert_eq!(
            MappingType::Follow.exclusive_class(),
            Some(ExclusiveClass::Follow)
        );
    }

    #[test]
    fn requirement_parse_accepts_legacy_values() {
        assert_eq!(Requirement::parse("sub_tier3"), Some(Requirement::SubscriberTier3));
        assert_eq!(Requirement::parse("MOD"), Some(Requirement::Moderator));
        assert_eq!(Requirement::parse("nonsense"), None);
        assert_eq!(Requirement::Subscriber.required_tier(), Some(SubTier::Any));
    }
}
