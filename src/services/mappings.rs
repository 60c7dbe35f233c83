use std::sync::Arc;

use rand::seq::SliceRandom;
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::db::models::{Mapping, MappingType, Requirement, SubTier};
use crate::services::normalizer::{CanonicalEvent, EventKind};
use crate::services::notifications::{Notification, NotificationBus};
use crate::services::session::SessionContext;
use crate::services::twitch::HelixApi;

/// Knobs for the requirement gate.
#[derive(Debug, Clone, Copy)]
pub struct GatePolicy {
    /// Let subscribers, VIPs and moderators through a `follower` requirement.
    pub follower_accepts_elevated: bool,
}

impl Default for GatePolicy {
    fn default() -> Self {
        Self {
            follower_accepts_elevated: true,
        }
    }
}

/// A mapping that matched and passed its requirement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dispatch {
    pub mapping_id: String,
    pub card_labels: Vec<String>,
    pub selected_label: String,
}

// ============================================================================
// Matching
// ============================================================================

/// Best bits mapping for `amount`: the highest threshold not above it, else a
/// threshold-less mapping.
pub fn best_bits_mapping(mappings: &[Mapping], amount: Option<u64>) -> Option<&Mapping> {
    let bits_mappings = || {
        mappings
            .iter()
            .filter(|m| m.mapping_type == MappingType::Bits)
    };

    amount
        .and_then(|amount| {
            bits_mappings()
                .filter(|m| m.bits.is_some_and(|t| t <= amount))
                .max_by_key(|m| m.bits)
        })
        .or_else(|| bits_mappings().find(|m| m.bits.is_none()))
}

fn tier_matches(wanted: SubTier, actual: Option<SubTier>) -> bool {
    wanted == SubTier::Any || actual == Some(wanted)
}

/// The mapping an event triggers, if any.
pub fn match_mapping<'a>(mappings: &'a [Mapping], event: &CanonicalEvent) -> Option<&'a Mapping> {
    match event.kind {
        EventKind::Command => {
            let command = event.command.as_deref()?;
            mappings.iter().find(|m| {
                m.mapping_type == MappingType::Command
                    && m.command
                        .as_deref()
                        .is_some_and(|c| c.eq_ignore_ascii_case(command))
            })
        }
        EventKind::Redeem => {
            let redeems = || {
                mappings
                    .iter()
                    .filter(|m| m.mapping_type == MappingType::Redeem)
            };
            // A title filter that matches beats a catch-all.
            let title = event.reward_title.as_deref();
            redeems()
                .find(|m| {
                    matches!((m.reward_title.as_deref(), title),
                        (Some(filter), Some(t)) if filter.eq_ignore_ascii_case(t))
                })
                .or_else(|| redeems().find(|m| m.reward_title.is_none()))
                // A redemption carrying an amount can still land on a bits mapping.
                .or_else(|| {
                    event
                        .bits
                        .and_then(|amount| best_bits_mapping(mappings, Some(amount)))
                })
        }
        EventKind::Follow => mappings
            .iter()
            .find(|m| m.mapping_type == MappingType::Follow),
        EventKind::Raid => mappings.iter().find(|m| m.mapping_type == MappingType::Raid),
        EventKind::Subscribe => mappings.iter().find(|m| {
            m.mapping_type
                .subscribe_tier()
                .is_some_and(|wanted| tier_matches(wanted, event.tier))
        }),
        EventKind::Bits => best_bits_mapping(mappings, event.bits),
        EventKind::Chat | EventKind::SubscriptionGift | EventKind::Unknown => None,
    }
}

// ============================================================================
// Requirement gate
// ============================================================================

/// Whether a simulated requirement from the test UI satisfies `required`.
pub fn test_override_satisfies(required: Requirement, simulated: Requirement, policy: GatePolicy) -> bool {
    let simulated_tier = simulated.required_tier();
    match required {
        Requirement::None => true,
        Requirement::Follower => {
            simulated == Requirement::Follower
                || (policy.follower_accepts_elevated
                    && (simulated_tier.is_some()
                        || matches!(simulated, Requirement::Vip | Requirement::Moderator)))
        }
        Requirement::Subscriber => simulated_tier.is_some(),
        Requirement::Vip => simulated == Requirement::Vip,
        Requirement::Moderator => simulated == Requirement::Moderator,
        tiered => simulated == tiered,
    }
}

pub struct MappingEngine {
    mappings: RwLock<Vec<Mapping>>,
    api: Arc<dyn HelixApi>,
    ctx: Arc<SessionContext>,
    bus: Arc<NotificationBus>,
    policy: GatePolicy,
}

impl MappingEngine {
    pub fn new(
        api: Arc<dyn HelixApi>,
        ctx: Arc<SessionContext>,
        bus: Arc<NotificationBus>,
        policy: GatePolicy,
    ) -> Self {
        Self {
            mappings: RwLock::new(Vec::new()),
            api,
            ctx,
            bus,
            policy,
        }
    }

    /// Replace the in-memory mapping list after a change in the store.
    pub async fn reload(&self, mappings: Vec<Mapping>) {
        debug!("Mapping engine reloaded with {} mapping(s)", mappings.len());
        *self.mappings.write().await = mappings;
    }

    /// Whether the event's user meets `requirement`. Fails closed when the
    /// user is unknown unless a test override is present.
    pub async fn requirement_satisfied(&self, requirement: Requirement, event: &CanonicalEvent) -> bool {
        if requirement == Requirement::None {
            return true;
        }
        if let Some(simulated) = event.test_requirement {
            return test_override_satisfies(requirement, simulated, self.policy);
        }
        let Some(login) = event.user.as_deref().map(str::to_lowercase) else {
            debug!("No resolvable user on {} event; requirement not met", event.raw_type);
            return false;
        };

        match requirement {
            Requirement::None => true,
            Requirement::Follower => {
                if self.api.check_follows(&login).await {
                    return true;
                }
                self.policy.follower_accepts_elevated
                    && (self.ctx.badges.is_vip(&login)
                        || self.ctx.badges.is_moderator(&login)
                        || self.api.check_subscriber(&login).await)
            }
            Requirement::Vip => self.ctx.badges.is_vip(&login),
            Requirement::Moderator => self.ctx.badges.is_moderator(&login),
            subscriber => {
                let wanted = subscriber.required_tier().unwrap_or(SubTier::Any);
                match self.ctx.tier_cache.resolve(self.api.as_ref(), &login).await {
                    Some(tier) => tier_matches(wanted, Some(tier)),
                    // Tier unknown: a confirmed subscriber still passes.
                    None => self.api.check_subscriber(&login).await,
                }
            }
        }
    }

    /// Match, gate and dispatch one event.
    pub async fn handle(&self, event: &CanonicalEvent) -> Option<Dispatch> {
        let mapping = {
            let mappings = self.mappings.read().await;
            match_mapping(&mappings, event)?.clone()
        };

        if !self.requirement_satisfied(mapping.requirement, event).await {
            info!(
                "Mapping {} matched {:?} from {:?} but requirement {:?} was not met",
                mapping.id, event.kind, event.user, mapping.requirement
            );
            return None;
        }

        let selected_label = mapping
            .card_labels
            .choose(&mut rand::thread_rng())?
            .clone();

        info!(
            "Mapping {} triggered by {:?} event; playing {}",
            mapping.id, event.kind, selected_label
        );
        self.bus.publish(Notification::MappingTriggered {
            mapping_id: mapping.id.clone(),
            card_labels: mapping.card_labels.clone(),
            selected_label: selected_label.clone(),
            event_id: event.id.clone(),
        });

        Some(Dispatch {
            mapping_id: mapping.id,
            card_labels: mapping.card_labels,
            selected_label,
        })
    }
}
