use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::db::models::TopicKey;
use crate::db::TopicConfigRepository;
use crate::error::AppResult;
use crate::services::notifications::DeletionResult;
use crate::services::session::SessionContext;
use crate::services::twitch::{
    CreateOutcome, DeleteOutcome, DesiredSubscription, HelixApi, SubscriptionDescriptor,
};

const FOLLOW_TYPE: &str = "channel.follow";

/// Concrete subscription for a topic, or `None` for topics the follower
/// poller covers instead.
pub fn desired_subscription(topic: TopicKey, broadcaster_id: &str) -> Option<DesiredSubscription> {
    let condition_key = match topic {
        TopicKey::Follow => return None,
        TopicKey::Raid => "to_broadcaster_user_id",
        _ => "broadcaster_user_id",
    };

    Some(DesiredSubscription {
        subscription_type: topic.subscription_type().to_string(),
        version: topic.subscription_version().to_string(),
        condition: HashMap::from([(condition_key.to_string(), broadcaster_id.to_string())]),
    })
}

// ============================================================================
// In-flight tracking
// ============================================================================

/// Fingerprints with a create request currently outstanding.
#[derive(Debug, Clone, Default)]
pub struct InFlightTracker {
    active: Arc<Mutex<HashSet<String>>>,
}

impl InFlightTracker {
    /// Claim `fingerprint`. `None` means another caller holds it.
    pub fn try_begin(&self, fingerprint: &str) -> Option<InFlightGuard> {
        let mut active = self.active.lock().ok()?;
        if !active.insert(fingerprint.to_string()) {
            return None;
        }
        Some(InFlightGuard {
            active: self.active.clone(),
            fingerprint: fingerprint.to_string(),
        })
    }

    pub fn contains(&self, fingerprint: &str) -> bool {
        self.active
            .lock()
            .map(|active| active.contains(fingerprint))
            .unwrap_or(false)
    }
}

/// Releases its fingerprint when dropped.
#[derive(Debug)]
pub struct InFlightGuard {
    active: Arc<Mutex<HashSet<String>>>,
    fingerprint: String,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        if let Ok(mut active) = self.active.lock() {
            active.remove(&self.fingerprint);
        }
    }
}

struct RunningGuard<'a>(&'a AtomicBool);

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

// ============================================================================
// Reconciler
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ReconcileStatus {
    Completed,
    /// No session yet; topics were stored and will apply once one opens.
    Deferred,
    AlreadyRunning,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconcileReport {
    pub status: ReconcileStatus,
    pub created: Vec<String>,
    pub deleted: Vec<String>,
    /// Subscription types the provider refused with 410.
    pub unavailable: Vec<String>,
    pub failed: Vec<String>,
    pub skipped_in_flight: Vec<String>,
}

impl ReconcileReport {
    fn new(status: ReconcileStatus) -> Self {
        Self {
            status,
            created: Vec::new(),
            deleted: Vec::new(),
            unavailable: Vec::new(),
            failed: Vec::new(),
            skipped_in_flight: Vec::new(),
        }
    }
}

/// Converges the provider's subscriptions to the desired topics.
pub struct SubscriptionManager {
    api: Arc<dyn HelixApi>,
    ctx: Arc<SessionContext>,
    running: AtomicBool,
    in_flight: InFlightTracker,
}

impl SubscriptionManager {
    pub fn new(api: Arc<dyn HelixApi>, ctx: Arc<SessionContext>, in_flight: InFlightTracker) -> Self {
        Self {
            api,
            ctx,
            running: AtomicBool::new(false),
            in_flight,
        }
    }

    /// Persist `topics` as the desired set, then reconcile against them.
    pub async fn reconcile(&self, topics: BTreeSet<TopicKey>) -> AppResult<ReconcileReport> {
        TopicConfigRepository::set_topics(&self.ctx.topics, topics).await?;
        self.reconcile_persisted().await
    }

    /// Reconcile against whatever topics are currently persisted.
    pub async fn reconcile_persisted(&self) -> AppResult<ReconcileReport> {
        let Some(session_id) = self.ctx.session_id().await else {
            debug!("No EventSub session yet; reconciliation deferred");
            return Ok(ReconcileReport::new(ReconcileStatus::Deferred));
        };

        if self.running.swap(true, Ordering::SeqCst) {
            debug!("Reconciliation already running; skipping");
            return Ok(ReconcileReport::new(ReconcileStatus::AlreadyRunning));
        }
        let _running = RunningGuard(&self.running);

        let Some(broadcaster_id) = self.broadcaster_id().await else {
            warn!("Broadcaster id could not be resolved; reconciliation deferred");
            return Ok(ReconcileReport::new(ReconcileStatus::Deferred));
        };

        let topics = TopicConfigRepository::get(&self.ctx.topics).await.topics;
        self.run(&topics, &broadcaster_id, &session_id).await
    }

    async fn broadcaster_id(&self) -> Option<String> {
        if let Some(id) = self.ctx.broadcaster_user_id().await {
            return Some(id);
        }
        let creds = self.ctx.credentials().await?;
        let id = self.api.resolve_user_id(&creds.login).await?;
        self.ctx.set_broadcaster_user_id(id.clone()).await;
        Some(id)
    }

    async fn run(
        &self,
        topics: &BTreeSet<TopicKey>,
        broadcaster_id: &str,
        session_id: &str,
    ) -> AppResult<ReconcileReport> {
        let mut report = ReconcileReport::new(ReconcileStatus::Completed);

        let desired: Vec<DesiredSubscription> = topics
            .iter()
            .filter_map(|t| desired_subscription(*t, broadcaster_id))
            .collect();
        let desired_fingerprints: HashSet<String> =
            desired.iter().map(DesiredSubscription::fingerprint).collect();

        let current = self.api.list_subscriptions().await;

        // An empty listing may just be a failed request, so only a non-empty
        // one is trusted to prune owned ids.
        if !current.is_empty() {
            let live: HashSet<&str> = current.iter().map(|s| s.id.as_str()).collect();
            let pruned = TopicConfigRepository::retain_owned_ids(&self.ctx.topics, &live).await?;
            if !pruned.is_empty() {
                info!("Pruned {} owned subscription id(s) no longer listed", pruned.len());
            }
        }
        let owned = self.ctx.owned_subscription_ids().await;
        let may_delete = |sub: &SubscriptionDescriptor| owned.is_empty() || owned.contains(&sub.id);

        // Add phase: decide everything before any removal is considered.
        let mut stale: Vec<&SubscriptionDescriptor> = Vec::new();
        let mut missing: Vec<&DesiredSubscription> = Vec::new();
        for want in &desired {
            let fingerprint = want.fingerprint();
            let matching: Vec<&SubscriptionDescriptor> = current
                .iter()
                .filter(|s| s.fingerprint() == fingerprint)
                .collect();

            if matching.iter().any(|s| s.session_id() == Some(session_id)) {
                continue;
            }
            for old in matching {
                if may_delete(old) {
                    stale.push(old);
                } else {
                    debug!(
                        "Leaving {} ({}) bound to another session; not ours to delete",
                        old.subscription_type, old.id
                    );
                }
            }
            missing.push(want);
        }

        let extra: Vec<&SubscriptionDescriptor> = current
            .iter()
            .filter(|s| !desired_fingerprints.contains(&s.fingerprint()))
            .filter(|s| s.subscription_type != FOLLOW_TYPE)
            .filter(|s| may_delete(*s))
            .collect();

        for old in stale {
            info!(
                "Replacing {} ({}) bound to stale session {:?}",
                old.subscription_type,
                old.id,
                old.session_id()
            );
            self.record_delete(&old.id, &mut report).await?;
        }

        for want in missing {
            self.create(want, session_id, &mut report).await?;
        }

        for sub in extra {
            info!("Removing unwanted {} ({})", sub.subscription_type, sub.id);
            self.record_delete(&sub.id, &mut report).await?;
        }

        info!(
            "Reconciliation done: {} created, {} deleted, {} unavailable, {} failed",
            report.created.len(),
            report.deleted.len(),
            report.unavailable.len(),
            report.failed.len()
        );
        Ok(report)
    }

    async fn create(
        &self,
        want: &DesiredSubscription,
        session_id: &str,
        report: &mut ReconcileReport,
    ) -> AppResult<()> {
        let fingerprint = want.fingerprint();
        let Some(_guard) = self.in_flight.try_begin(&fingerprint) else {
            debug!("Create for {} already in flight", fingerprint);
            report.skipped_in_flight.push(want.subscription_type.clone());
            return Ok(());
        };

        match self.api.create_subscription(want, session_id).await {
            CreateOutcome::Created(created) => {
                info!("Created {} ({})", created.subscription_type, created.id);
                TopicConfigRepository::add_owned_id(&self.ctx.topics, &created.id).await?;
                report.created.push(created.id);
            }
            CreateOutcome::Unavailable => {
                report.unavailable.push(want.subscription_type.clone());
            }
            CreateOutcome::Failed(e) => {
                warn!("Creating {} failed: {}", want.subscription_type, e);
                report.failed.push(want.subscription_type.clone());
            }
        }
        Ok(())
    }

    async fn record_delete(&self, id: &str, report: &mut ReconcileReport) -> AppResult<()> {
        match self.delete_owned(id).await? {
            DeleteOutcome::Failed(e) => {
                warn!("Deleting subscription {} failed: {}", id, e);
                report.failed.push(id.to_string());
            }
            _ => report.deleted.push(id.to_string()),
        }
        Ok(())
    }

    /// Delete `id` on the provider and stop tracking it once it is gone.
    pub async fn delete_owned(&self, id: &str) -> AppResult<DeleteOutcome> {
        let outcome = self.api.delete_subscription(id).await;
        if outcome.is_success() {
            TopicConfigRepository::remove_owned_id(&self.ctx.topics, id).await?;
        }
        Ok(outcome)
    }

    /// Best-effort delete of every owned subscription. Each id gets its own
    /// result; one failure never stops the rest.
    pub async fn clear_owned(&self) -> Vec<DeletionResult> {
        let owned = self.ctx.owned_subscription_ids().await;
        let mut results = Vec::with_capacity(owned.len());

        for id in owned {
            let result = match self.delete_owned(&id).await {
                Ok(DeleteOutcome::Deleted) => (true, "deleted".to_string()),
                Ok(DeleteOutcome::AlreadyGone) => (true, "already gone".to_string()),
                Ok(DeleteOutcome::Failed(e)) => (false, e),
                Err(e) => (false, format!("deleted, but tracking update failed: {}", e)),
            };
            if !result.0 {
                warn!("Could not clear subscription {}: {}", id, result.1);
            }
            results.push(DeletionResult {
                id,
                success: result.0,
                detail: result.1,
            });
        }
        results
    }

    /// Live subscriptions, each flagged with whether this process owns it.
    pub async fn list_with_ownership(&self) -> Vec<(SubscriptionDescriptor, bool)> {
        let owned = self.ctx.owned_subscription_ids().await;
        self.api
            .list_subscriptions()
            .await
            .into_iter()
            .map(|s| {
                let is_owned = owned.contains(&s.id);
                (s, is_owned)
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::testing::{connected_context, test_context, FakeHelix, BROADCASTER_ID};

    fn topics(keys: &[TopicKey]) -> BTreeSet<TopicKey> {
        keys.iter().copied().collect()
    }

    async fn manager(session: &str) -> (SubscriptionManager, Arc<FakeHelix>, Arc<SessionContext>) {
        let fake = Arc::new(FakeHelix::default());
        let ctx = connected_context(session).await;
        let manager = SubscriptionManager::new(fake.clone(), ctx.clone(), InFlightTracker::default());
        (manager, fake, ctx)
    }

    fn want(topic: TopicKey) -> DesiredSubscription {
        desired_subscription(topic, BROADCASTER_ID).unwrap()
    }

    #[test]
    fn follow_has_no_eventsub_descriptor() {
        assert!(desired_subscription(TopicKey::Follow, "1").is_none());
        let raid = desired_subscription(TopicKey::Raid, "1").unwrap();
        assert_eq!(raid.condition["to_broadcaster_user_id"], "1");
        let cheer = desired_subscription(TopicKey::Cheer, "1").unwrap();
        assert_eq!(cheer.subscription_type, "channel.cheer");
        assert_eq!(cheer.condition["broadcaster_user_id"], "1");
    }

    #[test]
    fn in_flight_tracker_releases_on_drop() {
        let tracker = InFlightTracker::default();
        let guard = tracker.try_begin("fp").unwrap();
        assert!(tracker.try_begin("fp").is_none());
        assert!(tracker.contains("fp"));
        drop(guard);
        assert!(!tracker.contains("fp"));
        assert!(tracker.try_begin("fp").is_some());
    }

    #[tokio::test]
    async fn fresh_topics_are_created_and_owned() {
        let (manager, fake, ctx) = manager("S1").await;

        let report = manager
            .reconcile(topics(&[TopicKey::Redemption, TopicKey::Subscribe]))
            .await
            .unwrap();

        assert_eq!(report.status, ReconcileStatus::Completed);
        assert_eq!(fake.created().len(), 2);
        assert!(fake.deleted().is_empty());
        assert_eq!(ctx.owned_subscription_ids().await.len(), 2);
    }

    #[tokio::test]
    async fn second_run_makes_no_calls() {
        let (manager, fake, _ctx) = manager("S1").await;
        let desired = topics(&[TopicKey::Redemption, TopicKey::Raid, TopicKey::Follow]);

        manager.reconcile(desired.clone()).await.unwrap();
        let created = fake.created().len();
        assert_eq!(created, 2);

        let report = manager.reconcile(desired).await.unwrap();
        assert!(report.created.is_empty());
        assert!(report.deleted.is_empty());
        assert_eq!(fake.created().len(), created);
        assert!(fake.deleted().is_empty());
    }

    #[tokio::test]
    async fn stale_session_subscription_is_replaced() {
        let (manager, fake, ctx) = manager("S2").await;
        fake.seed_subscription("old", &want(TopicKey::Redemption), "S1");
        TopicConfigRepository::add_owned_id(&ctx.topics, "old").await.unwrap();

        let report = manager
            .reconcile(topics(&[TopicKey::Redemption]))
            .await
            .unwrap();

        assert_eq!(fake.deleted(), vec!["old".to_string()]);
        assert_eq!(report.created.len(), 1);
        let live = fake.live();
        assert_eq!(live.len(), 1);
        assert_eq!(live[0].session_id(), Some("S2"));
        assert!(!ctx.owned_subscription_ids().await.contains("old"));
    }

    #[tokio::test]
    async fn foreign_subscriptions_survive_when_ownership_is_known() {
        let (manager, fake, ctx) = manager("S1").await;
        fake.seed_subscription("mine", &want(TopicKey::Cheer), "S1");
        fake.seed_subscription("theirs", &want(TopicKey::Raid), "S1");
        TopicConfigRepository::add_owned_id(&ctx.topics, "mine").await.unwrap();

        manager.reconcile(BTreeSet::new()).await.unwrap();

        assert_eq!(fake.deleted(), vec!["mine".to_string()]);
        assert_eq!(fake.live_ids(), vec!["theirs".to_string()]);
    }

    #[tokio::test]
    async fn empty_owned_set_falls_back_to_deleting_unmatched() {
        let (manager, fake, _ctx) = manager("S1").await;
        fake.seed_subscription("legacy", &want(TopicKey::Raid), "S0");
        let follow = DesiredSubscription {
            subscription_type: FOLLOW_TYPE.to_string(),
            version: "2".to_string(),
            condition: HashMap::from([
                ("broadcaster_user_id".to_string(), BROADCASTER_ID.to_string()),
                ("moderator_user_id".to_string(), BROADCASTER_ID.to_string()),
            ]),
        };
        fake.seed_subscription("follow", &follow, "S0");

        manager.reconcile(BTreeSet::new()).await.unwrap();

        assert_eq!(fake.deleted(), vec!["legacy".to_string()]);
        assert_eq!(fake.live_ids(), vec!["follow".to_string()]);
    }

    #[tokio::test]
    async fn owned_ids_missing_from_listing_are_pruned() {
        let (manager, fake, ctx) = manager("S1").await;
        fake.seed_subscription("live", &want(TopicKey::Cheer), "S1");
        TopicConfigRepository::add_owned_id(&ctx.topics, "live").await.unwrap();
        TopicConfigRepository::add_owned_id(&ctx.topics, "ghost").await.unwrap();

        manager.reconcile(topics(&[TopicKey::Cheer])).await.unwrap();

        let owned = ctx.owned_subscription_ids().await;
        assert!(owned.contains("live"));
        assert!(!owned.contains("ghost"));
        assert!(fake.deleted().is_empty());
    }

    #[tokio::test]
    async fn failed_listing_keeps_owned_ids() {
        let (manager, fake, ctx) = manager("S1").await;
        TopicConfigRepository::add_owned_id(&ctx.topics, "kept").await.unwrap();
        fake.fail_listing(true);

        manager.reconcile(BTreeSet::new()).await.unwrap();

        assert!(ctx.owned_subscription_ids().await.contains("kept"));
    }

    #[tokio::test]
    async fn unavailable_topics_are_reported_not_owned() {
        let (manager, fake, ctx) = manager("S1").await;
        fake.mark_unavailable("channel.cheer");

        let report = manager.reconcile(topics(&[TopicKey::Cheer])).await.unwrap();

        assert_eq!(report.unavailable, vec!["channel.cheer".to_string()]);
        assert!(ctx.owned_subscription_ids().await.is_empty());
    }

    #[tokio::test]
    async fn without_session_topics_are_stored_and_deferred() {
        let fake = Arc::new(FakeHelix::default());
        let ctx = test_context();
        let manager = SubscriptionManager::new(fake.clone(), ctx.clone(), InFlightTracker::default());

        let report = manager.reconcile(topics(&[TopicKey::Raid])).await.unwrap();

        assert_eq!(report.status, ReconcileStatus::Deferred);
        assert!(fake.created().is_empty());
        let stored = TopicConfigRepository::get(&ctx.topics).await.topics;
        assert!(stored.contains(&TopicKey::Raid));
    }

    #[tokio::test]
    async fn concurrent_runs_create_each_subscription_once() {
        let (manager, fake, _ctx) = manager("S1").await;
        let manager = Arc::new(manager);
        let desired = topics(&[TopicKey::Redemption, TopicKey::Subscribe]);

        let a = tokio::spawn({
            let m = manager.clone();
            let d = desired.clone();
            async move { m.reconcile(d).await.unwrap() }
        });
        let b = tokio::spawn({
            let m = manager.clone();
            async move { m.reconcile(desired).await.unwrap() }
        });
        let (a, b) = (a.await.unwrap(), b.await.unwrap());

        assert_eq!(fake.created().len(), 2);
        assert!(
            a.status == ReconcileStatus::AlreadyRunning
                || b.status == ReconcileStatus::AlreadyRunning
                || (a.created.len() + b.created.len()) == 2
        );
    }

    #[tokio::test]
    async fn shared_tracker_blocks_duplicate_create() {
        let fake = Arc::new(FakeHelix::default());
        let ctx = connected_context("S1").await;
        let tracker = InFlightTracker::default();
        let manager = SubscriptionManager::new(fake.clone(), ctx, tracker.clone());

        let _held = tracker.try_begin(&want(TopicKey::Raid).fingerprint()).unwrap();
        let report = manager.reconcile(topics(&[TopicKey::Raid])).await.unwrap();

        assert_eq!(report.skipped_in_flight, vec!["channel.raid".to_string()]);
        assert!(fake.created().is_empty());
    }

    #[tokio::test]
    async fn clear_reports_each_deletion_and_prunes() {
        let (manager, fake, ctx) = manager("S1").await;
        fake.seed_subscription("A", &want(TopicKey::Cheer), "S1");
        TopicConfigRepository::add_owned_id(&ctx.topics, "A").await.unwrap();
        TopicConfigRepository::add_owned_id(&ctx.topics, "B").await.unwrap();

        let results = manager.clear_owned().await;

        assert_eq!(results.len(), 2);
        assert!(results.iter().all(|r| r.success));
        assert_eq!(results[0].id, "A");
        assert_eq!(results[1].detail, "already gone");
        assert!(ctx.owned_subscription_ids().await.is_empty());
    }

    #[tokio::test]
    async fn clear_keeps_ids_whose_delete_failed() {
        let (manager, fake, ctx) = manager("S1").await;
        TopicConfigRepository::add_owned_id(&ctx.topics, "A").await.unwrap();
        fake.override_delete("A", DeleteOutcome::Failed("500".to_string()));

        let results = manager.clear_owned().await;

        assert!(!results[0].success);
        assert!(ctx.owned_subscription_ids().await.contains("A"));
    }
}
