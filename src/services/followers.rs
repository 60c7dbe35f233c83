use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::db::TopicConfigRepository;
use crate::error::AppResult;
use crate::services::normalizer::{normalize_notification, CanonicalEvent};
use crate::services::session::SessionContext;
use crate::services::twitch::{Follower, HelixApi};

struct Running {
    handle: JoinHandle<()>,
    stop: oneshot::Sender<()>,
}

/// Turns the followers endpoint into `follow` events, since follow
/// subscriptions are not kept on EventSub.
pub struct FollowerPoller {
    api: Arc<dyn HelixApi>,
    ctx: Arc<SessionContext>,
    interval: Duration,
    running: Mutex<Option<Running>>,
}

impl FollowerPoller {
    pub fn new(api: Arc<dyn HelixApi>, ctx: Arc<SessionContext>, interval: Duration) -> Self {
        Self {
            api,
            ctx,
            interval,
            running: Mutex::new(None),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running
            .lock()
            .map(|r| r.as_ref().is_some_and(|r| !r.handle.is_finished()))
            .unwrap_or(false)
    }

    /// Start polling on a fixed interval. A no-op if already running.
    pub fn start(self: &Arc<Self>, events: mpsc::UnboundedSender<CanonicalEvent>) {
        let Ok(mut running) = self.running.lock() else {
            return;
        };
        if running.as_ref().is_some_and(|r| !r.handle.is_finished()) {
            return;
        }

        let (stop_tx, mut stop_rx) = oneshot::channel();
        let poller = self.clone();
        let handle = tokio::spawn(async move {
            info!("Follower poller started ({:?} interval)", poller.interval);
            loop {
                match poller.poll_once().await {
                    Ok(new_follows) => {
                        for event in new_follows {
                            if events.send(event).is_err() {
                                debug!("Event pipeline closed; follower poller exiting");
                                return;
                            }
                        }
                    }
                    Err(e) => warn!("Follower poll failed: {}", e),
                }

                tokio::select! {
                    _ = &mut stop_rx => {
                        info!("Follower poller stopped");
                        break;
                    }
                    _ = tokio::time::sleep(poller.interval) => {}
                }
            }
        });

        *running = Some(Running {
            handle,
            stop: stop_tx,
        });
    }

    pub fn stop(&self) {
        let Ok(mut running) = self.running.lock() else {
            return;
        };
        if let Some(r) = running.take() {
            if r.stop.send(()).is_err() {
                r.handle.abort();
            }
        }
    }

    /// One poll cycle. Returns a canonical follow event for each follower
    /// newer than the stored watermark, oldest first.
    pub async fn poll_once(&self) -> AppResult<Vec<CanonicalEvent>> {
        let watermark = TopicConfigRepository::get(&self.ctx.topics)
            .await
            .last_follower_poll_timestamp;

        let Some(followers) = self.api.recent_followers().await else {
            debug!("Followers unavailable this cycle; watermark unchanged");
            return Ok(Vec::new());
        };

        let now = Utc::now();
        let Some(since) = watermark else {
            TopicConfigRepository::advance_follower_watermark(&self.ctx.topics, now).await?;
            info!("Follower watermark initialised; existing followers are not replayed");
            return Ok(Vec::new());
        };

        let mut fresh: Vec<Follower> = followers
            .into_iter()
            .filter(|f| f.followed_at > since)
            .collect();
        fresh.sort_by_key(|f| f.followed_at);

        let newest = fresh.last().map(|f| f.followed_at).unwrap_or(now);
        TopicConfigRepository::advance_follower_watermark(&self.ctx.topics, newest.max(now))
            .await?;

        if !fresh.is_empty() {
            info!("{} new follower(s) since {}", fresh.len(), since);
        }

        fresh
            .iter()
            .map(|f| -> AppResult<CanonicalEvent> {
                Ok(normalize_notification("channel.follow", serde_json::to_value(f)?))
            })
            .collect()
    }
}
