use std::collections::VecDeque;
use std::sync::Mutex;

use serde::Serialize;
use tokio::sync::broadcast;

use crate::services::irc::ChatMessage;
use crate::services::normalizer::CanonicalEvent;

/// How many canonical events the activity feed keeps.
pub const RECENT_EVENTS_LIMIT: usize = 200;
const CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Transport {
    Chat,
    EventSub,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Closed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeletionResult {
    pub id: String,
    pub success: bool,
    pub detail: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClearCredentialsResult {
    pub deletions: Vec<DeletionResult>,
    pub purged_topics: bool,
}

/// Everything the bridge tells the UI.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum Notification {
    ChatLine(ChatMessage),
    NormalizedEvent(CanonicalEvent),
    #[serde(rename_all = "camelCase")]
    ConnectionStateChanged {
        transport: Transport,
        state: ConnectionState,
        #[serde(skip_serializing_if = "Option::is_none")]
        detail: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    MappingTriggered {
        mapping_id: String,
        card_labels: Vec<String>,
        selected_label: String,
        event_id: String,
    },
    ClearCredentialsResult(ClearCredentialsResult),
}

impl Notification {
    pub fn name(&self) -> &'static str {
        match self {
            Notification::ChatLine(_) => "chat-line",
            Notification::NormalizedEvent(_) => "normalized-event",
            Notification::ConnectionStateChanged { .. } => "connection-state-changed",
            Notification::MappingTriggered { .. } => "mapping-triggered",
            Notification::ClearCredentialsResult(_) => "clear-credentials-result",
        }
    }
}

/// Publish/subscribe channel for notifications, plus the recent-event feed.
pub struct NotificationBus {
    tx: broadcast::Sender<Notification>,
    recent: Mutex<VecDeque<CanonicalEvent>>,
}

impl Default for NotificationBus {
    fn default() -> Self {
        Self::new()
    }
}

impl NotificationBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self {
            tx,
            recent: Mutex::new(VecDeque::with_capacity(RECENT_EVENTS_LIMIT)),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Notification> {
        self.tx.subscribe()
    }

    /// Having no subscribers is not an error.
    pub fn publish(&self, notification: Notification) {
        if let Notification::NormalizedEvent(event) = &notification {
            if let Ok(mut recent) = self.recent.lock() {
                if recent.len() == RECENT_EVENTS_LIMIT {
                    recent.pop_front();
                }
                recent.push_back(event.clone());
            }
        }
        tracing::trace!("Publishing {}", notification.name());
        let _ = self.tx.send(notification);
    }

    pub fn connection_state(&self, transport: Transport, state: ConnectionState, detail: Option<String>) {
        self.publish(Notification::ConnectionStateChanged {
            transport,
            state,
            detail,
        });
    }

    /// Newest first.
    pub fn recent_events(&self, include_tests: bool) -> Vec<CanonicalEvent> {
        self.recent
            .lock()
            .map(|recent| {
                recent
                    .iter()
                    .rev()
                    .filter(|e| include_tests || !e.is_test)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }
}
