//! EventSub WebSocket session.
//!
//! Frame handling is split from the socket: `SessionMachine` is a plain state
//! machine fed with parsed frames, and `run_session` owns the connection and
//! forwards whatever the machine emits. The session is never re-opened
//! automatically after it closes; a new `connect` has to be requested.

use std::time::Duration;

use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, trace, warn};

type Socket = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

/// Slack on top of the keepalive interval Twitch announces in the welcome.
const KEEPALIVE_GRACE: Duration = Duration::from_secs(5);

// ============================================================================
// Frames
// ============================================================================

#[derive(Debug, Deserialize)]
struct Envelope {
    metadata: Metadata,
    #[serde(default)]
    payload: Payload,
}

#[derive(Debug, Deserialize)]
struct Metadata {
    message_type: String,
}

#[derive(Debug, Default, Deserialize)]
struct Payload {
    session: Option<SessionInfo>,
    subscription: Option<SubscriptionInfo>,
    event: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct SessionInfo {
    id: String,
    keepalive_timeout_seconds: Option<u64>,
    reconnect_url: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SubscriptionInfo {
    #[serde(default)]
    id: String,
    #[serde(rename = "type")]
    subscription_type: String,
    #[serde(default)]
    status: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Welcome {
        session_id: String,
        keepalive: Option<Duration>,
    },
    Keepalive,
    Reconnect {
        url: String,
    },
    Notification {
        subscription_type: String,
        event: Value,
    },
    Revocation {
        id: String,
        subscription_type: String,
        status: String,
    },
    Other(String),
}

/// Parse one text frame. `None` for anything that is not a well-formed
/// EventSub message.
pub fn parse_frame(text: &str) -> Option<Frame> {
    let envelope: Envelope = serde_json::from_str(text).ok()?;
    let Payload {
        session,
        subscription,
        event,
    } = envelope.payload;

    let frame = match envelope.metadata.message_type.as_str() {
        "session_welcome" => {
            let session = session?;
            Frame::Welcome {
                session_id: session.id,
                keepalive: session.keepalive_timeout_seconds.map(Duration::from_secs),
            }
        }
        "session_keepalive" => Frame::Keepalive,
        "session_reconnect" => Frame::Reconnect {
            url: session?.reconnect_url?,
        },
        "notification" => Frame::Notification {
            subscription_type: subscription?.subscription_type,
            event: event.unwrap_or(Value::Null),
        },
        "revocation" => {
            let sub = subscription?;
            Frame::Revocation {
                id: sub.id,
                subscription_type: sub.subscription_type,
                status: sub.status,
            }
        }
        other => Frame::Other(other.to_string()),
    };
    Some(frame)
}

// ============================================================================
// State machine
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum SessionState {
    Disconnected,
    Connecting,
    SessionOpen,
    Closed,
}

/// What the session reports to the rest of the bridge.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionSignal {
    Connecting,
    Opened(String),
    Notification {
        subscription_type: String,
        event: Value,
    },
    Revoked {
        id: String,
        subscription_type: String,
        status: String,
    },
    Closed(Option<String>),
}

/// A signal stamped with the connect attempt that produced it, so the bridge
/// can drop what a replaced or cleared session still had queued.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionEvent {
    pub generation: u64,
    pub signal: SessionSignal,
}

#[derive(Debug)]
pub struct SessionMachine {
    state: SessionState,
    session_id: Option<String>,
}

impl Default for SessionMachine {
    fn default() -> Self {
        Self {
            state: SessionState::Disconnected,
            session_id: None,
        }
    }
}

impl SessionMachine {
    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }

    pub fn begin_connect(&mut self) -> Option<SessionSignal> {
        match self.state {
            SessionState::Disconnected | SessionState::Closed => {
                self.state = SessionState::Connecting;
                Some(SessionSignal::Connecting)
            }
            _ => None,
        }
    }

    pub fn on_frame(&mut self, frame: Frame) -> Option<SessionSignal> {
        match (self.state, frame) {
            (SessionState::Connecting, Frame::Welcome { session_id, .. }) => {
                self.state = SessionState::SessionOpen;
                self.session_id = Some(session_id.clone());
                Some(SessionSignal::Opened(session_id))
            }
            // Welcome on the socket we hopped to after a reconnect request.
            (SessionState::SessionOpen, Frame::Welcome { session_id, .. }) => {
                if self.session_id.as_deref() == Some(session_id.as_str()) {
                    return None;
                }
                self.session_id = Some(session_id.clone());
                Some(SessionSignal::Opened(session_id))
            }
            (
                SessionState::SessionOpen,
                Frame::Notification {
                    subscription_type,
                    event,
                },
            ) => Some(SessionSignal::Notification {
                subscription_type,
                event,
            }),
            (
                SessionState::SessionOpen,
                Frame::Revocation {
                    id,
                    subscription_type,
                    status,
                },
            ) => Some(SessionSignal::Revoked {
                id,
                subscription_type,
                status,
            }),
            (state, frame) => {
                trace!("Ignoring {:?} in state {:?}", frame, state);
                None
            }
        }
    }

    pub fn on_close(&mut self, reason: Option<String>) -> Option<SessionSignal> {
        match self.state {
            SessionState::Connecting | SessionState::SessionOpen => {
                self.state = SessionState::Closed;
                self.session_id = None;
                Some(SessionSignal::Closed(reason))
            }
            _ => None,
        }
    }
}

// ============================================================================
// Socket loop
// ============================================================================

/// A running session task.
pub struct EventSubHandle {
    stop: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

impl EventSubHandle {
    pub fn spawn(
        url: String,
        generation: u64,
        signals: mpsc::UnboundedSender<SessionEvent>,
    ) -> Self {
        let (stop, stop_rx) = oneshot::channel();
        let task = tokio::spawn(run_session(url, generation, signals, stop_rx));
        Self { stop, task }
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Ask the session to close and wait briefly for it to do so.
    pub async fn close(self) {
        if self.stop.send(()).is_err() {
            return;
        }
        if tokio::time::timeout(Duration::from_secs(5), self.task)
            .await
            .is_err()
        {
            warn!("EventSub session did not close in time");
        }
    }
}

enum Step {
    Continue,
    Hop(String),
    Close(Option<String>),
}

async fn run_session(
    url: String,
    generation: u64,
    signals: mpsc::UnboundedSender<SessionEvent>,
    mut stop: oneshot::Receiver<()>,
) {
    let mut machine = SessionMachine::default();
    let emit = |signal: Option<SessionSignal>| {
        if let Some(signal) = signal {
            let _ = signals.send(SessionEvent { generation, signal });
        }
    };

    emit(machine.begin_connect());
    let mut ws = match connect_async(url.as_str()).await {
        Ok((ws, _)) => {
            info!("EventSub socket connected to {}", url);
            ws
        }
        Err(e) => {
            warn!("EventSub connect to {} failed: {}", url, e);
            emit(machine.on_close(Some(e.to_string())));
            return;
        }
    };

    let mut keepalive: Option<Duration> = None;
    loop {
        let limit = keepalive;
        let next = async {
            match limit {
                Some(limit) => tokio::time::timeout(limit, ws.next()).await.ok(),
                None => Some(ws.next().await),
            }
        };

        let step = tokio::select! {
            _ = &mut stop => {
                let _ = ws.close(None).await;
                Step::Close(Some("closed by request".to_string()))
            }
            received = next => match received {
                None => Step::Close(Some("keepalive timeout".to_string())),
                Some(None) => Step::Close(None),
                Some(Some(Err(e))) => Step::Close(Some(e.to_string())),
                Some(Some(Ok(message))) => {
                    handle_message(&mut ws, &mut machine, &mut keepalive, message, &emit).await
                }
            }
        };

        match step {
            Step::Continue => {}
            Step::Hop(new_url) => match connect_async(new_url.as_str()).await {
                Ok((new_ws, _)) => {
                    info!("EventSub hopping to {}", new_url);
                    let _ = ws.close(None).await;
                    ws = new_ws;
                }
                Err(e) => warn!("EventSub reconnect to {} failed: {}", new_url, e),
            },
            Step::Close(reason) => {
                info!("EventSub session closed: {:?}", reason);
                emit(machine.on_close(reason));
                return;
            }
        }
    }
}

async fn handle_message(
    ws: &mut Socket,
    machine: &mut SessionMachine,
    keepalive: &mut Option<Duration>,
    message: Message,
    emit: &impl Fn(Option<SessionSignal>),
) -> Step {
    let text = match message {
        Message::Text(text) => text,
        Message::Ping(payload) => {
            if let Err(e) = ws.send(Message::Pong(payload)).await {
                debug!("Failed to answer EventSub ping: {}", e);
            }
            return Step::Continue;
        }
        Message::Close(frame) => return Step::Close(frame.map(|f| f.reason.to_string())),
        _ => return Step::Continue,
    };

    let Some(frame) = parse_frame(text.as_str()) else {
        debug!("Unparseable EventSub frame: {}", text.as_str());
        return Step::Continue;
    };

    match &frame {
        Frame::Welcome {
            keepalive: Some(limit),
            ..
        } => *keepalive = Some(*limit + KEEPALIVE_GRACE),
        Frame::Keepalive => trace!("EventSub keepalive"),
        Frame::Reconnect { url } => return Step::Hop(url.clone()),
        Frame::Revocation {
            subscription_type,
            status,
            ..
        } => warn!("EventSub revoked {} ({})", subscription_type, status),
        Frame::Other(kind) => debug!("Unhandled EventSub message type {}", kind),
        _ => {}
    }

    emit(machine.on_frame(frame));
    Step::Continue
}
