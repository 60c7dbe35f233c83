//! Read-only Twitch chat over IRC on TLS. Chat lines carry the badges used
//! for the VIP and moderator gates, and cheers arrive here with their bits tag.

use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_native_tls::{native_tls, TlsConnector, TlsStream};
use tracing::{debug, info, warn};

use crate::services::irc::{ChatMessage, IrcMessage};
use crate::services::notifications::{ConnectionState, NotificationBus, Transport};
use crate::services::session::Credentials;

const CAPABILITIES: &str = "CAP REQ :twitch.tv/tags twitch.tv/commands";
const CONNECT_TIMEOUT: Duration = Duration::from_secs(15);
const AUTH_FAILED_TEXT: &str = "Login authentication failed";

/// What to do about one line from the server.
#[derive(Debug)]
pub enum ChatAction {
    Reply(String),
    Joined(String),
    Message(ChatMessage),
    Close(String),
    Ignore,
}

/// Lines sent right after the socket opens.
pub fn handshake(credentials: &Credentials) -> Vec<String> {
    vec![
        CAPABILITIES.to_string(),
        format!("PASS oauth:{}", credentials.access_token),
        format!("NICK {}", credentials.login),
        format!("JOIN #{}", credentials.login),
    ]
}

pub fn interpret(line: &str) -> ChatAction {
    let message = IrcMessage::parse(line);
    match message.command() {
        Some("PING") => {
            let token = message.params().first().copied().unwrap_or("tmi.twitch.tv");
            ChatAction::Reply(format!("PONG :{}", token))
        }
        Some("PRIVMSG") => message
            .to_chat_message()
            .map(ChatAction::Message)
            .unwrap_or(ChatAction::Ignore),
        Some("JOIN") => message
            .params()
            .first()
            .map(|c| ChatAction::Joined(c.trim_start_matches('#').to_string()))
            .unwrap_or(ChatAction::Ignore),
        Some("RECONNECT") => ChatAction::Close("server requested reconnect".to_string()),
        Some("NOTICE") if line.contains(AUTH_FAILED_TEXT) => {
            ChatAction::Close(AUTH_FAILED_TEXT.to_string())
        }
        _ => ChatAction::Ignore,
    }
}

/// Host name to verify the certificate against, from a `host:port` address.
pub fn tls_domain(addr: &str) -> &str {
    addr.rsplit_once(':').map(|(host, _)| host).unwrap_or(addr)
}

/// Open the chat socket. The token goes out in `PASS`, so plain TCP is never used.
async fn connect_tls(addr: &str) -> std::io::Result<TlsStream<TcpStream>> {
    let tcp = tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(addr))
        .await
        .map_err(|_| std::io::Error::new(std::io::ErrorKind::TimedOut, "connect timed out"))??;

    let connector = native_tls::TlsConnector::new().map_err(std::io::Error::other)?;
    TlsConnector::from(connector)
        .connect(tls_domain(addr), tcp)
        .await
        .map_err(std::io::Error::other)
}

pub struct ChatHandle {
    stop: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

impl ChatHandle {
    pub fn spawn(
        addr: String,
        credentials: Credentials,
        bus: Arc<NotificationBus>,
        messages: mpsc::UnboundedSender<ChatMessage>,
    ) -> Self {
        let (stop, stop_rx) = oneshot::channel();
        let task = tokio::spawn(async move {
            bus.connection_state(Transport::Chat, ConnectionState::Connecting, None);
            let detail = match run_chat(&addr, &credentials, &bus, &messages, stop_rx).await {
                Ok(reason) => reason,
                Err(e) => {
                    warn!("Chat connection to {} failed: {}", addr, e);
                    e.to_string()
                }
            };
            bus.connection_state(Transport::Chat, ConnectionState::Closed, Some(detail));
        });
        Self { stop, task }
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    pub async fn close(self) {
        if self.stop.send(()).is_ok()
            && tokio::time::timeout(Duration::from_secs(5), self.task)
                .await
                .is_err()
        {
            warn!("Chat task did not stop in time");
        }
    }
}

async fn run_chat(
    addr: &str,
    credentials: &Credentials,
    bus: &NotificationBus,
    messages: &mpsc::UnboundedSender<ChatMessage>,
    mut stop: oneshot::Receiver<()>,
) -> std::io::Result<String> {
    let stream = connect_tls(addr).await?;

    let (reader, mut writer) = tokio::io::split(stream);
    for line in handshake(credentials) {
        writer.write_all(format!("{}\r\n", line).as_bytes()).await?;
    }
    writer.flush().await?;
    info!("Chat connecting as {}", credentials.login);

    let mut lines = BufReader::new(reader).lines();
    loop {
        let line = tokio::select! {
            _ = &mut stop => {
                let _ = writer.write_all(b"QUIT\r\n").await;
                return Ok("closed by request".to_string());
            }
            line = lines.next_line() => match line? {
                Some(line) => line,
                None => return Ok("server closed the connection".to_string()),
            }
        };

        match interpret(&line) {
            ChatAction::Reply(reply) => {
                writer.write_all(format!("{}\r\n", reply).as_bytes()).await?;
                writer.flush().await?;
            }
            ChatAction::Joined(channel) => {
                info!("Joined chat #{}", channel);
                bus.connection_state(Transport::Chat, ConnectionState::Connected, Some(channel));
            }
            ChatAction::Message(message) => {
                if messages.send(message).is_err() {
                    return Ok("event pipeline closed".to_string());
                }
            }
            ChatAction::Close(reason) => return Ok(reason),
            ChatAction::Ignore => debug!("chat: {}", line),
        }
    }
}
