use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use lazy_static::lazy_static;
use parking_lot::RwLock;
use regex::Regex;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::gateway_handler::OutboundMessage;
use crate::rcon_client::RconClient;
use crate::runtime_manager::{ContainerController, ContainerState, LogCursor, LogLine};

/// Prefix for chat relayed into the game, and outbound echo guard.
pub const RELAY_TAG: &str = "[Discord]";
/// The server logs RCON-issued `say` under this marker.
const RCON_ECHO_TAG: &str = "[Rcon]";

const RETRY_DELAY: Duration = Duration::from_secs(2);
const MAX_RETRY_DELAY: Duration = Duration::from_secs(30);
/// Status poll interval while the container is down.
const DOWN_POLL_INTERVAL: Duration = Duration::from_secs(10);

lazy_static! {
    static ref CHAT_RE: Regex = Regex::new(r"INFO\]: <(.*?)> (.*)").unwrap();
    static ref SERVER_RE: Regex = Regex::new(r"INFO\]: \[Server\] (.*)").unwrap();
    static ref JOIN_RE: Regex = Regex::new(r"INFO\]: (\S+) joined the game").unwrap();
    static ref LEAVE_RE: Regex = Regex::new(r"INFO\]: (\S+) left the game").unwrap();
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChatKind {
    Chat,
    Join,
    Leave,
    Server,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ChatEvent {
    pub kind: ChatKind,
    pub player: String,
    pub text: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BridgeState {
    Idle,
    Tailing,
    Backoff,
    Stopped,
}

impl std::fmt::Display for BridgeState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            BridgeState::Idle => "idle",
            BridgeState::Tailing => "tailing",
            BridgeState::Backoff => "backoff",
            BridgeState::Stopped => "stopped",
        };
        f.write_str(label)
    }
}

/// Classifies one log line. Lines carrying the RCON echo marker or the relay
/// tag are our own output coming back and are never events.
pub fn classify_line(line: &str, timestamp: DateTime<Utc>) -> Option<ChatEvent> {
    if line.contains(RCON_ECHO_TAG) || line.contains(RELAY_TAG) {
        return None;
    }
    if let Some(caps) = CHAT_RE.captures(line) {
        return Some(ChatEvent {
            kind: ChatKind::Chat,
            player: caps[1].to_string(),
            text: caps[2].to_string(),
            timestamp,
        });
    }
    if let Some(caps) = SERVER_RE.captures(line) {
        return Some(ChatEvent {
            kind: ChatKind::Server,
            player: "Server".to_string(),
            text: caps[1].to_string(),
            timestamp,
        });
    }
    if let Some(caps) = JOIN_RE.captures(line) {
        return Some(ChatEvent {
            kind: ChatKind::Join,
            player: caps[1].to_string(),
            text: String::new(),
            timestamp,
        });
    }
    if let Some(caps) = LEAVE_RE.captures(line) {
        return Some(ChatEvent {
            kind: ChatKind::Leave,
            player: caps[1].to_string(),
            text: String::new(),
            timestamp,
        });
    }
    None
}

/// Platform-side rendering per event kind. Server notices are classified but
/// not relayed.
pub fn format_event(event: &ChatEvent) -> Option<String> {
    match event.kind {
        ChatKind::Chat => Some(format!("**<{}>** {}", event.player, event.text)),
        ChatKind::Join => Some(format!("📥 **{}** joined the game", event.player)),
        ChatKind::Leave => Some(format!("📤 **{}** left the game", event.player)),
        ChatKind::Server => None,
    }
}

pub fn sanitize_inbound(content: &str) -> String {
    content.replace('\n', " ").replace('"', "'").trim().to_string()
}

/// Two-way chat relay. Outbound: tails the container log stream, classifies
/// lines and pushes events to the gateway. Inbound: turns platform messages
/// into in-game `say`. Runs as its own task; stream failures back off
/// exponentially (base 2s, capped at 30s) and container downtime is polled at
/// a fixed interval.
pub struct ChatBridge {
    rcon: Arc<RconClient>,
    controller: Arc<ContainerController>,
    channel_id: u64,
    outbound: mpsc::Sender<OutboundMessage>,
    state: RwLock<BridgeState>,
}

impl ChatBridge {
    pub fn new(
        rcon: Arc<RconClient>,
        controller: Arc<ContainerController>,
        channel_id: u64,
        outbound: mpsc::Sender<OutboundMessage>,
    ) -> Self {
        Self {
            rcon,
            controller,
            channel_id,
            outbound,
            state: RwLock::new(BridgeState::Idle),
        }
    }

    pub fn state(&self) -> BridgeState {
        *self.state.read()
    }

    fn set_state(&self, next: BridgeState) {
        *self.state.write() = next;
    }

    pub async fn run(&self) {
        info!("Chat bridge starting for channel {}", self.channel_id);
        let mut cursor = LogCursor::default();
        let mut retry_delay = RETRY_DELAY;

        loop {
            if self.outbound.is_closed() {
                self.set_state(BridgeState::Stopped);
                info!("Outbound channel closed, chat bridge stopping");
                return;
            }

            match self.controller.status().await {
                Ok(ContainerState::Running) => {}
                Ok(state) => {
                    self.set_state(BridgeState::Idle);
                    debug!("Container {} while bridging, polling status", state);
                    tokio::time::sleep(DOWN_POLL_INTERVAL).await;
                    continue;
                }
                Err(e) => {
                    warn!("Status check failed in chat bridge: {}", e);
                    self.set_state(BridgeState::Backoff);
                    tokio::time::sleep(retry_delay).await;
                    retry_delay = (retry_delay * 2).min(MAX_RETRY_DELAY);
                    continue;
                }
            }

            match self.controller.tail_logs(cursor).await {
                Ok(stream) => {
                    self.set_state(BridgeState::Tailing);
                    let entry_line = cursor.line;
                    cursor = self.relay_session(stream, cursor).await;
                    if cursor.line > entry_line {
                        retry_delay = RETRY_DELAY;
                    }
                    self.set_state(BridgeState::Backoff);
                    debug!(
                        "Log stream ended at line {}, retrying in {}s",
                        cursor.line,
                        retry_delay.as_secs()
                    );
                }
                Err(e) => {
                    warn!("Failed to open log stream: {}", e);
                    self.set_state(BridgeState::Backoff);
                }
            }
            tokio::time::sleep(retry_delay).await;
            retry_delay = (retry_delay * 2).min(MAX_RETRY_DELAY);
        }
    }

    /// Consumes one log stream until it ends, forwarding events. The cursor
    /// advances on every consumed line; lines at or before the cursor were
    /// already handled in an earlier session and are dropped, so nothing is
    /// ever forwarded twice across reconnects.
    async fn relay_session(
        &self,
        mut stream: mpsc::Receiver<LogLine>,
        mut cursor: LogCursor,
    ) -> LogCursor {
        while let Some(line) = stream.recv().await {
            if line.cursor.line <= cursor.line {
                debug!("Skipping already-relayed log line {}", line.cursor.line);
                continue;
            }
            cursor = line.cursor;

            let timestamp = line.cursor.since.unwrap_or_else(Utc::now);
            let event = match classify_line(&line.text, timestamp) {
                Some(event) => event,
                None => continue,
            };
            let content = match format_event(&event) {
                Some(content) => content,
                None => {
                    debug!("Server notice not relayed: {}", event.text);
                    continue;
                }
            };
            let message = OutboundMessage::chat(self.channel_id, content);
            if self.outbound.send(message).await.is_err() {
                warn!("Outbound channel closed, ending relay session");
                return cursor;
            }
        }
        cursor
    }

    /// Relays one platform message in-game, unless it fails the echo guards:
    /// wrong channel, authored by a bot, or empty after sanitizing.
    pub async fn relay_inbound(&self, channel_id: u64, author: &str, is_bot: bool, content: &str) {
        if channel_id != self.channel_id || is_bot {
            return;
        }
        let sanitized = sanitize_inbound(content);
        if sanitized.is_empty() {
            return;
        }
        let command = format!("say {} <{}> {}", RELAY_TAG, author, sanitized);
        if let Err(e) = self.rcon.execute(&command).await {
            warn!("Failed to relay chat in-game: {}", e);
        }
    }
}
