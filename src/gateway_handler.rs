use std::sync::Arc;
use std::time::Duration;

use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::sync::{mpsc, RwLock};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::chat_bridge::ChatBridge;
use crate::command_handler::{
    clamp_reply, format_error_reply, CommandHandler, CommandRequest, CommandVerb,
};
use crate::config::WardenConfig;
use crate::errors::{WardenError, WardenResult};

type WsStream = tokio_tungstenite::WebSocketStream<
    tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
>;
type WsWrite = SplitSink<WsStream, Message>;

const RECONNECT_DELAY: Duration = Duration::from_secs(5);
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(15);

/// A message for the gateway adapter. Producers push these into the outbound
/// channel; a single writer task owns the socket.
#[derive(Debug, Clone)]
pub enum OutboundMessage {
    Reply {
        request_id: String,
        channel_id: u64,
        content: String,
    },
    Chat {
        channel_id: u64,
        content: String,
    },
}

impl OutboundMessage {
    pub fn reply(request_id: impl Into<String>, channel_id: u64, content: String) -> Self {
        OutboundMessage::Reply {
            request_id: request_id.into(),
            channel_id,
            content,
        }
    }

    pub fn chat(channel_id: u64, content: String) -> Self {
        OutboundMessage::Chat {
            channel_id,
            content,
        }
    }

    fn to_json(&self) -> Value {
        match self {
            OutboundMessage::Reply {
                request_id,
                channel_id,
                content,
            } => json!({
                "type": "reply",
                "requestId": request_id,
                "channelId": channel_id,
                "content": content,
            }),
            OutboundMessage::Chat {
                channel_id,
                content,
            } => json!({
                "type": "chat",
                "channelId": channel_id,
                "content": content,
            }),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CommandEnvelope {
    pub request_id: String,
    pub channel_id: u64,
    pub invoker_id: u64,
    pub invoker_name: String,
    pub invoker_roles: Vec<u64>,
    pub verb: String,
    pub args: String,
}

/// Parses a gateway `command` payload. A missing request id gets a fresh one
/// so every dispatch is correlatable in the logs.
pub fn parse_command_envelope(msg: &Value) -> WardenResult<CommandEnvelope> {
    let channel_id = msg["channelId"]
        .as_u64()
        .ok_or_else(|| WardenError::InvalidRequest("Missing channelId".to_string()))?;
    let invoker_id = msg["invokerId"]
        .as_u64()
        .ok_or_else(|| WardenError::InvalidRequest("Missing invokerId".to_string()))?;
    let verb = msg["verb"]
        .as_str()
        .ok_or_else(|| WardenError::InvalidRequest("Missing verb".to_string()))?
        .to_string();
    let invoker_roles = msg["roleIds"]
        .as_array()
        .map(|roles| roles.iter().filter_map(|role| role.as_u64()).collect())
        .unwrap_or_default();

    Ok(CommandEnvelope {
        request_id: msg["requestId"]
            .as_str()
            .map(|s| s.to_string())
            .unwrap_or_else(|| Uuid::new_v4().to_string()),
        channel_id,
        invoker_id,
        invoker_name: msg["invokerName"].as_str().unwrap_or("unknown").to_string(),
        invoker_roles,
        verb,
        args: msg["args"].as_str().unwrap_or("").to_string(),
    })
}

/// Persistent connection to the chat-platform gateway adapter. Reconnects
/// forever with a fixed delay; inbound commands are dispatched in their own
/// tasks so a slow verb never stalls the read loop.
pub struct GatewayHandler {
    config: Arc<WardenConfig>,
    handler: Arc<CommandHandler>,
    bridge: Arc<ChatBridge>,
    outbound_tx: mpsc::Sender<OutboundMessage>,
    write: Arc<RwLock<Option<Arc<tokio::sync::Mutex<WsWrite>>>>>,
    connected: Arc<RwLock<bool>>,
}

impl GatewayHandler {
    pub fn new(
        config: Arc<WardenConfig>,
        handler: Arc<CommandHandler>,
        bridge: Arc<ChatBridge>,
        outbound_tx: mpsc::Sender<OutboundMessage>,
        connected: Arc<RwLock<bool>>,
    ) -> Self {
        Self {
            config,
            handler,
            bridge,
            outbound_tx,
            write: Arc::new(RwLock::new(None)),
            connected,
        }
    }

    pub async fn connect_and_listen(
        &self,
        mut outbound: mpsc::Receiver<OutboundMessage>,
    ) -> WardenResult<()> {
        // one writer task for the life of the agent; messages produced while
        // disconnected are dropped, the platform shows history anyway
        let write_slot = self.write.clone();
        tokio::spawn(async move {
            while let Some(message) = outbound.recv().await {
                let writer = { write_slot.read().await.clone() };
                match writer {
                    Some(writer) => {
                        let mut w = writer.lock().await;
                        if let Err(e) = w.send(Message::text(message.to_json().to_string())).await
                        {
                            debug!("Failed to push outbound message: {}", e);
                        }
                    }
                    None => debug!("Gateway offline, dropping outbound message"),
                }
            }
        });

        loop {
            match self.establish_connection().await {
                Ok(()) => info!("Gateway connection closed"),
                Err(e) => error!("Gateway connection error: {}", e),
            }
            tokio::time::sleep(RECONNECT_DELAY).await;
        }
    }

    async fn establish_connection(&self) -> WardenResult<()> {
        let url = &self.config.gateway.url;
        info!("Connecting to gateway: {}", url);

        let (ws_stream, _) = connect_async(url.as_str())
            .await
            .map_err(|e| WardenError::Gateway(format!("Failed to connect: {}", e)))?;

        info!("Gateway connected");

        let (write, mut read) = ws_stream.split();
        let write = Arc::new(tokio::sync::Mutex::new(write));
        {
            let mut guard = self.write.write().await;
            *guard = Some(write.clone());
        }
        *self.connected.write().await = true;

        let identify = json!({
            "type": "identify",
            "agentId": self.config.gateway.agent_id,
            "token": self.config.gateway.token,
            "version": env!("CARGO_PKG_VERSION"),
        });
        {
            let mut w = write.lock().await;
            w.send(Message::text(identify.to_string()))
                .await
                .map_err(|e| WardenError::Gateway(e.to_string()))?;
        }
        info!("Identify sent");

        // heartbeat task, dies with the connection
        let write_clone = write.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(HEARTBEAT_INTERVAL);
            loop {
                interval.tick().await;
                debug!("Sending heartbeat");
                let heartbeat = json!({"type": "heartbeat"});
                let mut w = write_clone.lock().await;
                if w.send(Message::text(heartbeat.to_string())).await.is_err() {
                    break;
                }
            }
        });

        while let Some(msg) = read.next().await {
            match msg {
                Ok(Message::Text(text)) => {
                    if let Err(e) = self.handle_message(text.as_str()).await {
                        error!("Error handling gateway message: {}", e);
                    }
                }
                Ok(Message::Close(_)) => {
                    info!("Gateway closed connection");
                    break;
                }
                Err(e) => {
                    error!("Gateway socket error: {}", e);
                    break;
                }
                _ => {}
            }
        }

        {
            let mut guard = self.write.write().await;
            *guard = None;
        }
        *self.connected.write().await = false;

        Ok(())
    }

    async fn handle_message(&self, text: &str) -> WardenResult<()> {
        let msg: Value = serde_json::from_str(text)?;

        match msg["type"].as_str() {
            Some("hello") => {
                info!("Gateway session acknowledged");
            }
            Some("command") => self.handle_command(&msg)?,
            Some("bridgeMessage") => self.handle_bridge_message(&msg).await?,
            Some("heartbeatAck") => {
                debug!("Heartbeat acknowledged");
            }
            _ => {
                warn!("Unknown gateway message type: {}", msg["type"]);
            }
        }

        Ok(())
    }

    fn handle_command(&self, msg: &Value) -> WardenResult<()> {
        let envelope = parse_command_envelope(msg)?;
        let handler = self.handler.clone();
        let outbound = self.outbound_tx.clone();

        tokio::spawn(async move {
            // the channel filter stays silent even for malformed verbs
            if !handler.accepts_channel(envelope.channel_id) {
                debug!(
                    "Ignoring command from channel {} (request {})",
                    envelope.channel_id, envelope.request_id
                );
                return;
            }

            let reply = match CommandVerb::parse(&envelope.verb, &envelope.args) {
                Ok(verb) => {
                    let request = CommandRequest {
                        request_id: envelope.request_id.clone(),
                        channel_id: envelope.channel_id,
                        invoker_id: envelope.invoker_id,
                        invoker_name: envelope.invoker_name.clone(),
                        invoker_roles: envelope.invoker_roles.clone(),
                        verb,
                    };
                    match handler.dispatch(&request).await {
                        Ok(Some(content)) => Some(content),
                        Ok(None) => None,
                        Err(e) => Some(format_error_reply(&e)),
                    }
                }
                Err(e) => Some(format_error_reply(&e)),
            };

            if let Some(content) = reply {
                let message = OutboundMessage::reply(
                    envelope.request_id,
                    envelope.channel_id,
                    clamp_reply(content),
                );
                if outbound.send(message).await.is_err() {
                    warn!("Outbound channel closed, dropping command reply");
                }
            }
        });

        Ok(())
    }

    async fn handle_bridge_message(&self, msg: &Value) -> WardenResult<()> {
        let channel_id = msg["channelId"]
            .as_u64()
            .ok_or_else(|| WardenError::InvalidRequest("Missing channelId".to_string()))?;
        let author = msg["author"].as_str().unwrap_or("unknown");
        let is_bot = msg["bot"].as_bool().unwrap_or(false);
        let content = msg["content"].as_str().unwrap_or("");
        self.bridge
            .relay_inbound(channel_id, author, is_bot, content)
            .await;
        Ok(())
    }
}
