use std::time::Duration;

use bytes::{Buf, BufMut, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::time::timeout;
use tracing::debug;

use crate::config::RconConfig;
use crate::errors::{WardenError, WardenResult};

pub const TYPE_LOGIN: i32 = 3;
pub const TYPE_COMMAND: i32 = 2;
pub const TYPE_RESPONSE: i32 = 0;

/// Smallest legal declared length: request id, type and two NUL terminators.
const MIN_FRAME_LEN: i32 = 10;
/// Largest declared length accepted before the frame is rejected outright.
const MAX_FRAME_LEN: i32 = 1 << 20;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub request_id: i32,
    pub frame_type: i32,
    pub body: String,
}

/// Encodes a frame: little-endian length (counting everything after itself),
/// request id, type, NUL-terminated body, trailing NUL pad.
pub fn encode_frame(request_id: i32, frame_type: i32, body: &str) -> BytesMut {
    let mut buf = BytesMut::with_capacity(body.len() + 14);
    buf.put_i32_le(body.len() as i32 + MIN_FRAME_LEN);
    buf.put_i32_le(request_id);
    buf.put_i32_le(frame_type);
    buf.put_slice(body.as_bytes());
    buf.put_u8(0);
    buf.put_u8(0);
    buf
}

/// Reads one frame, reassembling across however many TCP segments it spans.
async fn read_frame(stream: &mut TcpStream) -> WardenResult<Frame> {
    let mut len_buf = [0u8; 4];
    stream.read_exact(&mut len_buf).await.map_err(|e| {
        WardenError::Connectivity(format!("Connection lost reading frame length: {}", e))
    })?;
    let length = i32::from_le_bytes(len_buf);
    if !(MIN_FRAME_LEN..=MAX_FRAME_LEN).contains(&length) {
        return Err(WardenError::Protocol(format!(
            "Declared frame length {} out of bounds",
            length
        )));
    }

    let mut frame = vec![0u8; length as usize];
    stream.read_exact(&mut frame).await.map_err(|e| {
        WardenError::Connectivity(format!("Connection lost reading frame: {}", e))
    })?;

    let mut header = &frame[..8];
    let request_id = header.get_i32_le();
    let frame_type = header.get_i32_le();
    if frame[length as usize - 2..] != [0, 0] {
        return Err(WardenError::Protocol(
            "Frame missing NUL terminators".to_string(),
        ));
    }
    let body = String::from_utf8_lossy(&frame[8..length as usize - 2]).into_owned();
    Ok(Frame {
        request_id,
        frame_type,
        body,
    })
}

struct RconSession {
    stream: TcpStream,
    last_id: i32,
}

impl RconSession {
    /// Ids are strictly increasing within a session and never -1 or 0.
    fn next_request_id(&mut self) -> i32 {
        self.last_id = self.last_id.wrapping_add(1);
        if self.last_id <= 0 {
            self.last_id = 1;
        }
        self.last_id
    }
}

/// RCON client owning a single serialized session. All callers go through the
/// internal mutex, so exactly one request is in flight at a time. A failed
/// round trip invalidates the session and the next call reconnects and
/// re-authenticates once before giving up.
pub struct RconClient {
    host: String,
    port: u16,
    password: String,
    connect_timeout: Duration,
    reply_timeout: Duration,
    session: Mutex<Option<RconSession>>,
}

impl RconClient {
    pub fn new(config: &RconConfig) -> Self {
        Self {
            host: config.host.clone(),
            port: config.port,
            password: config.password.clone(),
            connect_timeout: Duration::from_secs(config.connect_timeout_secs),
            reply_timeout: Duration::from_secs(config.reply_timeout_secs),
            session: Mutex::new(None),
        }
    }

    /// Opens the TCP connection and authenticates, if not already connected.
    pub async fn connect(&self) -> WardenResult<()> {
        let mut slot = self.session.lock().await;
        if slot.is_none() {
            *slot = Some(self.open_session().await?);
        }
        Ok(())
    }

    pub async fn close(&self) {
        let mut slot = self.session.lock().await;
        if slot.take().is_some() {
            debug!("RCON session closed");
        }
    }

    /// Runs a console command and returns the response body. Stale response
    /// frames are skipped until the id matches; on a transport failure the
    /// session is dropped and rebuilt exactly once.
    pub async fn execute(&self, command: &str) -> WardenResult<String> {
        let mut slot = self.session.lock().await;
        let mut reconnected = false;
        loop {
            let session = match slot.as_mut() {
                Some(session) => session,
                None => slot.insert(self.open_session().await?),
            };
            match self.round_trip(session, command).await {
                Ok(reply) => return Ok(reply),
                Err(err) => {
                    *slot = None;
                    if reconnected {
                        return Err(err);
                    }
                    reconnected = true;
                    debug!("RCON session lost, reconnecting once: {}", err);
                }
            }
        }
    }

    /// Polls the server with `list` until it answers or the timeout elapses.
    pub async fn wait_until_ready(&self, wait_for: Duration, interval: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + wait_for;
        loop {
            if self.execute("list").await.is_ok() {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(interval).await;
        }
    }

    async fn open_session(&self) -> WardenResult<RconSession> {
        let addr = format!("{}:{}", self.host, self.port);
        let stream = timeout(self.connect_timeout, TcpStream::connect(&addr))
            .await
            .map_err(|_| {
                WardenError::Connectivity(format!("Timed out connecting to RCON at {}", addr))
            })?
            .map_err(|e| {
                WardenError::Connectivity(format!("Failed to connect to RCON at {}: {}", addr, e))
            })?;

        let mut session = RconSession { stream, last_id: 0 };
        let login_id = session.next_request_id();
        let login = encode_frame(login_id, TYPE_LOGIN, &self.password);
        session.stream.write_all(&login).await.map_err(|e| {
            WardenError::Connectivity(format!("Failed to send RCON login: {}", e))
        })?;

        // Authentication rejection (id -1) fails fast; there is no point
        // retrying with the same password.
        loop {
            let reply = timeout(self.reply_timeout, read_frame(&mut session.stream))
                .await
                .map_err(|_| {
                    WardenError::Connectivity("Timed out waiting for RCON login reply".to_string())
                })??;
            if reply.request_id == -1 {
                return Err(WardenError::Connectivity(
                    "RCON authentication rejected".to_string(),
                ));
            }
            if reply.request_id == login_id {
                debug!("RCON session established to {}", addr);
                return Ok(session);
            }
        }
    }

    async fn round_trip(
        &self,
        session: &mut RconSession,
        command: &str,
    ) -> WardenResult<String> {
        let request_id = session.next_request_id();
        let frame = encode_frame(request_id, TYPE_COMMAND, command);
        session.stream.write_all(&frame).await.map_err(|e| {
            WardenError::Connectivity(format!("Failed to send RCON command: {}", e))
        })?;

        loop {
            let reply = timeout(self.reply_timeout, read_frame(&mut session.stream))
                .await
                .map_err(|_| {
                    WardenError::Connectivity("Timed out waiting for RCON response".to_string())
                })??;
            if reply.request_id == -1 {
                return Err(WardenError::Connectivity(
                    "RCON session no longer authenticated".to_string(),
                ));
            }
            if reply.request_id == request_id {
                return Ok(reply.body);
            }
            debug!(
                "Skipping stale RCON frame (id {}, expected {})",
                reply.request_id, request_id
            );
        }
    }
}

#[cfg(test)]
pub mod testing {
    use super::*;
    use std::net::SocketAddr;
    use tokio::net::TcpListener;

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum ServerBehavior {
        /// Authenticates, answers every command with `#<id> <body>`.
        Echo,
        /// Answers every command with the given body.
        Static(&'static str),
        /// Like Echo, but precedes the reply with a stale frame and dribbles
        /// the real one out in 3-byte chunks.
        Fragmented,
        /// Rejects every login with request id -1.
        RejectAuth,
        /// Serves one reply on the first connection then closes the socket;
        /// later connections behave like Echo.
        DropAfterFirstReply,
        /// Answers commands with a frame whose terminators are missing.
        Malformed,
        /// Accepts the connection, reads the login, never replies.
        Mute,
    }

    /// Spawns a scripted RCON server on a loopback port.
    pub async fn spawn_server(password: &'static str, behavior: ServerBehavior) -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let mut first_conn = true;
            loop {
                let Ok((mut stream, _)) = listener.accept().await else {
                    break;
                };
                let drop_after_first =
                    first_conn && behavior == ServerBehavior::DropAfterFirstReply;
                first_conn = false;
                let _ = serve_conn(&mut stream, password, behavior, drop_after_first).await;
            }
        });
        addr
    }

    async fn serve_conn(
        stream: &mut TcpStream,
        password: &str,
        behavior: ServerBehavior,
        drop_after_first: bool,
    ) -> WardenResult<()> {
        let login = read_frame(stream).await?;
        if behavior == ServerBehavior::Mute {
            tokio::time::sleep(Duration::from_secs(30)).await;
            return Ok(());
        }
        if behavior == ServerBehavior::RejectAuth || login.body != password {
            stream
                .write_all(&encode_frame(-1, TYPE_COMMAND, ""))
                .await?;
            return Ok(());
        }
        stream
            .write_all(&encode_frame(login.request_id, TYPE_COMMAND, ""))
            .await?;

        let mut replies = 0u32;
        loop {
            let cmd = read_frame(stream).await?;
            let body = match behavior {
                ServerBehavior::Static(reply) => reply.to_string(),
                _ => format!("#{} {}", cmd.request_id, cmd.body),
            };
            match behavior {
                ServerBehavior::Malformed => {
                    let mut buf = BytesMut::new();
                    buf.put_i32_le(MIN_FRAME_LEN);
                    buf.put_i32_le(cmd.request_id);
                    buf.put_i32_le(TYPE_RESPONSE);
                    buf.put_u8(1);
                    buf.put_u8(1);
                    stream.write_all(&buf).await?;
                }
                ServerBehavior::Fragmented => {
                    stream
                        .write_all(&encode_frame(cmd.request_id + 1000, TYPE_RESPONSE, "stale"))
                        .await?;
                    let reply = encode_frame(cmd.request_id, TYPE_RESPONSE, &body);
                    for chunk in reply.chunks(3) {
                        stream.write_all(chunk).await?;
                        stream.flush().await?;
                        tokio::time::sleep(Duration::from_millis(2)).await;
                    }
                }
                _ => {
                    stream
                        .write_all(&encode_frame(cmd.request_id, TYPE_RESPONSE, &body))
                        .await?;
                }
            }
            replies += 1;
            if drop_after_first && replies == 1 {
                return Ok(());
            }
        }
    }

    /// Echo server that also reports every received command body, so tests
    /// can assert exactly what went over the wire.
    pub async fn spawn_recording_server(
        password: &'static str,
    ) -> (SocketAddr, tokio::sync::mpsc::UnboundedReceiver<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        tokio::spawn(async move {
            loop {
                let Ok((mut stream, _)) = listener.accept().await else {
                    break;
                };
                let login = match read_frame(&mut stream).await {
                    Ok(frame) => frame,
                    Err(_) => continue,
                };
                if login.body != password {
                    let _ = stream.write_all(&encode_frame(-1, TYPE_COMMAND, "")).await;
                    continue;
                }
                let _ = stream
                    .write_all(&encode_frame(login.request_id, TYPE_COMMAND, ""))
                    .await;
                while let Ok(cmd) = read_frame(&mut stream).await {
                    let _ = tx.send(cmd.body.clone());
                    let _ = stream
                        .write_all(&encode_frame(cmd.request_id, TYPE_RESPONSE, ""))
                        .await;
                }
            }
        });
        (addr, rx)
    }

    pub fn client_for(addr: SocketAddr, password: &str) -> RconClient {
        RconClient::new(&RconConfig {
            host: addr.ip().to_string(),
            port: addr.port(),
            password: password.to_string(),
            connect_timeout_secs: 2,
            reply_timeout_secs: 1,
            ready_timeout_secs: 1,
        })
    }
}
