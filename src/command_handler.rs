use std::sync::Arc;
use std::time::Duration;

use lazy_static::lazy_static;
use regex::Regex;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::access_guard::AccessPolicy;
use crate::backup_manager::BackupManager;
use crate::chat_bridge::{sanitize_inbound, RELAY_TAG};
use crate::errors::{WardenError, WardenResult};
use crate::rcon_client::RconClient;
use crate::runtime_manager::{ContainerController, ContainerState, StartOutcome, StopOutcome};

const DEFAULT_LOG_LINES: u32 = 20;
const MAX_LOG_LINES: u32 = 200;
/// Platform message cap, minus headroom for formatting.
const MAX_REPLY_CHARS: usize = 1900;
const MAX_LOG_BODY_CHARS: usize = 1800;

const HELP_TEXT: &str = "\
**Server commands**
`status` - container state and online players
`start` / `stop` / `restart` - lifecycle control
`players` - who is online
`say <message>` - speak in game chat
`cmd <command>` - raw console command
`logs [n]` - last n log lines (default 20)
`save` - create a backup archive
`load [name]` - list backups, or restore one
`help` - this text";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandVerb {
    Status,
    Start,
    Stop,
    Restart,
    Players,
    Say { message: String },
    Cmd { command: String },
    Logs { lines: u32 },
    Save,
    Load { name: Option<String> },
    Help,
}

impl CommandVerb {
    pub fn parse(verb: &str, args: &str) -> WardenResult<Self> {
        let args = args.trim();
        match verb.to_ascii_lowercase().as_str() {
            "status" => Ok(CommandVerb::Status),
            "start" => Ok(CommandVerb::Start),
            "stop" => Ok(CommandVerb::Stop),
            "restart" => Ok(CommandVerb::Restart),
            "players" => Ok(CommandVerb::Players),
            "say" => {
                if args.is_empty() {
                    return Err(WardenError::InvalidRequest(
                        "say needs a message".to_string(),
                    ));
                }
                Ok(CommandVerb::Say {
                    message: args.to_string(),
                })
            }
            "cmd" => {
                if args.is_empty() {
                    return Err(WardenError::InvalidRequest(
                        "cmd needs a console command".to_string(),
                    ));
                }
                Ok(CommandVerb::Cmd {
                    command: args.to_string(),
                })
            }
            "logs" => {
                let lines = if args.is_empty() {
                    DEFAULT_LOG_LINES
                } else {
                    args.parse::<u32>().map_err(|_| {
                        WardenError::InvalidRequest("logs takes a number of lines".to_string())
                    })?
                };
                Ok(CommandVerb::Logs {
                    lines: lines.clamp(1, MAX_LOG_LINES),
                })
            }
            "save" => Ok(CommandVerb::Save),
            "load" => Ok(CommandVerb::Load {
                name: (!args.is_empty()).then(|| args.to_string()),
            }),
            "help" => Ok(CommandVerb::Help),
            unknown => Err(WardenError::NotFound(format!(
                "Unknown command: {}",
                unknown
            ))),
        }
    }

    /// Verbs that take the lifecycle guard. `save` belongs here even though
    /// it leaves the container running: an archive must never race a restore.
    /// Listing backups (`load` without a name) is read-only.
    fn is_lifecycle(&self) -> bool {
        matches!(
            self,
            CommandVerb::Start
                | CommandVerb::Stop
                | CommandVerb::Restart
                | CommandVerb::Save
                | CommandVerb::Load { name: Some(_) }
        )
    }
}

#[derive(Debug, Clone)]
pub struct CommandRequest {
    pub request_id: String,
    pub channel_id: u64,
    pub invoker_id: u64,
    pub invoker_name: String,
    pub invoker_roles: Vec<u64>,
    pub verb: CommandVerb,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlayerList {
    pub count: u32,
    pub max: u32,
    pub names: Vec<String>,
}

lazy_static! {
    static ref LIST_RE: Regex =
        Regex::new(r"There are (\d+) of a max(?: of)? (\d+) players online:?\s*(.*)").unwrap();
}

/// Parses the server's `list` response, accepting both the `of a max 20` and
/// `of a max of 20` phrasings.
pub fn parse_player_list(response: &str) -> Option<PlayerList> {
    let caps = LIST_RE.captures(response.trim())?;
    let count = caps[1].parse().ok()?;
    let max = caps[2].parse().ok()?;
    let names = caps[3]
        .split(',')
        .map(|name| name.trim().to_string())
        .filter(|name| !name.is_empty())
        .collect();
    Some(PlayerList { count, max, names })
}

/// Renders an error as an operator-facing reply.
pub fn format_error_reply(err: &WardenError) -> String {
    match err {
        WardenError::Authorization(_) => {
            "❌ You don't have permission to use this command.".to_string()
        }
        WardenError::NotFound(msg) => format!("❌ {}", msg),
        other => format!("❌ {}", other),
    }
}

/// Truncates a reply to the platform limit on a character boundary.
pub fn clamp_reply(reply: String) -> String {
    if reply.chars().count() <= MAX_REPLY_CHARS {
        return reply;
    }
    let truncated: String = reply.chars().take(MAX_REPLY_CHARS).collect();
    format!("{}...", truncated)
}

/// Tail-biased truncation: for log output the newest lines are the point.
fn clamp_tail(text: &str, max_chars: usize) -> String {
    let total = text.chars().count();
    if total <= max_chars {
        return text.to_string();
    }
    let kept: String = text.chars().skip(total - max_chars).collect();
    format!("...{}", kept)
}

/// Routes parsed commands to the RCON client, container controller and backup
/// manager. One dispatch call handles one request end to end and produces the
/// reply text (or `None` when the channel filter silently drops the request).
pub struct CommandHandler {
    rcon: Arc<RconClient>,
    controller: Arc<ContainerController>,
    backups: Arc<BackupManager>,
    policy: AccessPolicy,
    /// Commands are only accepted from this channel; 0 accepts any.
    command_channel_id: u64,
    ready_timeout: Duration,
    lifecycle_gate: Mutex<()>,
}

impl CommandHandler {
    pub fn new(
        rcon: Arc<RconClient>,
        controller: Arc<ContainerController>,
        backups: Arc<BackupManager>,
        policy: AccessPolicy,
        command_channel_id: u64,
        ready_timeout: Duration,
    ) -> Self {
        Self {
            rcon,
            controller,
            backups,
            policy,
            command_channel_id,
            ready_timeout,
            lifecycle_gate: Mutex::new(()),
        }
    }

    /// True when commands from this channel should be processed at all.
    pub fn accepts_channel(&self, channel_id: u64) -> bool {
        self.command_channel_id == 0 || channel_id == self.command_channel_id
    }

    pub async fn dispatch(&self, request: &CommandRequest) -> WardenResult<Option<String>> {
        if !self.accepts_channel(request.channel_id) {
            debug!(
                "Ignoring command from channel {} (accepting only {})",
                request.channel_id, self.command_channel_id
            );
            return Ok(None);
        }

        if !self
            .policy
            .authorize(request.invoker_id, &request.invoker_roles)
        {
            warn!(
                "Denied {:?} from {} ({})",
                request.verb, request.invoker_name, request.invoker_id
            );
            return Err(WardenError::Authorization(format!(
                "{} is not allowed to run commands",
                request.invoker_name
            )));
        }

        info!(
            "Dispatching {:?} for {} (request {})",
            request.verb, request.invoker_name, request.request_id
        );

        if request.verb.is_lifecycle() {
            let _gate = self.lifecycle_gate.try_lock().map_err(|_| {
                WardenError::ContainerState(
                    "Another lifecycle operation is already in progress".to_string(),
                )
            })?;
            return self.run_verb(request).await.map(Some);
        }
        self.run_verb(request).await.map(Some)
    }

    async fn run_verb(&self, request: &CommandRequest) -> WardenResult<String> {
        match &request.verb {
            CommandVerb::Status => self.handle_status().await,
            CommandVerb::Start => self.handle_start().await,
            CommandVerb::Stop => self.handle_stop().await,
            CommandVerb::Restart => self.handle_restart().await,
            CommandVerb::Players => self.handle_players().await,
            CommandVerb::Say { message } => self.handle_say(request, message).await,
            CommandVerb::Cmd { command } => self.handle_cmd(command).await,
            CommandVerb::Logs { lines } => self.handle_logs(*lines).await,
            CommandVerb::Save => self.handle_save().await,
            CommandVerb::Load { name: Some(name) } => self.handle_load(name).await,
            CommandVerb::Load { name: None } => self.handle_list_backups().await,
            CommandVerb::Help => Ok(HELP_TEXT.to_string()),
        }
    }

    async fn handle_status(&self) -> WardenResult<String> {
        match self.controller.status().await? {
            ContainerState::Running => match self.rcon.execute("list").await {
                Ok(reply) => Ok(format!("✅ **Server is ONLINE**\n```{}```", reply)),
                Err(e) => {
                    debug!("Status RCON probe failed: {}", e);
                    Ok("✅ **Server is ONLINE** (RCON unavailable)".to_string())
                }
            },
            ContainerState::Restarting => Ok("🔄 **Server is RESTARTING**".to_string()),
            _ => Ok("❌ **Server is OFFLINE**".to_string()),
        }
    }

    async fn handle_start(&self) -> WardenResult<String> {
        match self.controller.ensure_started().await? {
            StartOutcome::AlreadyRunning => Ok("⚠️ Server is already running!".to_string()),
            StartOutcome::Started => Ok(format!(
                "🚀 Server starting... {}",
                self.readiness_suffix().await
            )),
        }
    }

    async fn handle_stop(&self) -> WardenResult<String> {
        match self.controller.stop_graceful().await? {
            StopOutcome::AlreadyStopped => Ok("⚠️ Server is already stopped.".to_string()),
            StopOutcome::Stopped => Ok("🛑 **Server stopped.**".to_string()),
        }
    }

    async fn handle_restart(&self) -> WardenResult<String> {
        self.controller.restart().await?;
        Ok(format!(
            "🔄 Server restarting... {}",
            self.readiness_suffix().await
        ))
    }

    async fn handle_players(&self) -> WardenResult<String> {
        let reply = self.rcon.execute("list").await?;
        let players = parse_player_list(&reply).ok_or_else(|| {
            WardenError::Protocol(format!("Unexpected list response: {}", reply))
        })?;
        if players.names.is_empty() {
            Ok(format!(
                "👥 **Online Players ({}/{})**: none",
                players.count, players.max
            ))
        } else {
            Ok(format!(
                "👥 **Online Players ({}/{})**: {}",
                players.count,
                players.max,
                players.names.join(", ")
            ))
        }
    }

    async fn handle_say(&self, request: &CommandRequest, message: &str) -> WardenResult<String> {
        let sanitized = sanitize_inbound(message);
        self.rcon
            .execute(&format!(
                "say {} <{}> {}",
                RELAY_TAG, request.invoker_name, sanitized
            ))
            .await?;
        Ok("💬 Message sent!".to_string())
    }

    async fn handle_cmd(&self, command: &str) -> WardenResult<String> {
        let reply = self.rcon.execute(command).await?;
        if reply.trim().is_empty() {
            Ok("✅ Command sent.".to_string())
        } else {
            Ok(format!("```{}```", clamp_tail(&reply, MAX_LOG_BODY_CHARS)))
        }
    }

    async fn handle_logs(&self, lines: u32) -> WardenResult<String> {
        let tail = self.controller.logs_tail(lines).await?;
        let body = clamp_tail(&tail.join("\n"), MAX_LOG_BODY_CHARS);
        Ok(format!(
            "📜 **Last {} log lines:**\n```{}```",
            tail.len(),
            body
        ))
    }

    async fn handle_save(&self) -> WardenResult<String> {
        let info = self.backups.save().await?;
        Ok(format!(
            "💾 **Backup created:** `{}` ({:.1} MB, sha256 {})",
            info.file_name,
            info.size_bytes as f64 / (1024.0 * 1024.0),
            &info.checksum[..12]
        ))
    }

    async fn handle_load(&self, name: &str) -> WardenResult<String> {
        let outcome = self.backups.load(name).await?;
        let mut reply = format!("📦 **Backup `{}` restored.**", name);
        if let Some(safety) = outcome.safety_backup {
            reply.push_str(&format!(" Safety backup: `{}`.", safety));
        }
        reply.push_str(&format!(" {}", self.readiness_suffix().await));
        Ok(reply)
    }

    async fn handle_list_backups(&self) -> WardenResult<String> {
        let backups = self.backups.list_backups().await?;
        if backups.is_empty() {
            return Ok("📦 No backups yet. Use `save` to create one.".to_string());
        }
        let lines: Vec<String> = backups
            .iter()
            .take(10)
            .map(|b| {
                format!(
                    "`{}` ({:.1} MB)",
                    b.file_name,
                    b.size_bytes as f64 / (1024.0 * 1024.0)
                )
            })
            .collect();
        Ok(format!("📦 **Available backups:**\n{}", lines.join("\n")))
    }

    async fn readiness_suffix(&self) -> String {
        if self
            .rcon
            .wait_until_ready(self.ready_timeout, Duration::from_secs(1))
            .await
        {
            "✅ **Server is ONLINE and ready!**".to_string()
        } else {
            "⚠️ Not accepting connections yet, check back shortly.".to_string()
        }
    }
}
