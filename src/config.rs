use serde::{Deserialize, Serialize};
use std::path::PathBuf;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct WardenConfig {
    pub gateway: GatewayConfig,
    pub rcon: RconConfig,
    pub container: ContainerConfig,
    #[serde(default)]
    pub backups: BackupConfig,
    #[serde(default)]
    pub access: AccessConfig,
    #[serde(default)]
    pub bridge: BridgeConfig,
    pub logging: LoggingConfig,
}

#[derive(Clone, Deserialize, Serialize)]
pub struct GatewayConfig {
    pub url: String,
    pub agent_id: String,
    pub token: String,
}

impl std::fmt::Debug for GatewayConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GatewayConfig")
            .field("url", &self.url)
            .field("agent_id", &self.agent_id)
            .field("token", &"[REDACTED]")
            .finish()
    }
}

#[derive(Clone, Deserialize, Serialize)]
pub struct RconConfig {
    #[serde(default = "default_rcon_host")]
    pub host: String,
    #[serde(default = "default_rcon_port")]
    pub port: u16,
    pub password: String,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
    #[serde(default = "default_reply_timeout")]
    pub reply_timeout_secs: u64,
    #[serde(default = "default_ready_timeout")]
    pub ready_timeout_secs: u64,
}

impl std::fmt::Debug for RconConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RconConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("password", &"[REDACTED]")
            .field("connect_timeout_secs", &self.connect_timeout_secs)
            .field("reply_timeout_secs", &self.reply_timeout_secs)
            .field("ready_timeout_secs", &self.ready_timeout_secs)
            .finish()
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ContainerConfig {
    #[serde(default = "default_container_name")]
    pub name: String,
    #[serde(default = "default_runtime_bin")]
    pub runtime_bin: String,
    #[serde(default = "default_stop_grace")]
    pub stop_grace_secs: u64,
    #[serde(default = "default_stop_signal")]
    pub stop_signal: String,
    #[serde(default = "default_mount_dir")]
    pub mount_dir: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BackupConfig {
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    pub backups_dir: Option<PathBuf>,
    #[serde(default = "default_world_dirs")]
    pub world_dirs: Vec<String>,
}

impl BackupConfig {
    /// Host-side backups directory; defaults to `<data_dir>/backups`.
    pub fn backups_dir(&self) -> PathBuf {
        self.backups_dir
            .clone()
            .unwrap_or_else(|| self.data_dir.join("backups"))
    }
}

impl Default for BackupConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            backups_dir: None,
            world_dirs: default_world_dirs(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct AccessConfig {
    #[serde(default)]
    pub allowed_user_ids: Vec<u64>,
    #[serde(default)]
    pub allowed_role_ids: Vec<u64>,
    #[serde(default)]
    pub whitelist_disabled: bool,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct BridgeConfig {
    /// Chat channel mirrored in-game; 0 disables the bridge.
    #[serde(default)]
    pub channel_id: u64,
    /// Channel commands are accepted from; 0 accepts any channel.
    #[serde(default)]
    pub command_channel_id: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String,
}

impl WardenConfig {
    pub fn from_file(path: &str) -> Result<Self, String> {
        let content =
            std::fs::read_to_string(path).map_err(|e| format!("Failed to read config: {}", e))?;
        toml::from_str(&content).map_err(|e| format!("Failed to parse config: {}", e))
    }

    pub fn from_env() -> Result<Self, String> {
        Ok(Self {
            gateway: GatewayConfig {
                url: std::env::var("GATEWAY_URL")
                    .unwrap_or_else(|_| "ws://localhost:3000/ws".to_string()),
                agent_id: std::env::var("AGENT_ID").ok().unwrap_or_else(|| {
                    hostname().unwrap_or_else(|_| "warden-agent".to_string())
                }),
                token: std::env::var("GATEWAY_TOKEN")
                    .map_err(|_| "GATEWAY_TOKEN not set".to_string())?,
            },
            rcon: RconConfig {
                host: std::env::var("RCON_HOST").unwrap_or_else(|_| default_rcon_host()),
                port: std::env::var("RCON_PORT")
                    .ok()
                    .and_then(|v| v.parse().ok())
                    .unwrap_or_else(default_rcon_port),
                password: std::env::var("RCON_PASSWORD")
                    .map_err(|_| "RCON_PASSWORD not set".to_string())?,
                connect_timeout_secs: default_connect_timeout(),
                reply_timeout_secs: default_reply_timeout(),
                ready_timeout_secs: env_u64("READY_TIMEOUT_SECS", default_ready_timeout()),
            },
            container: ContainerConfig {
                name: std::env::var("GAME_CONTAINER")
                    .unwrap_or_else(|_| default_container_name()),
                runtime_bin: std::env::var("CONTAINER_RUNTIME")
                    .unwrap_or_else(|_| default_runtime_bin()),
                stop_grace_secs: env_u64("STOP_GRACE_SECS", default_stop_grace()),
                stop_signal: default_stop_signal(),
                mount_dir: std::env::var("GAME_MOUNT_DIR")
                    .unwrap_or_else(|_| default_mount_dir()),
            },
            backups: BackupConfig {
                data_dir: PathBuf::from(
                    std::env::var("GAME_DATA_DIR").unwrap_or_else(|_| {
                        default_data_dir().to_string_lossy().into_owned()
                    }),
                ),
                backups_dir: std::env::var("BACKUPS_DIR").ok().map(PathBuf::from),
                world_dirs: std::env::var("WORLD_DIRS")
                    .ok()
                    .map(|v| parse_name_list(&v))
                    .unwrap_or_else(default_world_dirs),
            },
            access: AccessConfig {
                allowed_user_ids: parse_id_list(
                    &std::env::var("ALLOWED_USERS").unwrap_or_default(),
                ),
                allowed_role_ids: parse_id_list(
                    &std::env::var("ALLOWED_ROLES").unwrap_or_default(),
                ),
                whitelist_disabled: std::env::var("DISABLE_WHITELIST")
                    .map(|v| v.eq_ignore_ascii_case("true"))
                    .unwrap_or(false),
            },
            bridge: BridgeConfig {
                channel_id: env_u64("BRIDGE_CHANNEL_ID", 0),
                command_channel_id: env_u64("COMMAND_CHANNEL_ID", 0),
            },
            logging: LoggingConfig {
                level: std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
                format: std::env::var("LOG_FORMAT").unwrap_or_else(|_| "json".to_string()),
            },
        })
    }
}

/// Parses a comma-separated id list, skipping entries that are not integers.
pub fn parse_id_list(raw: &str) -> Vec<u64> {
    raw.split(',')
        .filter_map(|part| part.trim().parse::<u64>().ok())
        .collect()
}

fn parse_name_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|part| part.trim().to_string())
        .filter(|part| !part.is_empty())
        .collect()
}

fn env_u64(name: &str, default: u64) -> u64 {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn hostname() -> Result<String, std::io::Error> {
    std::process::Command::new("hostname")
        .output()
        .map(|output| String::from_utf8_lossy(&output.stdout).trim().to_string())
}

fn default_rcon_host() -> String {
    "mc".to_string()
}

fn default_rcon_port() -> u16 {
    25575
}

fn default_connect_timeout() -> u64 {
    5
}

fn default_reply_timeout() -> u64 {
    10
}

fn default_ready_timeout() -> u64 {
    300
}

fn default_container_name() -> String {
    "mc-server".to_string()
}

fn default_runtime_bin() -> String {
    "docker".to_string()
}

fn default_stop_grace() -> u64 {
    120
}

fn default_stop_signal() -> String {
    "SIGTERM".to_string()
}

fn default_mount_dir() -> String {
    "/data".to_string()
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("/minecraft-data")
}

fn default_world_dirs() -> Vec<String> {
    vec!["world".to_string()]
}
