use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{mpsc, RwLock};
use tracing::{error, info, warn};

mod access_guard;
mod backup_manager;
mod chat_bridge;
mod command_handler;
mod config;
mod errors;
mod gateway_handler;
mod rcon_client;
mod runtime_manager;

pub use access_guard::AccessPolicy;
pub use backup_manager::BackupManager;
pub use chat_bridge::ChatBridge;
pub use command_handler::CommandHandler;
pub use config::WardenConfig;
pub use errors::{WardenError, WardenResult};
pub use gateway_handler::{GatewayHandler, OutboundMessage};
pub use rcon_client::RconClient;
pub use runtime_manager::{ContainerController, ContainerRuntime, ContainerState, DockerCli};

/// Warden Agent - Main application state
pub struct WardenAgent {
    pub config: Arc<WardenConfig>,
    pub rcon: Arc<RconClient>,
    pub controller: Arc<ContainerController>,
    pub backups: Arc<BackupManager>,
    pub handler: Arc<CommandHandler>,
    pub bridge: Arc<ChatBridge>,
    pub gateway: Arc<GatewayHandler>,
    pub gateway_connected: Arc<RwLock<bool>>,
    outbound_rx: Arc<Mutex<Option<mpsc::Receiver<OutboundMessage>>>>,
}

impl WardenAgent {
    pub async fn new(config: WardenConfig) -> WardenResult<Self> {
        info!("Initializing Warden Agent");

        let config = Arc::new(config);

        let docker = DockerCli::new(config.container.runtime_bin.clone());
        if let Err(e) = docker.probe().await {
            warn!("Container runtime check failed: {}", e);
            warn!("Continuing; container operations will fail until it is available");
        }
        let runtime: Arc<dyn ContainerRuntime> = Arc::new(docker);

        let controller = Arc::new(ContainerController::new(
            runtime,
            config.container.name.clone(),
            config.container.stop_signal.clone(),
            Duration::from_secs(config.container.stop_grace_secs),
            Duration::from_secs(1),
        ));

        let rcon = Arc::new(RconClient::new(&config.rcon));

        let backups = Arc::new(BackupManager::new(
            rcon.clone(),
            controller.clone(),
            &config.backups,
            config.container.mount_dir.clone(),
        ));

        let handler = Arc::new(CommandHandler::new(
            rcon.clone(),
            controller.clone(),
            backups.clone(),
            AccessPolicy::from_config(&config.access),
            config.bridge.command_channel_id,
            Duration::from_secs(config.rcon.ready_timeout_secs),
        ));

        let (outbound_tx, outbound_rx) = mpsc::channel(64);

        let bridge = Arc::new(ChatBridge::new(
            rcon.clone(),
            controller.clone(),
            config.bridge.channel_id,
            outbound_tx.clone(),
        ));

        let gateway_connected = Arc::new(RwLock::new(false));
        let gateway = Arc::new(GatewayHandler::new(
            config.clone(),
            handler.clone(),
            bridge.clone(),
            outbound_tx,
            gateway_connected.clone(),
        ));

        Ok(Self {
            config,
            rcon,
            controller,
            backups,
            handler,
            bridge,
            gateway,
            gateway_connected,
            outbound_rx: Arc::new(Mutex::new(Some(outbound_rx))),
        })
    }

    pub async fn run(&self) -> WardenResult<()> {
        info!("Starting Warden Agent");

        let outbound = self
            .outbound_rx
            .lock()
            .take()
            .ok_or_else(|| WardenError::Runtime("Agent is already running".to_string()))?;

        // Log the managed container's state up front so a misconfigured name
        // shows immediately.
        match self.controller.status().await {
            Ok(state) => info!(
                "Container '{}' is {}",
                self.controller.container_name(),
                state
            ),
            Err(e) => warn!("Initial container status check failed: {}", e),
        }

        // Start gateway connection
        let agent = self.clone_refs();
        let gateway_task = tokio::spawn(async move {
            if let Err(e) = agent.gateway.connect_and_listen(outbound).await {
                error!("Gateway error: {}", e);
            }
        });

        // Start the chat bridge when a channel is configured
        if self.config.bridge.channel_id != 0 {
            let agent = self.clone_refs();
            tokio::spawn(async move {
                agent.bridge.run().await;
            });
        } else {
            info!("Chat bridge disabled (no bridge channel configured)");
        }

        // Start HTTP server for local management
        let agent = self.clone_refs();
        let http_task = tokio::spawn(async move {
            if let Err(e) = agent.start_http_server().await {
                error!("HTTP server error: {}", e);
            }
        });

        tokio::select! {
            _ = gateway_task => {},
            _ = http_task => {},
            _ = tokio::signal::ctrl_c() => {
                info!("Shutdown signal received");
            }
        }

        self.rcon.close().await;

        Ok(())
    }

    async fn start_http_server(&self) -> WardenResult<()> {
        use axum::{routing::get, Json, Router};

        let controller = self.controller.clone();
        let connected = self.gateway_connected.clone();
        let app = Router::new()
            .route(
                "/health",
                get(move || {
                    let controller = controller.clone();
                    let connected = connected.clone();
                    async move {
                        let state = controller
                            .status()
                            .await
                            .unwrap_or(ContainerState::Unknown);
                        Json(serde_json::json!({
                            "status": "ok",
                            "version": env!("CARGO_PKG_VERSION"),
                            "container": state.to_string(),
                            "gatewayConnected": *connected.read().await,
                        }))
                    }
                }),
            )
            .route("/stats", get(|| async { Json(collect_stats()) }));

        let listener = tokio::net::TcpListener::bind("127.0.0.1:8080").await?;

        info!("Local HTTP server listening on 127.0.0.1:8080");

        axum::serve(listener, app)
            .await
            .map_err(|e| WardenError::Runtime(e.to_string()))
    }

    fn clone_refs(&self) -> Self {
        Self {
            config: self.config.clone(),
            rcon: self.rcon.clone(),
            controller: self.controller.clone(),
            backups: self.backups.clone(),
            handler: self.handler.clone(),
            bridge: self.bridge.clone(),
            gateway: self.gateway.clone(),
            gateway_connected: self.gateway_connected.clone(),
            outbound_rx: self.outbound_rx.clone(),
        }
    }
}

fn collect_stats() -> serde_json::Value {
    use sysinfo::System;

    let mut sys = System::new();
    sys.refresh_cpu_usage();
    sys.refresh_memory();

    serde_json::json!({
        "cpuPercent": sys.global_cpu_usage(),
        "memoryUsedBytes": sys.used_memory(),
        "memoryTotalBytes": sys.total_memory(),
        "uptimeSecs": System::uptime(),
    })
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let mut config_path: Option<String> = None;
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        if arg == "--config" {
            config_path = args.next();
        }
    }

    let config_path = config_path.as_deref().unwrap_or("./config.toml");
    // Load config first so logging level/format can be applied.
    let config = WardenConfig::from_file(config_path)
        .or_else(|_| WardenConfig::from_file("/opt/warden-agent/config.toml"))
        .or_else(|_| WardenConfig::from_env())
        .map_err(WardenError::ConfigError)?;

    let filter = format!("warden_agent={},tokio=info", config.logging.level);
    if config.logging.format == "json" {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    info!("Warden Agent starting");
    info!("Configuration loaded: {:?}", config);

    let agent = WardenAgent::new(config).await?;
    agent.run().await?;

    Ok(())
}
