use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::io::AsyncBufReadExt;
use tokio::process::Command;
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::errors::{WardenError, WardenResult};

const LOG_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerState {
    Running,
    Stopped,
    Restarting,
    Unknown,
}

impl ContainerState {
    /// Maps the runtime's `.State.Status` string onto the agent's model.
    pub fn parse(raw: &str) -> Self {
        match raw.trim() {
            "running" => ContainerState::Running,
            "exited" | "created" | "dead" => ContainerState::Stopped,
            "restarting" => ContainerState::Restarting,
            _ => ContainerState::Unknown,
        }
    }
}

impl std::fmt::Display for ContainerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            ContainerState::Running => "running",
            ContainerState::Stopped => "stopped",
            ContainerState::Restarting => "restarting",
            ContainerState::Unknown => "unknown",
        };
        f.write_str(label)
    }
}

/// Resume position within the container's log stream. `line` is the ordinal
/// of the last consumed line and is the dedup authority; `since` is a
/// timestamp hint used to restart the underlying stream near the position.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct LogCursor {
    pub line: u64,
    pub since: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub struct LogLine {
    pub cursor: LogCursor,
    pub text: String,
}

#[derive(Debug, Clone)]
pub struct ExecOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl ExecOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartOutcome {
    Started,
    AlreadyRunning,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    Stopped,
    AlreadyStopped,
}

/// Low-level binding to the container runtime. Everything above this trait is
/// runtime-agnostic, so tests substitute an in-memory fake.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    async fn status(&self, container: &str) -> WardenResult<ContainerState>;
    async fn start(&self, container: &str) -> WardenResult<()>;
    async fn signal(&self, container: &str, signal: &str) -> WardenResult<()>;
    async fn logs_tail(&self, container: &str, lines: u32) -> WardenResult<String>;
    async fn tail_logs(
        &self,
        container: &str,
        cursor: LogCursor,
    ) -> WardenResult<mpsc::Receiver<LogLine>>;
    async fn exec(&self, container: &str, argv: &[&str]) -> WardenResult<ExecOutput>;
}

/// Shim over the runtime CLI (`docker` by default, any compatible binary via
/// config).
pub struct DockerCli {
    bin: String,
}

impl DockerCli {
    pub fn new(bin: impl Into<String>) -> Self {
        Self { bin: bin.into() }
    }

    fn command(&self) -> Command {
        Command::new(&self.bin)
    }

    /// Startup probe: checks the runtime CLI answers at all.
    pub async fn probe(&self) -> WardenResult<()> {
        let output = self.command().arg("version").output().await.map_err(|e| {
            WardenError::Runtime(format!("Container runtime '{}' unavailable: {}", self.bin, e))
        })?;
        if !output.status.success() {
            return Err(WardenError::Runtime(format!(
                "Container runtime '{}' probe failed: {}",
                self.bin,
                String::from_utf8_lossy(&output.stderr)
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl ContainerRuntime for DockerCli {
    async fn status(&self, container: &str) -> WardenResult<ContainerState> {
        let output = self
            .command()
            .arg("inspect")
            .arg("--format")
            .arg("{{.State.Status}}")
            .arg(container)
            .output()
            .await
            .map_err(|e| WardenError::Runtime(format!("Failed to inspect container: {}", e)))?;

        if !output.status.success() {
            debug!(
                "Inspect failed for {}: {}",
                container,
                String::from_utf8_lossy(&output.stderr).trim()
            );
            return Ok(ContainerState::Unknown);
        }

        Ok(ContainerState::parse(&String::from_utf8_lossy(
            &output.stdout,
        )))
    }

    async fn start(&self, container: &str) -> WardenResult<()> {
        info!("Starting container: {}", container);

        let output = self.command().arg("start").arg(container).output().await?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(WardenError::Runtime(format!(
                "Failed to start container: {}",
                stderr
            )));
        }

        Ok(())
    }

    async fn signal(&self, container: &str, signal: &str) -> WardenResult<()> {
        info!("Signalling container {} with {}", container, signal);

        let output = self
            .command()
            .arg("kill")
            .arg("-s")
            .arg(signal)
            .arg(container)
            .output()
            .await?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(WardenError::Runtime(format!(
                "Failed to signal container: {}",
                stderr
            )));
        }

        Ok(())
    }

    async fn logs_tail(&self, container: &str, lines: u32) -> WardenResult<String> {
        let output = self
            .command()
            .arg("logs")
            .arg("--tail")
            .arg(lines.to_string())
            .arg(container)
            .output()
            .await?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(WardenError::Runtime(format!(
                "Failed to get logs: {}",
                stderr
            )));
        }

        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    async fn tail_logs(
        &self,
        container: &str,
        cursor: LogCursor,
    ) -> WardenResult<mpsc::Receiver<LogLine>> {
        info!("Following log stream for container: {}", container);

        let mut cmd = self.command();
        cmd.arg("logs").arg("--follow").arg("--timestamps");
        match cursor.since {
            Some(since) => {
                cmd.arg("--since").arg(since.to_rfc3339());
            }
            // fresh cursor: only lines appended after the stream opens
            None => {
                cmd.arg("--tail").arg("0");
            }
        }
        let mut child = cmd
            .arg(container)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| WardenError::Runtime(format!("Failed to spawn log stream: {}", e)))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| WardenError::Runtime("Failed to capture log stdout".to_string()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| WardenError::Runtime("Failed to capture log stderr".to_string()))?;

        let (tx, rx) = mpsc::channel(LOG_CHANNEL_CAPACITY);
        let container = container.to_string();
        tokio::spawn(async move {
            let mut stdout_lines = tokio::io::BufReader::new(stdout).lines();
            let mut stderr_lines = tokio::io::BufReader::new(stderr).lines();
            let mut position = cursor;
            loop {
                let next = tokio::select! {
                    line = stdout_lines.next_line() => line,
                    line = stderr_lines.next_line() => line,
                };
                let line = match next {
                    Ok(Some(line)) => line,
                    Ok(None) => break,
                    Err(e) => {
                        debug!("Log stream read error for {}: {}", container, e);
                        break;
                    }
                };
                let (timestamp, text) = split_log_timestamp(&line);
                if let (Some(ts), Some(since)) = (timestamp, cursor.since) {
                    // the runtime redelivers the boundary line on --since
                    if ts <= since {
                        continue;
                    }
                }
                position.line += 1;
                if timestamp.is_some() {
                    position.since = timestamp;
                }
                if tx
                    .send(LogLine {
                        cursor: position,
                        text,
                    })
                    .await
                    .is_err()
                {
                    break;
                }
            }
            let _ = child.kill().await;
        });

        Ok(rx)
    }

    async fn exec(&self, container: &str, argv: &[&str]) -> WardenResult<ExecOutput> {
        let mut cmd = self.command();
        cmd.arg("exec").arg(container);
        for arg in argv {
            cmd.arg(arg);
        }

        let output = cmd
            .output()
            .await
            .map_err(|e| WardenError::Runtime(format!("Exec failed to spawn: {}", e)))?;

        Ok(ExecOutput {
            exit_code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        })
    }
}

/// Splits the `--timestamps` prefix off a log line. Lines without a parseable
/// timestamp come back whole.
fn split_log_timestamp(line: &str) -> (Option<DateTime<Utc>>, String) {
    if let Some((prefix, rest)) = line.split_once(' ') {
        if let Ok(ts) = DateTime::parse_from_rfc3339(prefix) {
            return (Some(ts.with_timezone(&Utc)), rest.to_string());
        }
    }
    (None, line.to_string())
}

/// Lifecycle orchestration for the one managed container. State is queried
/// from the runtime on every operation, never cached.
pub struct ContainerController {
    runtime: Arc<dyn ContainerRuntime>,
    container: String,
    stop_signal: String,
    stop_grace: Duration,
    poll_interval: Duration,
}

impl ContainerController {
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        container: impl Into<String>,
        stop_signal: impl Into<String>,
        stop_grace: Duration,
        poll_interval: Duration,
    ) -> Self {
        Self {
            runtime,
            container: container.into(),
            stop_signal: stop_signal.into(),
            stop_grace,
            poll_interval,
        }
    }

    pub fn container_name(&self) -> &str {
        &self.container
    }

    pub async fn status(&self) -> WardenResult<ContainerState> {
        self.runtime.status(&self.container).await
    }

    pub async fn ensure_started(&self) -> WardenResult<StartOutcome> {
        if self.status().await? == ContainerState::Running {
            return Ok(StartOutcome::AlreadyRunning);
        }
        self.runtime.start(&self.container).await?;
        Ok(StartOutcome::Started)
    }

    /// Delivers the stop signal and waits for Stopped within the grace
    /// period. Never escalates to a force kill: on expiry the caller gets a
    /// container-state error and decides what to do.
    pub async fn stop_graceful(&self) -> WardenResult<StopOutcome> {
        if self.status().await? == ContainerState::Stopped {
            return Ok(StopOutcome::AlreadyStopped);
        }

        self.runtime
            .signal(&self.container, &self.stop_signal)
            .await?;

        let deadline = tokio::time::Instant::now() + self.stop_grace;
        loop {
            if self.status().await? == ContainerState::Stopped {
                info!("Container {} stopped gracefully", self.container);
                return Ok(StopOutcome::Stopped);
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(WardenError::ContainerState(format!(
                    "Container {} did not stop within {}s grace period",
                    self.container,
                    self.stop_grace.as_secs()
                )));
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }

    pub async fn restart(&self) -> WardenResult<()> {
        self.stop_graceful().await?;
        self.runtime.start(&self.container).await?;
        Ok(())
    }

    /// Exactly the last `lines` log lines, oldest first.
    pub async fn logs_tail(&self, lines: u32) -> WardenResult<Vec<String>> {
        let raw = self.runtime.logs_tail(&self.container, lines).await?;
        let all: Vec<&str> = raw.lines().collect();
        let keep = all.len().saturating_sub(lines as usize);
        Ok(all[keep..].iter().map(|s| s.to_string()).collect())
    }

    pub async fn tail_logs(&self, cursor: LogCursor) -> WardenResult<mpsc::Receiver<LogLine>> {
        self.runtime.tail_logs(&self.container, cursor).await
    }

    pub async fn exec(&self, argv: &[&str]) -> WardenResult<ExecOutput> {
        self.runtime.exec(&self.container, argv).await
    }
}

#[cfg(test)]
pub mod testing {
    use super::*;
    use parking_lot::Mutex;

    type ExecHook = Box<dyn Fn(&[&str]) -> ExecOutput + Send + Sync>;

    /// In-memory stand-in for the runtime CLI. Records every call so tests
    /// can assert which operations ran (and which never did).
    pub struct FakeRuntime {
        pub state: Mutex<ContainerState>,
        pub calls: Mutex<Vec<String>>,
        /// When true, a stop signal flips the state to Stopped after
        /// `signal_delay`.
        pub stop_on_signal: bool,
        pub signal_delay: Duration,
        pub tail_text: Mutex<String>,
        pub exec_hook: Option<ExecHook>,
    }

    impl FakeRuntime {
        pub fn new(state: ContainerState) -> Self {
            Self {
                state: Mutex::new(state),
                calls: Mutex::new(Vec::new()),
                stop_on_signal: true,
                signal_delay: Duration::from_millis(0),
                tail_text: Mutex::new(String::new()),
                exec_hook: None,
            }
        }

        pub fn calls_matching(&self, prefix: &str) -> usize {
            self.calls
                .lock()
                .iter()
                .filter(|call| call.starts_with(prefix))
                .count()
        }

        fn record(&self, call: String) {
            self.calls.lock().push(call);
        }
    }

    #[async_trait]
    impl ContainerRuntime for FakeRuntime {
        async fn status(&self, _container: &str) -> WardenResult<ContainerState> {
            Ok(*self.state.lock())
        }

        async fn start(&self, _container: &str) -> WardenResult<()> {
            self.record("start".to_string());
            *self.state.lock() = ContainerState::Running;
            Ok(())
        }

        async fn signal(&self, _container: &str, signal: &str) -> WardenResult<()> {
            self.record(format!("signal {}", signal));
            if self.signal_delay > Duration::from_millis(0) {
                tokio::time::sleep(self.signal_delay).await;
            }
            if self.stop_on_signal {
                *self.state.lock() = ContainerState::Stopped;
            }
            Ok(())
        }

        async fn logs_tail(&self, _container: &str, lines: u32) -> WardenResult<String> {
            self.record(format!("logs_tail {}", lines));
            Ok(self.tail_text.lock().clone())
        }

        async fn tail_logs(
            &self,
            _container: &str,
            _cursor: LogCursor,
        ) -> WardenResult<mpsc::Receiver<LogLine>> {
            self.record("tail_logs".to_string());
            let (_tx, rx) = mpsc::channel(1);
            Ok(rx)
        }

        async fn exec(&self, _container: &str, argv: &[&str]) -> WardenResult<ExecOutput> {
            self.record(format!("exec {}", argv.join(" ")));
            if let Some(hook) = &self.exec_hook {
                return Ok(hook(argv));
            }
            Ok(ExecOutput {
                exit_code: 0,
                stdout: String::new(),
                stderr: String::new(),
            })
        }
    }

    pub fn controller_for(runtime: Arc<FakeRuntime>) -> ContainerController {
        ContainerController::new(
            runtime,
            "game",
            "SIGTERM",
            Duration::from_millis(200),
            Duration::from_millis(10),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;

    #[test]
    fn test_container_state_parse() {
        assert_eq!(ContainerState::parse("running\n"), ContainerState::Running);
        assert_eq!(ContainerState::parse("exited"), ContainerState::Stopped);
        assert_eq!(ContainerState::parse("created"), ContainerState::Stopped);
        assert_eq!(
            ContainerState::parse("restarting"),
            ContainerState::Restarting
        );
        assert_eq!(ContainerState::parse("paused"), ContainerState::Unknown);
        assert_eq!(ContainerState::parse(""), ContainerState::Unknown);
    }

    #[test]
    fn test_split_log_timestamp() {
        let (ts, text) =
            split_log_timestamp("2026-08-23T12:34:56.123456789Z [12:34:56] [Server thread/INFO]: hi");
        assert!(ts.is_some());
        assert_eq!(text, "[12:34:56] [Server thread/INFO]: hi");

        let (ts, text) = split_log_timestamp("no timestamp here");
        assert!(ts.is_none());
        assert_eq!(text, "no timestamp here");
    }

    #[tokio::test]
    async fn test_stop_graceful_waits_for_stopped() {
        let runtime = Arc::new(FakeRuntime::new(ContainerState::Running));
        let controller = controller_for(runtime.clone());
        let outcome = controller.stop_graceful().await.unwrap();
        assert_eq!(outcome, StopOutcome::Stopped);
        assert_eq!(runtime.calls_matching("signal SIGTERM"), 1);
    }

    #[tokio::test]
    async fn test_stop_graceful_times_out_without_force_kill() {
        let mut fake = FakeRuntime::new(ContainerState::Running);
        fake.stop_on_signal = false;
        let runtime = Arc::new(fake);
        let controller = controller_for(runtime.clone());

        let err = controller.stop_graceful().await.unwrap_err();
        assert!(matches!(err, WardenError::ContainerState(_)));
        // one graceful signal, nothing harsher
        assert_eq!(runtime.calls_matching("signal"), 1);
        assert_eq!(*runtime.state.lock(), ContainerState::Running);
    }

    #[tokio::test]
    async fn test_stop_when_already_stopped_is_success() {
        let runtime = Arc::new(FakeRuntime::new(ContainerState::Stopped));
        let controller = controller_for(runtime.clone());
        let outcome = controller.stop_graceful().await.unwrap();
        assert_eq!(outcome, StopOutcome::AlreadyStopped);
        assert_eq!(runtime.calls_matching("signal"), 0);
    }

    #[tokio::test]
    async fn test_ensure_started() {
        let runtime = Arc::new(FakeRuntime::new(ContainerState::Stopped));
        let controller = controller_for(runtime.clone());
        assert_eq!(
            controller.ensure_started().await.unwrap(),
            StartOutcome::Started
        );
        assert_eq!(runtime.calls_matching("start"), 1);

        assert_eq!(
            controller.ensure_started().await.unwrap(),
            StartOutcome::AlreadyRunning
        );
        assert_eq!(runtime.calls_matching("start"), 1);
    }

    #[tokio::test]
    async fn test_restart_stops_then_starts() {
        let runtime = Arc::new(FakeRuntime::new(ContainerState::Running));
        let controller = controller_for(runtime.clone());
        controller.restart().await.unwrap();
        assert_eq!(runtime.calls_matching("signal"), 1);
        assert_eq!(runtime.calls_matching("start"), 1);
    }

    #[tokio::test]
    async fn test_logs_tail_returns_exactly_n_lines() {
        let runtime = Arc::new(FakeRuntime::new(ContainerState::Running));
        *runtime.tail_text.lock() = (1..=10)
            .map(|i| format!("line {}", i))
            .collect::<Vec<_>>()
            .join("\n");
        let controller = controller_for(runtime);
        let lines = controller.logs_tail(5).await.unwrap();
        assert_eq!(
            lines,
            vec!["line 6", "line 7", "line 8", "line 9", "line 10"]
        );
    }
}
