use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

use chrono::Utc;
use sha2::{Digest, Sha256};
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::config::BackupConfig;
use crate::errors::{WardenError, WardenResult};
use crate::rcon_client::RconClient;
use crate::runtime_manager::ContainerController;

#[derive(Debug, Clone)]
pub struct BackupInfo {
    pub file_name: String,
    pub size_bytes: u64,
    pub checksum: String,
}

#[derive(Debug, Clone)]
pub struct BackupEntry {
    pub file_name: String,
    pub size_bytes: u64,
    pub modified: SystemTime,
}

#[derive(Debug, Clone)]
pub struct LoadOutcome {
    pub safety_backup: Option<String>,
}

/// Validates a user-supplied backup name by pure string inspection, before
/// anything touches the filesystem. Rejection deliberately reveals nothing
/// about paths on disk.
pub fn validate_backup_name(name: &str) -> WardenResult<()> {
    let path = Path::new(name);
    let safe = !name.is_empty()
        && !name.contains("..")
        && !name.contains('/')
        && !name.contains('\\')
        && !path.is_absolute()
        && path.components().all(|c| matches!(c, Component::Normal(_)));
    if !safe {
        return Err(WardenError::NotFound(format!("Unknown backup: {}", name)));
    }
    Ok(())
}

/// Archive save/load for the game data directory. Saves run `tar` inside the
/// container over the data mount so the exit code is the definitive success
/// signal; restores run host-side while the container is stopped.
pub struct BackupManager {
    rcon: Arc<RconClient>,
    controller: Arc<ContainerController>,
    data_dir: PathBuf,
    backups_dir: PathBuf,
    world_dirs: Vec<String>,
    mount_dir: String,
}

impl BackupManager {
    pub fn new(
        rcon: Arc<RconClient>,
        controller: Arc<ContainerController>,
        config: &BackupConfig,
        mount_dir: impl Into<String>,
    ) -> Self {
        Self {
            rcon,
            controller,
            data_dir: config.data_dir.clone(),
            backups_dir: config.backups_dir(),
            world_dirs: config.world_dirs.clone(),
            mount_dir: mount_dir.into(),
        }
    }

    pub async fn save(&self) -> WardenResult<BackupInfo> {
        // Best effort: ask the server to flush the world first. A dead server
        // is not a reason to skip the archive.
        match self.rcon.execute("save-all flush").await {
            Ok(_) => debug!("World flush acknowledged"),
            Err(e) => warn!("Skipping world flush, server unreachable: {}", e),
        }

        let file_name = format!("backup-{}.tar.gz", Utc::now().format("%Y%m%d-%H%M%S"));
        let container_backups = format!("{}/backups", self.mount_dir);
        let container_archive = format!("{}/{}", container_backups, file_name);

        info!("Creating backup archive {}", file_name);

        let mkdir = self
            .controller
            .exec(&["mkdir", "-p", &container_backups])
            .await?;
        if !mkdir.success() {
            return Err(WardenError::Backup(format!(
                "Failed to prepare backups directory: {}",
                mkdir.stderr.trim()
            )));
        }

        let mut argv: Vec<String> = vec![
            "tar".to_string(),
            "-czf".to_string(),
            container_archive,
            "-C".to_string(),
            self.mount_dir.clone(),
        ];
        argv.extend(self.world_dirs.iter().cloned());
        let argv_refs: Vec<&str> = argv.iter().map(|s| s.as_str()).collect();

        let output = self.controller.exec(&argv_refs).await?;
        if !output.success() {
            return Err(WardenError::Backup(format!(
                "Archive creation failed (exit {}): {}",
                output.exit_code,
                output.stderr.trim()
            )));
        }

        let host_archive = self.backups_dir.join(&file_name);
        let buffer = tokio::fs::read(&host_archive).await.map_err(|e| {
            WardenError::Backup(format!(
                "Archive not visible on host after creation: {}",
                e
            ))
        })?;
        let checksum = format!("{:x}", Sha256::digest(&buffer));

        info!(
            "Backup {} created ({} bytes, sha256 {})",
            file_name,
            buffer.len(),
            checksum
        );

        Ok(BackupInfo {
            file_name,
            size_bytes: buffer.len() as u64,
            checksum,
        })
    }

    /// Restores a named archive: validate, stop gracefully, snapshot the
    /// current world, swap in the archive contents, start again. Every step
    /// aborts the whole operation on failure.
    pub async fn load(&self, name: &str) -> WardenResult<LoadOutcome> {
        validate_backup_name(name)?;

        let archive = self.backups_dir.join(name);
        tokio::fs::metadata(&archive)
            .await
            .map_err(|_| WardenError::NotFound(format!("Unknown backup: {}", name)))?;

        // No file is touched until the container has actually stopped.
        self.controller.stop_graceful().await?;

        let safety_backup = self.create_safety_backup().await?;

        for dir in &self.world_dirs {
            let target = self.data_dir.join(dir);
            if target.exists() {
                tokio::fs::remove_dir_all(&target).await.map_err(|e| {
                    WardenError::Backup(format!("Failed to clear {}: {}", dir, e))
                })?;
            }
        }

        let archive_str = archive.to_string_lossy().into_owned();
        let data_dir_str = self.data_dir.to_string_lossy().into_owned();
        run_host_tar(&["-xzf", &archive_str, "-C", &data_dir_str])
            .await
            .map_err(|e| WardenError::Backup(format!("Restore extraction failed: {}", e)))?;

        info!("Backup {} restored, starting container", name);
        self.controller.ensure_started().await?;

        Ok(LoadOutcome { safety_backup })
    }

    pub async fn list_backups(&self) -> WardenResult<Vec<BackupEntry>> {
        let entries = match std::fs::read_dir(&self.backups_dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(WardenError::IoError(e.to_string())),
        };

        let mut backups = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| WardenError::IoError(e.to_string()))?;
            let file_name = entry.file_name().to_string_lossy().into_owned();
            if !file_name.ends_with(".tar.gz") {
                continue;
            }
            let meta = entry
                .metadata()
                .map_err(|e| WardenError::IoError(e.to_string()))?;
            backups.push(BackupEntry {
                file_name,
                size_bytes: meta.len(),
                modified: meta.modified().unwrap_or(SystemTime::UNIX_EPOCH),
            });
        }

        backups.sort_by(|a, b| b.modified.cmp(&a.modified));
        Ok(backups)
    }

    async fn create_safety_backup(&self) -> WardenResult<Option<String>> {
        let present: Vec<&String> = self
            .world_dirs
            .iter()
            .filter(|dir| self.data_dir.join(dir.as_str()).exists())
            .collect();
        if present.is_empty() {
            info!("No world directories present, skipping safety backup");
            return Ok(None);
        }

        std::fs::create_dir_all(&self.backups_dir)
            .map_err(|e| WardenError::Backup(format!("Failed to prepare backups dir: {}", e)))?;

        let name = format!(
            "pre-restore-backup-{}.tar.gz",
            Utc::now().format("%Y%m%d-%H%M%S")
        );
        let archive = self.backups_dir.join(&name).to_string_lossy().into_owned();
        let data_dir = self.data_dir.to_string_lossy().into_owned();

        let mut args: Vec<&str> = vec!["-czf", &archive, "-C", &data_dir];
        args.extend(present.iter().map(|s| s.as_str()));

        run_host_tar(&args)
            .await
            .map_err(|e| WardenError::Backup(format!("Safety backup failed: {}", e)))?;

        info!("Safety backup {} created", name);
        Ok(Some(name))
    }
}

async fn run_host_tar(args: &[&str]) -> WardenResult<()> {
    let output = Command::new("tar")
        .args(args)
        .output()
        .await
        .map_err(|e| WardenError::Backup(format!("Failed to run tar: {}", e)))?;
    if !output.status.success() {
        return Err(WardenError::Backup(
            String::from_utf8_lossy(&output.stderr).trim().to_string(),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RconConfig;
    use crate::runtime_manager::testing::{controller_for, FakeRuntime};
    use crate::runtime_manager::{ContainerState, ExecOutput};
    use std::time::Duration;

    fn dead_rcon() -> Arc<RconClient> {
        Arc::new(RconClient::new(&RconConfig {
            host: "127.0.0.1".to_string(),
            port: 9,
            password: "x".to_string(),
            connect_timeout_secs: 1,
            reply_timeout_secs: 1,
            ready_timeout_secs: 1,
        }))
    }

    fn manager_with(
        runtime: Arc<FakeRuntime>,
        data_dir: PathBuf,
        world_dirs: Vec<String>,
    ) -> BackupManager {
        BackupManager::new(
            dead_rcon(),
            Arc::new(controller_for(runtime)),
            &BackupConfig {
                data_dir,
                backups_dir: None,
                world_dirs,
            },
            "/data",
        )
    }

    #[test]
    fn test_validate_backup_name() {
        assert!(validate_backup_name("backup-20260823-120000.tar.gz").is_ok());
        assert!(validate_backup_name("../../etc/passwd").is_err());
        assert!(validate_backup_name("/etc/passwd").is_err());
        assert!(validate_backup_name("nested/backup.tar.gz").is_err());
        assert!(validate_backup_name("..").is_err());
        assert!(validate_backup_name("").is_err());
    }

    #[tokio::test]
    async fn test_load_rejects_traversal_before_any_runtime_call() {
        let runtime = Arc::new(FakeRuntime::new(ContainerState::Running));
        let manager = manager_with(
            runtime.clone(),
            PathBuf::from("/nonexistent/data"),
            vec!["world".to_string()],
        );

        let err = manager.load("../../etc/passwd").await.unwrap_err();
        assert!(matches!(err, WardenError::NotFound(_)));
        assert!(runtime.calls.lock().is_empty());
    }

    #[tokio::test]
    async fn test_load_unknown_backup_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let runtime = Arc::new(FakeRuntime::new(ContainerState::Running));
        let manager = manager_with(
            runtime.clone(),
            dir.path().to_path_buf(),
            vec!["world".to_string()],
        );

        let err = manager.load("no-such-backup.tar.gz").await.unwrap_err();
        assert!(matches!(err, WardenError::NotFound(_)));
        assert!(runtime.calls.lock().is_empty());
    }

    #[tokio::test]
    async fn test_load_aborts_without_extraction_when_stop_fails() {
        let dir = tempfile::tempdir().unwrap();
        let data_dir = dir.path().to_path_buf();
        let world = data_dir.join("world");
        std::fs::create_dir_all(&world).unwrap();
        std::fs::write(world.join("level.dat"), b"current world").unwrap();
        let backups = data_dir.join("backups");
        std::fs::create_dir_all(&backups).unwrap();
        std::fs::write(backups.join("old.tar.gz"), b"archive bytes").unwrap();

        let mut fake = FakeRuntime::new(ContainerState::Running);
        fake.stop_on_signal = false;
        let runtime = Arc::new(fake);
        let manager = manager_with(runtime.clone(), data_dir, vec!["world".to_string()]);

        let err = manager.load("old.tar.gz").await.unwrap_err();
        assert!(matches!(err, WardenError::ContainerState(_)));
        // world untouched, container never started, nothing exec'd
        assert_eq!(
            std::fs::read(world.join("level.dat")).unwrap(),
            b"current world"
        );
        assert_eq!(runtime.calls_matching("start"), 0);
        assert_eq!(runtime.calls_matching("exec"), 0);
    }

    #[tokio::test]
    async fn test_save_reports_size_and_checksum() {
        let dir = tempfile::tempdir().unwrap();
        let data_dir = dir.path().to_path_buf();
        let backups = data_dir.join("backups");
        std::fs::create_dir_all(&backups).unwrap();

        let payload: &[u8] = b"fake archive bytes";
        let mut fake = FakeRuntime::new(ContainerState::Running);
        let host_backups = backups.clone();
        fake.exec_hook = Some(Box::new(move |argv: &[&str]| {
            if argv.first() == Some(&"tar") {
                let container_path = Path::new(argv[2]);
                let file_name = container_path.file_name().unwrap();
                std::fs::write(host_backups.join(file_name), payload).unwrap();
            }
            ExecOutput {
                exit_code: 0,
                stdout: String::new(),
                stderr: String::new(),
            }
        }));
        let runtime = Arc::new(fake);
        let manager = manager_with(runtime.clone(), data_dir, vec!["world".to_string()]);

        let info = manager.save().await.unwrap();
        assert_eq!(info.size_bytes, payload.len() as u64);
        assert_eq!(info.checksum, format!("{:x}", Sha256::digest(payload)));
        assert!(info.file_name.starts_with("backup-"));
        assert_eq!(runtime.calls_matching("exec tar -czf"), 1);
    }

    #[tokio::test]
    async fn test_save_surfaces_archive_failure() {
        let dir = tempfile::tempdir().unwrap();
        let mut fake = FakeRuntime::new(ContainerState::Running);
        fake.exec_hook = Some(Box::new(|argv: &[&str]| {
            if argv.first() == Some(&"tar") {
                return ExecOutput {
                    exit_code: 2,
                    stdout: String::new(),
                    stderr: "tar: world: No such file or directory".to_string(),
                };
            }
            ExecOutput {
                exit_code: 0,
                stdout: String::new(),
                stderr: String::new(),
            }
        }));
        let runtime = Arc::new(fake);
        let manager = manager_with(
            runtime,
            dir.path().to_path_buf(),
            vec!["world".to_string()],
        );

        let err = manager.save().await.unwrap_err();
        assert!(matches!(err, WardenError::Backup(ref msg) if msg.contains("exit 2")));
    }

    #[tokio::test]
    async fn test_list_backups_newest_first() {
        let dir = tempfile::tempdir().unwrap();
        let data_dir = dir.path().to_path_buf();
        let backups = data_dir.join("backups");
        std::fs::create_dir_all(&backups).unwrap();

        std::fs::write(backups.join("older.tar.gz"), b"a").unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        std::fs::write(backups.join("newer.tar.gz"), b"bb").unwrap();
        std::fs::write(backups.join("notes.txt"), b"ignored").unwrap();

        let runtime = Arc::new(FakeRuntime::new(ContainerState::Running));
        let manager = manager_with(runtime, data_dir, vec!["world".to_string()]);

        let listed = manager.list_backups().await.unwrap();
        let names: Vec<&str> = listed.iter().map(|b| b.file_name.as_str()).collect();
        assert_eq!(names, vec!["newer.tar.gz", "older.tar.gz"]);
    }
}
