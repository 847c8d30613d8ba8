pub mod config;
pub mod directory;
pub mod nfs;
pub mod rclone;
pub mod service;
pub mod sftp;
pub mod smb;
pub mod webdav;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::error::{CronvaultError, MountError, Result};
use crate::mount::guard::{remove_credentials, CredentialDir};
use crate::mount::inspect::MountTable;
use crate::mount::ops::{classify_failure, umount_command};
use crate::secrets::SecretResolver;
use crate::types::VolumeStatus;
use crate::util::command::{CommandRunner, CommandSpec};

use self::config::VolumeConfig;

/// Result of a backend operation, persisted as the volume's status.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendOutcome {
    pub status: VolumeStatus,
    pub error: Option<String>,
}

impl BackendOutcome {
    pub fn mounted() -> Self {
        Self {
            status: VolumeStatus::Mounted,
            error: None,
        }
    }

    pub fn unmounted() -> Self {
        Self {
            status: VolumeStatus::Unmounted,
            error: None,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            status: VolumeStatus::Error,
            error: Some(message.into()),
        }
    }
}

/// Host facilities shared by every backend.
#[derive(Clone)]
pub struct MountEnvironment {
    pub runner: Arc<dyn CommandRunner>,
    pub secrets: Arc<dyn SecretResolver>,
    pub mount_table: PathBuf,
    pub mount_base: PathBuf,
    pub credentials_base: PathBuf,
    pub timeout: Duration,
    pub platform_supported: bool,
}

pub fn platform_supported() -> bool {
    cfg!(target_os = "linux")
}

/// Where a volume's data is reachable: the configured path for directory
/// volumes, `<mount_base>/<short_id>/_data` for everything else.
pub fn volume_path(config: &VolumeConfig, short_id: &str, mount_base: &Path) -> PathBuf {
    match config {
        VolumeConfig::Directory(cfg) => cfg.path.clone(),
        _ => mount_base.join(short_id).join("_data"),
    }
}

pub struct VolumeBackend {
    name: String,
    config: VolumeConfig,
    path: PathBuf,
    credentials: PathBuf,
    env: MountEnvironment,
}

impl VolumeBackend {
    pub fn new(name: &str, short_id: &str, config: &VolumeConfig, env: &MountEnvironment) -> Self {
        Self {
            name: name.to_string(),
            config: config.clone(),
            path: volume_path(config, short_id, &env.mount_base),
            credentials: env.credentials_base.join(short_id),
            env: env.clone(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn credentials_dir(&self) -> &Path {
        &self.credentials
    }

    pub async fn mount(&self) -> BackendOutcome {
        if let VolumeConfig::Directory(cfg) = &self.config {
            return directory::check_health(cfg);
        }
        if !self.env.platform_supported {
            return BackendOutcome::error(
                MountError::PlatformUnsupported(self.config.kind().to_string()).to_string(),
            );
        }

        let health = self.check_health();
        match health.status {
            VolumeStatus::Mounted => {
                debug!(volume = %self.name, "already mounted");
                return health;
            }
            VolumeStatus::Error => {
                debug!(volume = %self.name, "clearing stale mount before remount");
                let _ = self.unmount().await;
            }
            VolumeStatus::Unmounted => {}
        }

        match self.mount_inner().await {
            Ok(()) => {
                info!(volume = %self.name, path = %self.path.display(), "mounted");
                BackendOutcome::mounted()
            }
            Err(err) => {
                warn!(volume = %self.name, error = %err, "mount failed");
                BackendOutcome::error(err.to_string())
            }
        }
    }

    pub async fn unmount(&self) -> BackendOutcome {
        if matches!(self.config, VolumeConfig::Directory(_)) {
            return BackendOutcome::unmounted();
        }
        if !self.env.platform_supported {
            return BackendOutcome::error(
                MountError::PlatformUnsupported(self.config.kind().to_string()).to_string(),
            );
        }
        let result = self.unmount_inner().await;
        remove_credentials(&self.credentials);
        match result {
            Ok(()) => BackendOutcome::unmounted(),
            Err(err) => {
                warn!(volume = %self.name, error = %err, "unmount failed");
                BackendOutcome::error(err.to_string())
            }
        }
    }

    /// Re-derives the state from the live mount table on every call.
    pub fn check_health(&self) -> BackendOutcome {
        if let VolumeConfig::Directory(cfg) = &self.config {
            return directory::check_health(cfg);
        }
        if !self.env.platform_supported {
            return BackendOutcome::error(
                MountError::PlatformUnsupported(self.config.kind().to_string()).to_string(),
            );
        }
        if !self.path.exists() {
            return BackendOutcome::unmounted();
        }
        let table = match MountTable::read(&self.env.mount_table) {
            Ok(table) => table,
            Err(err) => return BackendOutcome::error(err.to_string()),
        };
        match table.find(&self.path) {
            None => BackendOutcome::unmounted(),
            Some(entry) if self.fs_type_matches(&entry.fs_type) => BackendOutcome::mounted(),
            Some(entry) => BackendOutcome::error(format!(
                "{} is mounted as {}, expected a {} filesystem",
                self.path.display(),
                entry.fs_type,
                self.config.kind()
            )),
        }
    }

    fn fs_type_matches(&self, fs_type: &str) -> bool {
        match &self.config {
            VolumeConfig::Directory(_) => true,
            VolumeConfig::Nfs(_) => nfs::fs_type_matches(fs_type),
            VolumeConfig::Smb(_) => smb::fs_type_matches(fs_type),
            VolumeConfig::Webdav(_) => webdav::fs_type_matches(fs_type),
            VolumeConfig::Rclone(_) => rclone::fs_type_matches(fs_type),
            VolumeConfig::Sftp(_) => sftp::fs_type_matches(fs_type),
        }
    }

    fn timeout(&self) -> Duration {
        match &self.config {
            VolumeConfig::Sftp(_) => self.env.timeout * 2,
            _ => self.env.timeout,
        }
    }

    fn plan(&self, creds: &CredentialDir) -> Result<CommandSpec> {
        let secrets = self.env.secrets.as_ref();
        match &self.config {
            VolumeConfig::Directory(_) => Err(CronvaultError::message(
                "directory volumes are not mounted",
            )),
            VolumeConfig::Nfs(cfg) => Ok(nfs::mount_command(cfg, &self.path)),
            VolumeConfig::Smb(cfg) => smb::mount_command(cfg, &self.path, creds, secrets),
            VolumeConfig::Webdav(cfg) => webdav::mount_command(cfg, &self.path, creds, secrets),
            VolumeConfig::Rclone(cfg) => Ok(rclone::mount_command(cfg, &self.path)),
            VolumeConfig::Sftp(cfg) => sftp::mount_command(cfg, &self.path, creds, secrets),
        }
    }

    async fn mount_inner(&self) -> Result<()> {
        std::fs::create_dir_all(&self.path)
            .map_err(|e| CronvaultError::message(format!("create {}: {}", self.path.display(), e)))?;
        let creds = CredentialDir::create(self.credentials.clone())?;
        let command = self.plan(&creds)?;
        let timeout = self.timeout();
        let output = match self.env.runner.run(&command, timeout).await {
            Ok(output) => output,
            Err(CronvaultError::Timeout { .. }) => {
                return Err(MountError::Timeout(timeout.as_secs()).into())
            }
            Err(err) => return Err(err),
        };
        if !output.success() {
            return Err(classify_failure(&output).into());
        }
        creds.keep();
        Ok(())
    }

    async fn unmount_inner(&self) -> Result<()> {
        let table = MountTable::read(&self.env.mount_table)?;
        let ours = table
            .find(&self.path)
            .map(|entry| self.fs_type_matches(&entry.fs_type))
            .unwrap_or(false);
        if !ours {
            debug!(volume = %self.name, "not mounted; nothing to unmount");
            return Ok(());
        }
        let output = match self
            .env
            .runner
            .run(&umount_command(&self.path), self.env.timeout)
            .await
        {
            Ok(output) => output,
            Err(CronvaultError::Timeout { seconds, .. }) => {
                return Err(MountError::Timeout(seconds).into())
            }
            Err(err) => return Err(err),
        };
        if !output.success() {
            return Err(MountError::Command(format!(
                "umount {}: {}",
                self.path.display(),
                output.stderr.trim()
            ))
            .into());
        }
        info!(volume = %self.name, path = %self.path.display(), "unmounted");
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::fs;
    use std::path::Path;
    use std::sync::Arc;
    use std::time::Duration;

    use tempfile::TempDir;

    use super::MountEnvironment;
    use crate::secrets::DefaultSecretResolver;
    use crate::util::command::testing::RecordingRunner;

    pub struct Host {
        pub dir: TempDir,
        pub runner: Arc<RecordingRunner>,
        pub env: MountEnvironment,
    }

    impl Host {
        pub fn new() -> Self {
            let dir = TempDir::new().expect("tempdir");
            let runner = Arc::new(RecordingRunner::default());
            let secrets_dir = dir.path().join("secrets");
            fs::create_dir_all(&secrets_dir).unwrap();
            let mount_table = dir.path().join("mounts");
            fs::write(&mount_table, "proc /proc proc rw 0 0\n").unwrap();
            let env = MountEnvironment {
                runner: runner.clone(),
                secrets: Arc::new(DefaultSecretResolver::new(secrets_dir)),
                mount_table,
                mount_base: dir.path().join("volumes"),
                credentials_base: dir.path().join("credentials"),
                timeout: Duration::from_secs(5),
                platform_supported: true,
            };
            Self { dir, runner, env }
        }

        pub fn secret(&self, name: &str, value: &str) {
            fs::write(self.dir.path().join("secrets").join(name), value).unwrap();
        }

        pub fn set_mounted(&self, path: &Path, fs_type: &str) {
            fs::create_dir_all(path).unwrap();
            fs::write(
                &self.env.mount_table,
                format!("proc /proc proc rw 0 0\nremote {} {} rw 0 0\n", path.display(), fs_type),
            )
            .unwrap();
        }

        pub fn clear_mounts(&self) {
            fs::write(&self.env.mount_table, "proc /proc proc rw 0 0\n").unwrap();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::config::{NfsConfig, SftpConfig, SmbConfig};
    use super::testing::Host;
    use super::*;
    use std::os::unix::fs::MetadataExt;

    fn nfs() -> VolumeConfig {
        VolumeConfig::Nfs(NfsConfig {
            server: "nas".to_string(),
            export_path: "/export".to_string(),
            port: 2049,
            version: "4.1".to_string(),
            read_only: false,
        })
    }

    #[tokio::test]
    async fn mount_is_idempotent_when_already_mounted() {
        let host = Host::new();
        let backend = VolumeBackend::new("media", "ab12cd34", &nfs(), &host.env);
        host.set_mounted(backend.path(), "nfs4");

        let outcome = backend.mount().await;
        assert_eq!(outcome, BackendOutcome::mounted());
        assert!(host.runner.programs().is_empty());
    }

    #[tokio::test]
    async fn health_follows_the_live_mount_table() {
        let host = Host::new();
        let backend = VolumeBackend::new("media", "ab12cd34", &nfs(), &host.env);
        host.set_mounted(backend.path(), "nfs");
        assert_eq!(backend.check_health().status, VolumeStatus::Mounted);

        host.clear_mounts();
        assert_eq!(backend.check_health().status, VolumeStatus::Unmounted);

        host.set_mounted(backend.path(), "ext4");
        assert_eq!(backend.check_health().status, VolumeStatus::Error);
    }

    #[tokio::test]
    async fn unsupported_platform_fails_without_side_effects() {
        let mut host = Host::new();
        host.env.platform_supported = false;
        let backend = VolumeBackend::new("media", "ab12cd34", &nfs(), &host.env);

        let outcome = backend.mount().await;
        assert_eq!(outcome.status, VolumeStatus::Error);
        assert!(outcome.error.unwrap().contains("only be mounted on Linux"));
        assert!(host.runner.programs().is_empty());
        assert!(!backend.path().exists());
    }

    #[tokio::test]
    async fn failed_mount_is_classified_and_credentials_removed() {
        let host = Host::new();
        host.secret("smb-pass", "hunter2");
        let cfg = VolumeConfig::Smb(SmbConfig {
            server: "files".to_string(),
            share: "docs".to_string(),
            username: Some("alice".to_string()),
            password: Some("file://smb-pass".to_string()),
            domain: None,
            version: "3.0".to_string(),
            port: 445,
            uid: None,
            gid: None,
            read_only: true,
        });
        let backend = VolumeBackend::new("docs", "ef56ab78", &cfg, &host.env);
        host.runner.reply(32, "mount error(13): Permission denied");

        let outcome = backend.mount().await;
        assert_eq!(outcome.status, VolumeStatus::Error);
        assert!(outcome.error.unwrap().starts_with("authentication failed"));
        assert!(!backend.credentials_dir().exists());
    }

    #[tokio::test]
    async fn successful_mount_keeps_credentials_until_unmount() {
        let host = Host::new();
        host.secret("smb-pass", "hunter2");
        let cfg = VolumeConfig::Smb(SmbConfig {
            server: "files".to_string(),
            share: "docs".to_string(),
            username: Some("alice".to_string()),
            password: Some("file://smb-pass".to_string()),
            domain: Some("CORP".to_string()),
            version: "3.0".to_string(),
            port: 445,
            uid: Some(1000),
            gid: Some(1000),
            read_only: true,
        });
        let backend = VolumeBackend::new("docs", "ef56ab78", &cfg, &host.env);

        assert_eq!(backend.mount().await, BackendOutcome::mounted());
        let creds = backend.credentials_dir().join("smb-credentials");
        let contents = std::fs::read_to_string(&creds).expect("credentials");
        assert!(contents.contains("password=hunter2"));
        assert!(contents.contains("domain=CORP"));
        assert_eq!(std::fs::metadata(&creds).unwrap().mode() & 0o777, 0o600);
        let (spec, _) = host.runner.call(0);
        assert!(!spec.display().contains("hunter2"));

        host.set_mounted(backend.path(), "cifs");
        assert_eq!(backend.unmount().await, BackendOutcome::unmounted());
        let (spec, _) = host.runner.call(1);
        assert_eq!(spec.program, "umount");
        assert_eq!(spec.args[0], "-l");
        assert!(!backend.credentials_dir().exists());
    }

    #[tokio::test]
    async fn unmount_of_unmounted_volume_is_a_noop() {
        let host = Host::new();
        let backend = VolumeBackend::new("media", "ab12cd34", &nfs(), &host.env);
        assert_eq!(backend.unmount().await, BackendOutcome::unmounted());
        assert!(host.runner.programs().is_empty());
    }

    #[tokio::test]
    async fn stale_mount_is_cleared_before_remount() {
        let host = Host::new();
        let backend = VolumeBackend::new("media", "ab12cd34", &nfs(), &host.env);
        // Same path but the wrong filesystem: health reports error.
        host.set_mounted(backend.path(), "tmpfs");
        let outcome = backend.mount().await;
        assert_eq!(outcome, BackendOutcome::mounted());
        // tmpfs is not ours, so only the mount command runs.
        assert_eq!(host.runner.programs(), vec!["mount".to_string()]);
    }

    #[tokio::test]
    async fn sftp_uses_double_timeout() {
        let host = Host::new();
        let cfg = VolumeConfig::Sftp(SftpConfig {
            host: "backup.example".to_string(),
            port: 2222,
            username: "bob".to_string(),
            password: None,
            private_key: Some("-----BEGIN KEY-----".to_string()),
            path: "/data".to_string(),
            known_hosts: None,
            skip_host_key_check: true,
            read_only: false,
        });
        let backend = VolumeBackend::new("remote", "0011aabb", &cfg, &host.env);
        assert_eq!(backend.mount().await, BackendOutcome::mounted());
        let (spec, timeout) = host.runner.call(0);
        assert_eq!(spec.program, "sshfs");
        assert_eq!(timeout, host.env.timeout * 2);
    }
}
