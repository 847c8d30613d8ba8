use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::config::model::{ResticSettings, RetentionPolicy};
use crate::db::models::Repository;
use crate::error::{CronvaultError, EngineError, MountError, Result};
use crate::mount::guard::CredentialDir;
use crate::repository::config::RepositoryConfig;
use crate::secrets::SecretResolver;
use crate::types::CompressionMode;

const PROBE_TIMEOUT: Duration = Duration::from_secs(120);

/// One `status` record of `restic backup --json`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BackupProgress {
    #[serde(default)]
    pub percent_done: f64,
    #[serde(default)]
    pub total_files: u64,
    #[serde(default)]
    pub files_done: u64,
    #[serde(default)]
    pub total_bytes: u64,
    #[serde(default)]
    pub bytes_done: u64,
    #[serde(default)]
    pub seconds_elapsed: u64,
    #[serde(default)]
    pub current_files: Vec<String>,
}

/// The closing `summary` record of `restic backup --json`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BackupSummary {
    #[serde(default)]
    pub files_new: u64,
    #[serde(default)]
    pub files_changed: u64,
    #[serde(default)]
    pub files_unmodified: u64,
    #[serde(default)]
    pub dirs_new: u64,
    #[serde(default)]
    pub dirs_changed: u64,
    #[serde(default)]
    pub dirs_unmodified: u64,
    #[serde(default)]
    pub data_added: u64,
    #[serde(default)]
    pub total_files_processed: u64,
    #[serde(default)]
    pub total_bytes_processed: u64,
    #[serde(default)]
    pub total_duration: f64,
    #[serde(default)]
    pub snapshot_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ErrorDetail {
    #[serde(default)]
    message: String,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "message_type", rename_all = "snake_case")]
enum BackupMessage {
    Status(BackupProgress),
    Summary(BackupSummary),
    Error {
        #[serde(default)]
        error: Option<ErrorDetail>,
        #[serde(default)]
        item: String,
    },
    #[serde(other)]
    Other,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct Snapshot {
    pub id: String,
    #[serde(default)]
    pub short_id: String,
    pub time: DateTime<Utc>,
    #[serde(default)]
    pub hostname: String,
    #[serde(default)]
    pub paths: Vec<String>,
    #[serde(default)]
    pub tags: Option<Vec<String>>,
}

pub struct BackupRequest<'a> {
    pub source: &'a Path,
    pub tag: &'a str,
    pub compression: CompressionMode,
    pub include: &'a [String],
    pub exclude: &'a [String],
    pub exclude_if_present: &'a [String],
    pub one_file_system: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum BackupRun {
    Finished {
        exit_code: i32,
        stderr: String,
        summary: Option<BackupSummary>,
        /// Per-item errors restic reported while archiving.
        item_errors: Vec<String>,
    },
    Cancelled,
}

enum Exec {
    Finished { code: i32, stdout: String, stderr: String },
    Cancelled,
}

/// Repository location plus the environment restic needs to reach it.
/// Credential files live in `files` and vanish with it.
struct Target {
    url: String,
    env: Vec<(String, String)>,
    options: Vec<String>,
    files: CredentialDir,
}

/// Runs restic as a subprocess. Every invocation gets a fresh scratch
/// directory for credential and pattern files.
#[derive(Clone)]
pub struct ResticCli {
    settings: ResticSettings,
    scratch: PathBuf,
    secrets: Arc<dyn SecretResolver>,
}

impl ResticCli {
    pub fn new(settings: ResticSettings, scratch: PathBuf, secrets: Arc<dyn SecretResolver>) -> Self {
        Self {
            settings,
            scratch,
            secrets,
        }
    }

    pub fn secrets(&self) -> &dyn SecretResolver {
        self.secrets.as_ref()
    }

    /// The `--repo` value for a repository.
    pub fn repository_url(&self, repo: &Repository) -> String {
        match &repo.config {
            RepositoryConfig::Local(cfg) => cfg
                .path
                .clone()
                .unwrap_or_else(|| self.settings.local_repository_base.join(&repo.name))
                .to_string_lossy()
                .to_string(),
            RepositoryConfig::S3(cfg) => {
                format!("s3:{}/{}", cfg.endpoint.trim_end_matches('/'), cfg.bucket)
            }
            RepositoryConfig::R2(cfg) => format!(
                "s3:https://{}.r2.cloudflarestorage.com/{}",
                cfg.account_id, cfg.bucket
            ),
            RepositoryConfig::Gcs(cfg) => format!("gs:{}:/", cfg.bucket),
            RepositoryConfig::Azure(cfg) => format!("azure:{}:/", cfg.container),
            RepositoryConfig::Rest(cfg) => {
                let base = cfg.url.trim_end_matches('/');
                match cfg.path.as_deref().map(|p| p.trim_matches('/')) {
                    Some(path) if !path.is_empty() => format!("rest:{}/{}", base, path),
                    _ => format!("rest:{}", base),
                }
            }
            RepositoryConfig::Sftp(cfg) => format!("sftp:{}@{}:{}", cfg.username, cfg.host, cfg.path),
            RepositoryConfig::Rclone(cfg) => format!("rclone:{}:{}", cfg.remote, cfg.path),
        }
    }

    fn target(&self, repo: &Repository) -> Result<Target> {
        let files = CredentialDir::create(self.scratch.join(Uuid::new_v4().simple().to_string()))?;
        let secrets = self.secrets.as_ref();
        let mut env = vec![(
            "RESTIC_CACHE_DIR".to_string(),
            self.settings.cache_dir.to_string_lossy().to_string(),
        )];
        match secrets.resolve_optional(repo.password.as_deref())? {
            Some(password) => env.push(("RESTIC_PASSWORD".to_string(), password)),
            None => env.push((
                "RESTIC_PASSWORD_FILE".to_string(),
                self.settings.password_file.to_string_lossy().to_string(),
            )),
        }
        let mut options = Vec::new();
        match &repo.config {
            RepositoryConfig::Local(_) | RepositoryConfig::Rclone(_) => {}
            RepositoryConfig::S3(cfg) => {
                env.push(("AWS_ACCESS_KEY_ID".to_string(), secrets.resolve(&cfg.access_key_id)?));
                env.push((
                    "AWS_SECRET_ACCESS_KEY".to_string(),
                    secrets.resolve(&cfg.secret_access_key)?,
                ));
            }
            RepositoryConfig::R2(cfg) => {
                env.push(("AWS_ACCESS_KEY_ID".to_string(), secrets.resolve(&cfg.access_key_id)?));
                env.push((
                    "AWS_SECRET_ACCESS_KEY".to_string(),
                    secrets.resolve(&cfg.secret_access_key)?,
                ));
                env.push(("AWS_DEFAULT_REGION".to_string(), "auto".to_string()));
            }
            RepositoryConfig::Gcs(cfg) => {
                let credentials = files.write("gcs.json", &secrets.resolve(&cfg.credentials_json)?)?;
                env.push(("GOOGLE_PROJECT_ID".to_string(), cfg.project_id.clone()));
                env.push((
                    "GOOGLE_APPLICATION_CREDENTIALS".to_string(),
                    credentials.to_string_lossy().to_string(),
                ));
            }
            RepositoryConfig::Azure(cfg) => {
                env.push(("AZURE_ACCOUNT_NAME".to_string(), cfg.account_name.clone()));
                env.push(("AZURE_ACCOUNT_KEY".to_string(), secrets.resolve(&cfg.account_key)?));
                if let Some(suffix) = &cfg.endpoint_suffix {
                    env.push(("AZURE_ENDPOINT_SUFFIX".to_string(), suffix.clone()));
                }
            }
            RepositoryConfig::Rest(cfg) => {
                if let Some(username) = secrets.resolve_optional(cfg.username.as_deref())? {
                    env.push(("RESTIC_REST_USERNAME".to_string(), username));
                }
                if let Some(password) = secrets.resolve_optional(cfg.password.as_deref())? {
                    env.push(("RESTIC_REST_PASSWORD".to_string(), password));
                }
            }
            RepositoryConfig::Sftp(cfg) => {
                let mut ssh = format!("ssh -p {}", cfg.port);
                if let Some(mut key) = secrets.resolve_optional(cfg.private_key.as_deref())? {
                    if !key.ends_with('\n') {
                        key.push('\n');
                    }
                    let key_file = files.write("ssh-key", &key)?;
                    ssh.push_str(&format!(" -i {}", key_file.display()));
                }
                match (&cfg.known_hosts, cfg.skip_host_key_check) {
                    (_, true) => ssh.push_str(
                        " -o StrictHostKeyChecking=no -o UserKnownHostsFile=/dev/null",
                    ),
                    (Some(known_hosts), false) => {
                        let file = files.write("known_hosts", known_hosts)?;
                        ssh.push_str(&format!(
                            " -o StrictHostKeyChecking=yes -o UserKnownHostsFile={}",
                            file.display()
                        ));
                    }
                    (None, false) => {
                        return Err(MountError::InvalidOptions(
                            "knownHosts is required unless skipHostKeyCheck is set".to_string(),
                        )
                        .into())
                    }
                }
                ssh.push_str(&format!(" {}@{} -s sftp", cfg.username, cfg.host));
                options.push("-o".to_string());
                options.push(format!("sftp.command={}", ssh));
            }
        }
        Ok(Target {
            url: self.repository_url(repo),
            env,
            options,
            files,
        })
    }

    async fn exec<F>(
        &self,
        target: &Target,
        args: &[String],
        extra_env: &[(String, String)],
        cancel: &CancellationToken,
        mut on_line: F,
    ) -> Result<Exec>
    where
        F: FnMut(&str) -> bool + Send,
    {
        let mut cmd = Command::new(&self.settings.binary);
        cmd.arg("--repo")
            .arg(&target.url)
            .args(&target.options)
            .args(args)
            .envs(target.env.iter().chain(extra_env.iter()).map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        debug!(repo = %target.url, args = ?args, "restic");
        let mut child = cmd.spawn().map_err(|e| {
            CronvaultError::message(format!("spawn {}: {}", self.settings.binary.display(), e))
        })?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| CronvaultError::message("restic stdout unavailable"))?;
        let mut stderr = child
            .stderr
            .take()
            .ok_or_else(|| CronvaultError::message("restic stderr unavailable"))?;
        let stderr_task = tokio::spawn(async move {
            let mut buf = String::new();
            let _ = stderr.read_to_string(&mut buf).await;
            buf
        });

        let mut lines = BufReader::new(stdout).lines();
        let mut captured = String::new();
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    let _ = child.kill().await;
                    stderr_task.abort();
                    return Ok(Exec::Cancelled);
                }
                line = lines.next_line() => match line {
                    Ok(Some(line)) => {
                        if on_line(&line) {
                            captured.push_str(&line);
                            captured.push('\n');
                        }
                    }
                    Ok(None) => break,
                    Err(err) => {
                        warn!(error = %err, "restic stdout unreadable");
                        break;
                    }
                },
            }
        }
        let status = tokio::select! {
            _ = cancel.cancelled() => {
                let _ = child.kill().await;
                stderr_task.abort();
                return Ok(Exec::Cancelled);
            }
            status = child.wait() => status
                .map_err(|e| CronvaultError::message(format!("wait for restic: {}", e)))?,
        };
        let stderr = stderr_task.await.unwrap_or_default();
        Ok(Exec::Finished {
            code: status.code().unwrap_or(-1),
            stdout: captured,
            stderr,
        })
    }

    /// Runs a short command to completion; non-zero exits become engine errors.
    async fn run(&self, repo: &Repository, args: &[String]) -> Result<String> {
        self.run_with(repo, args, &[]).await
    }

    async fn run_with(
        &self,
        repo: &Repository,
        args: &[String],
        extra_env: &[(String, String)],
    ) -> Result<String> {
        let target = self.target(repo)?;
        let never = CancellationToken::new();
        match self.exec(&target, args, extra_env, &never, |_| true).await? {
            Exec::Finished { code: 0, stdout, .. } => Ok(stdout),
            Exec::Finished { code, stderr, .. } => Err(EngineError::from_exit(code, &stderr).into()),
            Exec::Cancelled => Err(EngineError::Interrupted(String::new()).into()),
        }
    }

    pub async fn init(&self, repo: &Repository) -> Result<()> {
        self.run(repo, &args(&["init"])).await.map(|_| ())
    }

    /// Cheap readability probe: decrypting the config proves location,
    /// credentials and password.
    pub async fn probe(&self, repo: &Repository) -> Result<()> {
        match tokio::time::timeout(PROBE_TIMEOUT, self.run(repo, &args(&["cat", "config"]))).await {
            Ok(result) => result.map(|_| ()),
            Err(_) => Err(CronvaultError::Timeout {
                operation: format!("restic probe of {}", repo.name),
                seconds: PROBE_TIMEOUT.as_secs(),
            }),
        }
    }

    pub async fn snapshots(&self, repo: &Repository, tag: Option<&str>) -> Result<Vec<Snapshot>> {
        let mut argv = args(&["snapshots", "--json"]);
        if let Some(tag) = tag {
            argv.push("--tag".to_string());
            argv.push(tag.to_string());
        }
        let stdout = self.run(repo, &argv).await?;
        let trimmed = stdout.trim();
        if trimmed.is_empty() || trimmed == "null" {
            return Ok(Vec::new());
        }
        serde_json::from_str(trimmed)
            .map_err(|e| EngineError::Output(format!("snapshots: {}", e)).into())
    }

    pub async fn forget(&self, repo: &Repository, tag: &str, policy: &RetentionPolicy) -> Result<()> {
        let mut argv = args(&["forget", "--tag", tag]);
        argv.extend(retention_args(policy));
        argv.push("--prune".to_string());
        self.run(repo, &argv).await.map(|_| ())
    }

    pub async fn delete_snapshot(&self, repo: &Repository, snapshot_id: &str) -> Result<()> {
        self.run(repo, &args(&["forget", snapshot_id, "--prune"]))
            .await
            .map(|_| ())
    }

    pub async fn check(&self, repo: &Repository, read_data: bool) -> Result<String> {
        let mut argv = args(&["check"]);
        if read_data {
            argv.push("--read-data".to_string());
        }
        self.run(repo, &argv).await
    }

    pub async fn unlock(&self, repo: &Repository) -> Result<()> {
        self.run(repo, &args(&["unlock"])).await.map(|_| ())
    }

    /// Copies snapshots tagged `tag` from `source` into `destination`.
    pub async fn copy(
        &self,
        source: &Repository,
        destination: &Repository,
        tag: &str,
        snapshot_id: Option<&str>,
    ) -> Result<()> {
        let from = self.target(source)?;
        let mut argv = args(&["copy", "--from-repo"]);
        argv.push(from.url.clone());
        argv.extend(from.options.iter().cloned());
        argv.push("--tag".to_string());
        argv.push(tag.to_string());
        if let Some(id) = snapshot_id {
            argv.push(id.to_string());
        }
        let extra: Vec<(String, String)> = from
            .env
            .iter()
            .filter(|(key, _)| key != "RESTIC_CACHE_DIR")
            .map(|(key, value)| match key.as_str() {
                "RESTIC_PASSWORD" => ("RESTIC_FROM_PASSWORD".to_string(), value.clone()),
                "RESTIC_PASSWORD_FILE" => ("RESTIC_FROM_PASSWORD_FILE".to_string(), value.clone()),
                _ => (key.clone(), value.clone()),
            })
            .collect();
        let result = self.run_with(destination, &argv, &extra).await;
        drop(from);
        result.map(|_| ())
    }

    pub async fn backup(
        &self,
        repo: &Repository,
        request: &BackupRequest<'_>,
        progress: Option<mpsc::UnboundedSender<BackupProgress>>,
        cancel: &CancellationToken,
    ) -> Result<BackupRun> {
        let target = self.target(repo)?;
        let mut argv = args(&["backup", "--compression", request.compression.as_str()]);
        if request.one_file_system {
            argv.push("--one-file-system".to_string());
        }
        argv.push("--tag".to_string());
        argv.push(request.tag.to_string());
        argv.push("--json".to_string());
        if !request.exclude.is_empty() {
            let file = target
                .files
                .write("exclude", &(request.exclude.join("\n") + "\n"))?;
            argv.push("--exclude-file".to_string());
            argv.push(file.to_string_lossy().to_string());
        }
        for marker in request.exclude_if_present {
            argv.push("--exclude-if-present".to_string());
            argv.push(marker.clone());
        }
        if request.include.is_empty() {
            argv.push(request.source.to_string_lossy().to_string());
        } else {
            let listed: Vec<String> = request
                .include
                .iter()
                .map(|pattern| include_path(request.source, pattern))
                .collect();
            let file = target.files.write("files-from", &(listed.join("\n") + "\n"))?;
            argv.push("--files-from".to_string());
            argv.push(file.to_string_lossy().to_string());
        }

        let mut summary = None;
        let mut item_errors = Vec::new();
        let outcome = self
            .exec(&target, &argv, &[], cancel, |line| {
                match serde_json::from_str::<BackupMessage>(line) {
                    Ok(BackupMessage::Status(status)) => {
                        if let Some(tx) = &progress {
                            let _ = tx.send(status);
                        }
                    }
                    Ok(BackupMessage::Summary(s)) => summary = Some(s),
                    Ok(BackupMessage::Error { error, item }) => {
                        let message = error.map(|e| e.message).unwrap_or_default();
                        item_errors.push(if item.is_empty() {
                            message
                        } else {
                            format!("{}: {}", item, message)
                        });
                    }
                    Ok(BackupMessage::Other) | Err(_) => {}
                }
                false
            })
            .await?;
        Ok(match outcome {
            Exec::Finished { code, stderr, .. } => BackupRun::Finished {
                exit_code: code,
                stderr,
                summary,
                item_errors,
            },
            Exec::Cancelled => BackupRun::Cancelled,
        })
    }
}

fn args(values: &[&str]) -> Vec<String> {
    values.iter().map(|v| v.to_string()).collect()
}

fn include_path(source: &Path, pattern: &str) -> String {
    let trimmed = pattern.trim_start_matches('/');
    source.join(trimmed).to_string_lossy().to_string()
}

pub fn retention_args(policy: &RetentionPolicy) -> Vec<String> {
    let mut out = Vec::new();
    let counts = [
        ("--keep-last", policy.keep_last),
        ("--keep-hourly", policy.keep_hourly),
        ("--keep-daily", policy.keep_daily),
        ("--keep-weekly", policy.keep_weekly),
        ("--keep-monthly", policy.keep_monthly),
        ("--keep-yearly", policy.keep_yearly),
    ];
    for (flag, value) in counts {
        if let Some(n) = value {
            out.push(flag.to_string());
            out.push(n.to_string());
        }
    }
    if let Some(within) = &policy.keep_within {
        out.push("--keep-within".to_string());
        out.push(within.clone());
    }
    out
}
