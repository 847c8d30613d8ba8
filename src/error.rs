use std::io;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CronvaultError {
    #[error("{0}")]
    Message(String),
    #[error("{0}")]
    Mount(MountError),
    #[error("{0}")]
    Engine(EngineError),
    #[error("{0}")]
    Config(ConfigError),
    #[error("{kind} {name} not found")]
    NotFound { kind: &'static str, name: String },
    #[error("{operation} timed out after {seconds}s")]
    Timeout { operation: String, seconds: u64 },
    #[error("{0}")]
    Io(#[from] io::Error),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("parse config: {0}")]
    Parse(String),
    #[error("{0}")]
    Invalid(String),
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum MountError {
    #[error("{0} volumes can only be mounted on Linux")]
    PlatformUnsupported(String),
    #[error("authentication failed: {0}")]
    AuthFailure(String),
    #[error("connection refused: {0}")]
    ConnectionRefused(String),
    #[error("invalid mount options: {0}")]
    InvalidOptions(String),
    #[error("mount timed out after {0}s")]
    Timeout(u64),
    #[error("{0}")]
    Command(String),
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EngineError {
    #[error("repository is locked by another process: {0}")]
    LockedRepository(String),
    #[error("wrong repository password{}", detail(.0))]
    WrongPassword(String),
    #[error("repository does not exist{}", detail(.0))]
    RepositoryNotFound(String),
    #[error("operation interrupted{}", detail(.0))]
    Interrupted(String),
    #[error("restic exited with code {code}: {stderr}")]
    Failed { code: i32, stderr: String },
    #[error("restic output: {0}")]
    Output(String),
}

impl EngineError {
    pub fn from_exit(code: i32, stderr: &str) -> Self {
        let stderr = stderr.trim();
        match code {
            10 => EngineError::RepositoryNotFound(stderr.to_string()),
            11 => EngineError::LockedRepository(stderr.to_string()),
            12 => EngineError::WrongPassword(stderr.to_string()),
            130 => EngineError::Interrupted(stderr.to_string()),
            _ => EngineError::Failed {
                code,
                stderr: stderr.to_string(),
            },
        }
    }
}

fn detail(stderr: &str) -> String {
    if stderr.is_empty() {
        String::new()
    } else {
        format!(": {}", stderr)
    }
}

pub type Result<T> = std::result::Result<T, CronvaultError>;

impl CronvaultError {
    pub fn message(msg: impl Into<String>) -> Self {
        CronvaultError::Message(msg.into())
    }

    pub fn not_found(kind: &'static str, name: impl Into<String>) -> Self {
        CronvaultError::NotFound {
            kind,
            name: name.into(),
        }
    }
}

impl From<MountError> for CronvaultError {
    fn from(err: MountError) -> Self {
        CronvaultError::Mount(err)
    }
}

impl From<EngineError> for CronvaultError {
    fn from(err: EngineError) -> Self {
        CronvaultError::Engine(err)
    }
}

impl From<ConfigError> for CronvaultError {
    fn from(err: ConfigError) -> Self {
        CronvaultError::Config(err)
    }
}
