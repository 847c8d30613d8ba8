use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Backend-specific repository settings. Secret fields hold resolver
/// references.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "backend", rename_all = "lowercase")]
pub enum RepositoryConfig {
    Local(LocalRepositoryConfig),
    S3(S3RepositoryConfig),
    R2(R2RepositoryConfig),
    Gcs(GcsRepositoryConfig),
    Azure(AzureRepositoryConfig),
    Rest(RestRepositoryConfig),
    Sftp(SftpRepositoryConfig),
    Rclone(RcloneRepositoryConfig),
}

impl RepositoryConfig {
    pub fn kind(&self) -> &'static str {
        match self {
            RepositoryConfig::Local(_) => "local",
            RepositoryConfig::S3(_) => "s3",
            RepositoryConfig::R2(_) => "r2",
            RepositoryConfig::Gcs(_) => "gcs",
            RepositoryConfig::Azure(_) => "azure",
            RepositoryConfig::Rest(_) => "rest",
            RepositoryConfig::Sftp(_) => "sftp",
            RepositoryConfig::Rclone(_) => "rclone",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct LocalRepositoryConfig {
    #[serde(default)]
    pub path: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct S3RepositoryConfig {
    pub endpoint: String,
    pub bucket: String,
    pub access_key_id: String,
    pub secret_access_key: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct R2RepositoryConfig {
    pub account_id: String,
    pub bucket: String,
    pub access_key_id: String,
    pub secret_access_key: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GcsRepositoryConfig {
    pub bucket: String,
    pub project_id: String,
    pub credentials_json: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AzureRepositoryConfig {
    pub container: String,
    pub account_name: String,
    pub account_key: String,
    #[serde(default)]
    pub endpoint_suffix: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RestRepositoryConfig {
    pub url: String,
    #[serde(default)]
    pub path: Option<String>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SftpRepositoryConfig {
    pub host: String,
    #[serde(default = "default_ssh_port")]
    pub port: u16,
    pub username: String,
    pub path: String,
    #[serde(default)]
    pub private_key: Option<String>,
    #[serde(default)]
    pub known_hosts: Option<String>,
    #[serde(default)]
    pub skip_host_key_check: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RcloneRepositoryConfig {
    pub remote: String,
    #[serde(default)]
    pub path: String,
}

fn default_ssh_port() -> u16 {
    22
}
