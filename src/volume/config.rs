use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Backend-specific volume settings. Credential fields hold secret
/// references (plain, `env://NAME` or `file://name`), never resolved values.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "backend", rename_all = "lowercase")]
pub enum VolumeConfig {
    Directory(DirectoryConfig),
    Nfs(NfsConfig),
    Smb(SmbConfig),
    Webdav(WebdavConfig),
    Rclone(RcloneConfig),
    Sftp(SftpConfig),
}

impl VolumeConfig {
    pub fn kind(&self) -> &'static str {
        match self {
            VolumeConfig::Directory(_) => "directory",
            VolumeConfig::Nfs(_) => "nfs",
            VolumeConfig::Smb(_) => "smb",
            VolumeConfig::Webdav(_) => "webdav",
            VolumeConfig::Rclone(_) => "rclone",
            VolumeConfig::Sftp(_) => "sftp",
        }
    }

    pub fn read_only(&self) -> bool {
        match self {
            VolumeConfig::Directory(c) => c.read_only,
            VolumeConfig::Nfs(c) => c.read_only,
            VolumeConfig::Smb(c) => c.read_only,
            VolumeConfig::Webdav(c) => c.read_only,
            VolumeConfig::Rclone(c) => c.read_only,
            VolumeConfig::Sftp(c) => c.read_only,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DirectoryConfig {
    pub path: PathBuf,
    #[serde(default)]
    pub read_only: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NfsConfig {
    pub server: String,
    pub export_path: String,
    #[serde(default = "default_nfs_port")]
    pub port: u16,
    #[serde(default = "default_nfs_version")]
    pub version: String,
    #[serde(default)]
    pub read_only: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SmbConfig {
    pub server: String,
    pub share: String,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub domain: Option<String>,
    #[serde(default = "default_smb_version")]
    pub version: String,
    #[serde(default = "default_smb_port")]
    pub port: u16,
    #[serde(default)]
    pub uid: Option<u32>,
    #[serde(default)]
    pub gid: Option<u32>,
    #[serde(default)]
    pub read_only: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebdavConfig {
    pub server: String,
    #[serde(default = "default_root")]
    pub path: String,
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub ssl: bool,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub uid: Option<u32>,
    #[serde(default)]
    pub gid: Option<u32>,
    #[serde(default)]
    pub read_only: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RcloneConfig {
    pub remote: String,
    #[serde(default)]
    pub path: String,
    #[serde(default)]
    pub config_path: Option<PathBuf>,
    #[serde(default)]
    pub read_only: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SftpConfig {
    pub host: String,
    #[serde(default = "default_ssh_port")]
    pub port: u16,
    pub username: String,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub private_key: Option<String>,
    #[serde(default = "default_root")]
    pub path: String,
    #[serde(default)]
    pub known_hosts: Option<String>,
    #[serde(default)]
    pub skip_host_key_check: bool,
    #[serde(default)]
    pub read_only: bool,
}

fn default_nfs_port() -> u16 {
    2049
}

fn default_nfs_version() -> String {
    "4.1".to_string()
}

fn default_smb_version() -> String {
    "3.0".to_string()
}

fn default_smb_port() -> u16 {
    445
}

fn default_ssh_port() -> u16 {
    22
}

fn default_root() -> String {
    "/".to_string()
}
