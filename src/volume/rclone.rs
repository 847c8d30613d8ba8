use std::path::Path;

use super::config::RcloneConfig;
use crate::util::command::CommandSpec;

pub fn fs_type_matches(fs_type: &str) -> bool {
    fs_type == "fuse.rclone"
}

pub fn mount_command(cfg: &RcloneConfig, path: &Path) -> CommandSpec {
    let mut cmd = CommandSpec::new("rclone")
        .arg("mount")
        .arg(format!("{}:{}", cfg.remote, cfg.path))
        .arg(path.to_string_lossy())
        .arg("--daemon")
        .arg("--vfs-cache-mode")
        .arg("writes")
        .arg("--dir-cache-time")
        .arg("1m");
    if cfg.read_only {
        cmd = cmd.arg("--read-only");
    }
    if let Some(config_path) = &cfg.config_path {
        cmd = cmd.env("RCLONE_CONFIG", config_path.to_string_lossy());
    }
    cmd
}
