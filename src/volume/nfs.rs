use std::path::Path;

use super::config::NfsConfig;
use crate::mount::ops::mount_command as os_mount;
use crate::util::command::CommandSpec;

pub fn fs_type_matches(fs_type: &str) -> bool {
    fs_type.starts_with("nfs")
}

pub fn mount_command(cfg: &NfsConfig, path: &Path) -> CommandSpec {
    let mut options = vec![format!("port={}", cfg.port), format!("vers={}", cfg.version)];
    if cfg.read_only {
        options.push("ro".to_string());
    }
    let source = format!("{}:{}", cfg.server, cfg.export_path);
    os_mount("nfs", &source, path, &options)
}
