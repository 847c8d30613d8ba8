use std::path::Path;

use crate::error::MountError;
use crate::util::command::{CommandOutput, CommandSpec};

pub fn mount_command(fs_type: &str, source: &str, mountpoint: &Path, options: &[String]) -> CommandSpec {
    let mut cmd = CommandSpec::new("mount").arg("-t").arg(fs_type);
    if !options.is_empty() {
        cmd = cmd.arg("-o").arg(options.join(","));
    }
    cmd.arg(source).arg(mountpoint.to_string_lossy())
}

/// Lazy unmount so a busy filesystem detaches instead of failing.
pub fn umount_command(mountpoint: &Path) -> CommandSpec {
    CommandSpec::new("umount")
        .arg("-l")
        .arg(mountpoint.to_string_lossy())
}

/// Maps a failed mount helper's output onto the message shown to users.
pub fn classify_failure(output: &CommandOutput) -> MountError {
    let stderr = output.stderr.trim();
    let detail = stderr
        .lines()
        .rev()
        .find(|line| !line.trim().is_empty())
        .unwrap_or("")
        .trim()
        .to_string();
    let lower = stderr.to_ascii_lowercase();
    if lower.contains("connection refused")
        || lower.contains("no route to host")
        || lower.contains("network is unreachable")
        || lower.contains("could not resolve")
        || lower.contains("name or service not known")
        || lower.contains("connection timed out")
    {
        return MountError::ConnectionRefused(detail);
    }
    if lower.contains("permission denied")
        || lower.contains("access denied")
        || lower.contains("authentication")
        || lower.contains("logon failure")
        || lower.contains("nt_status_logon_failure")
        || lower.contains("401 unauthorized")
    {
        return MountError::AuthFailure(detail);
    }
    if lower.contains("bad option")
        || lower.contains("invalid argument")
        || lower.contains("unknown option")
        || lower.contains("wrong fs type")
        || lower.contains("bad usage")
    {
        return MountError::InvalidOptions(detail);
    }
    if detail.is_empty() {
        MountError::Command(format!("mount helper exited with code {}", output.code))
    } else {
        MountError::Command(detail)
    }
}
