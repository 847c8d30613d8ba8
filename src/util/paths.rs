use std::fs::{self, OpenOptions};
use std::io::Write;
use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::error::{CronvaultError, Result};

pub fn is_safe_name(name: &str) -> bool {
    if name.is_empty() || name == "." || name == ".." {
        return false;
    }
    name.chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.')
}

/// Creates `path` (and parents) and restricts it to the owner.
pub fn ensure_private_dir(path: &Path) -> Result<()> {
    fs::create_dir_all(path)
        .map_err(|e| CronvaultError::message(format!("create {}: {}", path.display(), e)))?;
    let meta = fs::metadata(path)
        .map_err(|e| CronvaultError::message(format!("stat {}: {}", path.display(), e)))?;
    if !meta.is_dir() {
        return Err(CronvaultError::message(format!(
            "{} is not a directory",
            path.display()
        )));
    }
    let mut perms = meta.permissions();
    perms.set_mode(0o700);
    fs::set_permissions(path, perms)
        .map_err(|e| CronvaultError::message(format!("chmod {}: {}", path.display(), e)))?;
    Ok(())
}

/// Writes `contents` to `path` with mode 0600, replacing any previous file.
pub fn write_private_file(path: &Path, contents: &str) -> Result<PathBuf> {
    if path.exists() {
        fs::remove_file(path)
            .map_err(|e| CronvaultError::message(format!("remove {}: {}", path.display(), e)))?;
    }
    let mut file = OpenOptions::new()
        .write(true)
        .create_new(true)
        .mode(0o600)
        .open(path)
        .map_err(|e| CronvaultError::message(format!("create {}: {}", path.display(), e)))?;
    file.write_all(contents.as_bytes())
        .map_err(|e| CronvaultError::message(format!("write {}: {}", path.display(), e)))?;
    Ok(path.to_path_buf())
}

/// Removes credential material older than `max_age` left behind under
/// `base` by an unclean shutdown. Directories in `keep` are left alone.
pub fn sweep_stale_files(base: &Path, max_age: Duration, keep: &[PathBuf]) -> usize {
    if !base.exists() {
        return 0;
    }
    let cutoff = SystemTime::now()
        .checked_sub(max_age)
        .unwrap_or(SystemTime::UNIX_EPOCH);
    let mut removed = 0;
    let walker = WalkDir::new(base)
        .min_depth(1)
        .contents_first(true)
        .into_iter();
    for entry in walker {
        let entry = match entry {
            Ok(entry) => entry,
            Err(err) => {
                warn!(error = %err, "skip unreadable entry during credential sweep");
                continue;
            }
        };
        let path = entry.path();
        if keep.iter().any(|k| path.starts_with(k)) {
            continue;
        }
        if entry.file_type().is_dir() {
            if fs::remove_dir(path).is_ok() {
                debug!(path = %path.display(), "removed empty credential directory");
            }
            continue;
        }
        let modified = entry
            .metadata()
            .ok()
            .and_then(|meta| meta.modified().ok())
            .unwrap_or(SystemTime::UNIX_EPOCH);
        if modified <= cutoff && fs::remove_file(path).is_ok() {
            debug!(path = %path.display(), "removed stale credential file");
            removed += 1;
        }
    }
    removed
}
