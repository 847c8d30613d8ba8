use std::fs;

use super::config::DirectoryConfig;
use super::BackendOutcome;

/// Directory volumes are local paths: "mounted" means readable.
pub fn check_health(cfg: &DirectoryConfig) -> BackendOutcome {
    if !cfg.path.is_dir() {
        return BackendOutcome::error(format!("directory {} does not exist", cfg.path.display()));
    }
    match fs::read_dir(&cfg.path) {
        Ok(_) => BackendOutcome::mounted(),
        Err(e) => BackendOutcome::error(format!("directory {}: {}", cfg.path.display(), e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::VolumeStatus;
    use tempfile::TempDir;

    #[test]
    fn existing_directory_is_mounted() {
        let dir = TempDir::new().expect("tempdir");
        let cfg = DirectoryConfig {
            path: dir.path().to_path_buf(),
            read_only: false,
        };
        assert_eq!(check_health(&cfg).status, VolumeStatus::Mounted);

        let missing = DirectoryConfig {
            path: dir.path().join("missing"),
            read_only: false,
        };
        assert_eq!(check_health(&missing).status, VolumeStatus::Error);
    }
}
