use std::path::{Path, PathBuf};

use crate::error::Result;
use crate::util::paths::{ensure_private_dir, write_private_file};

/// Per-volume directory holding transient credential files. The directory is
/// removed on drop unless `keep` was called after a successful mount.
pub struct CredentialDir {
    path: PathBuf,
    armed: bool,
}

impl CredentialDir {
    pub fn create(path: PathBuf) -> Result<Self> {
        ensure_private_dir(&path)?;
        Ok(Self { path, armed: true })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn write(&self, name: &str, contents: &str) -> Result<PathBuf> {
        write_private_file(&self.path.join(name), contents)
    }

    pub fn keep(mut self) {
        self.armed = false;
    }
}

impl Drop for CredentialDir {
    fn drop(&mut self) {
        if self.armed {
            remove_credentials(&self.path);
        }
    }
}

pub fn remove_credentials(path: &Path) {
    let _ = std::fs::remove_dir_all(path);
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn removed_on_drop_unless_kept() {
        let base = TempDir::new().expect("tempdir");
        let dropped = base.path().join("a");
        {
            let dir = CredentialDir::create(dropped.clone()).expect("create");
            dir.write("key", "x").expect("write");
        }
        assert!(!dropped.exists());

        let kept = base.path().join("b");
        let dir = CredentialDir::create(kept.clone()).expect("create");
        dir.write("key", "x").expect("write");
        dir.keep();
        assert!(kept.join("key").exists());
    }
}
