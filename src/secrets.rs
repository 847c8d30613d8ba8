use std::fs;
use std::path::PathBuf;

use crate::error::{CronvaultError, Result};
use crate::util::paths::is_safe_name;

/// Turns a stored credential reference into its plaintext value.
pub trait SecretResolver: Send + Sync {
    fn resolve(&self, reference: &str) -> Result<String>;

    fn resolve_optional(&self, reference: Option<&str>) -> Result<Option<String>> {
        reference.map(|r| self.resolve(r)).transpose()
    }
}

/// Resolves `env://NAME` from the process environment, `file://name` from
/// the secrets directory and returns anything else verbatim.
#[derive(Debug, Clone)]
pub struct DefaultSecretResolver {
    secrets_dir: PathBuf,
}

impl DefaultSecretResolver {
    pub fn new(secrets_dir: PathBuf) -> Self {
        Self { secrets_dir }
    }
}

impl SecretResolver for DefaultSecretResolver {
    fn resolve(&self, reference: &str) -> Result<String> {
        if let Some(name) = reference.strip_prefix("env://") {
            return std::env::var(name).map_err(|_| {
                CronvaultError::message(format!("secret env://{} is not set", name))
            });
        }
        if let Some(name) = reference.strip_prefix("file://") {
            if !is_safe_name(name) {
                return Err(CronvaultError::message(format!(
                    "secret file name {:?} must use only letters, digits, '.', '-', '_'",
                    name
                )));
            }
            let path = self.secrets_dir.join(name);
            let value = fs::read_to_string(&path).map_err(|e| {
                CronvaultError::message(format!("read secret {}: {}", path.display(), e))
            })?;
            return Ok(value.trim_end_matches(['\r', '\n']).to_string());
        }
        Ok(reference.to_string())
    }
}
