use crate::db::models::Repository;
use crate::error::Result;
use crate::repository::config::RepositoryConfig;
use crate::secrets::SecretResolver;

/// Backends whose credentials travel in the same environment variables.
/// Two repositories in one group can only take part in a single restic
/// invocation when their credentials are identical.
pub fn conflict_group(config: &RepositoryConfig) -> Option<&'static str> {
    match config {
        RepositoryConfig::S3(_) | RepositoryConfig::R2(_) => Some("s3"),
        RepositoryConfig::Gcs(_) => Some("gcs"),
        RepositoryConfig::Azure(_) => Some("azure"),
        RepositoryConfig::Rest(_) => Some("rest"),
        RepositoryConfig::Sftp(_) => Some("sftp"),
        RepositoryConfig::Local(_) | RepositoryConfig::Rclone(_) => None,
    }
}

fn credentials(config: &RepositoryConfig, secrets: &dyn SecretResolver) -> Result<Vec<Option<String>>> {
    Ok(match config {
        RepositoryConfig::S3(cfg) => vec![
            Some(secrets.resolve(&cfg.access_key_id)?),
            Some(secrets.resolve(&cfg.secret_access_key)?),
        ],
        RepositoryConfig::R2(cfg) => vec![
            Some(secrets.resolve(&cfg.access_key_id)?),
            Some(secrets.resolve(&cfg.secret_access_key)?),
        ],
        RepositoryConfig::Gcs(cfg) => vec![
            Some(cfg.project_id.clone()),
            Some(secrets.resolve(&cfg.credentials_json)?),
        ],
        RepositoryConfig::Azure(cfg) => vec![
            Some(cfg.account_name.clone()),
            Some(secrets.resolve(&cfg.account_key)?),
            cfg.endpoint_suffix.clone(),
        ],
        RepositoryConfig::Rest(cfg) => vec![
            secrets.resolve_optional(cfg.username.as_deref())?,
            secrets.resolve_optional(cfg.password.as_deref())?,
        ],
        RepositoryConfig::Sftp(cfg) => vec![
            Some(format!("{}@{}:{}", cfg.username, cfg.host, cfg.port)),
            secrets.resolve_optional(cfg.private_key.as_deref())?,
            cfg.known_hosts.clone(),
            Some(cfg.skip_host_key_check.to_string()),
        ],
        RepositoryConfig::Local(_) | RepositoryConfig::Rclone(_) => Vec::new(),
    })
}

/// Returns why `mirror` cannot receive copies from `primary`, if it cannot.
/// Credentials are resolved on every call so rotated secrets are honoured.
pub fn mirror_incompatibility(
    primary: &Repository,
    mirror: &Repository,
    secrets: &dyn SecretResolver,
) -> Result<Option<String>> {
    let group = match (conflict_group(&primary.config), conflict_group(&mirror.config)) {
        (Some(a), Some(b)) if a == b => a,
        _ => return Ok(None),
    };
    if credentials(&primary.config, secrets)? == credentials(&mirror.config, secrets)? {
        return Ok(None);
    }
    Ok(Some(format!(
        "{} and {} are both {} repositories with different credentials",
        primary.name, mirror.name, group
    )))
}
