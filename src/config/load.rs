use std::collections::HashSet;
use std::fs::File;
use std::io::Read;
use std::path::PathBuf;
use std::time::Duration;

use crate::config::model::{Config, ResticSettings, RuntimeConfig, SchedulerSettings, Settings};
use crate::cron::CronExpression;
use crate::error::{ConfigError, CronvaultError, Result};
use crate::util::paths::is_safe_name;

const DEFAULT_DATA_DIR: &str = "/var/lib/cronvault";
const DEFAULT_RUNTIME_DIR: &str = "/run/cronvault";
const DEFAULT_SECRETS_DIR: &str = "/run/secrets";
const DEFAULT_RESTIC_BINARY: &str = "restic";
const DEFAULT_MOUNT_TIMEOUT_SECS: u64 = 30;
const DEFAULT_TICK_MILLIS: u64 = 1000;
const DEFAULT_BACKUP_DISPATCH_CRON: &str = "* * * * *";
const DEFAULT_VOLUME_HEALTH_CRON: &str = "*/5 * * * *";
const DEFAULT_REPOSITORY_HEALTH_CRON: &str = "0 * * * *";

pub fn load_config(path: &str) -> Result<RuntimeConfig> {
    let mut contents = String::new();
    File::open(path)
        .map_err(CronvaultError::Io)?
        .read_to_string(&mut contents)
        .map_err(CronvaultError::Io)?;
    parse_config(&contents)
}

pub fn parse_config(contents: &str) -> Result<RuntimeConfig> {
    let cfg: Config =
        serde_yaml::from_str(contents).map_err(|e| ConfigError::Parse(e.to_string()))?;
    parse_runtime(cfg)
}

fn parse_runtime(cfg: Config) -> Result<RuntimeConfig> {
    let mut volume_names = HashSet::new();
    for volume in &cfg.volumes {
        check_name("volume", &volume.name)?;
        if !volume_names.insert(volume.name.as_str()) {
            return Err(ConfigError::Invalid(format!("duplicate volume name {}", volume.name)).into());
        }
    }

    let mut repository_names = HashSet::new();
    for repository in &cfg.repositories {
        check_name("repository", &repository.name)?;
        if !repository_names.insert(repository.name.as_str()) {
            return Err(ConfigError::Invalid(format!(
                "duplicate repository name {}",
                repository.name
            ))
            .into());
        }
    }

    let mut schedule_names = HashSet::new();
    for schedule in &cfg.schedules {
        check_name("schedule", &schedule.name)?;
        if !schedule_names.insert(schedule.name.as_str()) {
            return Err(ConfigError::Invalid(format!("duplicate schedule name {}", schedule.name)).into());
        }
        if !volume_names.contains(schedule.volume.as_str()) {
            return Err(ConfigError::Invalid(format!(
                "schedule {}: unknown volume {}",
                schedule.name, schedule.volume
            ))
            .into());
        }
        if !repository_names.contains(schedule.repository.as_str()) {
            return Err(ConfigError::Invalid(format!(
                "schedule {}: unknown repository {}",
                schedule.name, schedule.repository
            ))
            .into());
        }
        CronExpression::parse(&schedule.cron)
            .map_err(|e| ConfigError::Invalid(format!("schedule {}: {}", schedule.name, e)))?;
        let mut mirrors = HashSet::new();
        for mirror in &schedule.mirrors {
            if mirror == &schedule.repository {
                return Err(ConfigError::Invalid(format!(
                    "schedule {}: mirror {} is the primary repository",
                    schedule.name, mirror
                ))
                .into());
            }
            if !repository_names.contains(mirror.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "schedule {}: unknown mirror repository {}",
                    schedule.name, mirror
                ))
                .into());
            }
            if !mirrors.insert(mirror.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "schedule {}: duplicate mirror {}",
                    schedule.name, mirror
                ))
                .into());
            }
        }
        if let Some(retention) = &schedule.retention {
            if retention.is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "schedule {}: retention policy keeps nothing",
                    schedule.name
                ))
                .into());
            }
        }
    }

    let settings = build_settings(&cfg)?;
    Ok(RuntimeConfig {
        settings,
        volumes: cfg.volumes,
        repositories: cfg.repositories,
        schedules: cfg.schedules,
    })
}

fn build_settings(cfg: &Config) -> Result<Settings> {
    let data_dir = PathBuf::from(cfg.data_dir.as_deref().unwrap_or(DEFAULT_DATA_DIR));
    let runtime_dir = PathBuf::from(cfg.runtime_dir.as_deref().unwrap_or(DEFAULT_RUNTIME_DIR));
    let mount_base = cfg
        .mount_base
        .as_ref()
        .map(PathBuf::from)
        .unwrap_or_else(|| data_dir.join("volumes"));
    let secrets_dir = PathBuf::from(cfg.secrets_dir.as_deref().unwrap_or(DEFAULT_SECRETS_DIR));

    let restic = ResticSettings {
        binary: PathBuf::from(cfg.restic.binary.as_deref().unwrap_or(DEFAULT_RESTIC_BINARY)),
        password_file: cfg
            .restic
            .password_file
            .as_ref()
            .map(PathBuf::from)
            .unwrap_or_else(|| data_dir.join("restic.pass")),
        cache_dir: cfg
            .restic
            .cache_dir
            .as_ref()
            .map(PathBuf::from)
            .unwrap_or_else(|| data_dir.join("cache")),
        local_repository_base: cfg
            .restic
            .local_repository_base
            .as_ref()
            .map(PathBuf::from)
            .unwrap_or_else(|| data_dir.join("repositories")),
    };

    let scheduler = SchedulerSettings {
        tick: Duration::from_millis(cfg.scheduler.tick_millis.unwrap_or(DEFAULT_TICK_MILLIS).max(10)),
        backup_dispatch_cron: cron_option(
            "backupDispatchCron",
            cfg.scheduler.backup_dispatch_cron.as_deref(),
            DEFAULT_BACKUP_DISPATCH_CRON,
        )?,
        volume_health_cron: cron_option(
            "volumeHealthCron",
            cfg.scheduler.volume_health_cron.as_deref(),
            DEFAULT_VOLUME_HEALTH_CRON,
        )?,
        repository_health_cron: cron_option(
            "repositoryHealthCron",
            cfg.scheduler.repository_health_cron.as_deref(),
            DEFAULT_REPOSITORY_HEALTH_CRON,
        )?,
    };

    Ok(Settings {
        data_dir,
        runtime_dir,
        mount_base,
        secrets_dir,
        restic,
        mount_timeout: Duration::from_secs(
            cfg.timeouts.mount_seconds.unwrap_or(DEFAULT_MOUNT_TIMEOUT_SECS),
        ),
        scheduler,
    })
}

fn cron_option(key: &str, value: Option<&str>, default: &str) -> Result<String> {
    let expr = value.unwrap_or(default);
    CronExpression::parse(expr)
        .map_err(|e| ConfigError::Invalid(format!("scheduler.{}: {}", key, e)))?;
    Ok(expr.to_string())
}

fn check_name(kind: &str, name: &str) -> Result<()> {
    if name.trim().is_empty() {
        return Err(ConfigError::Invalid(format!("{} name is required", kind)).into());
    }
    if !is_safe_name(name) {
        return Err(ConfigError::Invalid(format!(
            "{} {} name must use only letters, digits, '.', '-', '_'",
            kind, name
        ))
        .into());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::config::RepositoryConfig;
    use crate::types::CompressionMode;
    use crate::volume::config::VolumeConfig;
    use std::io::Write;
    use tempfile::NamedTempFile;

    const SAMPLE: &str = r#"
dataDir: "/srv/cronvault"
restic:
  binary: "/usr/local/bin/restic"
volumes:
  - name: "media"
    backend: nfs
    server: "nas.local"
    exportPath: "/export/media"
  - name: "home"
    backend: directory
    path: "/home"
    autoRemount: false
repositories:
  - name: "primary"
    backend: s3
    endpoint: "https://s3.example.com"
    bucket: "backups"
    accessKeyId: "env://AWS_KEY"
    secretAccessKey: "file://aws-secret"
    compression: max
  - name: "offsite"
    backend: local
schedules:
  - name: "media-nightly"
    volume: "media"
    repository: "primary"
    cron: "0 3 * * *"
    exclude: ["*.tmp"]
    mirrors: ["offsite"]
    retention:
      keepDaily: 7
      keepWithin: "30d"
"#;

    #[test]
    fn load_config_with_entities() {
        let mut file = NamedTempFile::new().expect("tempfile");
        file.write_all(SAMPLE.as_bytes()).expect("write");
        let cfg = load_config(file.path().to_string_lossy().as_ref()).expect("load");
        assert_eq!(cfg.volumes.len(), 2);
        assert!(matches!(cfg.volumes[0].config, VolumeConfig::Nfs(_)));
        assert!(cfg.volumes[0].auto_remount);
        assert!(!cfg.volumes[1].auto_remount);
        assert!(matches!(cfg.repositories[0].config, RepositoryConfig::S3(_)));
        assert_eq!(cfg.repositories[0].compression, CompressionMode::Max);
        assert_eq!(cfg.schedules[0].mirrors, vec!["offsite".to_string()]);
        assert_eq!(cfg.settings.mount_base, PathBuf::from("/srv/cronvault/volumes"));
        assert_eq!(cfg.settings.state_path(), PathBuf::from("/srv/cronvault/state.yaml"));
        assert_eq!(cfg.settings.mount_timeout, Duration::from_secs(30));
    }

    #[test]
    fn schedule_with_unknown_volume_is_invalid() {
        let yaml = SAMPLE.replace("volume: \"media\"", "volume: \"missing\"");
        let err = parse_config(&yaml).unwrap_err();
        assert!(err.to_string().contains("unknown volume missing"));
    }

    #[test]
    fn mirror_equal_to_primary_is_invalid() {
        let yaml = SAMPLE.replace("mirrors: [\"offsite\"]", "mirrors: [\"primary\"]");
        let err = parse_config(&yaml).unwrap_err();
        assert!(err.to_string().contains("is the primary repository"));
    }

    #[test]
    fn invalid_cron_is_reported_with_schedule_name() {
        let yaml = SAMPLE.replace("0 3 * * *", "every night");
        let err = parse_config(&yaml).unwrap_err();
        assert!(err.to_string().contains("schedule media-nightly"));
    }

    #[test]
    fn unsafe_names_are_rejected() {
        let yaml = SAMPLE.replace("name: \"home\"", "name: \"../home\"");
        assert!(parse_config(&yaml).is_err());
    }

    #[test]
    fn shipped_example_parses() {
        let cfg = parse_config(include_str!("../../cronvault.example.yaml")).expect("example");
        assert_eq!(cfg.volumes.len(), 3);
        assert_eq!(cfg.schedules[0].mirrors, vec!["offsite".to_string()]);
        assert_eq!(cfg.settings.mount_timeout, Duration::from_secs(30));
    }
}
