use std::path::PathBuf;
use std::sync::Arc;

use chrono::Utc;
use tracing::{info, warn};

use super::config::VolumeConfig;
use super::{BackendOutcome, MountEnvironment, VolumeBackend};
use crate::db::models::Volume;
use crate::db::Database;
use crate::error::{CronvaultError, MountError, Result};
use crate::events::{Event, EventBus};
use crate::types::VolumeStatus;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct HealthSweepReport {
    pub healthy: usize,
    pub remounted: usize,
    pub failed: usize,
}

/// Volume lifecycle on top of the backends: every outcome is persisted on
/// the row and announced on the event bus.
#[derive(Clone)]
pub struct VolumeService {
    db: Arc<Database>,
    events: EventBus,
    env: MountEnvironment,
}

impl VolumeService {
    pub fn new(db: Arc<Database>, events: EventBus, env: MountEnvironment) -> Self {
        Self { db, events, env }
    }

    fn load(&self, id: &str) -> Result<Volume> {
        self.db
            .volume(id)
            .ok_or_else(|| CronvaultError::not_found("volume", id))
    }

    pub fn backend(&self, volume: &Volume) -> VolumeBackend {
        VolumeBackend::new(&volume.name, &volume.short_id, &volume.config, &self.env)
    }

    pub fn path(&self, volume: &Volume) -> PathBuf {
        self.backend(volume).path().to_path_buf()
    }

    fn record(&self, volume: &Volume, outcome: &BackendOutcome) -> Result<()> {
        let previous = volume.status;
        self.db.update_volume(&volume.id, |row| {
            row.status = outcome.status;
            row.last_error = outcome.error.clone();
            row.last_health_check = Some(Utc::now());
        })?;
        if previous != outcome.status || outcome.status == VolumeStatus::Error {
            self.events.emit(Event::VolumeStatusChanged {
                volume_id: volume.id.clone(),
                name: volume.name.clone(),
                status: outcome.status,
                error: outcome.error.clone(),
            });
        }
        Ok(())
    }

    pub async fn mount_volume(&self, id: &str) -> Result<BackendOutcome> {
        let volume = self.load(id)?;
        let outcome = self.backend(&volume).mount().await;
        self.record(&volume, &outcome)?;
        if outcome.status == VolumeStatus::Mounted {
            self.events.emit(Event::VolumeMounted {
                volume_id: volume.id.clone(),
                name: volume.name.clone(),
            });
        }
        Ok(outcome)
    }

    pub async fn unmount_volume(&self, id: &str) -> Result<BackendOutcome> {
        let volume = self.load(id)?;
        let outcome = self.backend(&volume).unmount().await;
        self.record(&volume, &outcome)?;
        if outcome.status == VolumeStatus::Unmounted {
            self.events.emit(Event::VolumeUnmounted {
                volume_id: volume.id.clone(),
                name: volume.name.clone(),
            });
        }
        Ok(outcome)
    }

    pub async fn check_health(&self, id: &str) -> Result<BackendOutcome> {
        let volume = self.load(id)?;
        let outcome = self.backend(&volume).check_health();
        self.record(&volume, &outcome)?;
        Ok(outcome)
    }

    /// Mounts the volume when needed and returns the path to back up.
    pub async fn ensure_mounted(&self, id: &str) -> Result<PathBuf> {
        let volume = self.load(id)?;
        let backend = self.backend(&volume);
        if backend.check_health().status == VolumeStatus::Mounted {
            return Ok(backend.path().to_path_buf());
        }
        let outcome = self.mount_volume(id).await?;
        match outcome.status {
            VolumeStatus::Mounted => Ok(backend.path().to_path_buf()),
            _ => Err(MountError::Command(format!(
                "volume {} is not mounted: {}",
                volume.name,
                outcome.error.unwrap_or_else(|| "unknown error".to_string())
            ))
            .into()),
        }
    }

    /// Checks every volume and remounts the ones that dropped out and
    /// opted into auto-remount. One failure never stops the sweep.
    pub async fn health_sweep(&self) -> HealthSweepReport {
        let mut report = HealthSweepReport::default();
        for volume in self.db.volumes() {
            let outcome = match self.check_health(&volume.id).await {
                Ok(outcome) => outcome,
                Err(err) => {
                    warn!(volume = %volume.name, error = %err, "health check failed");
                    report.failed += 1;
                    continue;
                }
            };
            if outcome.status == VolumeStatus::Mounted {
                report.healthy += 1;
                continue;
            }
            if !volume.auto_remount {
                report.failed += 1;
                continue;
            }
            info!(volume = %volume.name, status = %outcome.status, "remounting volume");
            match self.mount_volume(&volume.id).await {
                Ok(outcome) if outcome.status == VolumeStatus::Mounted => report.remounted += 1,
                Ok(_) => report.failed += 1,
                Err(err) => {
                    warn!(volume = %volume.name, error = %err, "remount failed");
                    report.failed += 1;
                }
            }
        }
        report
    }

    /// Applies a new backend configuration: the old mount is released first,
    /// then the volume is mounted with the new settings.
    pub async fn update_volume_config(
        &self,
        id: &str,
        config: VolumeConfig,
        auto_remount: bool,
    ) -> Result<BackendOutcome> {
        let volume = self.load(id)?;
        let released = self.unmount_volume(id).await?;
        if released.status == VolumeStatus::Error {
            return Err(CronvaultError::message(format!(
                "cannot reconfigure volume {}: {}",
                volume.name,
                released.error.unwrap_or_default()
            )));
        }
        self.db.update_volume(id, |row| {
            row.config = config;
            row.auto_remount = auto_remount;
        })?;
        info!(volume = %volume.name, "volume configuration updated");
        self.mount_volume(id).await
    }

    /// Removes the volume row, but only once it is no longer mounted.
    pub async fn delete_volume(&self, id: &str) -> Result<()> {
        let volume = self.load(id)?;
        let outcome = self.unmount_volume(id).await?;
        if outcome.status != VolumeStatus::Unmounted {
            return Err(CronvaultError::message(format!(
                "cannot delete volume {}: {}",
                volume.name,
                outcome.error.unwrap_or_else(|| "unmount failed".to_string())
            )));
        }
        if !matches!(volume.config, VolumeConfig::Directory(_)) {
            let path = self.path(&volume);
            let _ = std::fs::remove_dir(&path);
            if let Some(parent) = path.parent() {
                let _ = std::fs::remove_dir(parent);
            }
        }
        self.db.remove_volume(id)?;
        info!(volume = %volume.name, "volume deleted");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::models::Volume;
    use crate::volume::config::NfsConfig;
    use crate::volume::testing::Host;
    use futures::StreamExt;

    fn nfs_volume(id: &str, auto_remount: bool) -> Volume {
        Volume {
            id: id.to_string(),
            short_id: format!("{}0000", id),
            name: id.to_string(),
            config: VolumeConfig::Nfs(NfsConfig {
                server: "nas".to_string(),
                export_path: format!("/export/{}", id),
                port: 2049,
                version: "4.1".to_string(),
                read_only: true,
            }),
            auto_remount,
            status: VolumeStatus::Mounted,
            last_error: None,
            last_health_check: None,
        }
    }

    fn setup(host: &Host, volumes: Vec<Volume>) -> (VolumeService, Arc<Database>, EventBus) {
        let db = Arc::new(Database::open(&host.dir.path().join("state.yaml")).expect("open"));
        db.mutate(|state| {
            state.volumes = volumes;
            Ok(())
        })
        .expect("seed");
        let events = EventBus::new();
        (
            VolumeService::new(db.clone(), events.clone(), host.env.clone()),
            db,
            events,
        )
    }

    #[tokio::test]
    async fn sweep_remounts_only_auto_remount_volumes() {
        let host = Host::new();
        let (service, db, events) =
            setup(&host, vec![nfs_volume("auto", true), nfs_volume("manual", false)]);
        let mut stream = events.subscribe();

        let report = service.health_sweep().await;
        assert_eq!(report, HealthSweepReport { healthy: 0, remounted: 1, failed: 1 });
        assert_eq!(host.runner.programs(), vec!["mount".to_string()]);
        assert_eq!(db.volume("auto").unwrap().status, VolumeStatus::Mounted);
        let manual = db.volume("manual").unwrap();
        assert_eq!(manual.status, VolumeStatus::Unmounted);
        assert!(manual.last_health_check.is_some());

        let first = stream.next().await.expect("event");
        assert_eq!(first.name(), "volume:status_changed");
    }

    #[tokio::test]
    async fn failed_mount_is_persisted() {
        let host = Host::new();
        let (service, db, _) = setup(&host, vec![nfs_volume("media", true)]);
        host.runner.reply(32, "mount.nfs: Connection refused");

        let outcome = service.mount_volume("media").await.expect("mount");
        assert_eq!(outcome.status, VolumeStatus::Error);
        let row = db.volume("media").unwrap();
        assert_eq!(row.status, VolumeStatus::Error);
        assert!(row.last_error.unwrap().starts_with("connection refused"));
        assert!(service.ensure_mounted("media").await.is_ok());
    }

    #[tokio::test]
    async fn delete_requires_a_successful_unmount() {
        let host = Host::new();
        let (service, db, _) = setup(&host, vec![nfs_volume("media", true)]);
        let path = service.path(&db.volume("media").unwrap());
        host.set_mounted(&path, "nfs4");
        host.runner.reply(32, "umount: target is busy");

        assert!(service.delete_volume("media").await.is_err());
        assert!(db.volume("media").is_some());

        service.delete_volume("media").await.expect("delete");
        assert!(db.volume("media").is_none());
    }

    #[tokio::test]
    async fn config_update_remounts_with_new_settings() {
        let host = Host::new();
        let (service, db, _) = setup(&host, vec![nfs_volume("media", true)]);

        let mut config = nfs_volume("media", true).config;
        if let VolumeConfig::Nfs(cfg) = &mut config {
            cfg.server = "nas2".to_string();
        }
        let outcome = service
            .update_volume_config("media", config.clone(), false)
            .await
            .expect("update");
        assert_eq!(outcome.status, VolumeStatus::Mounted);
        assert_eq!(host.runner.programs(), vec!["mount".to_string()]);
        let (spec, _) = host.runner.call(0);
        assert!(spec.display().contains("nas2:/export/media"));
        let row = db.volume("media").unwrap();
        assert_eq!(row.config, config);
        assert!(!row.auto_remount);
    }
}
