use crate::clients::cloudstack::{retry_transient, CloudAdapter};
use crate::config::TimeoutConfig;
use crate::db::queries::{disk as disk_queries, export as export_queries, volume as volume_queries};
use crate::db::queries::cloud_config;
use crate::jobtracker::JobTracker;
use crate::models::cloud_config::OsseaConfig;
use crate::models::export::NbdExport;
use crate::models::volume::{OperationMode, OsseaVolume};
use crate::volume_daemon::device::DeviceWatcher;
use crate::volume_daemon::error::VolumeDaemonError;
use crate::volume_daemon::exports::NbdExportManager;
use crate::volume_daemon::stable_names;
use log::{error, info};
use parking_lot::Mutex;
use serde::Serialize;
use sqlx::{MySql, Pool};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

const GIB: u64 = 1 << 30;

/// The volume daemon's business logic. One instance per process; operations
/// against one volume are serialized by a per-volume lock, distinct volumes
/// proceed in parallel.
pub struct VolumeService {
    pool: Pool<MySql>,
    cloud: Arc<dyn CloudAdapter>,
    watcher: DeviceWatcher,
    exports: NbdExportManager,
    symlink_dir: String,
    timeouts: TimeoutConfig,
    tracker: JobTracker,
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    privilege_error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub status: &'static str,
    pub privileged: bool,
    pub privilege_error: Option<String>,
    pub active_config_present: bool,
}

impl VolumeService {
    pub fn new(
        pool: Pool<MySql>,
        cloud: Arc<dyn CloudAdapter>,
        watcher: DeviceWatcher,
        exports: NbdExportManager,
        symlink_dir: String,
        timeouts: TimeoutConfig,
    ) -> Self {
        let privilege_error = Self::privilege_check(&symlink_dir).err();
        if let Some(e) = &privilege_error {
            // Serving attaches without symlink privilege would silently
            // disable stable naming and break every export downstream, so
            // the daemon degrades to refusing them instead.
            error!("Privilege check failed: {}; attach and export operations disabled", e);
        }

        let tracker = JobTracker::new(pool.clone(), "volume-daemon");

        Self {
            pool,
            cloud,
            watcher,
            exports,
            symlink_dir,
            timeouts,
            tracker,
            locks: Mutex::new(HashMap::new()),
            privilege_error,
        }
    }

    /// Probes the actual capability instead of inspecting uids: can we
    /// create and remove a symlink where stable names live?
    pub fn privilege_check(symlink_dir: &str) -> Result<(), String> {
        let probe = std::path::Path::new(symlink_dir).join(".volume-daemon-probe");
        let _ = std::fs::remove_file(&probe);
        std::os::unix::fs::symlink("/dev/null", &probe)
            .map_err(|e| format!("cannot create symlinks in {}: {}", symlink_dir, e))?;
        std::fs::remove_file(&probe)
            .map_err(|e| format!("cannot remove symlinks in {}: {}", symlink_dir, e))?;
        Ok(())
    }

    pub async fn health(&self) -> HealthReport {
        let active_config_present = cloud_config::get_active(&self.pool)
            .await
            .map(|c| c.is_some())
            .unwrap_or(false);

        HealthReport {
            status: if self.privilege_error.is_none() { "ok" } else { "degraded" },
            privileged: self.privilege_error.is_none(),
            privilege_error: self.privilege_error.clone(),
            active_config_present,
        }
    }

    pub fn ensure_dummy_export(&self) -> Result<(), VolumeDaemonError> {
        self.exports.ensure_dummy_export()
    }

    fn ensure_privileged(&self) -> Result<(), VolumeDaemonError> {
        match &self.privilege_error {
            None => Ok(()),
            Some(e) => Err(VolumeDaemonError::InsufficientPrivilege(e.clone())),
        }
    }

    fn lock_for(&self, volume_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.locks.lock();
        locks
            .entry(volume_id.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    /// The active cloud configuration, read fresh for every operation. The
    /// orchestrator's own VM id lives here; caching it across operations
    /// would misclassify attaches after a config change.
    async fn active_config(&self) -> Result<OsseaConfig, VolumeDaemonError> {
        cloud_config::get_active(&self.pool)
            .await?
            .ok_or(VolumeDaemonError::NoActiveConfig)
    }

    /// Correlation failures park the context until an operator acknowledges
    /// them; further volume operations on it are refused.
    async fn ensure_context_unblocked(&self, volume_id: &str) -> Result<Option<String>, VolumeDaemonError> {
        let context_id = volume_queries::context_for_volume(&self.pool, volume_id).await?;
        if let Some(context_id) = &context_id {
            let orphans =
                volume_queries::unacknowledged_orphans_for_context(&self.pool, context_id).await?;
            if !orphans.is_empty() {
                return Err(VolumeDaemonError::ContextBlocked(context_id.clone()));
            }
        }
        Ok(context_id)
    }

    pub async fn create_volume(
        &self,
        size_gb: i64,
        vm_disk_id: Option<i64>,
        correlation_id: &str,
    ) -> Result<OsseaVolume, VolumeDaemonError> {
        let config = self.active_config().await?;
        let job = self
            .tracker
            .start_job_correlated("volume-create", None, correlation_id)
            .await?;
        let step = job.step("create-cloud-volume").await?;

        let name = format!("mig-{}", Uuid::new_v4());
        let cloud = self.cloud.clone();
        let disk_offering_id = config.disk_offering_id.clone();
        let zone_id = config.zone_id.clone();

        let created = tokio::time::timeout(
            Duration::from_secs(self.timeouts.volume_create_secs),
            retry_transient(|| cloud.create_volume(&name, size_gb, &disk_offering_id, &zone_id)),
        )
        .await;

        let volume_id = match created {
            Ok(Ok(volume_id)) => volume_id,
            Ok(Err(e)) => {
                step.fail(&e.to_string()).await?;
                job.fail(&e.to_string()).await?;
                return Err(VolumeDaemonError::CloudApi(e.to_string()));
            }
            Err(_) => {
                let msg = format!("createVolume exceeded {}s", self.timeouts.volume_create_secs);
                step.fail(&msg).await?;
                job.fail(&msg).await?;
                return Err(VolumeDaemonError::CloudApi(msg));
            }
        };

        let volume = volume_queries::insert_volume(&self.pool, &volume_id, vm_disk_id, size_gb).await?;
        volume_queries::mark_available(&self.pool, &volume_id).await?;
        if let Some(disk_id) = vm_disk_id {
            disk_queries::set_volume_link(&self.pool, disk_id, volume.id).await?;
        }

        step.info(&format!("volume {} created ({} GiB)", volume_id, size_gb)).await;
        step.complete().await?;
        job.complete().await?;

        Ok(volume)
    }

    /// Attaches a volume to the orchestrator host and returns the stable
    /// device path. Kernel paths never leave the daemon.
    pub async fn attach_to_orchestrator(
        &self,
        volume_id: &str,
        correlation_id: &str,
    ) -> Result<String, VolumeDaemonError> {
        let config = self.active_config().await?;
        let oma_vm_id = config.oma_vm_id.clone();
        match self.attach(volume_id, &oma_vm_id, correlation_id).await? {
            Some(stable_path) => Ok(stable_path),
            None => Err(VolumeDaemonError::MissingStableName(volume_id.to_string())),
        }
    }

    /// Attaches a volume to an arbitrary VM (failover path).
    pub async fn attach_to_vm(
        &self,
        volume_id: &str,
        vm_id: &str,
        correlation_id: &str,
    ) -> Result<(), VolumeDaemonError> {
        self.attach(volume_id, vm_id, correlation_id).await?;
        Ok(())
    }

    /// Shared attach path. The operation mode is decided by comparing the
    /// target VM against the orchestrator's own VM id from the active
    /// configuration row; `oma` mode additionally runs device correlation
    /// and stable naming and returns the stable path.
    async fn attach(
        &self,
        volume_id: &str,
        target_vm_id: &str,
        correlation_id: &str,
    ) -> Result<Option<String>, VolumeDaemonError> {
        let lock = self.lock_for(volume_id);
        let _guard = lock.lock().await;

        let context_id = self.ensure_context_unblocked(volume_id).await?;
        let config = self.active_config().await?;
        let mode = if target_vm_id == config.oma_vm_id {
            OperationMode::Oma
        } else {
            OperationMode::Failover
        };

        if mode == OperationMode::Oma {
            self.ensure_privileged()?;
        }

        let volume = volume_queries::get_by_volume_id(&self.pool, volume_id).await?;

        let job = self
            .tracker
            .start_job_correlated("volume-attach", context_id.as_deref(), correlation_id)
            .await?;
        let step = job.step("attach-cloud-volume").await?;

        // Snapshot the device set before the cloud sees the request, or a
        // fast attach could land between the call and the baseline.
        let before = if mode == OperationMode::Oma {
            Some(self.watcher.snapshot()?)
        } else {
            None
        };

        let cloud = self.cloud.clone();
        let attach_result = tokio::time::timeout(
            Duration::from_secs(self.timeouts.volume_attach_secs),
            retry_transient(|| cloud.attach_volume(volume_id, target_vm_id)),
        )
        .await;

        match attach_result {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                step.fail(&e.to_string()).await?;
                job.fail(&e.to_string()).await?;
                return Err(VolumeDaemonError::CloudApi(e.to_string()));
            }
            Err(_) => {
                let msg = format!("attachVolume exceeded {}s", self.timeouts.volume_attach_secs);
                step.fail(&msg).await?;
                job.fail(&msg).await?;
                return Err(VolumeDaemonError::CloudApi(msg));
            }
        }

        let Some(before) = before else {
            // Failover attach: the device appears inside the target VM, not
            // on this host. No correlation, no stable name.
            volume_queries::mark_attached(
                &self.pool,
                volume_id,
                target_vm_id,
                OperationMode::Failover.as_str(),
                None,
            )
            .await?;
            step.info(&format!("volume {} attached to VM {}", volume_id, target_vm_id)).await;
            step.complete().await?;
            job.complete().await?;
            return Ok(None);
        };

        let expected_size = (volume.size_gb as u64) * GIB;
        let kernel_path = match self
            .watcher
            .wait_for_new_device(
                volume_id,
                &before,
                expected_size,
                Duration::from_secs(self.timeouts.device_appearance_secs),
            )
            .await
        {
            Ok(path) => path,
            Err(e) => {
                // The cloud says attached but the host disagrees. Park the
                // attachment for reconciliation; returning a guessed kernel
                // path would be worse than failing.
                let reason = match &e {
                    VolumeDaemonError::AmbiguousDevice { .. } => "ambiguous-device-correlation",
                    _ => "device-timeout",
                };
                volume_queries::record_orphaned_attachment(
                    &self.pool,
                    volume_id,
                    context_id.as_deref(),
                    reason,
                    &e.to_string(),
                )
                .await?;
                step.error(&e.to_string()).await;
                step.fail(&e.to_string()).await?;
                job.fail(&e.to_string()).await?;
                return Err(e);
            }
        };

        let stable_name = stable_names::stable_name_for(volume_id);
        let symlink_path = stable_names::install_symlink(&self.symlink_dir, &stable_name, &kernel_path)?;
        let symlink_str = symlink_path.to_string_lossy().into_owned();

        // "attached + device known + mapping present" commits as one
        // transition; on failure the symlink is rolled back too.
        if let Err(e) = volume_queries::record_attachment_with_mapping(
            &self.pool,
            volume_id,
            target_vm_id,
            OperationMode::Oma.as_str(),
            &kernel_path,
            &stable_name,
            &symlink_str,
        )
        .await
        {
            let _ = stable_names::remove_symlink(&self.symlink_dir, &stable_name);
            step.fail(&e.to_string()).await?;
            job.fail(&e.to_string()).await?;
            return Err(e.into());
        }

        info!(
            "Volume {} attached to orchestrator: {} -> {}",
            volume_id, symlink_str, kernel_path
        );
        step.info(&format!("stable name {} -> {}", stable_name, kernel_path)).await;
        step.complete().await?;
        job.complete().await?;

        Ok(Some(symlink_str))
    }

    /// Detaches a volume from wherever it is attached. Exports are removed
    /// first; the stable-name reservation outlives the detach.
    pub async fn detach(
        &self,
        volume_id: &str,
        correlation_id: &str,
    ) -> Result<(), VolumeDaemonError> {
        let lock = self.lock_for(volume_id);
        let _guard = lock.lock().await;

        let volume = volume_queries::get_by_volume_id(&self.pool, volume_id).await?;
        let mapping = volume_queries::get_device_mapping(&self.pool, volume_id).await?;
        let context_id = volume_queries::context_for_volume(&self.pool, volume_id).await?;

        let job = self
            .tracker
            .start_job_correlated("volume-detach", context_id.as_deref(), correlation_id)
            .await?;
        let step = job.step("detach-cloud-volume").await?;

        if volume.operation_mode.as_deref() == Some("oma") {
            if let Some(device_path) = &volume.device_path {
                if device_is_mounted(device_path)? {
                    let e = VolumeDaemonError::VolumeBusy(volume_id.to_string());
                    step.fail(&e.to_string()).await?;
                    job.fail(&e.to_string()).await?;
                    return Err(e);
                }
            }
        }

        for export in export_queries::list_for_volume(&self.pool, volume_id).await? {
            self.exports.remove_export(&export.export_name)?;
            export_queries::delete_by_name(&self.pool, &export.export_name).await?;
            step.info(&format!("export {} removed", export.export_name)).await;
        }

        let cloud = self.cloud.clone();
        let detach_result = tokio::time::timeout(
            Duration::from_secs(self.timeouts.volume_attach_secs),
            retry_transient(|| cloud.detach_volume(volume_id)),
        )
        .await;

        match detach_result {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                step.fail(&e.to_string()).await?;
                job.fail(&e.to_string()).await?;
                return Err(VolumeDaemonError::CloudApi(e.to_string()));
            }
            Err(_) => {
                let msg = format!("detachVolume exceeded {}s", self.timeouts.volume_attach_secs);
                step.fail(&msg).await?;
                job.fail(&msg).await?;
                return Err(VolumeDaemonError::CloudApi(msg));
            }
        }

        if let Some(mapping) = mapping {
            stable_names::remove_symlink(&self.symlink_dir, &mapping.stable_name)?;
            volume_queries::mark_mapping_detached(&self.pool, volume_id).await?;
        }
        volume_queries::mark_detached(&self.pool, volume_id).await?;

        step.complete().await?;
        job.complete().await?;
        Ok(())
    }

    /// Publishes a volume as an NBD export. The volume must be attached to
    /// the orchestrator with a live stable name; the export is backed by the
    /// stable path so reattachment cannot invalidate it.
    pub async fn create_export(
        &self,
        volume_id: &str,
        job_id: &str,
        vm_disk_id: i64,
        read_only: bool,
        correlation_id: &str,
    ) -> Result<NbdExport, VolumeDaemonError> {
        let lock = self.lock_for(volume_id);
        let _guard = lock.lock().await;
        self.ensure_privileged()?;

        let volume = volume_queries::get_by_volume_id(&self.pool, volume_id).await?;
        if volume.operation_mode.as_deref() != Some("oma") {
            return Err(VolumeDaemonError::MissingStableName(volume_id.to_string()));
        }

        let mapping = volume_queries::get_device_mapping(&self.pool, volume_id)
            .await?
            .ok_or_else(|| VolumeDaemonError::MissingStableName(volume_id.to_string()))?;

        if stable_names::resolve_symlink(&self.symlink_dir, &mapping.stable_name).is_none() {
            return Err(VolumeDaemonError::BackingPathMissing(mapping.symlink_path));
        }

        let disk = disk_queries::get_disk_by_id(&self.pool, vm_disk_id).await?;
        let export_name = NbdExportManager::export_name_for(job_id, &disk.disk_key);

        let tracked = self
            .tracker
            .start_job_correlated("volume-export", Some(disk.vm_context_id.as_str()), correlation_id)
            .await?;
        let step = tracked.step("create-nbd-export").await?;

        // Same (job, disk) recreates the same export; retries converge
        // instead of accumulating.
        if let Some(existing) = export_queries::get_by_name(&self.pool, &export_name).await? {
            self.exports.add_export(&export_name, &existing.backing_path, existing.read_only)?;
            step.info("export already recorded; config refreshed").await;
            step.complete().await?;
            tracked.complete().await?;
            return Ok(existing);
        }

        self.exports.add_export(&export_name, &mapping.symlink_path, read_only)?;

        let export = export_queries::create_export(
            &self.pool,
            &export_name,
            volume_id,
            vm_disk_id,
            job_id,
            &mapping.symlink_path,
            read_only,
            i32::from(self.exports_port()),
        )
        .await?;

        step.info(&format!("export {} -> {}", export_name, mapping.symlink_path)).await;
        step.complete().await?;
        tracked.complete().await?;

        Ok(export)
    }

    pub async fn delete_export(
        &self,
        export_name: &str,
        _correlation_id: &str,
    ) -> Result<(), VolumeDaemonError> {
        // Idempotent: removing an export that is already gone succeeds.
        self.exports.remove_export(export_name)?;
        export_queries::delete_by_name(&self.pool, export_name).await?;
        Ok(())
    }

    pub async fn delete_volume(
        &self,
        volume_id: &str,
        correlation_id: &str,
    ) -> Result<(), VolumeDaemonError> {
        let lock = self.lock_for(volume_id);
        let _guard = lock.lock().await;

        let volume = volume_queries::get_by_volume_id(&self.pool, volume_id).await?;
        if volume.attached_vm_id.is_some() {
            return Err(VolumeDaemonError::StillAttached(volume_id.to_string()));
        }

        let job = self
            .tracker
            .start_job_correlated("volume-delete", None, correlation_id)
            .await?;
        let step = job.step("delete-cloud-volume").await?;

        let cloud = self.cloud.clone();
        if let Err(e) = retry_transient(|| cloud.delete_volume(volume_id)).await {
            // "Already gone" counts as success for deletes
            if !e.to_string().contains("not found") {
                step.fail(&e.to_string()).await?;
                job.fail(&e.to_string()).await?;
                return Err(VolumeDaemonError::CloudApi(e.to_string()));
            }
        }

        volume_queries::delete_volume_row(&self.pool, volume_id).await?;
        step.complete().await?;
        job.complete().await?;
        Ok(())
    }

    pub async fn snapshot_volume(
        &self,
        volume_id: &str,
        correlation_id: &str,
    ) -> Result<String, VolumeDaemonError> {
        let lock = self.lock_for(volume_id);
        let _guard = lock.lock().await;

        let context_id = volume_queries::context_for_volume(&self.pool, volume_id).await?;
        let job = self
            .tracker
            .start_job_correlated("volume-snapshot", context_id.as_deref(), correlation_id)
            .await?;
        let step = job.step("create-cloud-snapshot").await?;

        let cloud = self.cloud.clone();
        match retry_transient(|| cloud.snapshot_volume(volume_id)).await {
            Ok(snapshot_id) => {
                step.info(&format!("snapshot {} created", snapshot_id)).await;
                step.complete().await?;
                job.complete().await?;
                Ok(snapshot_id)
            }
            Err(e) => {
                step.fail(&e.to_string()).await?;
                job.fail(&e.to_string()).await?;
                Err(VolumeDaemonError::CloudApi(e.to_string()))
            }
        }
    }

    pub async fn revert_snapshot(
        &self,
        volume_id: &str,
        snapshot_id: &str,
        _correlation_id: &str,
    ) -> Result<(), VolumeDaemonError> {
        let lock = self.lock_for(volume_id);
        let _guard = lock.lock().await;

        let cloud = self.cloud.clone();
        retry_transient(|| cloud.revert_snapshot(snapshot_id))
            .await
            .map_err(|e| VolumeDaemonError::CloudApi(e.to_string()))
    }

    pub async fn delete_snapshot(
        &self,
        snapshot_id: &str,
        _correlation_id: &str,
    ) -> Result<(), VolumeDaemonError> {
        let cloud = self.cloud.clone();
        match retry_transient(|| cloud.delete_snapshot(snapshot_id)).await {
            Ok(()) => Ok(()),
            Err(e) if e.to_string().contains("not found") => Ok(()),
            Err(e) => Err(VolumeDaemonError::CloudApi(e.to_string())),
        }
    }

    pub async fn get_volume(&self, volume_id: &str) -> Result<OsseaVolume, VolumeDaemonError> {
        volume_queries::get_by_volume_id(&self.pool, volume_id)
            .await
            .map_err(|_| VolumeDaemonError::NotFound(format!("volume {}", volume_id)))
    }

    pub async fn list_exports(&self) -> Result<Vec<NbdExport>, VolumeDaemonError> {
        Ok(export_queries::list_all(&self.pool).await?)
    }

    fn exports_port(&self) -> u16 {
        crate::config::APP_CONFIG.volume_daemon.nbd_port
    }

    pub fn export_url(&self, export_name: &str) -> String {
        self.exports.export_url(export_name)
    }
}

/// A device with a live mount must not be detached out from under the
/// kernel.
fn device_is_mounted(device_path: &str) -> Result<bool, VolumeDaemonError> {
    let mounts = match std::fs::read_to_string("/proc/mounts") {
        Ok(mounts) => mounts,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(false),
        Err(e) => return Err(e.into()),
    };

    Ok(mounts
        .lines()
        .any(|line| line.split_whitespace().next() == Some(device_path)))
}
