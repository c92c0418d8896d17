//! NBD export configuration management.
//!
//! One config snippet per export under the server's conf.d directory. The
//! server is reloaded with SIGHUP on every add/remove so unrelated in-flight
//! exports are not disturbed; it is never restarted by the daemon. A dummy
//! export is kept on disk at all times so the server starts cleanly when no
//! migrations are in flight.

use crate::volume_daemon::error::VolumeDaemonError;
use log::{info, warn};
use std::path::{Path, PathBuf};
use std::process::Command;

pub const DUMMY_EXPORT_NAME: &str = "dummy";

#[derive(Clone)]
pub struct NbdExportManager {
    config_dir: String,
    pid_file: String,
    port: u16,
    data_address: String,
}

impl NbdExportManager {
    pub fn new(config_dir: String, pid_file: String, port: u16, data_address: String) -> Self {
        Self {
            config_dir,
            pid_file,
            port,
            data_address,
        }
    }

    /// Export names are a pure function of (job, disk) so the agent can
    /// reconnect to the same names after an orchestrator restart, and so
    /// retried jobs reuse rather than accumulate exports.
    pub fn export_name_for(job_id: &str, disk_key: &str) -> String {
        format!("migration-{}-{}", job_id, disk_key)
    }

    /// URL the agent dials on the data channel.
    pub fn export_url(&self, export_name: &str) -> String {
        format!("nbd://{}:{}/{}", self.data_address, self.port, export_name)
    }

    pub fn config_path(&self, export_name: &str) -> PathBuf {
        Path::new(&self.config_dir).join(format!("{}.conf", export_name))
    }

    /// Writes the per-export snippet and reloads the server.
    pub fn add_export(
        &self,
        export_name: &str,
        backing_path: &str,
        read_only: bool,
    ) -> Result<(), VolumeDaemonError> {
        let content = render_export_config(export_name, backing_path, read_only);
        std::fs::create_dir_all(&self.config_dir)?;
        std::fs::write(self.config_path(export_name), content)?;
        info!("Export {} -> {} (ro={})", export_name, backing_path, read_only);
        self.reload_server()
    }

    /// Removes the snippet and reloads. Already-gone is success.
    pub fn remove_export(&self, export_name: &str) -> Result<(), VolumeDaemonError> {
        match std::fs::remove_file(self.config_path(export_name)) {
            Ok(_) => {
                info!("Export {} removed", export_name);
                self.reload_server()
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// The dummy export keeps the server alive with zero real exports.
    pub fn ensure_dummy_export(&self) -> Result<(), VolumeDaemonError> {
        let path = self.config_path(DUMMY_EXPORT_NAME);
        if path.exists() {
            return Ok(());
        }
        std::fs::create_dir_all(&self.config_dir)?;
        std::fs::write(path, render_export_config(DUMMY_EXPORT_NAME, "/dev/null", true))?;
        Ok(())
    }

    /// SIGHUP makes the server re-read conf.d without dropping connections.
    fn reload_server(&self) -> Result<(), VolumeDaemonError> {
        let pid = match std::fs::read_to_string(&self.pid_file) {
            Ok(pid) => pid.trim().to_string(),
            Err(e) => {
                warn!("NBD server pid file {} unreadable ({}); skipping reload", self.pid_file, e);
                return Ok(());
            }
        };

        let status = Command::new("kill").arg("-HUP").arg(&pid).status()?;
        if !status.success() {
            warn!("SIGHUP to nbd-server pid {} failed with {}", pid, status);
        }
        Ok(())
    }
}

fn render_export_config(export_name: &str, backing_path: &str, read_only: bool) -> String {
    format!(
        "[{}]\nexportname = {}\nreadonly = {}\nmultifile = false\ncopyonwrite = false\n",
        export_name, backing_path, read_only
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn export_names_are_deterministic_per_job_and_disk() {
        let a = NbdExportManager::export_name_for("repl-1234", "disk-2000");
        let b = NbdExportManager::export_name_for("repl-1234", "disk-2000");
        assert_eq!(a, b);
        assert_eq!(a, "migration-repl-1234-disk-2000");

        // Sibling disks of the same job must not collide
        let c = NbdExportManager::export_name_for("repl-1234", "disk-2001");
        assert_ne!(a, c);
    }

    #[test]
    fn config_snippet_carries_backing_path_and_ro_flag() {
        let content = render_export_config("migration-x-disk-2000", "/dev/mapper/volabc12345", false);
        assert!(content.starts_with("[migration-x-disk-2000]\n"));
        assert!(content.contains("exportname = /dev/mapper/volabc12345"));
        assert!(content.contains("readonly = false"));
    }

    #[test]
    fn url_targets_the_data_address() {
        let mgr = NbdExportManager::new(
            "/tmp/conf.d".into(),
            "/tmp/nbd.pid".into(),
            10809,
            "10.0.100.189".into(),
        );
        assert_eq!(
            mgr.export_url("migration-j-disk-2000"),
            "nbd://10.0.100.189:10809/migration-j-disk-2000"
        );
    }
}
