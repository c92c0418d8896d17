use lazy_static::lazy_static;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Configuration for the ossea-migrate appliances.
///
/// One `config.json` drives all three processes; each binary reads the
/// section it cares about. The file is created with defaults on first boot
/// so an appliance image always comes up with something editable.
///
/// Secrets never live here: `DATABASE_URL` and `OSSEA_MIGRATE_ENC_KEY` are
/// taken from the environment (see `credentials`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub orchestrator: OrchestratorConfig,
    pub volume_daemon: VolumeDaemonConfig,
    pub agent: AgentConfig,
    pub timeouts: TimeoutConfig,
}

/// Orchestrator (OMA) process settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    /// Port for the REST API
    pub port: u16,

    /// Management address: control-tunnel endpoint, REST bind address
    pub management_address: String,

    /// Data address: where the NBD server listens. Must be a different
    /// address than `management_address`; block traffic is never tunneled.
    pub data_address: String,

    /// Base URL of the co-located volume daemon (loopback only)
    pub volume_daemon_url: String,

    /// Agent API base URL as seen through the control tunnel
    pub agent_url: String,

    /// Loopback port of the tunnel's reverse forward to the agent API;
    /// must agree with the port in `agent_url`
    pub agent_forward_port: u16,

    /// Unix account that terminates agent tunnels
    pub tunnel_user: String,

    /// authorized_keys file managed by the enrollment flow
    pub tunnel_authorized_keys: String,

    /// How long live-failover snapshots are retained, in hours
    pub snapshot_retention_hours: u32,
}

/// Volume daemon settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VolumeDaemonConfig {
    /// Loopback port for the local HTTP API
    pub port: u16,

    /// Directory where stable-name symlinks are materialized
    pub symlink_dir: String,

    /// Directory of per-export NBD config snippets
    pub nbd_config_dir: String,

    /// Path to the NBD server's pid file, used to signal reloads
    pub nbd_pid_file: String,

    /// Port the NBD server listens on (data address)
    pub nbd_port: u16,

    /// sysfs block-device root, overridable for tests
    pub sys_block_dir: String,
}

/// Migration agent (VMA) settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Port for the agent HTTP API (reached through the tunnel)
    pub port: u16,

    /// Orchestrator management address for the SSH control tunnel
    pub oma_management_address: String,

    /// Orchestrator REST port on the management address, for the
    /// pre-tunnel enrollment bootstrap
    pub oma_api_port: u16,

    /// Data-mover sidecar wrapping the hypervisor SDK, on the VMA loopback
    pub datamover_url: String,

    /// Orchestrator data address for direct NBD connections
    pub oma_data_address: String,

    /// SSH port on the orchestrator
    pub oma_ssh_port: u16,

    /// Tunnel user on the orchestrator
    pub tunnel_user: String,

    /// Where the enrollment keypair is kept
    pub key_dir: String,

    /// NBD sessions per disk; more triggers vSphere-side throttling
    pub workers_per_disk: usize,
}

/// Operation deadlines in seconds. Every cloud call a caller can block on
/// must run under one of these.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeoutConfig {
    pub volume_create_secs: u64,
    pub volume_attach_secs: u64,
    pub device_appearance_secs: u64,
    pub agent_discover_secs: u64,
    pub chunk_write_secs: u64,
    pub progress_poll_interval_secs: u64,
    pub progress_poll_timeout_secs: u64,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            orchestrator: OrchestratorConfig {
                port: 8082,
                management_address: "10.245.246.125".to_string(),
                data_address: "10.245.246.189".to_string(),
                volume_daemon_url: "http://127.0.0.1:8090".to_string(),
                agent_url: "http://127.0.0.1:9081".to_string(),
                agent_forward_port: 9081,
                tunnel_user: "vma_tunnel".to_string(),
                tunnel_authorized_keys: "/home/vma_tunnel/.ssh/authorized_keys".to_string(),
                snapshot_retention_hours: 72,
            },
            volume_daemon: VolumeDaemonConfig {
                port: 8090,
                symlink_dir: "/dev/mapper".to_string(),
                nbd_config_dir: "/etc/nbd-server/conf.d".to_string(),
                nbd_pid_file: "/run/nbd-server.pid".to_string(),
                nbd_port: 10809,
                sys_block_dir: "/sys/block".to_string(),
            },
            agent: AgentConfig {
                port: 8081,
                oma_management_address: "10.245.246.125".to_string(),
                oma_api_port: 8082,
                datamover_url: "http://127.0.0.1:8083".to_string(),
                oma_data_address: "10.245.246.189".to_string(),
                oma_ssh_port: 443,
                tunnel_user: "vma_tunnel".to_string(),
                key_dir: "/opt/vma/keys".to_string(),
                workers_per_disk: 4,
            },
            timeouts: TimeoutConfig {
                volume_create_secs: 120,
                volume_attach_secs: 120,
                device_appearance_secs: 30,
                agent_discover_secs: 60,
                chunk_write_secs: 30,
                progress_poll_interval_secs: 2,
                progress_poll_timeout_secs: 10,
            },
        }
    }
}

/// Possible errors that can occur during configuration operations.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ConfigError {
    /// Indicates that the configuration file could not be found
    FileNotFound,

    /// Indicates that writing to the configuration file failed
    FailedToWrite,

    /// Indicates that parsing the configuration file content failed
    ParseError,
}

lazy_static! {
    /// Global static reference to the appliance configuration, initialized
    /// on first access from `config.json` (or defaults written on first
    /// boot).
    pub static ref APP_CONFIG: Arc<AppConfig> =
        Arc::new(AppConfig::read().expect("Failed to initialize appliance config"));
}

impl AppConfig {
    /// Reads the configuration from "config.json" in the working directory,
    /// writing defaults there first if no file exists.
    pub fn read() -> Result<Self, ConfigError> {
        let config_path = "config.json";
        let config_content = match std::fs::read_to_string(config_path) {
            Ok(content) => content,
            Err(_) => {
                Self::write_default().expect("Failed to write default config");
                return Ok(AppConfig::default());
            }
        };

        let config: AppConfig = match serde_json::from_str(&config_content) {
            Ok(config) => config,
            Err(_) => return Err(ConfigError::ParseError),
        };

        Ok(config)
    }

    /// Writes the current configuration to "config.json".
    pub fn write(&self) -> Result<(), ConfigError> {
        let config_path = "config.json";

        let config_content = match serde_json::to_string_pretty(&self) {
            Ok(content) => content,
            Err(_) => return Err(ConfigError::ParseError),
        };

        match std::fs::write(config_path, config_content) {
            Ok(_) => Ok(()),
            Err(_) => Err(ConfigError::FailedToWrite),
        }
    }

    /// Creates and writes a default configuration to the config file.
    pub fn write_default() -> Result<(), ConfigError> {
        let config = AppConfig::default();
        config.write()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_addresses_are_split() {
        let config = AppConfig::default();
        assert_ne!(
            config.orchestrator.management_address,
            config.orchestrator.data_address,
            "control and data planes must terminate on distinct addresses"
        );
    }

    #[test]
    fn default_round_trips_through_json() {
        let config = AppConfig::default();
        let text = serde_json::to_string(&config).unwrap();
        let back: AppConfig = serde_json::from_str(&text).unwrap();
        assert_eq!(back.volume_daemon.port, config.volume_daemon.port);
        assert_eq!(back.timeouts.volume_attach_secs, 120);
    }
}
