use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// The durable record of a source VM under management. Survives replication
/// jobs and failovers; the unit of concurrency isolation.
#[derive(Debug, Clone, sqlx::FromRow, Serialize)]
pub struct VmContext {
    pub context_id: String,
    pub vm_name: String,
    pub vmware_path: String,
    pub vcenter_host: String,
    pub datacenter: String,
    pub status: String, // enum: 'discovered', 'replicating', 'ready_for_failover', 'failed_over_test', 'failed_over_live', 'cleanup_in_progress', 'failed'
    pub cpu_count: Option<i32>,
    pub memory_mb: Option<i32>,
    pub power_state: Option<String>,
    pub os_type: Option<String>,
    pub ossea_config_id: Option<i64>,
    pub credential_id: Option<i64>,
    pub last_operation_summary: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Context statuses during which a new replication must be rejected.
pub const FAILOVER_BLOCKING_STATUSES: &[&str] =
    &["failed_over_test", "failed_over_live", "cleanup_in_progress"];

/// Fresh VM metadata as reported by the agent's discovery. This is the
/// authoritative spec source at job start; the cached columns on the context
/// row are display-only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VmSpec {
    pub vm_name: String,
    pub vmware_path: String,
    pub datacenter: String,
    pub cpu_count: i32,
    pub memory_mb: i32,
    pub power_state: String,
    pub os_type: String,
    pub networks: Vec<String>,
    pub disks: Vec<DiskSpec>,
}

/// One source disk as seen by discovery.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiskSpec {
    /// vSphere stable disk key, e.g. "disk-2000". The only identifier that
    /// survives across replication jobs.
    pub disk_key: String,
    pub size_bytes: i64,
    pub unit_number: i32,
    pub bus_number: i32,
    pub datastore: String,
}
