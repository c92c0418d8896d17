use chrono::{DateTime, Utc};
use serde::Serialize;

/// One source disk owned by exactly one VM context.
///
/// Identity is (vm_context_id, disk_key) and it survives across replication
/// jobs: new jobs update these rows in place. The auto-increment id is
/// ephemeral and must never be used for cross-job correlation.
#[derive(Debug, Clone, sqlx::FromRow, Serialize)]
pub struct VmDisk {
    pub id: i64,
    pub vm_context_id: String,
    pub disk_key: String,
    pub size_bytes: i64,
    pub unit_number: i32,
    pub bus_number: i32,
    pub datastore: Option<String>,
    /// Last successful CBT cursor for this disk; NULL until the first
    /// completed copy.
    pub change_id: Option<String>,
    pub ossea_volume_id: Option<i64>,
    pub replication_job_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}
