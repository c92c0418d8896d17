use chrono::{DateTime, Utc};
use serde::Serialize;

/// The export of a volume over the NBD wire protocol.
///
/// `vm_disk_id` is NOT NULL by schema: exports correlate per source disk so
/// multi-disk jobs stay stable across retries. Export names are a pure
/// function of (job, disk), which lets the agent reconnect to the same names
/// after an orchestrator restart.
#[derive(Debug, Clone, sqlx::FromRow, Serialize)]
pub struct NbdExport {
    pub id: i64,
    pub export_name: String,
    pub volume_id: String,
    pub vm_disk_id: i64,
    pub job_id: String,
    pub backing_path: String,
    pub read_only: bool,
    pub port: i32,
    pub created_at: DateTime<Utc>,
}
