use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One copy attempt for a VM context.
#[derive(Debug, Clone, sqlx::FromRow, Serialize)]
pub struct ReplicationJob {
    pub id: String,
    pub vm_context_id: String,
    pub replication_type: String, // enum: 'initial', 'incremental'
    pub status: String, // enum: 'pending', 'running', 'completed', 'failed', 'cancelled'
    pub agent_job_id: Option<String>,
    pub correlation_id: String,
    pub bytes_transferred: i64,
    pub total_bytes: i64,
    pub throughput_bps: i64,
    pub current_disk: Option<String>,
    pub error_message: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

pub const ACTIVE_REPLICATION_STATUSES: &[&str] = &["pending", "running"];

/// Replication type requested per disk. The decision is per disk, not per
/// VM: a context can run `incremental` on seeded disks while a newly added
/// disk gets its `initial` copy in the same job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReplicationType {
    Initial,
    Incremental,
}

impl ReplicationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReplicationType::Initial => "initial",
            ReplicationType::Incremental => "incremental",
        }
    }
}
