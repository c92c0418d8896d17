use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A destination block volume owned by the cloud.
#[derive(Debug, Clone, sqlx::FromRow, Serialize)]
pub struct OsseaVolume {
    pub id: i64,
    /// Cloud-side volume id (uuid string)
    pub volume_id: String,
    pub vm_disk_id: Option<i64>,
    pub size_gb: i64,
    /// Owning VM when attached; NULL when detached
    pub attached_vm_id: Option<String>,
    pub operation_mode: Option<String>, // enum: 'oma', 'failover'
    pub device_path: Option<String>,
    pub status: String, // enum: 'creating', 'available', 'attached', 'deleting'
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Whether a volume is attached to the orchestrator host for writes or to a
/// destination VM for failover. Decides whether stable naming applies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationMode {
    Oma,
    Failover,
}

impl OperationMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationMode::Oma => "oma",
            OperationMode::Failover => "failover",
        }
    }
}

/// Persistent decoupling of a volume from the kernel's transient device
/// naming. Rows survive detach; the stable name is reserved for the volume
/// forever and reattach reuses it.
#[derive(Debug, Clone, sqlx::FromRow, Serialize)]
pub struct DeviceMapping {
    pub id: i64,
    pub volume_id: String,
    pub stable_name: String,
    pub symlink_path: String,
    pub kernel_path: Option<String>,
    pub operation_mode: String, // enum: 'oma', 'failover'
    pub attachment_state: String, // enum: 'attached', 'detached'
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// An attach whose device never appeared, parked for operator
/// reconciliation.
#[derive(Debug, Clone, sqlx::FromRow, Serialize)]
pub struct OrphanedAttachment {
    pub id: i64,
    pub volume_id: String,
    pub vm_context_id: Option<String>,
    pub reason: String, // enum: 'device-timeout', 'ambiguous-device-correlation'
    pub detail: Option<String>,
    pub acknowledged: bool,
    pub created_at: DateTime<Utc>,
}
