use chrono::{DateTime, Utc};
use serde::Serialize;

/// Stored vCenter credentials. Password material is ciphertext produced by
/// the appliance's credential library; plaintext never reaches this struct.
#[derive(Debug, Clone, sqlx::FromRow, Serialize)]
pub struct VmwareCredential {
    pub id: i64,
    pub name: String,
    pub vcenter_host: String,
    pub username: String,
    #[serde(skip_serializing)]
    pub password_ciphertext: String,
    pub datacenter: Option<String>,
    pub is_default: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}
