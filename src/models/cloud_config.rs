use chrono::{DateTime, Utc};
use serde::Serialize;

/// A destination-cloud configuration. At most one row carries `is_active`;
/// the active row supplies the default network, the template, and the
/// orchestrator's own cloud-side VM id.
///
/// `oma_vm_id` is deployment state, not a constant: the same binary runs in
/// many environments and the volume daemon reads this column on every attach
/// decision.
#[derive(Debug, Clone, sqlx::FromRow, Serialize)]
pub struct OsseaConfig {
    pub id: i64,
    pub name: String,
    pub api_url: String,
    #[serde(skip_serializing)]
    pub api_key_ciphertext: String,
    #[serde(skip_serializing)]
    pub secret_key_ciphertext: String,
    pub zone_id: String,
    pub template_id: String,
    pub service_offering_id: String,
    pub disk_offering_id: String,
    pub default_network_id: String,
    pub oma_vm_id: String,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}
