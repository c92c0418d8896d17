use chrono::{DateTime, Utc};
use serde::Serialize;

/// Per-context, per-source-network pair of destination networks. Either
/// destination may be NULL; a missing entry falls back to the default
/// network of the active cloud configuration.
#[derive(Debug, Clone, sqlx::FromRow, Serialize)]
pub struct NetworkMapping {
    pub id: i64,
    pub vm_context_id: String,
    pub source_network_name: String,
    /// Destination network for live failover
    pub destination_network_id: Option<String>,
    /// Destination network for test failover, usually isolated
    pub test_network_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}
