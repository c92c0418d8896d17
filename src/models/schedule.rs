use chrono::{DateTime, Utc};
use serde::Serialize;

/// A cron-like replication trigger over a group of VM contexts.
#[derive(Debug, Clone, sqlx::FromRow, Serialize)]
pub struct ReplicationSchedule {
    pub id: i64,
    pub name: String,
    pub cron_expression: String,
    pub replication_type: String, // enum: 'initial', 'incremental'
    /// At most this many members replicate concurrently per trigger
    pub max_concurrent: i32,
    pub enabled: bool,
    pub last_run_at: Option<DateTime<Utc>>,
    pub next_run_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, sqlx::FromRow, Serialize)]
pub struct ScheduleMember {
    pub id: i64,
    pub schedule_id: i64,
    pub vm_context_id: String,
}
