use chrono::{DateTime, Utc};
use serde::Serialize;

/// Parent record of the hierarchical job log. Every substantive operation
/// opens one of these, emits ordered steps, and closes with a terminal
/// status. The recovery scan enumerates rows whose status is in
/// `ACTIVE_JOB_STATUSES` after a restart.
#[derive(Debug, Clone, sqlx::FromRow, Serialize)]
pub struct Job {
    pub id: String,
    pub job_type: String,
    pub owner: String, // enum: 'orchestrator', 'volume-daemon', 'scheduler'
    pub vm_context_id: Option<String>,
    pub correlation_id: String,
    /// Agent-side or cloud-side identifier for recovery queries
    pub external_job_id: Option<String>,
    pub status: String, // enum: 'running', 'completed', 'failed', 'cancelled'
    pub error_message: Option<String>,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

pub const ACTIVE_JOB_STATUSES: &[&str] = &["running"];

#[derive(Debug, Clone, sqlx::FromRow, Serialize)]
pub struct JobStep {
    pub id: i64,
    pub job_id: String,
    pub seq: i32,
    pub name: String,
    pub status: String, // enum: 'running', 'completed', 'failed'
    pub error_message: Option<String>,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, sqlx::FromRow, Serialize)]
pub struct JobLogEntry {
    pub id: i64,
    pub job_step_id: i64,
    pub level: String, // enum: 'debug', 'info', 'warn', 'error'
    pub message: String,
    /// JSON-encoded structured payload, when the caller attached one
    pub detail: Option<String>,
    pub created_at: DateTime<Utc>,
}
