use chrono::{DateTime, Utc};
use serde::Serialize;

/// One agent's enrollment request. Agents ship without credentials; the
/// operator approves the key before the control tunnel becomes usable.
#[derive(Debug, Clone, sqlx::FromRow, Serialize)]
pub struct AgentEnrollment {
    pub id: String,
    pub agent_name: String,
    pub public_key: String,
    pub fingerprint: String,
    /// Short code shown on the agent console for the operator to compare
    pub pairing_code: String,
    pub state: String, // enum: 'pending_approval', 'approved', 'rejected'
    pub approved_by: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}
