use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One test or live failover of a VM context.
#[derive(Debug, Clone, sqlx::FromRow, Serialize)]
pub struct FailoverJob {
    pub id: String,
    pub vm_context_id: String,
    pub failover_type: String, // enum: 'test', 'live'
    pub phase: String,
    pub status: String, // enum: 'running', 'completed', 'failed', 'cleaned_up'
    pub destination_vm_id: Option<String>,
    /// JSON map of volume_id -> snapshot_id, written during the snapshot
    /// phase and consumed by rollback.
    pub snapshot_ids: Option<String>,
    pub network_strategy: Option<String>, // enum: 'test', 'production'
    pub error_message: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailoverType {
    Test,
    Live,
}

impl FailoverType {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailoverType::Test => "test",
            FailoverType::Live => "live",
        }
    }
}

/// Ordered phases of a failover. Any failure transitions to a phase-specific
/// cleanup path; phases Snapshot..PowerOn block new replications on the
/// context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailoverPhase {
    Validate,
    Snapshot,
    DetachFromOma,
    InjectDrivers,
    CreateVm,
    AttachVolumes,
    PowerOn,
    Verify,
    Completed,
}

impl FailoverPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailoverPhase::Validate => "validate",
            FailoverPhase::Snapshot => "snapshot",
            FailoverPhase::DetachFromOma => "detach_from_oma",
            FailoverPhase::InjectDrivers => "inject_drivers",
            FailoverPhase::CreateVm => "create_vm",
            FailoverPhase::AttachVolumes => "attach_volumes",
            FailoverPhase::PowerOn => "power_on",
            FailoverPhase::Verify => "verify",
            FailoverPhase::Completed => "completed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "validate" => Some(FailoverPhase::Validate),
            "snapshot" => Some(FailoverPhase::Snapshot),
            "detach_from_oma" => Some(FailoverPhase::DetachFromOma),
            "inject_drivers" => Some(FailoverPhase::InjectDrivers),
            "create_vm" => Some(FailoverPhase::CreateVm),
            "attach_volumes" => Some(FailoverPhase::AttachVolumes),
            "power_on" => Some(FailoverPhase::PowerOn),
            "verify" => Some(FailoverPhase::Verify),
            "completed" => Some(FailoverPhase::Completed),
            _ => None,
        }
    }

    /// True while the phase must exclude concurrent replication.
    pub fn blocks_replication(&self) -> bool {
        matches!(
            self,
            FailoverPhase::Snapshot
                | FailoverPhase::DetachFromOma
                | FailoverPhase::InjectDrivers
                | FailoverPhase::CreateVm
                | FailoverPhase::AttachVolumes
                | FailoverPhase::PowerOn
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn phases_are_ordered() {
        assert!(FailoverPhase::Validate < FailoverPhase::Snapshot);
        assert!(FailoverPhase::PowerOn < FailoverPhase::Verify);
    }

    #[test]
    fn replication_exclusion_covers_phases_two_through_seven() {
        assert!(!FailoverPhase::Validate.blocks_replication());
        assert!(FailoverPhase::Snapshot.blocks_replication());
        assert!(FailoverPhase::PowerOn.blocks_replication());
        assert!(!FailoverPhase::Verify.blocks_replication());
        assert!(!FailoverPhase::Completed.blocks_replication());
    }
}
