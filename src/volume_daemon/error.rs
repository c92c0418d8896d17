use thiserror::Error;

/// Errors surfaced by volume daemon operations.
///
/// The correlation variants (`DeviceTimeout`, `AmbiguousDevice`,
/// `MissingStableName`) are critical: they mean the daemon's identity
/// invariants are broken, and no further volume operations may proceed on
/// the affected context until an operator acknowledges the orphan record.
#[derive(Error, Debug)]
pub enum VolumeDaemonError {
    #[error("Volume {volume_id}: device did not appear within {timeout_secs}s of cloud attach")]
    DeviceTimeout { volume_id: String, timeout_secs: u64 },

    #[error("ambiguous-device-correlation: volume {volume_id} matched {candidates} new devices of the same size")]
    AmbiguousDevice { volume_id: String, candidates: usize },

    #[error("Volume {0} is attached to the orchestrator but has no stable name mapping")]
    MissingStableName(String),

    #[error("Insufficient privilege: {0}")]
    InsufficientPrivilege(String),

    #[error("No active cloud configuration; cannot resolve the orchestrator VM id")]
    NoActiveConfig,

    #[error("Export backing path {0} does not resolve to a device")]
    BackingPathMissing(String),

    #[error("Volume {0} is busy (mounted or exported)")]
    VolumeBusy(String),

    #[error("Volume {0} is still attached; detach before deleting")]
    StillAttached(String),

    #[error("Context {0} has unacknowledged correlation failures; volume operations are blocked")]
    ContextBlocked(String),

    #[error("Cloud API error: {0}")]
    CloudApi(String),

    #[error("{0} not found")]
    NotFound(String),

    #[error("Filesystem error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl VolumeDaemonError {
    /// True for failures of the identity invariants, which must fail fast
    /// and park the operation for reconciliation.
    pub fn is_correlation_failure(&self) -> bool {
        matches!(
            self,
            VolumeDaemonError::DeviceTimeout { .. }
                | VolumeDaemonError::AmbiguousDevice { .. }
                | VolumeDaemonError::MissingStableName(_)
        )
    }
}
