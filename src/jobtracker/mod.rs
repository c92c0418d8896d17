//! Hierarchical, persistent job/step logging.
//!
//! Every substantive operation (replication, failover phase, volume
//! operation, scheduler tick) opens a parent job, emits ordered steps,
//! attaches structured events to steps, and closes the parent with a
//! terminal status. Correlation ids ride on every outgoing HTTP call so
//! distributed debugging stays tractable.

pub mod recovery;
pub mod tracker;

pub use recovery::{RecoveryAction, RecoveryScanner, StatusProbe, SubsystemStatus};
pub use tracker::{JobTracker, TrackedJob, TrackedStep};

/// Header carrying the correlation id between processes.
pub const CORRELATION_HEADER: &str = "X-Correlation-Id";
