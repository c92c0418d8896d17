//! Typed HTTP clients for the external collaborators: the OSSEA cloud API,
//! the migration agent (through the control tunnel), and the co-located
//! volume daemon.

pub mod agent;
pub mod cloudstack;
pub mod volume_daemon;

pub use agent::AgentClient;
pub use cloudstack::{CloudAdapter, CloudError, CloudStackClient};
pub use volume_daemon::VolumeDaemonClient;
