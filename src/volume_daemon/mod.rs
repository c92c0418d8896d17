//! The volume daemon is the single authority for block-volume state on the
//! orchestrator host. Nothing else talks to the cloud volume APIs or writes
//! under the symlink directory; every other component calls the daemon's
//! loopback HTTP interface.

pub mod api;
pub mod device;
pub mod error;
pub mod exports;
pub mod service;
pub mod stable_names;

pub use error::VolumeDaemonError;
pub use service::VolumeService;
