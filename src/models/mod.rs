//! Row types for the appliance database. One module per table family;
//! status columns are strings whose legal values are listed inline.

pub mod cloud_config;
pub mod credential;
pub mod disk;
pub mod enrollment;
pub mod export;
pub mod failover;
pub mod job;
pub mod network_mapping;
pub mod replication;
pub mod schedule;
pub mod vm_context;
pub mod volume;
