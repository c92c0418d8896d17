//! Query layer: one module per table family. All functions take a pool (or
//! transaction), return `anyhow::Result`, and add context at the call site.

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
