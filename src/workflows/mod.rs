//! Orchestrator-side workflow engine: replication, failover, and
//! test-failover cleanup. One `Workflows` instance owns the shared clients;
//! the per-operation logic lives in the sibling modules' impl blocks.

pub mod cleanup;
pub mod failover;
pub mod replication;

use crate::clients::cloudstack::CloudAdapter;
use crate::clients::{AgentClient, VolumeDaemonClient};
use crate::config::TimeoutConfig;
use crate::jobtracker::JobTracker;
use parking_lot::Mutex;
use sqlx::{MySql, Pool};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum WorkflowError {
    #[error("{0}")]
    Validation(String),

    #[error("{0}")]
    Conflict(String),

    #[error("{0} not found")]
    NotFound(String),

    #[error("Upstream failure: {0}")]
    Upstream(String),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

/// Shared dependencies of every workflow.
pub struct Workflows {
    pub pool: Pool<MySql>,
    pub agent: Arc<AgentClient>,
    pub volumes: Arc<VolumeDaemonClient>,
    pub cloud: Arc<dyn CloudAdapter>,
    pub tracker: JobTracker,
    pub timeouts: TimeoutConfig,
    /// Replication and failover are mutually exclusive per context. The
    /// owned guard is taken at workflow entry and moves into the background
    /// task, so the lock is held until the workflow finishes, not just
    /// until the entry function returns.
    context_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl Workflows {
    pub fn new(
        pool: Pool<MySql>,
        agent: Arc<AgentClient>,
        volumes: Arc<VolumeDaemonClient>,
        cloud: Arc<dyn CloudAdapter>,
        timeouts: TimeoutConfig,
    ) -> Arc<Self> {
        let tracker = JobTracker::new(pool.clone(), "orchestrator");
        Arc::new(Self {
            pool,
            agent,
            volumes,
            cloud,
            tracker,
            timeouts,
            context_locks: Mutex::new(HashMap::new()),
        })
    }

    pub(crate) fn lock_for_context(&self, context_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.context_locks.lock();
        locks
            .entry(context_id.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    /// Claims the per-context workflow lock without waiting. A context whose
    /// lock is held has a workflow in flight; callers surface that as a
    /// conflict rather than queueing behind an hours-long copy.
    pub(crate) fn claim_context(
        &self,
        context_id: &str,
    ) -> Result<tokio::sync::OwnedMutexGuard<()>, WorkflowError> {
        self.lock_for_context(context_id).try_lock_owned().map_err(|_| {
            WorkflowError::Conflict(format!(
                "context {} has a workflow in flight",
                context_id
            ))
        })
    }
}
