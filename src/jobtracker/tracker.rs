use crate::db::queries::job as job_queries;
use log::warn;
use sqlx::{MySql, Pool};
use std::sync::atomic::{AtomicI32, Ordering};
use uuid::Uuid;

/// Entry point for opening tracked jobs. One per process, cheap to clone.
#[derive(Clone)]
pub struct JobTracker {
    pool: Pool<MySql>,
    /// Which process writes these records: 'orchestrator', 'volume-daemon',
    /// or 'scheduler'
    owner: &'static str,
}

impl JobTracker {
    pub fn new(pool: Pool<MySql>, owner: &'static str) -> Self {
        Self { pool, owner }
    }

    /// Opens a parent job with a fresh correlation id.
    pub async fn start_job(
        &self,
        job_type: &str,
        vm_context_id: Option<&str>,
    ) -> anyhow::Result<TrackedJob> {
        let correlation_id = format!("corr-{}", Uuid::new_v4());
        self.start_job_correlated(job_type, vm_context_id, &correlation_id).await
    }

    /// Opens a parent job under an existing correlation id, so daemon-side
    /// jobs chain to the orchestrator operation that caused them.
    pub async fn start_job_correlated(
        &self,
        job_type: &str,
        vm_context_id: Option<&str>,
        correlation_id: &str,
    ) -> anyhow::Result<TrackedJob> {
        let job_id = format!("job-{}", Uuid::new_v4());
        job_queries::create_job(
            &self.pool,
            &job_id,
            job_type,
            self.owner,
            vm_context_id,
            correlation_id,
        )
        .await?;

        Ok(TrackedJob {
            pool: self.pool.clone(),
            job_id,
            correlation_id: correlation_id.to_string(),
            next_seq: AtomicI32::new(1),
        })
    }
}

/// An open parent job. Steps are numbered in creation order.
pub struct TrackedJob {
    pool: Pool<MySql>,
    pub job_id: String,
    pub correlation_id: String,
    next_seq: AtomicI32,
}

impl TrackedJob {
    pub async fn step(&self, name: &str) -> anyhow::Result<TrackedStep> {
        let seq = self.next_seq.fetch_add(1, Ordering::SeqCst);
        let step_id = job_queries::create_step(&self.pool, &self.job_id, seq, name).await?;

        Ok(TrackedStep {
            pool: self.pool.clone(),
            step_id,
            name: name.to_string(),
        })
    }

    /// Records the agent-side or cloud-side identifier used by the recovery
    /// scan to find this job in the responsible subsystem.
    pub async fn set_external_id(&self, external_job_id: &str) -> anyhow::Result<()> {
        job_queries::set_external_job_id(&self.pool, &self.job_id, external_job_id).await
    }

    pub async fn complete(&self) -> anyhow::Result<()> {
        job_queries::close_job(&self.pool, &self.job_id, "completed", None).await
    }

    pub async fn fail(&self, error: &str) -> anyhow::Result<()> {
        job_queries::close_job(&self.pool, &self.job_id, "failed", Some(error)).await
    }

    pub async fn cancel(&self) -> anyhow::Result<()> {
        job_queries::close_job(&self.pool, &self.job_id, "cancelled", None).await
    }
}

/// An open step. Log events attach here, not to the parent.
pub struct TrackedStep {
    pool: Pool<MySql>,
    step_id: i64,
    name: String,
}

impl TrackedStep {
    pub async fn info(&self, message: &str) {
        self.log("info", message, None).await;
    }

    pub async fn warn(&self, message: &str) {
        self.log("warn", message, None).await;
    }

    pub async fn error(&self, message: &str) {
        self.log("error", message, None).await;
    }

    pub async fn info_detail(&self, message: &str, detail: &serde_json::Value) {
        self.log("info", message, Some(detail.to_string())).await;
    }

    async fn log(&self, level: &str, message: &str, detail: Option<String>) {
        // Step logging is best-effort; losing an event must not fail the
        // business operation it describes.
        if let Err(e) =
            job_queries::append_log(&self.pool, self.step_id, level, message, detail.as_deref())
                .await
        {
            warn!("Failed to append job log for step {}: {}", self.name, e);
        }
    }

    pub async fn complete(self) -> anyhow::Result<()> {
        job_queries::close_step(&self.pool, self.step_id, "completed", None).await
    }

    pub async fn fail(self, error: &str) -> anyhow::Result<()> {
        job_queries::close_step(&self.pool, self.step_id, "failed", Some(error)).await
    }
}
