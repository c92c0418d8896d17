use crate::db::queries::{job as job_queries, replication as replication_queries, vm_context as context_queries};
use crate::models::job::Job;
use async_trait::async_trait;
use log::{info, warn};
use sqlx::{MySql, Pool};
use std::collections::HashMap;
use std::sync::Arc;

/// What the responsible subsystem says about a job the orchestrator believes
/// is open.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubsystemStatus {
    Running,
    Completed,
    Failed(String),
    /// The subsystem has no record of the job at all
    NoRecord,
}

/// What the recovery scan does with an open job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecoveryAction {
    ResumePolling,
    CloseCompleted,
    CloseFailed(String),
}

/// Maps the subsystem's answer to the scan's action. Marking a job failed
/// without asking is exactly the bug this exists to prevent: a job that is
/// genuinely running keeps writing to exports whose orchestrator-side
/// records would claim to be dead.
pub fn decide(status: &SubsystemStatus) -> RecoveryAction {
    match status {
        SubsystemStatus::Running => RecoveryAction::ResumePolling,
        SubsystemStatus::Completed => RecoveryAction::CloseCompleted,
        SubsystemStatus::Failed(reason) => RecoveryAction::CloseFailed(reason.clone()),
        SubsystemStatus::NoRecord => {
            RecoveryAction::CloseFailed("subsystem has no record of this job".to_string())
        }
    }
}

/// Asks one subsystem for the current status of a job it owns.
#[async_trait]
pub trait StatusProbe: Send + Sync {
    async fn probe(&self, job: &Job) -> anyhow::Result<SubsystemStatus>;
}

/// Startup recovery scan. Probes are registered per job-type prefix
/// ("replication" → agent, "volume" → volume daemon, "failover" → internal
/// table state).
pub struct RecoveryScanner {
    pool: Pool<MySql>,
    probes: HashMap<&'static str, Arc<dyn StatusProbe>>,
}

impl RecoveryScanner {
    pub fn new(pool: Pool<MySql>) -> Self {
        Self {
            pool,
            probes: HashMap::new(),
        }
    }

    pub fn register_probe(&mut self, job_type_prefix: &'static str, probe: Arc<dyn StatusProbe>) {
        self.probes.insert(job_type_prefix, probe);
    }

    /// Enumerates open jobs and reconciles each against its subsystem.
    /// Returns the job ids left open for the poll loops to pick back up.
    pub async fn run(&self) -> anyhow::Result<Vec<String>> {
        let open_jobs = job_queries::list_active(&self.pool).await?;
        info!("Recovery scan: {} open job(s) to reconcile", open_jobs.len());

        let mut resumed = Vec::new();

        for job in open_jobs {
            let probe = self
                .probes
                .iter()
                .find(|(prefix, _)| job.job_type.starts_with(*prefix))
                .map(|(_, probe)| probe.clone());

            let status = match probe {
                Some(probe) => match probe.probe(&job).await {
                    Ok(status) => status,
                    Err(e) => {
                        // Unreachable subsystem is not evidence of failure.
                        // Leave the job open and let the next scan retry.
                        warn!(
                            "Recovery probe for job {} ({}) failed: {}; leaving open",
                            job.id, job.job_type, e
                        );
                        resumed.push(job.id.clone());
                        continue;
                    }
                },
                None => {
                    warn!("No recovery probe for job type {}; leaving open", job.job_type);
                    resumed.push(job.id.clone());
                    continue;
                }
            };

            match decide(&status) {
                RecoveryAction::ResumePolling => {
                    info!("Job {} still running in its subsystem; resuming polling", job.id);
                    resumed.push(job.id.clone());
                }
                RecoveryAction::CloseCompleted => {
                    info!("Job {} completed while orchestrator was down; closing", job.id);
                    job_queries::close_job(&self.pool, &job.id, "completed", None).await?;
                    self.apply_completion_side_effects(&job).await?;
                }
                RecoveryAction::CloseFailed(reason) => {
                    info!("Job {} failed while orchestrator was down: {}", job.id, reason);
                    job_queries::close_job(&self.pool, &job.id, "failed", Some(&reason)).await?;
                    self.apply_failure_side_effects(&job, &reason).await?;
                }
            }
        }

        Ok(resumed)
    }

    /// A replication that finished while we were down still needs its
    /// business records closed. CBT cursors are not reconstructed here: the
    /// agent delivers them through the changeid callback, which lands
    /// whether or not the orchestrator restarted in between.
    async fn apply_completion_side_effects(&self, job: &Job) -> anyhow::Result<()> {
        if !job.job_type.starts_with("replication") {
            return Ok(());
        }

        if let Some(external_id) = &job.external_job_id {
            replication_queries::mark_terminal(&self.pool, external_id, "completed", None).await?;
        }
        if let Some(context_id) = &job.vm_context_id {
            context_queries::update_status(&self.pool, context_id, "ready_for_failover").await?;
        }
        Ok(())
    }

    async fn apply_failure_side_effects(&self, job: &Job, reason: &str) -> anyhow::Result<()> {
        if job.job_type.starts_with("replication") {
            if let Some(external_id) = &job.external_job_id {
                replication_queries::mark_terminal(&self.pool, external_id, "failed", Some(reason))
                    .await?;
            }
            if let Some(context_id) = &job.vm_context_id {
                context_queries::update_status(&self.pool, context_id, "failed").await?;
                context_queries::set_last_operation_summary(
                    &self.pool,
                    context_id,
                    &format!("Replication failed during orchestrator restart recovery: {}", reason),
                )
                .await?;
            }
        }
        Ok(())
    }
}

/// Probe for volume-daemon jobs. Daemon operations are short and
/// serialized; after a restart the durable volume row is the subsystem's
/// answer: an attach whose volume ended up attached completed, one whose
/// volume did not has no surviving work to resume.
pub struct VolumeOpProbe {
    pool: Pool<MySql>,
}

impl VolumeOpProbe {
    pub fn new(pool: Pool<MySql>) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl StatusProbe for VolumeOpProbe {
    async fn probe(&self, job: &Job) -> anyhow::Result<SubsystemStatus> {
        use crate::db::queries::volume as volume_queries;

        let Some(volume_id) = &job.external_job_id else {
            return Ok(SubsystemStatus::NoRecord);
        };

        let volume = match volume_queries::get_by_volume_id(&self.pool, volume_id).await {
            Ok(volume) => volume,
            Err(_) => return Ok(SubsystemStatus::NoRecord),
        };

        Ok(match (job.job_type.as_str(), volume.status.as_str()) {
            ("volume-attach", "attached") => SubsystemStatus::Completed,
            ("volume-detach", "available") => SubsystemStatus::Completed,
            ("volume-create", "available") | ("volume-create", "attached") => {
                SubsystemStatus::Completed
            }
            _ => SubsystemStatus::Failed(format!(
                "volume {} is '{}' after daemon restart",
                volume_id, volume.status
            )),
        })
    }
}

/// Probe for failover jobs. The driving task lives inside the orchestrator
/// process, so a restart killed it; the failover row records how far it
/// got. Anything short of a terminal status failed with the process.
pub struct FailoverProbe {
    pool: Pool<MySql>,
}

impl FailoverProbe {
    pub fn new(pool: Pool<MySql>) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl StatusProbe for FailoverProbe {
    async fn probe(&self, job: &Job) -> anyhow::Result<SubsystemStatus> {
        use crate::db::queries::failover as failover_queries;

        let Some(failover_id) = &job.external_job_id else {
            return Ok(SubsystemStatus::NoRecord);
        };

        let failover = match failover_queries::get_job(&self.pool, failover_id).await {
            Ok(failover) => failover,
            Err(_) => return Ok(SubsystemStatus::NoRecord),
        };

        Ok(match failover.status.as_str() {
            "completed" | "cleaned_up" => SubsystemStatus::Completed,
            "failed" => SubsystemStatus::Failed(
                failover
                    .error_message
                    .unwrap_or_else(|| "failover failed".to_string()),
            ),
            _ => SubsystemStatus::Failed(format!(
                "orchestrator restarted during failover phase {}",
                failover.phase
            )),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn running_jobs_resume_rather_than_fail() {
        assert_eq!(decide(&SubsystemStatus::Running), RecoveryAction::ResumePolling);
    }

    #[test]
    fn completed_jobs_close_completed() {
        assert_eq!(decide(&SubsystemStatus::Completed), RecoveryAction::CloseCompleted);
    }

    #[test]
    fn missing_record_closes_failed() {
        match decide(&SubsystemStatus::NoRecord) {
            RecoveryAction::CloseFailed(reason) => assert!(reason.contains("no record")),
            other => panic!("unexpected action: {:?}", other),
        }
    }

    #[test]
    fn subsystem_failure_reason_is_preserved() {
        let status = SubsystemStatus::Failed("disk read error".to_string());
        assert_eq!(
            decide(&status),
            RecoveryAction::CloseFailed("disk read error".to_string())
        );
    }
}
