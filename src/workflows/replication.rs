//! The replication workflow: from a context id to a running agent-side copy
//! with volumes provisioned, attached, and exported.

use crate::clients::agent::{DiscoverRequest, DiskTarget, ReplicationSpec};
use crate::db::queries::{
    disk as disk_queries, export as export_queries, failover as failover_queries,
    replication as replication_queries, vm_context as context_queries, volume as volume_queries,
};
use crate::models::disk::VmDisk;
use crate::models::failover::FailoverPhase;
use crate::models::replication::{ReplicationJob, ReplicationType};
use crate::models::vm_context::VmSpec;
use crate::workflows::{WorkflowError, Workflows};
use log::{info, warn};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

const GIB: i64 = 1 << 30;

impl Workflows {
    /// Starts a replication for a managed context. This is the single entry
    /// point: the REST layer and the scheduler both land here, so
    /// validation can never drift between the two.
    pub async fn start_replication(
        self: Arc<Self>,
        context_id: &str,
        requested_type: Option<ReplicationType>,
    ) -> Result<ReplicationJob, WorkflowError> {
        // Held for the entire workflow: the guard moves into the polling
        // task below and releases only when the job reaches a terminal
        // state, so no failover can interleave with the copy
        let guard = self.claim_context(context_id)?;

        let context = context_queries::get_by_id(&self.pool, context_id)
            .await
            .map_err(|_| WorkflowError::NotFound(format!("context {}", context_id)))?;

        // One in-flight replication per context, and none at all while a
        // failover holds the context in phases 2-7
        if let Some(active) = failover_queries::find_active_for_context(&self.pool, context_id).await? {
            let phase_blocks = FailoverPhase::parse(&active.phase)
                .map(|p| p.blocks_replication())
                .unwrap_or(true);
            if phase_blocks {
                return Err(WorkflowError::Conflict(format!(
                    "context {} is in failover phase {}",
                    context_id, active.phase
                )));
            }
        }
        if let Some(job) = replication_queries::find_active_for_context(&self.pool, context_id).await? {
            return Err(WorkflowError::Conflict(format!(
                "context {} already has replication job {} in flight",
                context_id, job.id
            )));
        }

        let orphans =
            volume_queries::unacknowledged_orphans_for_context(&self.pool, context_id).await?;
        if !orphans.is_empty() {
            return Err(WorkflowError::Conflict(format!(
                "context {} has {} unacknowledged correlation failure(s)",
                context_id,
                orphans.len()
            )));
        }

        // Specs always come fresh from the hypervisor at job start; the
        // cached context row is for display only
        let tracked = self.tracker.start_job("replication", Some(context_id)).await?;
        let correlation_id = tracked.correlation_id.clone();

        let discover_step = tracked.step("discover-source-vm").await?;
        let spec = match self.discover_single_vm(&context, &correlation_id).await {
            Ok(spec) => {
                discover_step.complete().await?;
                spec
            }
            Err(e) => {
                discover_step.fail(&e.to_string()).await?;
                tracked.fail(&e.to_string()).await?;
                return Err(e);
            }
        };
        context_queries::update_cached_specs(&self.pool, context_id, &spec).await?;

        if let Err(e) = self.agent.enable_cbt(&spec.vmware_path, &correlation_id).await {
            tracked.fail(&e.to_string()).await?;
            return Err(WorkflowError::Upstream(e.to_string()));
        }

        let job_id = format!("repl-{}", Uuid::new_v4());

        // The per-disk CBT decision reads the existing (context, disk_key)
        // row; a disk first seen in this discovery has no row and therefore
        // no cursor, so it gets an initial pass even when its siblings run
        // incrementally
        let mut cursors: Vec<Option<String>> = Vec::with_capacity(spec.disks.len());
        for disk_spec in &spec.disks {
            let prior_cursor = match requested_type {
                Some(ReplicationType::Initial) => None,
                _ => disk_queries::get_disk(&self.pool, context_id, &disk_spec.disk_key)
                    .await?
                    .and_then(|d| d.change_id),
            };
            cursors.push(prior_cursor);
        }

        // Job-level type is derived from the per-disk decisions: any disk
        // without a prior cursor forces an initial pass for that disk
        let job_type = if !cursors.is_empty() && cursors.iter().all(|c| c.is_some()) {
            ReplicationType::Incremental
        } else {
            ReplicationType::Initial
        };

        replication_queries::create_job(
            &self.pool,
            &job_id,
            context_id,
            job_type.as_str(),
            &correlation_id,
        )
        .await?;

        // Disk rows are upserted keyed by (context, disk_key): re-runs
        // update in place, never duplicate
        let prepare_step = tracked.step("prepare-disks-and-volumes").await?;
        let mut disks: Vec<(VmDisk, Option<String>)> = Vec::new();
        for (disk_spec, prior_cursor) in spec.disks.iter().zip(cursors.into_iter()) {
            let disk =
                disk_queries::upsert_disk(&self.pool, context_id, disk_spec, &job_id).await?;
            disks.push((disk, prior_cursor));
        }

        let targets = match self
            .provision_and_export(&job_id, &disks, &correlation_id)
            .await
        {
            Ok(targets) => {
                prepare_step.complete().await?;
                targets
            }
            Err(e) => {
                prepare_step.fail(&e.to_string()).await?;
                tracked.fail(&e.to_string()).await?;
                replication_queries::mark_terminal(&self.pool, &job_id, "failed", Some(&e.to_string()))
                    .await?;
                return Err(e);
            }
        };

        let start_step = tracked.step("start-agent-replication").await?;
        let agent_spec = ReplicationSpec {
            job_id: job_id.clone(),
            vm_path: spec.vmware_path.clone(),
            disks: targets,
        };

        let agent_job_id = match self.agent.start_replication(&agent_spec, &correlation_id).await {
            Ok(agent_job_id) => {
                start_step.complete().await?;
                agent_job_id
            }
            Err(e) => {
                start_step.fail(&e.to_string()).await?;
                tracked.fail(&e.to_string()).await?;
                replication_queries::mark_terminal(&self.pool, &job_id, "failed", Some(&e.to_string()))
                    .await?;
                return Err(WorkflowError::Upstream(e.to_string()));
            }
        };

        let total_bytes: i64 = spec.disks.iter().map(|d| d.size_bytes).sum();
        replication_queries::mark_running(&self.pool, &job_id, &agent_job_id, total_bytes).await?;
        context_queries::update_status(&self.pool, context_id, "replicating").await?;
        tracked.set_external_id(&job_id).await?;

        let job = replication_queries::get_job(&self.pool, &job_id).await?;
        info!(
            "Replication {} started for {} ({} disk(s), {})",
            job_id,
            context_id,
            spec.disks.len(),
            job_type.as_str()
        );

        // Progress polling owns the rest of the lifecycle and carries the
        // context lock with it
        let workflows = self.clone();
        let context_id = context_id.to_string();
        tokio::spawn(async move {
            let _guard = guard;
            workflows.poll_replication(tracked, context_id, job_id, agent_job_id).await;
        });

        Ok(job)
    }

    async fn discover_single_vm(
        &self,
        context: &crate::models::vm_context::VmContext,
        correlation_id: &str,
    ) -> Result<VmSpec, WorkflowError> {
        let request = DiscoverRequest {
            credential_id: context.credential_id,
            vm_path_filter: Some(context.vmware_path.clone()),
        };

        let vms = self
            .agent
            .discover_vms(&request, correlation_id)
            .await
            .map_err(|e| WorkflowError::Upstream(e.to_string()))?;

        vms.into_iter()
            .find(|vm| vm.vmware_path == context.vmware_path)
            .ok_or_else(|| {
                WorkflowError::Validation(format!(
                    "source VM {} no longer exists on {}",
                    context.vmware_path, context.vcenter_host
                ))
            })
    }

    /// One destination volume per source disk (created once, reused on
    /// incrementals), attached to the orchestrator, exported under the
    /// deterministic (job, disk) name.
    async fn provision_and_export(
        &self,
        job_id: &str,
        disks: &[(VmDisk, Option<String>)],
        correlation_id: &str,
    ) -> Result<Vec<DiskTarget>, WorkflowError> {
        let mut targets = Vec::with_capacity(disks.len());

        for (disk, prior_cursor) in disks {
            let volume_id = match volume_queries::get_for_disk(&self.pool, disk.id).await? {
                Some(volume) => volume.volume_id,
                None => {
                    let size_gb = (disk.size_bytes + GIB - 1) / GIB;
                    self.volumes
                        .create_volume(size_gb, Some(disk.id), correlation_id)
                        .await
                        .map_err(|e| WorkflowError::Upstream(e.to_string()))?
                }
            };

            let volume = volume_queries::get_by_volume_id(&self.pool, &volume_id).await?;
            let already_on_oma =
                volume.status == "attached" && volume.operation_mode.as_deref() == Some("oma");
            if !already_on_oma {
                self.volumes
                    .attach_to_orchestrator(&volume_id, correlation_id)
                    .await
                    .map_err(|e| WorkflowError::Upstream(e.to_string()))?;
            }

            let export = self
                .volumes
                .create_export(&volume_id, job_id, disk.id, false, correlation_id)
                .await
                .map_err(|e| WorkflowError::Upstream(e.to_string()))?;

            targets.push(DiskTarget {
                disk_key: disk.disk_key.clone(),
                export_url: export.url,
                change_id: prior_cursor.clone(),
            });
        }

        Ok(targets)
    }

    /// Polls agent progress on a fixed cadence until the job reaches a
    /// terminal stage, then applies the closing side effects.
    async fn poll_replication(
        self: Arc<Self>,
        tracked: crate::jobtracker::TrackedJob,
        context_id: String,
        job_id: String,
        agent_job_id: String,
    ) {
        let interval = Duration::from_secs(self.timeouts.progress_poll_interval_secs);

        loop {
            tokio::time::sleep(interval).await;

            let progress = match self.agent.progress(&agent_job_id).await {
                Ok(progress) => progress,
                Err(e) => {
                    warn!("Progress poll for {} failed: {}; retrying", job_id, e);
                    continue;
                }
            };

            let _ = replication_queries::update_progress(
                &self.pool,
                &job_id,
                progress.bytes_transferred as i64,
                progress.throughput_bps as i64,
                progress.current_disk.as_deref(),
            )
            .await;

            match progress.stage.as_str() {
                "completed" => {
                    let _ = replication_queries::mark_terminal(&self.pool, &job_id, "completed", None)
                        .await;
                    let _ = context_queries::update_status(&self.pool, &context_id, "ready_for_failover")
                        .await;
                    let _ = context_queries::set_last_operation_summary(
                        &self.pool,
                        &context_id,
                        &format!("Replication {} completed ({} bytes)", job_id, progress.bytes_transferred),
                    )
                    .await;
                    let _ = tracked.complete().await;
                    info!("Replication {} completed", job_id);
                    return;
                }
                "failed" => {
                    let reason = progress.error.unwrap_or_else(|| "agent reported failure".into());
                    let _ = replication_queries::mark_terminal(
                        &self.pool,
                        &job_id,
                        "failed",
                        Some(&reason),
                    )
                    .await;
                    let _ = context_queries::update_status(&self.pool, &context_id, "failed").await;
                    let _ = context_queries::set_last_operation_summary(
                        &self.pool,
                        &context_id,
                        &format!("Replication {} failed: {}", job_id, reason),
                    )
                    .await;
                    let _ = tracked.fail(&reason).await;
                    return;
                }
                _ => {}
            }
        }
    }

    /// Respawns progress polling for replications that were running when
    /// the orchestrator went down and whose agent-side jobs are still
    /// alive. Called after the recovery scan has closed everything the
    /// agent no longer knows about.
    pub async fn resume_active_replications(self: Arc<Self>) -> anyhow::Result<usize> {
        let jobs = replication_queries::list_active(&self.pool).await?;
        let mut resumed = 0;

        for job in jobs {
            let Some(agent_job_id) = job.agent_job_id.clone() else {
                continue;
            };

            // Resumed copies hold the context lock exactly as fresh ones do
            let guard = match self.claim_context(&job.vm_context_id) {
                Ok(guard) => guard,
                Err(_) => {
                    warn!(
                        "Context {} already locked while resuming {}; skipping",
                        job.vm_context_id, job.id
                    );
                    continue;
                }
            };

            let tracked = self
                .tracker
                .start_job_correlated("replication-resume", Some(&job.vm_context_id), &job.correlation_id)
                .await?;
            tracked.set_external_id(&job.id).await?;

            info!("Resuming progress polling for replication {}", job.id);
            let workflows = self.clone();
            let context_id = job.vm_context_id.clone();
            let job_id = job.id.clone();
            tokio::spawn(async move {
                let _guard = guard;
                workflows.poll_replication(tracked, context_id, job_id, agent_job_id).await;
            });
            resumed += 1;
        }

        Ok(resumed)
    }

    /// Cancels a replication. Volumes stay attached to the orchestrator for
    /// the next attempt; exports are withdrawn so the agent's writers lose
    /// their targets and stop at the current chunk.
    pub async fn cancel_replication(&self, job_id: &str) -> Result<(), WorkflowError> {
        let job = replication_queries::get_job(&self.pool, job_id)
            .await
            .map_err(|_| WorkflowError::NotFound(format!("replication job {}", job_id)))?;

        if job.status != "running" && job.status != "pending" {
            return Err(WorkflowError::Conflict(format!(
                "replication job {} is already {}",
                job_id, job.status
            )));
        }

        // Volumes currently attached to a destination VM mean a failover
        // owns them; cancellation must not yank exports out from under it
        let volumes = volume_queries::list_for_context(&self.pool, &job.vm_context_id).await?;
        if volumes
            .iter()
            .any(|v| v.operation_mode.as_deref() == Some("failover"))
        {
            return Err(WorkflowError::Conflict(
                "volumes are attached to a destination VM".to_string(),
            ));
        }

        for volume in &volumes {
            for export in export_queries::list_for_volume(&self.pool, &volume.volume_id).await? {
                if export.job_id == job_id {
                    self.volumes
                        .delete_export(&export.export_name, &job.correlation_id)
                        .await
                        .map_err(|e| WorkflowError::Upstream(e.to_string()))?;
                }
            }
        }

        replication_queries::mark_terminal(&self.pool, job_id, "cancelled", None).await?;

        // Fall back to the pre-replication status: a context whose disks
        // all carry cursors was already seeded by an earlier run
        let disks = disk_queries::list_disks_for_context(&self.pool, &job.vm_context_id).await?;
        let status = if !disks.is_empty() && disks.iter().all(|d| d.change_id.is_some()) {
            "ready_for_failover"
        } else {
            "discovered"
        };
        context_queries::update_status(&self.pool, &job.vm_context_id, status).await?;

        info!("Replication {} cancelled", job_id);
        Ok(())
    }
}
