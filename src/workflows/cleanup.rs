//! Test-failover rollback: destroy the destination VM, bring the volumes
//! home to the orchestrator, roll them back to their pre-failover
//! snapshots, and return the context to `ready_for_failover`.

use crate::db::queries::{
    failover as failover_queries, vm_context as context_queries, volume as volume_queries,
};
use crate::workflows::{WorkflowError, Workflows};
use log::{info, warn};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

impl Workflows {
    /// Drops snapshots of completed live failovers once the retention
    /// window has passed. Runs periodically from a background task.
    pub async fn purge_live_failover_snapshots(
        &self,
        retention_hours: u32,
    ) -> anyhow::Result<usize> {
        let jobs =
            failover_queries::live_snapshots_past_retention(&self.pool, retention_hours).await?;
        let correlation_id = format!("corr-{}", Uuid::new_v4());
        let mut purged = 0;

        for job in jobs {
            let snapshots: HashMap<String, String> = job
                .snapshot_ids
                .as_deref()
                .map(serde_json::from_str)
                .transpose()
                .unwrap_or_default()
                .unwrap_or_default();

            let mut all_deleted = true;
            for snapshot_id in snapshots.values() {
                if let Err(e) = self.volumes.delete_snapshot(snapshot_id, &correlation_id).await {
                    warn!("Retention purge of snapshot {} failed: {}", snapshot_id, e);
                    all_deleted = false;
                }
            }

            if all_deleted {
                failover_queries::clear_snapshot_ids(&self.pool, &job.id).await?;
                purged += 1;
                info!("Purged retained snapshots of live failover {}", job.id);
            }
        }

        Ok(purged)
    }

    /// Hourly retention loop; spawned at orchestrator startup.
    pub async fn run_snapshot_retention(self: Arc<Self>, retention_hours: u32) {
        loop {
            if let Err(e) = self.purge_live_failover_snapshots(retention_hours).await {
                warn!("Snapshot retention pass failed: {:#}", e);
            }
            tokio::time::sleep(Duration::from_secs(3600)).await;
        }
    }

    pub async fn cleanup_test_failover(&self, context_id: &str) -> Result<(), WorkflowError> {
        // The rollback runs synchronously, so the guard covers the whole
        // workflow by staying in scope here
        let _guard = self.claim_context(context_id)?;

        let job = failover_queries::latest_completed_test(&self.pool, context_id)
            .await?
            .ok_or_else(|| {
                WorkflowError::NotFound(format!("completed test failover for {}", context_id))
            })?;

        let tracked = self.tracker.start_job("failover-cleanup", Some(context_id)).await?;
        let correlation_id = tracked.correlation_id.clone();
        context_queries::update_status(&self.pool, context_id, "cleanup_in_progress").await?;

        let snapshots: HashMap<String, String> = job
            .snapshot_ids
            .as_deref()
            .map(serde_json::from_str)
            .transpose()
            .map_err(|e| WorkflowError::Internal(anyhow::anyhow!("snapshot map unreadable: {}", e)))?
            .unwrap_or_default();

        // 1. Power off and delete the destination VM
        if let Some(vm_id) = &job.destination_vm_id {
            let step = tracked.step("destroy-destination-vm").await?;
            if let Err(e) = self.cloud.stop_vm(vm_id).await {
                // A VM that is already stopped or gone must not block the
                // rollback of the volumes
                warn!("Stopping destination VM {} failed: {}; continuing", vm_id, e);
                step.warn(&format!("stop failed: {}", e)).await;
            }
            match self.cloud.destroy_vm(vm_id).await {
                Ok(()) => step.complete().await?,
                Err(e) => {
                    warn!("Destroying destination VM {} failed: {}; continuing", vm_id, e);
                    step.warn(&format!("destroy failed: {}", e)).await;
                    step.complete().await?;
                }
            }
        }

        // 2+3. Volumes come back to the orchestrator; destroying the VM
        // detached them on the cloud side, reattaching restores the stable
        // names. Exports come back with the next replication job.
        let volumes = volume_queries::list_for_context(&self.pool, context_id).await?;
        let step = tracked.step("reattach-volumes-to-orchestrator").await?;
        for volume in &volumes {
            volume_queries::mark_detached(&self.pool, &volume.volume_id).await?;
            self.volumes
                .attach_to_orchestrator(&volume.volume_id, &correlation_id)
                .await
                .map_err(|e| WorkflowError::Upstream(e.to_string()))?;
        }
        step.complete().await?;

        // 4+5. Roll back to the pre-failover snapshots, then drop them
        let step = tracked.step("rollback-and-delete-snapshots").await?;
        for volume in &volumes {
            let Some(snapshot_id) = snapshots.get(&volume.volume_id) else {
                warn!("Volume {} has no pre-failover snapshot recorded", volume.volume_id);
                step.warn(&format!("no snapshot recorded for {}", volume.volume_id)).await;
                continue;
            };
            self.volumes
                .revert_volume(&volume.volume_id, snapshot_id, &correlation_id)
                .await
                .map_err(|e| WorkflowError::Upstream(e.to_string()))?;
            self.volumes
                .delete_snapshot(snapshot_id, &correlation_id)
                .await
                .map_err(|e| WorkflowError::Upstream(e.to_string()))?;
        }
        step.complete().await?;

        // 6. The context is ready to fail over again
        failover_queries::mark_terminal(&self.pool, &job.id, "cleaned_up", None).await?;
        context_queries::update_status(&self.pool, context_id, "ready_for_failover").await?;
        context_queries::set_last_operation_summary(
            &self.pool,
            context_id,
            &format!("Test failover {} rolled back", job.id),
        )
        .await?;
        tracked.complete().await?;
        info!("Test failover {} cleaned up for {}", job.id, context_id);

        Ok(())
    }
}
