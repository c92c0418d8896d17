//! Test and live failover.
//!
//! The two machines share phases and differ in networking and rollback
//! policy: a test failover must leave the source untouched and be fully
//! reversible; a live failover has no rollback once the destination VM is
//! powered on.

use crate::clients::agent::DiscoverRequest;
use crate::clients::cloudstack::DeployVmSpec;
use crate::db::queries::{
    disk as disk_queries, failover as failover_queries, network_mapping as mapping_queries,
    replication as replication_queries, vm_context as context_queries, volume as volume_queries,
};
use crate::models::cloud_config::OsseaConfig;
use crate::models::failover::{FailoverJob, FailoverPhase, FailoverType};
use crate::models::network_mapping::NetworkMapping;
use crate::models::vm_context::VmSpec;
use crate::workflows::{WorkflowError, Workflows};
use log::{info, warn};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

/// Templates at or above this intrinsic size cannot have their root disk
/// overridden downward by the cloud; validation rejects them up front
/// instead of letting the deploy fail deep inside the cloud API.
pub const MAX_TEMPLATE_SIZE_GB: i64 = 2;

impl Workflows {
    /// Runs validation synchronously, then drives the remaining phases in
    /// the background. The returned job row is in phase `validate`; the
    /// background task advances it from `snapshot` onward while holding the
    /// context lock, so no replication can start in between.
    pub async fn start_failover(
        self: Arc<Self>,
        context_id: &str,
        failover_type: FailoverType,
    ) -> Result<FailoverJob, WorkflowError> {
        // Moves into the phase-driving task below; released only once the
        // failover reaches a terminal status
        let guard = self.claim_context(context_id)?;

        let context = context_queries::get_by_id(&self.pool, context_id)
            .await
            .map_err(|_| WorkflowError::NotFound(format!("context {}", context_id)))?;

        // Phase 1: validate. Nothing is mutated until this passes.
        if let Some(job) = replication_queries::find_active_for_context(&self.pool, context_id).await? {
            return Err(WorkflowError::Conflict(format!(
                "replication job {} is in flight on this context",
                job.id
            )));
        }
        if let Some(job) = failover_queries::find_active_for_context(&self.pool, context_id).await? {
            return Err(WorkflowError::Conflict(format!(
                "failover job {} is already running on this context",
                job.id
            )));
        }

        let config = crate::db::queries::cloud_config::get_active(&self.pool)
            .await?
            .ok_or_else(|| WorkflowError::Validation("no active cloud configuration".into()))?;

        let template_size = self
            .cloud
            .template_size_gb(&config.template_id)
            .await
            .map_err(|e| WorkflowError::Upstream(e.to_string()))?;
        if template_size >= MAX_TEMPLATE_SIZE_GB {
            return Err(WorkflowError::Validation(format!(
                "template {} has fixed root disk {} GiB; select a template with intrinsic size < {} GiB",
                config.template_id, template_size, MAX_TEMPLATE_SIZE_GB
            )));
        }

        let disks = disk_queries::list_disks_for_context(&self.pool, context_id).await?;
        if disks.is_empty() || disks.iter().any(|d| d.ossea_volume_id.is_none()) {
            return Err(WorkflowError::Validation(format!(
                "context {} has no replicated volumes to fail over",
                context_id
            )));
        }

        let tracked = self
            .tracker
            .start_job(
                match failover_type {
                    FailoverType::Test => "failover-test",
                    FailoverType::Live => "failover-live",
                },
                Some(context_id),
            )
            .await?;

        let job_id = format!("fo-{}", Uuid::new_v4());
        let network_strategy = match failover_type {
            FailoverType::Test => "test",
            FailoverType::Live => "production",
        };
        let job = failover_queries::create_job(
            &self.pool,
            &job_id,
            context_id,
            failover_type.as_str(),
            network_strategy,
        )
        .await?;
        tracked.set_external_id(&job_id).await?;

        let workflows = self.clone();
        let context_id = context_id.to_string();
        tokio::spawn(async move {
            let _guard = guard;
            if let Err(e) = workflows
                .run_failover_phases(&tracked, &context_id, &job_id, failover_type, &config)
                .await
            {
                warn!("Failover {} failed: {}", job_id, e);
                let _ = failover_queries::mark_terminal(&workflows.pool, &job_id, "failed", Some(&e.to_string())).await;
                let _ = context_queries::update_status(&workflows.pool, &context_id, "failed").await;
                let _ = context_queries::set_last_operation_summary(
                    &workflows.pool,
                    &context_id,
                    &format!("Failover {} failed: {}", job_id, e),
                )
                .await;
                let _ = tracked.fail(&e.to_string()).await;
            }
        });

        Ok(job)
    }

    async fn run_failover_phases(
        &self,
        tracked: &crate::jobtracker::TrackedJob,
        context_id: &str,
        job_id: &str,
        failover_type: FailoverType,
        config: &OsseaConfig,
    ) -> Result<(), WorkflowError> {
        let correlation_id = tracked.correlation_id.clone();
        let context = context_queries::get_by_id(&self.pool, context_id).await?;
        let disks = disk_queries::list_disks_for_context(&self.pool, context_id).await?;
        let volumes = volume_queries::list_for_context(&self.pool, context_id).await?;

        // Phase 2: snapshot every destination volume
        self.enter_phase(job_id, FailoverPhase::Snapshot).await?;
        let step = tracked.step("snapshot-volumes").await?;
        let mut snapshots: HashMap<String, String> = HashMap::new();
        for volume in &volumes {
            let snapshot_id = self
                .volumes
                .snapshot_volume(&volume.volume_id, &correlation_id)
                .await
                .map_err(|e| WorkflowError::Upstream(e.to_string()))?;
            snapshots.insert(volume.volume_id.clone(), snapshot_id);
        }
        failover_queries::set_snapshot_ids(
            &self.pool,
            job_id,
            &serde_json::to_string(&snapshots).expect("string map serializes"),
        )
        .await?;
        step.complete().await?;

        // Phase 3: detach from the orchestrator; exports go with it
        self.enter_phase(job_id, FailoverPhase::DetachFromOma).await?;
        let step = tracked.step("detach-from-orchestrator").await?;
        for volume in &volumes {
            self.volumes
                .detach(&volume.volume_id, &correlation_id)
                .await
                .map_err(|e| WorkflowError::Upstream(e.to_string()))?;
        }
        step.complete().await?;

        // Phase 4: driver injection for Windows guests
        if context
            .os_type
            .as_deref()
            .map(|os| os.to_lowercase().contains("windows"))
            .unwrap_or(false)
        {
            self.enter_phase(job_id, FailoverPhase::InjectDrivers).await?;
            let step = tracked.step("inject-virtio-drivers").await?;
            let root_volume = volumes.first().ok_or_else(|| {
                WorkflowError::Internal(anyhow::anyhow!("context has no volumes at inject phase"))
            })?;
            match inject_drivers(&root_volume.volume_id) {
                Ok(()) => step.complete().await?,
                Err(e) => {
                    step.fail(&e).await?;
                    return Err(WorkflowError::Upstream(e));
                }
            }
        }

        // Phase 5: create the destination VM from fresh specs, no root disk
        self.enter_phase(job_id, FailoverPhase::CreateVm).await?;
        let step = tracked.step("create-destination-vm").await?;
        let spec = self.fresh_specs_for(&context, &correlation_id).await?;
        let mappings = mapping_queries::list_for_context(&self.pool, context_id).await?;

        let mut network_ids = Vec::new();
        for source_network in &spec.networks {
            let mapping = mappings
                .iter()
                .find(|m| &m.source_network_name == source_network);
            let (network_id, fell_back) =
                select_network(mapping, failover_type, &config.default_network_id);
            if fell_back {
                warn!(
                    "No {} network mapping for {} on {}; using the default network",
                    failover_type.as_str(),
                    source_network,
                    context_id
                );
                step.warn(&format!(
                    "network {} unmapped; defaulted to {}",
                    source_network, network_id
                ))
                .await;
            }
            network_ids.push(network_id);
        }
        network_ids.dedup();

        let vm_name = match failover_type {
            FailoverType::Test => format!("{}-test", context.vm_name),
            FailoverType::Live => context.vm_name.clone(),
        };
        let deploy = DeployVmSpec {
            name: vm_name,
            cpu_count: spec.cpu_count,
            memory_mb: spec.memory_mb,
            service_offering_id: config.service_offering_id.clone(),
            template_id: config.template_id.clone(),
            zone_id: config.zone_id.clone(),
            network_ids,
        };
        let destination_vm_id = self
            .cloud
            .deploy_vm(&deploy)
            .await
            .map_err(|e| WorkflowError::Upstream(e.to_string()))?;
        failover_queries::set_destination_vm(&self.pool, job_id, &destination_vm_id).await?;
        step.info(&format!("destination VM {} created", destination_vm_id)).await;
        step.complete().await?;

        // Phase 6: attach replicated volumes in original bus/unit order
        self.enter_phase(job_id, FailoverPhase::AttachVolumes).await?;
        let step = tracked.step("attach-volumes-to-destination").await?;
        for disk in &disks {
            let volume = volume_queries::get_for_disk(&self.pool, disk.id)
                .await?
                .ok_or_else(|| {
                    WorkflowError::Internal(anyhow::anyhow!("disk {} lost its volume", disk.disk_key))
                })?;
            self.volumes
                .attach_to_vm(&volume.volume_id, &destination_vm_id, &correlation_id)
                .await
                .map_err(|e| WorkflowError::Upstream(e.to_string()))?;
        }
        step.complete().await?;

        // Phase 7: power on
        self.enter_phase(job_id, FailoverPhase::PowerOn).await?;
        let step = tracked.step("power-on-destination").await?;
        self.cloud
            .start_vm(&destination_vm_id)
            .await
            .map_err(|e| WorkflowError::Upstream(e.to_string()))?;
        step.complete().await?;

        // Phase 8: verify the VM reports running; advisory only
        self.enter_phase(job_id, FailoverPhase::Verify).await?;
        let step = tracked.step("verify-running").await?;
        let deadline = tokio::time::Instant::now() + Duration::from_secs(120);
        loop {
            match self.cloud.vm_state(&destination_vm_id).await {
                Ok(state) if state == "Running" => break,
                Ok(_) | Err(_) if tokio::time::Instant::now() < deadline => {
                    tokio::time::sleep(Duration::from_secs(5)).await;
                }
                Ok(state) => {
                    step.warn(&format!("destination VM is {} after power-on", state)).await;
                    break;
                }
                Err(e) => {
                    step.warn(&format!("verify poll failed: {}", e)).await;
                    break;
                }
            }
        }
        step.complete().await?;

        failover_queries::update_phase(&self.pool, job_id, FailoverPhase::Completed.as_str()).await?;
        failover_queries::mark_terminal(&self.pool, job_id, "completed", None).await?;
        let final_status = match failover_type {
            FailoverType::Test => "failed_over_test",
            FailoverType::Live => "failed_over_live",
        };
        context_queries::update_status(&self.pool, context_id, final_status).await?;
        context_queries::set_last_operation_summary(
            &self.pool,
            context_id,
            &format!(
                "{} failover completed; destination VM {}",
                failover_type.as_str(),
                destination_vm_id
            ),
        )
        .await?;
        tracked.complete().await?;
        info!("Failover {} completed for {}", job_id, context_id);

        Ok(())
    }

    async fn enter_phase(&self, job_id: &str, phase: FailoverPhase) -> Result<(), WorkflowError> {
        failover_queries::update_phase(&self.pool, job_id, phase.as_str()).await?;
        Ok(())
    }

    async fn fresh_specs_for(
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
                    "source VM {} disappeared before failover",
                    context.vmware_path
                ))
            })
    }
}

/// Picks the destination network for one source network. Returns the id and
/// whether the default-network fallback was taken.
pub fn select_network(
    mapping: Option<&NetworkMapping>,
    failover_type: FailoverType,
    default_network_id: &str,
) -> (String, bool) {
    let mapped = mapping.and_then(|m| match failover_type {
        FailoverType::Test => m.test_network_id.clone(),
        FailoverType::Live => m.destination_network_id.clone(),
    });

    match mapped {
        Some(id) => (id, false),
        None => (default_network_id.to_string(), true),
    }
}

/// Runs the appliance's driver-injection tool against a replicated root
/// volume in place. The tool itself ships with the appliance image.
fn inject_drivers(volume_id: &str) -> Result<(), String> {
    let status = std::process::Command::new("oma-driver-inject")
        .arg("--volume")
        .arg(volume_id)
        .status()
        .map_err(|e| format!("launching oma-driver-inject: {}", e))?;

    if !status.success() {
        return Err(format!("oma-driver-inject exited with {}", status));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn mapping(test: Option<&str>, production: Option<&str>) -> NetworkMapping {
        NetworkMapping {
            id: 1,
            vm_context_id: "ctx-a".into(),
            source_network_name: "VM Network".into(),
            destination_network_id: production.map(str::to_string),
            test_network_id: test.map(str::to_string),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn test_failover_uses_the_test_network() {
        let m = mapping(Some("net-test"), Some("net-prod"));
        let (id, fell_back) = select_network(Some(&m), FailoverType::Test, "net-default");
        assert_eq!(id, "net-test");
        assert!(!fell_back);
    }

    #[test]
    fn live_failover_uses_the_production_network() {
        let m = mapping(Some("net-test"), Some("net-prod"));
        let (id, fell_back) = select_network(Some(&m), FailoverType::Live, "net-default");
        assert_eq!(id, "net-prod");
        assert!(!fell_back);
    }

    #[test]
    fn missing_mapping_falls_back_to_the_default() {
        let (id, fell_back) = select_network(None, FailoverType::Test, "net-default");
        assert_eq!(id, "net-default");
        assert!(fell_back);

        // A row that exists but lacks the side we need also falls back
        let m = mapping(None, Some("net-prod"));
        let (id, fell_back) = select_network(Some(&m), FailoverType::Test, "net-default");
        assert_eq!(id, "net-default");
        assert!(fell_back);
    }
}
