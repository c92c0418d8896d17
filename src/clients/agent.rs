use crate::jobtracker::{StatusProbe, SubsystemStatus, CORRELATION_HEADER};
use crate::models::job::Job;
use crate::models::vm_context::VmSpec;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum AgentError {
    #[error("Agent unreachable through the control tunnel: {0}")]
    Transport(String),

    #[error("Agent rejected the request: {0}")]
    Api(String),

    #[error("Agent has no record of job {0}")]
    UnknownJob(String),
}

/// One disk's copy target in a replication spec: the source disk key, the
/// export URL on the orchestrator's data address, and the prior CBT cursor
/// when this disk runs incrementally.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiskTarget {
    pub disk_key: String,
    pub export_url: String,
    pub change_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicationSpec {
    /// Agent-side job identifier the agent reports progress under
    pub job_id: String,
    pub vm_path: String,
    pub disks: Vec<DiskTarget>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentProgress {
    pub stage: String, // enum: 'queued', 'copying', 'completed', 'failed'
    pub percent: f64,
    pub bytes_transferred: u64,
    pub total_bytes: u64,
    pub throughput_bps: u64,
    pub current_disk: Option<String>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoverRequest {
    pub credential_id: Option<i64>,
    /// Single-VM filter by inventory path; empty discovers everything
    pub vm_path_filter: Option<String>,
}

/// Client for the migration agent's API, reached through the SSH control
/// tunnel's local forward. The bearer token is issued during enrollment.
#[derive(Clone)]
pub struct AgentClient {
    http: reqwest::Client,
    base_url: String,
    bearer_token: String,
}

impl AgentClient {
    pub fn new(base_url: String, bearer_token: String, discover_timeout: Duration) -> Self {
        let http = reqwest::Client::builder()
            .timeout(discover_timeout)
            .build()
            .expect("reqwest client construction cannot fail with static config");

        Self {
            http,
            base_url,
            bearer_token,
        }
    }

    async fn call<B: Serialize, R: for<'de> Deserialize<'de>>(
        &self,
        path: &str,
        body: &B,
        correlation_id: &str,
    ) -> Result<R, AgentError> {
        let response = self
            .http
            .post(format!("{}{}", self.base_url, path))
            .bearer_auth(&self.bearer_token)
            .header(CORRELATION_HEADER, correlation_id)
            .json(body)
            .send()
            .await
            .map_err(|e| AgentError::Transport(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(AgentError::Api(format!("{}: {}", status, text)));
        }

        response
            .json()
            .await
            .map_err(|e| AgentError::Transport(e.to_string()))
    }

    /// Fresh metadata from the hypervisor. The authoritative spec source at
    /// every job start; callers must not substitute cached context rows.
    pub async fn discover_vms(
        &self,
        request: &DiscoverRequest,
        correlation_id: &str,
    ) -> Result<Vec<VmSpec>, AgentError> {
        #[derive(Deserialize)]
        struct DiscoverResponse {
            vms: Vec<VmSpec>,
        }

        let response: DiscoverResponse = self
            .call("/api/v1/discover", request, correlation_id)
            .await?;
        Ok(response.vms)
    }

    /// Idempotent; the hypervisor treats enabling CBT twice as a no-op.
    pub async fn enable_cbt(&self, vm_path: &str, correlation_id: &str) -> Result<(), AgentError> {
        let _: serde_json::Value = self
            .call(
                "/api/v1/cbt/enable",
                &serde_json::json!({ "vm_path": vm_path }),
                correlation_id,
            )
            .await?;
        Ok(())
    }

    pub async fn start_replication(
        &self,
        spec: &ReplicationSpec,
        correlation_id: &str,
    ) -> Result<String, AgentError> {
        #[derive(Deserialize)]
        struct StartResponse {
            job_id: String,
        }

        let response: StartResponse = self
            .call("/api/v1/replications", spec, correlation_id)
            .await?;
        Ok(response.job_id)
    }

    pub async fn progress(&self, agent_job_id: &str) -> Result<AgentProgress, AgentError> {
        let response = self
            .http
            .get(format!("{}/api/v1/replications/{}/progress", self.base_url, agent_job_id))
            .bearer_auth(&self.bearer_token)
            .send()
            .await
            .map_err(|e| AgentError::Transport(e.to_string()))?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(AgentError::UnknownJob(agent_job_id.to_string()));
        }
        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            return Err(AgentError::Api(format!("{}: {}", status, text)));
        }

        response
            .json()
            .await
            .map_err(|e| AgentError::Transport(e.to_string()))
    }
}

/// Recovery probe: the agent is the source of truth for replication jobs
/// after an orchestrator restart.
#[async_trait]
impl StatusProbe for AgentClient {
    async fn probe(&self, job: &Job) -> anyhow::Result<SubsystemStatus> {
        let Some(agent_job_id) = &job.external_job_id else {
            // Never handed to the agent; nothing can still be running
            return Ok(SubsystemStatus::NoRecord);
        };

        match self.progress(agent_job_id).await {
            Ok(progress) => Ok(match progress.stage.as_str() {
                "completed" => SubsystemStatus::Completed,
                "failed" => SubsystemStatus::Failed(
                    progress.error.unwrap_or_else(|| "agent reported failure".to_string()),
                ),
                _ => SubsystemStatus::Running,
            }),
            Err(AgentError::UnknownJob(_)) => Ok(SubsystemStatus::NoRecord),
            Err(e) => Err(e.into()),
        }
    }
}
