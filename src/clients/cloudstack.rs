use async_trait::async_trait;
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CloudError {
    #[error("Cloud API rejected the request: {0}")]
    Api(String),

    #[error("Cloud API transport error: {0}")]
    Transport(String),

    #[error("Cloud quota exceeded: {0}")]
    Quota(String),

    #[error("Cloud async job {job_id} did not finish within {timeout_secs}s")]
    JobTimeout { job_id: String, timeout_secs: u64 },
}

impl CloudError {
    /// Transient errors are retried inside the volume daemon's operation
    /// boundary; everything else surfaces immediately.
    pub fn is_transient(&self) -> bool {
        matches!(self, CloudError::Transport(_))
    }
}

/// VM creation parameters for failover. Deliberately carries no root disk:
/// the replicated root volume is attached afterwards, which is why the
/// template's intrinsic size is validated upstream.
#[derive(Debug, Clone, Serialize)]
pub struct DeployVmSpec {
    pub name: String,
    pub cpu_count: i32,
    pub memory_mb: i32,
    pub service_offering_id: String,
    pub template_id: String,
    pub zone_id: String,
    pub network_ids: Vec<String>,
}

/// Narrow adapter over the OSSEA (CloudStack-compatible) API. Everything the
/// control plane needs, and nothing else; the full SDK stays outside this
/// codebase.
#[async_trait]
pub trait CloudAdapter: Send + Sync {
    async fn create_volume(
        &self,
        name: &str,
        size_gb: i64,
        disk_offering_id: &str,
        zone_id: &str,
    ) -> Result<String, CloudError>;

    async fn attach_volume(&self, volume_id: &str, vm_id: &str) -> Result<(), CloudError>;

    async fn detach_volume(&self, volume_id: &str) -> Result<(), CloudError>;

    async fn delete_volume(&self, volume_id: &str) -> Result<(), CloudError>;

    async fn snapshot_volume(&self, volume_id: &str) -> Result<String, CloudError>;

    async fn revert_snapshot(&self, snapshot_id: &str) -> Result<(), CloudError>;

    async fn delete_snapshot(&self, snapshot_id: &str) -> Result<(), CloudError>;

    /// Intrinsic size of a template in GiB, for failover validation.
    async fn template_size_gb(&self, template_id: &str) -> Result<i64, CloudError>;

    async fn deploy_vm(&self, spec: &DeployVmSpec) -> Result<String, CloudError>;

    async fn start_vm(&self, vm_id: &str) -> Result<(), CloudError>;

    async fn stop_vm(&self, vm_id: &str) -> Result<(), CloudError>;

    async fn destroy_vm(&self, vm_id: &str) -> Result<(), CloudError>;

    async fn vm_state(&self, vm_id: &str) -> Result<String, CloudError>;
}

/// Retries a cloud call on transient failures with 1/2/4s backoff. Hard
/// API rejections are never retried.
pub async fn retry_transient<T, F, Fut>(mut call: F) -> Result<T, CloudError>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, CloudError>>,
{
    let mut delay = Duration::from_secs(1);
    let mut last_err = None;

    for attempt in 0..3 {
        match call().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_transient() => {
                warn!("Transient cloud error (attempt {}): {}", attempt + 1, e);
                last_err = Some(e);
                tokio::time::sleep(delay).await;
                delay *= 2;
            }
            Err(e) => return Err(e),
        }
    }

    Err(last_err.expect("retry loop exited without an error"))
}

/// Client for the management server's JSON API. Authentication is
/// terminated by the appliance's API gateway; this client only ever sees
/// the pre-authenticated integration endpoint.
pub struct CloudStackClient {
    http: reqwest::Client,
    api_url: String,
}

#[derive(Debug, Deserialize)]
struct AsyncJobRef {
    #[serde(rename = "jobid")]
    job_id: String,
}

impl CloudStackClient {
    pub fn new(api_url: String) -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .expect("reqwest client construction cannot fail with static config");

        Self { http, api_url }
    }

    async fn call(
        &self,
        command: &str,
        params: &[(&str, String)],
    ) -> Result<serde_json::Value, CloudError> {
        let mut query: Vec<(&str, String)> = vec![
            ("command", command.to_string()),
            ("response", "json".to_string()),
        ];
        query.extend_from_slice(params);

        debug!("Cloud API call: {}", command);
        let response = self
            .http
            .get(&self.api_url)
            .query(&query)
            .send()
            .await
            .map_err(|e| CloudError::Transport(e.to_string()))?;

        let status = response.status();
        let body: serde_json::Value = response
            .json()
            .await
            .map_err(|e| CloudError::Transport(e.to_string()))?;

        if status.is_server_error() {
            return Err(CloudError::Transport(format!("{}: {}", status, body)));
        }
        if !status.is_success() {
            let text = body.to_string();
            if text.contains("exceeded") && text.contains("limit") {
                return Err(CloudError::Quota(text));
            }
            return Err(CloudError::Api(text));
        }

        Ok(body)
    }

    /// Most mutating CloudStack commands return an async job id; the caller
    /// owns the deadline, we own the polling.
    async fn await_job(&self, job_id: &str, timeout: Duration) -> Result<serde_json::Value, CloudError> {
        let deadline = tokio::time::Instant::now() + timeout;

        loop {
            let body = self
                .call("queryAsyncJobResult", &[("jobid", job_id.to_string())])
                .await?;
            let result = &body["queryasyncjobresultresponse"];

            match result["jobstatus"].as_i64().unwrap_or(0) {
                0 => {} // still running
                1 => return Ok(result["jobresult"].clone()),
                _ => {
                    let text = result["jobresult"]["errortext"]
                        .as_str()
                        .unwrap_or("async job failed")
                        .to_string();
                    return Err(CloudError::Api(text));
                }
            }

            if tokio::time::Instant::now() >= deadline {
                return Err(CloudError::JobTimeout {
                    job_id: job_id.to_string(),
                    timeout_secs: timeout.as_secs(),
                });
            }
            tokio::time::sleep(Duration::from_secs(2)).await;
        }
    }

    fn job_ref(body: &serde_json::Value, envelope: &str) -> Result<AsyncJobRef, CloudError> {
        serde_json::from_value(body[envelope].clone())
            .map_err(|e| CloudError::Api(format!("missing async job reference: {}", e)))
    }
}

#[async_trait]
impl CloudAdapter for CloudStackClient {
    async fn create_volume(
        &self,
        name: &str,
        size_gb: i64,
        disk_offering_id: &str,
        zone_id: &str,
    ) -> Result<String, CloudError> {
        let body = self
            .call(
                "createVolume",
                &[
                    ("name", name.to_string()),
                    ("size", size_gb.to_string()),
                    ("diskofferingid", disk_offering_id.to_string()),
                    ("zoneid", zone_id.to_string()),
                ],
            )
            .await?;

        let job = Self::job_ref(&body, "createvolumeresponse")?;
        let result = self.await_job(&job.job_id, Duration::from_secs(120)).await?;

        result["volume"]["id"]
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| CloudError::Api("createVolume result carried no volume id".into()))
    }

    async fn attach_volume(&self, volume_id: &str, vm_id: &str) -> Result<(), CloudError> {
        let body = self
            .call(
                "attachVolume",
                &[
                    ("id", volume_id.to_string()),
                    ("virtualmachineid", vm_id.to_string()),
                ],
            )
            .await?;
        let job = Self::job_ref(&body, "attachvolumeresponse")?;
        self.await_job(&job.job_id, Duration::from_secs(120)).await?;
        Ok(())
    }

    async fn detach_volume(&self, volume_id: &str) -> Result<(), CloudError> {
        let body = self
            .call("detachVolume", &[("id", volume_id.to_string())])
            .await?;
        let job = Self::job_ref(&body, "detachvolumeresponse")?;
        self.await_job(&job.job_id, Duration::from_secs(120)).await?;
        Ok(())
    }

    async fn delete_volume(&self, volume_id: &str) -> Result<(), CloudError> {
        self.call("deleteVolume", &[("id", volume_id.to_string())])
            .await?;
        Ok(())
    }

    async fn snapshot_volume(&self, volume_id: &str) -> Result<String, CloudError> {
        let body = self
            .call("createSnapshot", &[("volumeid", volume_id.to_string())])
            .await?;
        let job = Self::job_ref(&body, "createsnapshotresponse")?;
        let result = self.await_job(&job.job_id, Duration::from_secs(300)).await?;

        result["snapshot"]["id"]
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| CloudError::Api("createSnapshot result carried no snapshot id".into()))
    }

    async fn revert_snapshot(&self, snapshot_id: &str) -> Result<(), CloudError> {
        let body = self
            .call("revertSnapshot", &[("id", snapshot_id.to_string())])
            .await?;
        let job = Self::job_ref(&body, "revertsnapshotresponse")?;
        self.await_job(&job.job_id, Duration::from_secs(300)).await?;
        Ok(())
    }

    async fn delete_snapshot(&self, snapshot_id: &str) -> Result<(), CloudError> {
        let body = self
            .call("deleteSnapshot", &[("id", snapshot_id.to_string())])
            .await?;
        let job = Self::job_ref(&body, "deletesnapshotresponse")?;
        self.await_job(&job.job_id, Duration::from_secs(120)).await?;
        Ok(())
    }

    async fn template_size_gb(&self, template_id: &str) -> Result<i64, CloudError> {
        let body = self
            .call(
                "listTemplates",
                &[
                    ("id", template_id.to_string()),
                    ("templatefilter", "executable".to_string()),
                ],
            )
            .await?;

        let size_bytes = body["listtemplatesresponse"]["template"][0]["size"]
            .as_i64()
            .ok_or_else(|| CloudError::Api(format!("template {} not found", template_id)))?;

        Ok(size_bytes >> 30)
    }

    async fn deploy_vm(&self, spec: &DeployVmSpec) -> Result<String, CloudError> {
        let mut params = vec![
            ("name", spec.name.clone()),
            ("displayname", spec.name.clone()),
            ("serviceofferingid", spec.service_offering_id.clone()),
            ("templateid", spec.template_id.clone()),
            ("zoneid", spec.zone_id.clone()),
            ("networkids", spec.network_ids.join(",")),
            // The replicated root volume is attached after creation
            ("startvm", "false".to_string()),
            ("details[0].cpuNumber", spec.cpu_count.to_string()),
            ("details[0].memory", spec.memory_mb.to_string()),
        ];
        params.retain(|(_, v)| !v.is_empty());

        let body = self.call("deployVirtualMachine", &params).await?;
        let job = Self::job_ref(&body, "deployvirtualmachineresponse")?;
        let result = self.await_job(&job.job_id, Duration::from_secs(300)).await?;

        result["virtualmachine"]["id"]
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| CloudError::Api("deployVirtualMachine result carried no vm id".into()))
    }

    async fn start_vm(&self, vm_id: &str) -> Result<(), CloudError> {
        let body = self
            .call("startVirtualMachine", &[("id", vm_id.to_string())])
            .await?;
        let job = Self::job_ref(&body, "startvirtualmachineresponse")?;
        self.await_job(&job.job_id, Duration::from_secs(300)).await?;
        Ok(())
    }

    async fn stop_vm(&self, vm_id: &str) -> Result<(), CloudError> {
        let body = self
            .call(
                "stopVirtualMachine",
                &[("id", vm_id.to_string()), ("forced", "true".to_string())],
            )
            .await?;
        let job = Self::job_ref(&body, "stopvirtualmachineresponse")?;
        self.await_job(&job.job_id, Duration::from_secs(300)).await?;
        Ok(())
    }

    async fn destroy_vm(&self, vm_id: &str) -> Result<(), CloudError> {
        let body = self
            .call(
                "destroyVirtualMachine",
                &[("id", vm_id.to_string()), ("expunge", "true".to_string())],
            )
            .await?;
        let job = Self::job_ref(&body, "destroyvirtualmachineresponse")?;
        self.await_job(&job.job_id, Duration::from_secs(300)).await?;
        Ok(())
    }

    async fn vm_state(&self, vm_id: &str) -> Result<String, CloudError> {
        let body = self
            .call("listVirtualMachines", &[("id", vm_id.to_string())])
            .await?;

        body["listvirtualmachinesresponse"]["virtualmachine"][0]["state"]
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| CloudError::Api(format!("vm {} not found", vm_id)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn transient_errors_are_retried_then_surface() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let counter = attempts.clone();

        let result: Result<(), CloudError> = retry_transient(move || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(CloudError::Transport("connection refused".into()))
            }
        })
        .await;

        assert!(result.is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn api_rejections_are_never_retried() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let counter = attempts.clone();

        let result: Result<(), CloudError> = retry_transient(move || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(CloudError::Api("invalid parameter".into()))
            }
        })
        .await;

        assert!(result.is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }
}
