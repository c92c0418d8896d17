use crate::jobtracker::CORRELATION_HEADER;
use serde::Deserialize;
use serde_json::json;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum VolumeClientError {
    #[error("Volume daemon unreachable: {0}")]
    Transport(String),

    #[error("Volume daemon refused {operation}: {code}: {message}")]
    Api {
        operation: &'static str,
        code: String,
        message: String,
    },
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    error: String,
    #[serde(default)]
    message: String,
}

#[derive(Debug, Deserialize)]
pub struct ExportHandle {
    pub export_name: String,
    pub url: String,
}

#[derive(Debug, Deserialize)]
pub struct DaemonHealth {
    pub status: String,
    pub privileged: bool,
    pub privilege_error: Option<String>,
    pub active_config_present: bool,
}

/// Client for the co-located volume daemon's loopback API. Every request
/// carries the caller's correlation id so daemon-side job records chain to
/// the orchestrator operation that caused them.
#[derive(Clone)]
pub struct VolumeDaemonClient {
    http: reqwest::Client,
    base_url: String,
}

impl VolumeDaemonClient {
    pub fn new(base_url: String) -> Self {
        let http = reqwest::Client::builder()
            // Attach and create blow through HTTP defaults; the daemon owns
            // the fine-grained deadlines, this is the outer bound.
            .timeout(Duration::from_secs(300))
            .build()
            .expect("reqwest client construction cannot fail with static config");

        Self { http, base_url }
    }

    async fn post(
        &self,
        operation: &'static str,
        path: &str,
        body: serde_json::Value,
        correlation_id: &str,
    ) -> Result<serde_json::Value, VolumeClientError> {
        let response = self
            .http
            .post(format!("{}{}", self.base_url, path))
            .header(CORRELATION_HEADER, correlation_id)
            .json(&body)
            .send()
            .await
            .map_err(|e| VolumeClientError::Transport(e.to_string()))?;

        Self::parse(operation, response).await
    }

    async fn parse(
        operation: &'static str,
        response: reqwest::Response,
    ) -> Result<serde_json::Value, VolumeClientError> {
        let status = response.status();
        if status.is_success() {
            return response
                .json()
                .await
                .map_err(|e| VolumeClientError::Transport(e.to_string()));
        }

        let body: ErrorBody = response.json().await.unwrap_or(ErrorBody {
            error: "unknown".into(),
            message: format!("HTTP {}", status),
        });

        Err(VolumeClientError::Api {
            operation,
            code: body.error,
            message: body.message,
        })
    }

    pub async fn health(&self) -> Result<DaemonHealth, VolumeClientError> {
        let response = self
            .http
            .get(format!("{}/health", self.base_url))
            .send()
            .await
            .map_err(|e| VolumeClientError::Transport(e.to_string()))?;

        response
            .json()
            .await
            .map_err(|e| VolumeClientError::Transport(e.to_string()))
    }

    pub async fn create_volume(
        &self,
        size_gb: i64,
        vm_disk_id: Option<i64>,
        correlation_id: &str,
    ) -> Result<String, VolumeClientError> {
        let body = self
            .post(
                "create-volume",
                "/volumes",
                json!({ "size_gb": size_gb, "vm_disk_id": vm_disk_id }),
                correlation_id,
            )
            .await?;

        body["volume_id"]
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| VolumeClientError::Transport("response carried no volume_id".into()))
    }

    /// Returns the stable device path; kernel paths never cross this API.
    pub async fn attach_to_orchestrator(
        &self,
        volume_id: &str,
        correlation_id: &str,
    ) -> Result<String, VolumeClientError> {
        let body = self
            .post(
                "attach-to-orchestrator",
                &format!("/volumes/{}/attach", volume_id),
                json!({ "vm_id": null }),
                correlation_id,
            )
            .await?;

        body["device_path"]
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| VolumeClientError::Transport("response carried no device_path".into()))
    }

    pub async fn attach_to_vm(
        &self,
        volume_id: &str,
        vm_id: &str,
        correlation_id: &str,
    ) -> Result<(), VolumeClientError> {
        self.post(
            "attach-to-vm",
            &format!("/volumes/{}/attach", volume_id),
            json!({ "vm_id": vm_id }),
            correlation_id,
        )
        .await?;
        Ok(())
    }

    pub async fn detach(&self, volume_id: &str, correlation_id: &str) -> Result<(), VolumeClientError> {
        self.post(
            "detach",
            &format!("/volumes/{}/detach", volume_id),
            json!({}),
            correlation_id,
        )
        .await?;
        Ok(())
    }

    pub async fn delete_volume(
        &self,
        volume_id: &str,
        correlation_id: &str,
    ) -> Result<(), VolumeClientError> {
        let response = self
            .http
            .delete(format!("{}/volumes/{}", self.base_url, volume_id))
            .header(CORRELATION_HEADER, correlation_id)
            .send()
            .await
            .map_err(|e| VolumeClientError::Transport(e.to_string()))?;

        Self::parse("delete-volume", response).await?;
        Ok(())
    }

    pub async fn create_export(
        &self,
        volume_id: &str,
        job_id: &str,
        vm_disk_id: i64,
        read_only: bool,
        correlation_id: &str,
    ) -> Result<ExportHandle, VolumeClientError> {
        let body = self
            .post(
                "create-export",
                "/exports",
                json!({
                    "volume_id": volume_id,
                    "job_id": job_id,
                    "vm_disk_id": vm_disk_id,
                    "read_only": read_only,
                }),
                correlation_id,
            )
            .await?;

        serde_json::from_value(body)
            .map_err(|e| VolumeClientError::Transport(format!("malformed export response: {}", e)))
    }

    pub async fn delete_export(
        &self,
        export_name: &str,
        correlation_id: &str,
    ) -> Result<(), VolumeClientError> {
        let response = self
            .http
            .delete(format!("{}/exports/{}", self.base_url, export_name))
            .header(CORRELATION_HEADER, correlation_id)
            .send()
            .await
            .map_err(|e| VolumeClientError::Transport(e.to_string()))?;

        Self::parse("delete-export", response).await?;
        Ok(())
    }

    pub async fn snapshot_volume(
        &self,
        volume_id: &str,
        correlation_id: &str,
    ) -> Result<String, VolumeClientError> {
        let body = self
            .post(
                "snapshot-volume",
                &format!("/volumes/{}/snapshot", volume_id),
                json!({}),
                correlation_id,
            )
            .await?;

        body["snapshot_id"]
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| VolumeClientError::Transport("response carried no snapshot_id".into()))
    }

    pub async fn revert_volume(
        &self,
        volume_id: &str,
        snapshot_id: &str,
        correlation_id: &str,
    ) -> Result<(), VolumeClientError> {
        self.post(
            "revert-volume",
            &format!("/volumes/{}/revert", volume_id),
            json!({ "snapshot_id": snapshot_id }),
            correlation_id,
        )
        .await?;
        Ok(())
    }

    pub async fn delete_snapshot(
        &self,
        snapshot_id: &str,
        correlation_id: &str,
    ) -> Result<(), VolumeClientError> {
        let response = self
            .http
            .delete(format!("{}/snapshots/{}", self.base_url, snapshot_id))
            .header(CORRELATION_HEADER, correlation_id)
            .send()
            .await
            .map_err(|e| VolumeClientError::Transport(e.to_string()))?;

        Self::parse("delete-snapshot", response).await?;
        Ok(())
    }
}
