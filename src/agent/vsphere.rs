use crate::models::vm_context::VmSpec;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum VsphereError {
    #[error("vSphere API error: {0}")]
    Api(String),

    #[error("vSphere transport error: {0}")]
    Transport(String),

    #[error("CBT is not enabled on {0}")]
    CbtDisabled(String),

    #[error("Disk {0} not found on the source VM")]
    DiskNotFound(String),
}

/// One allocated or changed region of a source disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiskExtent {
    pub offset: u64,
    pub length: u64,
}

/// Result of a CBT extent query for one disk.
#[derive(Debug, Clone, Deserialize)]
pub struct ExtentQuery {
    pub extents: Vec<DiskExtent>,
    pub disk_size: u64,
}

/// Narrow adapter over the hypervisor SDK and its data-mover library. The
/// SDKs themselves live outside this codebase; the agent only needs these
/// five operations.
#[async_trait]
pub trait VsphereAdapter: Send + Sync {
    /// Fresh VM metadata, optionally filtered to one inventory path.
    async fn discover_vms(&self, path_filter: Option<&str>) -> Result<Vec<VmSpec>, VsphereError>;

    /// Enables changed-block tracking. Idempotent on the hypervisor side.
    async fn enable_cbt(&self, vm_path: &str) -> Result<(), VsphereError>;

    /// Extents to copy: changed-since-cursor when `change_id` is given,
    /// all allocated extents otherwise.
    async fn query_extents(
        &self,
        vm_path: &str,
        disk_key: &str,
        change_id: Option<&str>,
    ) -> Result<ExtentQuery, VsphereError>;

    /// Positional block read through the data mover.
    async fn read_blocks(
        &self,
        vm_path: &str,
        disk_key: &str,
        offset: u64,
        length: u64,
    ) -> Result<Vec<u8>, VsphereError>;

    /// The disk's CBT cursor after the copy, stored per disk on the
    /// orchestrator for the next incremental.
    async fn current_change_id(&self, vm_path: &str, disk_key: &str) -> Result<String, VsphereError>;
}

/// Adapter implementation backed by the appliance's data-mover sidecar,
/// which wraps the vendor SDK and exposes it on the VMA loopback.
pub struct DataMoverAdapter {
    http: reqwest::Client,
    base_url: String,
}

impl DataMoverAdapter {
    pub fn new(base_url: String) -> Self {
        let http = reqwest::Client::builder()
            // Block reads of a 32 MiB chunk dominate; everything else is
            // metadata traffic
            .timeout(Duration::from_secs(120))
            .build()
            .expect("reqwest client construction cannot fail with static config");

        Self { http, base_url }
    }

    async fn post_json<B: Serialize, R: for<'de> Deserialize<'de>>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<R, VsphereError> {
        let response = self
            .http
            .post(format!("{}{}", self.base_url, path))
            .json(body)
            .send()
            .await
            .map_err(|e| VsphereError::Transport(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            if text.contains("CBT") && text.contains("disabled") {
                return Err(VsphereError::CbtDisabled(text));
            }
            return Err(VsphereError::Api(format!("{}: {}", status, text)));
        }

        response
            .json()
            .await
            .map_err(|e| VsphereError::Transport(e.to_string()))
    }
}

#[async_trait]
impl VsphereAdapter for DataMoverAdapter {
    async fn discover_vms(&self, path_filter: Option<&str>) -> Result<Vec<VmSpec>, VsphereError> {
        #[derive(Deserialize)]
        struct DiscoverResponse {
            vms: Vec<VmSpec>,
        }

        let response: DiscoverResponse = self
            .post_json("/discover", &serde_json::json!({ "path": path_filter }))
            .await?;
        Ok(response.vms)
    }

    async fn enable_cbt(&self, vm_path: &str) -> Result<(), VsphereError> {
        let _: serde_json::Value = self
            .post_json("/cbt/enable", &serde_json::json!({ "vm_path": vm_path }))
            .await?;
        Ok(())
    }

    async fn query_extents(
        &self,
        vm_path: &str,
        disk_key: &str,
        change_id: Option<&str>,
    ) -> Result<ExtentQuery, VsphereError> {
        self.post_json(
            "/extents",
            &serde_json::json!({
                "vm_path": vm_path,
                "disk_key": disk_key,
                "change_id": change_id,
            }),
        )
        .await
    }

    async fn read_blocks(
        &self,
        vm_path: &str,
        disk_key: &str,
        offset: u64,
        length: u64,
    ) -> Result<Vec<u8>, VsphereError> {
        let response = self
            .http
            .post(format!("{}/read", self.base_url))
            .json(&serde_json::json!({
                "vm_path": vm_path,
                "disk_key": disk_key,
                "offset": offset,
                "length": length,
            }))
            .send()
            .await
            .map_err(|e| VsphereError::Transport(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            return Err(VsphereError::Api(format!("{}: {}", status, text)));
        }

        let bytes = response
            .bytes()
            .await
            .map_err(|e| VsphereError::Transport(e.to_string()))?;

        if bytes.len() as u64 != length {
            return Err(VsphereError::Api(format!(
                "short read: wanted {} bytes at offset {}, got {}",
                length,
                offset,
                bytes.len()
            )));
        }

        Ok(bytes.to_vec())
    }

    async fn current_change_id(&self, vm_path: &str, disk_key: &str) -> Result<String, VsphereError> {
        #[derive(Deserialize)]
        struct ChangeIdResponse {
            change_id: String,
        }

        let response: ChangeIdResponse = self
            .post_json(
                "/changeid",
                &serde_json::json!({ "vm_path": vm_path, "disk_key": disk_key }),
            )
            .await?;
        Ok(response.change_id)
    }
}
