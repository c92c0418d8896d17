//! The per-disk copy engine.
//!
//! One tokio task per disk; disks of the same VM copy in parallel. Within a
//! disk, coalesced chunks are fanned out to a small worker pool where each
//! worker owns its own NBD connection to the disk's export. Workers perform
//! positional writes, so completion order is irrelevant. The pool is capped
//! at four connections per disk; more triggers hypervisor-side throttling.

use crate::agent::cbt::{self, Chunk};
use crate::agent::error::AgentServiceError;
use crate::agent::nbd::NbdClient;
use crate::agent::progress::{Stage, PROGRESS};
use crate::agent::vsphere::VsphereAdapter;
use crate::clients::agent::{DiskTarget, ReplicationSpec};
use futures::future::join_all;
use log::{error, info, warn};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};

const MAX_WORKERS_PER_DISK: usize = 4;
/// Retries after the initial attempt, with 1/2/4 s backoff between tries.
const CHUNK_RETRIES: u32 = 3;

#[derive(Clone)]
pub struct EngineConfig {
    pub workers_per_disk: usize,
    pub chunk_write_timeout: Duration,
    /// Orchestrator API base URL through the control tunnel, for the CBT
    /// cursor callback
    pub orchestrator_url: String,
}

/// Spawns and supervises replication jobs.
pub struct ReplicationEngine {
    vsphere: Arc<dyn VsphereAdapter>,
    http: reqwest::Client,
    config: EngineConfig,
}

impl ReplicationEngine {
    pub fn new(vsphere: Arc<dyn VsphereAdapter>, config: EngineConfig) -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .expect("reqwest client construction cannot fail with static config");

        Self {
            vsphere,
            http,
            config,
        }
    }

    /// Accepts a replication spec and returns once the job is registered;
    /// the copy itself runs in the background and is observed via progress.
    pub fn start(self: Arc<Self>, spec: ReplicationSpec) -> Result<(), AgentServiceError> {
        if !PROGRESS.register(&spec.job_id) {
            return Err(AgentServiceError::JobAlreadyRunning(spec.job_id));
        }

        tokio::spawn(async move {
            self.run_job(spec).await;
        });

        Ok(())
    }

    async fn run_job(&self, spec: ReplicationSpec) {
        info!(
            "Replication {} starting: {} disk(s) of {}",
            spec.job_id,
            spec.disks.len(),
            spec.vm_path
        );
        PROGRESS.set_stage(&spec.job_id, Stage::Copying);

        let disk_runs = spec.disks.iter().map(|target| {
            self.run_disk(spec.job_id.clone(), spec.vm_path.clone(), target.clone())
        });

        let results = join_all(disk_runs).await;
        let failures: Vec<String> = results
            .into_iter()
            .filter_map(|r| r.err())
            .map(|e| e.to_string())
            .collect();

        if failures.is_empty() {
            info!("Replication {} completed", spec.job_id);
            PROGRESS.set_stage(&spec.job_id, Stage::Completed);
        } else {
            error!("Replication {} failed: {}", spec.job_id, failures.join("; "));
            PROGRESS.set_stage(&spec.job_id, Stage::Failed(failures.join("; ")));
        }
    }

    async fn run_disk(
        &self,
        job_id: String,
        vm_path: String,
        target: DiskTarget,
    ) -> Result<(), AgentServiceError> {
        let query = self
            .vsphere
            .query_extents(&vm_path, &target.disk_key, target.change_id.as_deref())
            .await
            .map_err(|e| AgentServiceError::Vsphere(e.to_string()))?;

        let chunks = cbt::coalesce_extents(&query.extents);
        let planned = cbt::total_bytes(&chunks);
        PROGRESS.set_disk_total(&job_id, &target.disk_key, planned);
        info!(
            "Disk {} of {}: {} chunk(s), {} bytes planned ({})",
            target.disk_key,
            vm_path,
            chunks.len(),
            planned,
            if target.change_id.is_some() { "incremental" } else { "initial" },
        );

        let (address, export_name) = parse_export_url(&target.export_url)?;

        let (tx, rx) = mpsc::channel::<Chunk>(64);
        let rx = Arc::new(Mutex::new(rx));
        let total_chunks = chunks.len();

        let worker_count = self.config.workers_per_disk.clamp(1, MAX_WORKERS_PER_DISK);
        let workers: Vec<_> = (0..worker_count)
            .map(|index| {
                self.run_worker(
                    index,
                    job_id.clone(),
                    vm_path.clone(),
                    target.disk_key.clone(),
                    address.clone(),
                    export_name.clone(),
                    rx.clone(),
                )
            })
            .collect();

        let feeder = async {
            for chunk in chunks {
                if tx.send(chunk).await.is_err() {
                    break;
                }
            }
            drop(tx);
        };

        let (_, worker_results) = tokio::join!(feeder, join_all(workers));

        let mut failed = 0usize;
        for result in worker_results {
            failed += result?;
        }

        if failed > 0 {
            return Err(AgentServiceError::DiskCopyFailed {
                disk_key: target.disk_key,
                failed,
                total: total_chunks,
            });
        }

        // The final cursor goes back to the orchestrator keyed by this
        // specific disk; the next incremental for this disk starts here.
        let change_id = self
            .vsphere
            .current_change_id(&vm_path, &target.disk_key)
            .await
            .map_err(|e| AgentServiceError::Vsphere(e.to_string()))?;
        self.post_change_id(&vm_path, &target.disk_key, &change_id)
            .await?;

        Ok(())
    }

    /// One worker: own NBD connection, chunks pulled from the shared queue,
    /// each chunk retried on a 1/2/4 s backoff before counting as failed.
    #[allow(clippy::too_many_arguments)]
    async fn run_worker(
        &self,
        index: usize,
        job_id: String,
        vm_path: String,
        disk_key: String,
        address: String,
        export_name: String,
        rx: Arc<Mutex<mpsc::Receiver<Chunk>>>,
    ) -> Result<usize, AgentServiceError> {
        let mut nbd = NbdClient::connect(&address, &export_name, self.config.chunk_write_timeout).await?;
        let mut failed = 0usize;

        loop {
            let chunk = {
                let mut rx = rx.lock().await;
                rx.recv().await
            };
            let Some(chunk) = chunk else { break };

            if self
                .copy_chunk(&mut nbd, &vm_path, &disk_key, chunk)
                .await
                .is_ok()
            {
                PROGRESS.add_bytes(&job_id, &disk_key, chunk.length);
            } else {
                failed += 1;
            }
        }

        nbd.flush().await?;
        nbd.disconnect().await?;
        info!("Worker {} for disk {} finished ({} failed chunk(s))", index, disk_key, failed);
        Ok(failed)
    }

    async fn copy_chunk(
        &self,
        nbd: &mut NbdClient,
        vm_path: &str,
        disk_key: &str,
        chunk: Chunk,
    ) -> Result<(), AgentServiceError> {
        let mut delay = Duration::from_secs(1);

        for attempt in 1..=CHUNK_RETRIES + 1 {
            let result = async {
                let data = self
                    .vsphere
                    .read_blocks(vm_path, disk_key, chunk.offset, chunk.length)
                    .await
                    .map_err(|e| AgentServiceError::Vsphere(e.to_string()))?;
                tokio::time::timeout(
                    self.config.chunk_write_timeout,
                    nbd.write_at(chunk.offset, &data),
                )
                .await
                .map_err(|_| AgentServiceError::Nbd("chunk write timed out".into()))?
            }
            .await;

            match result {
                Ok(()) => return Ok(()),
                Err(e) if attempt <= CHUNK_RETRIES => {
                    warn!(
                        "Chunk at {} on {} failed (attempt {}): {}; retrying in {:?}",
                        chunk.offset, disk_key, attempt, e, delay
                    );
                    tokio::time::sleep(delay).await;
                    delay *= 2;
                }
                Err(e) => {
                    error!("Chunk at {} on {} failed permanently: {}", chunk.offset, disk_key, e);
                    return Err(e);
                }
            }
        }

        unreachable!("retry loop always returns")
    }

    async fn post_change_id(
        &self,
        vm_path: &str,
        disk_key: &str,
        change_id: &str,
    ) -> Result<(), AgentServiceError> {
        let body = serde_json::json!({
            "vm_path": vm_path,
            "disk_id": disk_key,
            "change_id": change_id,
        });

        let mut delay = Duration::from_secs(1);
        for attempt in 1..=CHUNK_RETRIES + 1 {
            let result = self
                .http
                .post(format!("{}/api/v1/replications/changeid", self.config.orchestrator_url))
                .json(&body)
                .send()
                .await;

            match result {
                Ok(response) if response.status().is_success() => return Ok(()),
                Ok(response) if attempt > CHUNK_RETRIES => {
                    return Err(AgentServiceError::Vsphere(format!(
                        "storing CBT cursor failed: HTTP {}",
                        response.status()
                    )));
                }
                Err(e) if attempt > CHUNK_RETRIES => {
                    return Err(AgentServiceError::Vsphere(format!(
                        "storing CBT cursor failed: {}",
                        e
                    )));
                }
                _ => {
                    // A lost cursor silently downgrades the next run to a
                    // full copy; failing the disk is the lesser harm.
                    tokio::time::sleep(delay).await;
                    delay *= 2;
                }
            }
        }

        unreachable!("retry loop always returns")
    }
}

/// Splits "nbd://host:port/export-name" into the dial address and export.
pub fn parse_export_url(url: &str) -> Result<(String, String), AgentServiceError> {
    let rest = url
        .strip_prefix("nbd://")
        .ok_or_else(|| AgentServiceError::Nbd(format!("not an nbd URL: {}", url)))?;

    let (address, export_name) = rest
        .split_once('/')
        .ok_or_else(|| AgentServiceError::Nbd(format!("nbd URL missing export name: {}", url)))?;

    if address.is_empty() || export_name.is_empty() {
        return Err(AgentServiceError::Nbd(format!("malformed nbd URL: {}", url)));
    }

    Ok((address.to_string(), export_name.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn export_urls_split_into_address_and_name() {
        let (address, name) =
            parse_export_url("nbd://10.0.100.189:10809/migration-repl-1-disk-2000").unwrap();
        assert_eq!(address, "10.0.100.189:10809");
        assert_eq!(name, "migration-repl-1-disk-2000");
    }

    #[test]
    fn malformed_export_urls_are_rejected() {
        assert!(parse_export_url("http://x/y").is_err());
        assert!(parse_export_url("nbd://hostonly").is_err());
        assert!(parse_export_url("nbd:///noaddress").is_err());
    }
}
