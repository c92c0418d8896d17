//! In-process progress registry for replication jobs.
//!
//! Per-disk copy workers feed byte counters in; the aggregated view is
//! served to the orchestrator's progress polls and carries the stage
//! machine: queued -> copying -> completed | failed.

use crate::clients::agent::AgentProgress;
use once_cell::sync::Lazy;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::time::Instant;

/// Process-wide store; worker tasks outlive the HTTP requests that spawn
/// them, so the registry cannot live in request state.
pub static PROGRESS: Lazy<ProgressStore> = Lazy::new(ProgressStore::new);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Stage {
    Queued,
    Copying,
    Completed,
    Failed(String),
}

struct JobProgress {
    stage: Stage,
    /// Bytes planned and moved, per disk key
    disk_totals: HashMap<String, u64>,
    disk_bytes: HashMap<String, u64>,
    current_disk: Option<String>,
    started: Instant,
}

pub struct ProgressStore {
    jobs: RwLock<HashMap<String, JobProgress>>,
}

impl ProgressStore {
    fn new() -> Self {
        Self {
            jobs: RwLock::new(HashMap::new()),
        }
    }

    /// Registers a new job. Returns false when the job id is already live,
    /// which callers surface as a conflict rather than starting twice.
    pub fn register(&self, job_id: &str) -> bool {
        let mut jobs = self.jobs.write();
        match jobs.get(job_id) {
            Some(existing) if !matches!(existing.stage, Stage::Completed | Stage::Failed(_)) => false,
            _ => {
                jobs.insert(
                    job_id.to_string(),
                    JobProgress {
                        stage: Stage::Queued,
                        disk_totals: HashMap::new(),
                        disk_bytes: HashMap::new(),
                        current_disk: None,
                        started: Instant::now(),
                    },
                );
                true
            }
        }
    }

    pub fn set_stage(&self, job_id: &str, stage: Stage) {
        if let Some(job) = self.jobs.write().get_mut(job_id) {
            job.stage = stage;
        }
    }

    pub fn set_disk_total(&self, job_id: &str, disk_key: &str, total: u64) {
        if let Some(job) = self.jobs.write().get_mut(job_id) {
            job.disk_totals.insert(disk_key.to_string(), total);
        }
    }

    pub fn add_bytes(&self, job_id: &str, disk_key: &str, bytes: u64) {
        if let Some(job) = self.jobs.write().get_mut(job_id) {
            *job.disk_bytes.entry(disk_key.to_string()).or_insert(0) += bytes;
            job.current_disk = Some(disk_key.to_string());
        }
    }

    pub fn snapshot(&self, job_id: &str) -> Option<AgentProgress> {
        let jobs = self.jobs.read();
        let job = jobs.get(job_id)?;

        let total_bytes: u64 = job.disk_totals.values().sum();
        let bytes_transferred: u64 = job.disk_bytes.values().sum();
        let elapsed = job.started.elapsed().as_secs_f64();
        let throughput_bps = if elapsed > 0.0 {
            (bytes_transferred as f64 / elapsed) as u64
        } else {
            0
        };
        let percent = if total_bytes > 0 {
            (bytes_transferred as f64 / total_bytes as f64) * 100.0
        } else {
            0.0
        };

        let (stage, error) = match &job.stage {
            Stage::Queued => ("queued", None),
            Stage::Copying => ("copying", None),
            Stage::Completed => ("completed", None),
            Stage::Failed(e) => ("failed", Some(e.clone())),
        };

        Some(AgentProgress {
            stage: stage.to_string(),
            percent: percent.min(100.0),
            bytes_transferred,
            total_bytes,
            throughput_bps,
            current_disk: job.current_disk.clone(),
            error,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn double_registration_of_a_live_job_is_refused() {
        let store = ProgressStore::new();
        assert!(store.register("job-a"));
        assert!(!store.register("job-a"));

        store.set_stage("job-a", Stage::Completed);
        assert!(store.register("job-a"), "terminal jobs may be re-run");
    }

    #[test]
    fn snapshot_aggregates_across_disks() {
        let store = ProgressStore::new();
        store.register("job-b");
        store.set_stage("job-b", Stage::Copying);
        store.set_disk_total("job-b", "disk-2000", 1000);
        store.set_disk_total("job-b", "disk-2001", 1000);
        store.add_bytes("job-b", "disk-2000", 500);

        let progress = store.snapshot("job-b").unwrap();
        assert_eq!(progress.stage, "copying");
        assert_eq!(progress.bytes_transferred, 500);
        assert_eq!(progress.total_bytes, 2000);
        assert!((progress.percent - 25.0).abs() < 0.01);
        assert_eq!(progress.current_disk.as_deref(), Some("disk-2000"));
    }

    #[test]
    fn unknown_job_has_no_snapshot() {
        let store = ProgressStore::new();
        assert!(store.snapshot("nope").is_none());
    }
}
