use thiserror::Error;

#[derive(Error, Debug)]
pub enum AgentServiceError {
    #[error("Hypervisor error: {0}")]
    Vsphere(String),

    #[error("NBD protocol error: {0}")]
    Nbd(String),

    #[error("Replication job {0} not found")]
    JobNotFound(String),

    #[error("Replication job {0} is already running")]
    JobAlreadyRunning(String),

    #[error("Disk {disk_key}: {failed} of {total} chunks failed after retries")]
    DiskCopyFailed {
        disk_key: String,
        failed: usize,
        total: usize,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
