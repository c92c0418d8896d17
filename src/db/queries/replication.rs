use crate::models::replication::ReplicationJob;
use anyhow::Context;
use sqlx::{MySql, Pool};

pub async fn create_job(
    pool: &Pool<MySql>,
    job_id: &str,
    vm_context_id: &str,
    replication_type: &str,
    correlation_id: &str,
) -> anyhow::Result<ReplicationJob> {
    let mut tx = pool.begin().await?;

    sqlx::query(
        r#"INSERT INTO replication_jobs (
            id, vm_context_id, replication_type, status, correlation_id
        ) VALUES (?, ?, ?, 'pending', ?)"#,
    )
    .bind(job_id)
    .bind(vm_context_id)
    .bind(replication_type)
    .bind(correlation_id)
    .execute(&mut *tx)
    .await
    .context("Failed to create replication job")?;

    tx.commit().await?;
    get_job(pool, job_id).await
}

pub async fn get_job(pool: &Pool<MySql>, job_id: &str) -> anyhow::Result<ReplicationJob> {
    let job = sqlx::query_as::<_, ReplicationJob>("SELECT * FROM replication_jobs WHERE id = ?")
        .bind(job_id)
        .fetch_one(pool)
        .await
        .context("Failed to fetch replication job")?;

    Ok(job)
}

/// The at-most-one in-flight replication invariant is enforced by checking
/// this before job creation, under the per-context workflow lock.
pub async fn find_active_for_context(
    pool: &Pool<MySql>,
    vm_context_id: &str,
) -> anyhow::Result<Option<ReplicationJob>> {
    let job = sqlx::query_as::<_, ReplicationJob>(
        "SELECT * FROM replication_jobs WHERE vm_context_id = ? AND status IN ('pending', 'running')",
    )
    .bind(vm_context_id)
    .fetch_optional(pool)
    .await
    .context("Failed to look up active replication job")?;

    Ok(job)
}

pub async fn list_active(pool: &Pool<MySql>) -> anyhow::Result<Vec<ReplicationJob>> {
    let jobs = sqlx::query_as::<_, ReplicationJob>(
        "SELECT * FROM replication_jobs WHERE status IN ('pending', 'running')",
    )
    .fetch_all(pool)
    .await
    .context("Failed to list active replication jobs")?;

    Ok(jobs)
}

pub async fn mark_running(
    pool: &Pool<MySql>,
    job_id: &str,
    agent_job_id: &str,
    total_bytes: i64,
) -> anyhow::Result<()> {
    sqlx::query(
        r#"UPDATE replication_jobs
           SET status = 'running', agent_job_id = ?, total_bytes = ?, started_at = CURRENT_TIMESTAMP
           WHERE id = ?"#,
    )
    .bind(agent_job_id)
    .bind(total_bytes)
    .bind(job_id)
    .execute(pool)
    .await
    .context("Failed to mark replication job running")?;

    Ok(())
}

pub async fn update_progress(
    pool: &Pool<MySql>,
    job_id: &str,
    bytes_transferred: i64,
    throughput_bps: i64,
    current_disk: Option<&str>,
) -> anyhow::Result<()> {
    sqlx::query(
        r#"UPDATE replication_jobs
           SET bytes_transferred = ?, throughput_bps = ?, current_disk = ?
           WHERE id = ?"#,
    )
    .bind(bytes_transferred)
    .bind(throughput_bps)
    .bind(current_disk)
    .bind(job_id)
    .execute(pool)
    .await
    .context("Failed to update replication progress")?;

    Ok(())
}

pub async fn mark_terminal(
    pool: &Pool<MySql>,
    job_id: &str,
    status: &str,
    error_message: Option<&str>,
) -> anyhow::Result<()> {
    sqlx::query(
        r#"UPDATE replication_jobs
           SET status = ?, error_message = ?, completed_at = CURRENT_TIMESTAMP
           WHERE id = ?"#,
    )
    .bind(status)
    .bind(error_message)
    .bind(job_id)
    .execute(pool)
    .await
    .context("Failed to close replication job")?;

    Ok(())
}
