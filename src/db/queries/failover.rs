use crate::models::failover::FailoverJob;
use anyhow::Context;
use sqlx::{MySql, Pool};

pub async fn create_job(
    pool: &Pool<MySql>,
    job_id: &str,
    vm_context_id: &str,
    failover_type: &str,
    network_strategy: &str,
) -> anyhow::Result<FailoverJob> {
    sqlx::query(
        r#"INSERT INTO failover_jobs (
            id, vm_context_id, failover_type, phase, status, network_strategy, started_at
        ) VALUES (?, ?, ?, 'validate', 'running', ?, CURRENT_TIMESTAMP)"#,
    )
    .bind(job_id)
    .bind(vm_context_id)
    .bind(failover_type)
    .bind(network_strategy)
    .execute(pool)
    .await
    .context("Failed to create failover job")?;

    get_job(pool, job_id).await
}

pub async fn get_job(pool: &Pool<MySql>, job_id: &str) -> anyhow::Result<FailoverJob> {
    let job = sqlx::query_as::<_, FailoverJob>("SELECT * FROM failover_jobs WHERE id = ?")
        .bind(job_id)
        .fetch_one(pool)
        .await
        .context("Failed to fetch failover job")?;

    Ok(job)
}

pub async fn find_active_for_context(
    pool: &Pool<MySql>,
    vm_context_id: &str,
) -> anyhow::Result<Option<FailoverJob>> {
    let job = sqlx::query_as::<_, FailoverJob>(
        "SELECT * FROM failover_jobs WHERE vm_context_id = ? AND status = 'running'",
    )
    .bind(vm_context_id)
    .fetch_optional(pool)
    .await
    .context("Failed to look up active failover job")?;

    Ok(job)
}

/// Most recent completed test failover, the one cleanup rolls back.
pub async fn latest_completed_test(
    pool: &Pool<MySql>,
    vm_context_id: &str,
) -> anyhow::Result<Option<FailoverJob>> {
    let job = sqlx::query_as::<_, FailoverJob>(
        r#"SELECT * FROM failover_jobs
           WHERE vm_context_id = ? AND failover_type = 'test' AND status = 'completed'
           ORDER BY completed_at DESC LIMIT 1"#,
    )
    .bind(vm_context_id)
    .fetch_optional(pool)
    .await
    .context("Failed to fetch completed test failover")?;

    Ok(job)
}

/// Completed live failovers still holding snapshots past the retention
/// cutoff.
pub async fn live_snapshots_past_retention(
    pool: &Pool<MySql>,
    retention_hours: u32,
) -> anyhow::Result<Vec<FailoverJob>> {
    let jobs = sqlx::query_as::<_, FailoverJob>(
        r#"SELECT * FROM failover_jobs
           WHERE failover_type = 'live' AND status = 'completed'
             AND snapshot_ids IS NOT NULL
             AND completed_at < DATE_SUB(CURRENT_TIMESTAMP, INTERVAL ? HOUR)"#,
    )
    .bind(retention_hours)
    .fetch_all(pool)
    .await
    .context("Failed to list live failovers past snapshot retention")?;

    Ok(jobs)
}

pub async fn clear_snapshot_ids(pool: &Pool<MySql>, job_id: &str) -> anyhow::Result<()> {
    sqlx::query("UPDATE failover_jobs SET snapshot_ids = NULL WHERE id = ?")
        .bind(job_id)
        .execute(pool)
        .await
        .context("Failed to clear snapshot ids")?;

    Ok(())
}

pub async fn update_phase(pool: &Pool<MySql>, job_id: &str, phase: &str) -> anyhow::Result<()> {
    sqlx::query("UPDATE failover_jobs SET phase = ? WHERE id = ?")
        .bind(phase)
        .bind(job_id)
        .execute(pool)
        .await
        .context("Failed to update failover phase")?;

    Ok(())
}

pub async fn set_destination_vm(
    pool: &Pool<MySql>,
    job_id: &str,
    destination_vm_id: &str,
) -> anyhow::Result<()> {
    sqlx::query("UPDATE failover_jobs SET destination_vm_id = ? WHERE id = ?")
        .bind(destination_vm_id)
        .bind(job_id)
        .execute(pool)
        .await
        .context("Failed to record destination VM")?;

    Ok(())
}

pub async fn set_snapshot_ids(
    pool: &Pool<MySql>,
    job_id: &str,
    snapshot_ids_json: &str,
) -> anyhow::Result<()> {
    sqlx::query("UPDATE failover_jobs SET snapshot_ids = ? WHERE id = ?")
        .bind(snapshot_ids_json)
        .bind(job_id)
        .execute(pool)
        .await
        .context("Failed to record snapshot ids")?;

    Ok(())
}

pub async fn mark_terminal(
    pool: &Pool<MySql>,
    job_id: &str,
    status: &str,
    error_message: Option<&str>,
) -> anyhow::Result<()> {
    sqlx::query(
        r#"UPDATE failover_jobs
           SET status = ?, error_message = ?, completed_at = CURRENT_TIMESTAMP
           WHERE id = ?"#,
    )
    .bind(status)
    .bind(error_message)
    .bind(job_id)
    .execute(pool)
    .await
    .context("Failed to close failover job")?;

    Ok(())
}
