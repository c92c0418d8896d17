use crate::models::job::{Job, JobLogEntry, JobStep};
use anyhow::Context;
use sqlx::{MySql, Pool};

pub async fn create_job(
    pool: &Pool<MySql>,
    job_id: &str,
    job_type: &str,
    owner: &str,
    vm_context_id: Option<&str>,
    correlation_id: &str,
) -> anyhow::Result<Job> {
    sqlx::query(
        r#"INSERT INTO jobs (id, job_type, owner, vm_context_id, correlation_id, status)
           VALUES (?, ?, ?, ?, ?, 'running')"#,
    )
    .bind(job_id)
    .bind(job_type)
    .bind(owner)
    .bind(vm_context_id)
    .bind(correlation_id)
    .execute(pool)
    .await
    .context("Failed to create tracked job")?;

    get_job(pool, job_id).await
}

pub async fn get_job(pool: &Pool<MySql>, job_id: &str) -> anyhow::Result<Job> {
    let job = sqlx::query_as::<_, Job>("SELECT * FROM jobs WHERE id = ?")
        .bind(job_id)
        .fetch_one(pool)
        .await
        .context("Failed to fetch tracked job")?;

    Ok(job)
}

/// Jobs the recovery scan must reconcile after a restart.
pub async fn list_active(pool: &Pool<MySql>) -> anyhow::Result<Vec<Job>> {
    let jobs = sqlx::query_as::<_, Job>("SELECT * FROM jobs WHERE status = 'running'")
        .fetch_all(pool)
        .await
        .context("Failed to list active jobs")?;

    Ok(jobs)
}

pub async fn set_external_job_id(
    pool: &Pool<MySql>,
    job_id: &str,
    external_job_id: &str,
) -> anyhow::Result<()> {
    sqlx::query("UPDATE jobs SET external_job_id = ? WHERE id = ?")
        .bind(external_job_id)
        .bind(job_id)
        .execute(pool)
        .await
        .context("Failed to set external job id")?;

    Ok(())
}

pub async fn close_job(
    pool: &Pool<MySql>,
    job_id: &str,
    status: &str,
    error_message: Option<&str>,
) -> anyhow::Result<()> {
    sqlx::query(
        r#"UPDATE jobs SET status = ?, error_message = ?, completed_at = CURRENT_TIMESTAMP
           WHERE id = ?"#,
    )
    .bind(status)
    .bind(error_message)
    .bind(job_id)
    .execute(pool)
    .await
    .context("Failed to close tracked job")?;

    Ok(())
}

pub async fn create_step(
    pool: &Pool<MySql>,
    job_id: &str,
    seq: i32,
    name: &str,
) -> anyhow::Result<i64> {
    let result = sqlx::query(
        "INSERT INTO job_steps (job_id, seq, name, status) VALUES (?, ?, ?, 'running')",
    )
    .bind(job_id)
    .bind(seq)
    .bind(name)
    .execute(pool)
    .await
    .context("Failed to create job step")?;

    Ok(result.last_insert_id() as i64)
}

pub async fn close_step(
    pool: &Pool<MySql>,
    step_id: i64,
    status: &str,
    error_message: Option<&str>,
) -> anyhow::Result<()> {
    sqlx::query(
        r#"UPDATE job_steps SET status = ?, error_message = ?, completed_at = CURRENT_TIMESTAMP
           WHERE id = ?"#,
    )
    .bind(status)
    .bind(error_message)
    .bind(step_id)
    .execute(pool)
    .await
    .context("Failed to close job step")?;

    Ok(())
}

pub async fn append_log(
    pool: &Pool<MySql>,
    step_id: i64,
    level: &str,
    message: &str,
    detail: Option<&str>,
) -> anyhow::Result<()> {
    sqlx::query("INSERT INTO job_logs (job_step_id, level, message, detail) VALUES (?, ?, ?, ?)")
        .bind(step_id)
        .bind(level)
        .bind(message)
        .bind(detail)
        .execute(pool)
        .await
        .context("Failed to append job log")?;

    Ok(())
}

pub async fn steps_for_job(pool: &Pool<MySql>, job_id: &str) -> anyhow::Result<Vec<JobStep>> {
    let steps = sqlx::query_as::<_, JobStep>(
        "SELECT * FROM job_steps WHERE job_id = ? ORDER BY seq",
    )
    .bind(job_id)
    .fetch_all(pool)
    .await
    .context("Failed to list job steps")?;

    Ok(steps)
}

pub async fn logs_for_step(pool: &Pool<MySql>, step_id: i64) -> anyhow::Result<Vec<JobLogEntry>> {
    let logs = sqlx::query_as::<_, JobLogEntry>(
        "SELECT * FROM job_logs WHERE job_step_id = ? ORDER BY id",
    )
    .bind(step_id)
    .fetch_all(pool)
    .await
    .context("Failed to list job logs")?;

    Ok(logs)
}
