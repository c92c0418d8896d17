use crate::models::schedule::{ReplicationSchedule, ScheduleMember};
use anyhow::Context;
use chrono::{DateTime, Utc};
use sqlx::{MySql, Pool};

pub async fn create_schedule(
    pool: &Pool<MySql>,
    name: &str,
    cron_expression: &str,
    replication_type: &str,
    max_concurrent: i32,
) -> anyhow::Result<ReplicationSchedule> {
    sqlx::query(
        r#"INSERT INTO replication_schedules (name, cron_expression, replication_type, max_concurrent)
           VALUES (?, ?, ?, ?)"#,
    )
    .bind(name)
    .bind(cron_expression)
    .bind(replication_type)
    .bind(max_concurrent)
    .execute(pool)
    .await
    .context("Failed to create schedule")?;

    let schedule = sqlx::query_as::<_, ReplicationSchedule>(
        "SELECT * FROM replication_schedules WHERE name = ?",
    )
    .bind(name)
    .fetch_one(pool)
    .await
    .context("Schedule row missing after insert")?;

    Ok(schedule)
}

pub async fn get_schedule(pool: &Pool<MySql>, id: i64) -> anyhow::Result<ReplicationSchedule> {
    let schedule =
        sqlx::query_as::<_, ReplicationSchedule>("SELECT * FROM replication_schedules WHERE id = ?")
            .bind(id)
            .fetch_one(pool)
            .await
            .context("Failed to fetch schedule")?;

    Ok(schedule)
}

pub async fn list_schedules(pool: &Pool<MySql>) -> anyhow::Result<Vec<ReplicationSchedule>> {
    let schedules =
        sqlx::query_as::<_, ReplicationSchedule>("SELECT * FROM replication_schedules ORDER BY id")
            .fetch_all(pool)
            .await
            .context("Failed to list schedules")?;

    Ok(schedules)
}

pub async fn list_enabled(pool: &Pool<MySql>) -> anyhow::Result<Vec<ReplicationSchedule>> {
    let schedules = sqlx::query_as::<_, ReplicationSchedule>(
        "SELECT * FROM replication_schedules WHERE enabled = TRUE",
    )
    .fetch_all(pool)
    .await
    .context("Failed to list enabled schedules")?;

    Ok(schedules)
}

pub async fn set_run_times(
    pool: &Pool<MySql>,
    id: i64,
    last_run_at: DateTime<Utc>,
    next_run_at: Option<DateTime<Utc>>,
) -> anyhow::Result<()> {
    sqlx::query("UPDATE replication_schedules SET last_run_at = ?, next_run_at = ? WHERE id = ?")
        .bind(last_run_at)
        .bind(next_run_at)
        .bind(id)
        .execute(pool)
        .await
        .context("Failed to update schedule run times")?;

    Ok(())
}

pub async fn add_member(pool: &Pool<MySql>, schedule_id: i64, vm_context_id: &str) -> anyhow::Result<()> {
    sqlx::query(
        r#"INSERT INTO schedule_members (schedule_id, vm_context_id) VALUES (?, ?)
           ON DUPLICATE KEY UPDATE vm_context_id = VALUES(vm_context_id)"#,
    )
    .bind(schedule_id)
    .bind(vm_context_id)
    .execute(pool)
    .await
    .context("Failed to add schedule member")?;

    Ok(())
}

pub async fn remove_member(
    pool: &Pool<MySql>,
    schedule_id: i64,
    vm_context_id: &str,
) -> anyhow::Result<bool> {
    let result =
        sqlx::query("DELETE FROM schedule_members WHERE schedule_id = ? AND vm_context_id = ?")
            .bind(schedule_id)
            .bind(vm_context_id)
            .execute(pool)
            .await
            .context("Failed to remove schedule member")?;

    Ok(result.rows_affected() > 0)
}

pub async fn members_for_schedule(
    pool: &Pool<MySql>,
    schedule_id: i64,
) -> anyhow::Result<Vec<ScheduleMember>> {
    let members =
        sqlx::query_as::<_, ScheduleMember>("SELECT * FROM schedule_members WHERE schedule_id = ?")
            .bind(schedule_id)
            .fetch_all(pool)
            .await
            .context("Failed to list schedule members")?;

    Ok(members)
}

pub async fn delete_schedule(pool: &Pool<MySql>, id: i64) -> anyhow::Result<bool> {
    let result = sqlx::query("DELETE FROM replication_schedules WHERE id = ?")
        .bind(id)
        .execute(pool)
        .await
        .context("Failed to delete schedule")?;

    Ok(result.rows_affected() > 0)
}
