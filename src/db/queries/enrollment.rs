use crate::models::enrollment::AgentEnrollment;
use anyhow::Context;
use sqlx::{MySql, Pool};

pub async fn create_enrollment(
    pool: &Pool<MySql>,
    id: &str,
    agent_name: &str,
    public_key: &str,
    fingerprint: &str,
    pairing_code: &str,
) -> anyhow::Result<AgentEnrollment> {
    sqlx::query(
        r#"INSERT INTO agent_enrollments (id, agent_name, public_key, fingerprint, pairing_code)
           VALUES (?, ?, ?, ?, ?)"#,
    )
    .bind(id)
    .bind(agent_name)
    .bind(public_key)
    .bind(fingerprint)
    .bind(pairing_code)
    .execute(pool)
    .await
    .context("Failed to create enrollment")?;

    get_enrollment(pool, id).await
}

pub async fn get_enrollment(pool: &Pool<MySql>, id: &str) -> anyhow::Result<AgentEnrollment> {
    let enrollment =
        sqlx::query_as::<_, AgentEnrollment>("SELECT * FROM agent_enrollments WHERE id = ?")
            .bind(id)
            .fetch_one(pool)
            .await
            .context("Failed to fetch enrollment")?;

    Ok(enrollment)
}

pub async fn list_pending(pool: &Pool<MySql>) -> anyhow::Result<Vec<AgentEnrollment>> {
    let enrollments = sqlx::query_as::<_, AgentEnrollment>(
        "SELECT * FROM agent_enrollments WHERE state = 'pending_approval' ORDER BY created_at",
    )
    .fetch_all(pool)
    .await
    .context("Failed to list pending enrollments")?;

    Ok(enrollments)
}

/// Approved enrollments, oldest first; the newest one is the live agent.
pub async fn list_approved(pool: &Pool<MySql>) -> anyhow::Result<Vec<AgentEnrollment>> {
    let enrollments = sqlx::query_as::<_, AgentEnrollment>(
        "SELECT * FROM agent_enrollments WHERE state = 'approved' ORDER BY updated_at",
    )
    .fetch_all(pool)
    .await
    .context("Failed to list approved enrollments")?;

    Ok(enrollments)
}

pub async fn update_state(
    pool: &Pool<MySql>,
    id: &str,
    state: &str,
    approved_by: Option<&str>,
) -> anyhow::Result<()> {
    sqlx::query("UPDATE agent_enrollments SET state = ?, approved_by = ? WHERE id = ?")
        .bind(state)
        .bind(approved_by)
        .bind(id)
        .execute(pool)
        .await
        .context("Failed to update enrollment state")?;

    Ok(())
}
