use crate::models::vm_context::{VmContext, VmSpec};
use anyhow::Context;
use sqlx::{MySql, Pool};
use uuid::Uuid;

/// Resolves a context by (vmware_path, vcenter_host), creating it when the
/// VM is first added to management.
///
/// The pair is the context's natural identity and is protected by a unique
/// key, so concurrent callers race to one row; the loser of the race falls
/// back to reading the winner's row.
pub async fn resolve_or_create(
    pool: &Pool<MySql>,
    spec: &VmSpec,
    vcenter_host: &str,
    ossea_config_id: Option<i64>,
    credential_id: Option<i64>,
) -> anyhow::Result<VmContext> {
    if let Some(existing) = get_by_path(pool, &spec.vmware_path, vcenter_host).await? {
        return Ok(existing);
    }

    let context_id = format!("ctx-{}", Uuid::new_v4());
    let insert = sqlx::query(
        r#"INSERT INTO vm_contexts (
            context_id, vm_name, vmware_path, vcenter_host, datacenter,
            cpu_count, memory_mb, power_state, os_type, ossea_config_id, credential_id
        ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"#,
    )
    .bind(&context_id)
    .bind(&spec.vm_name)
    .bind(&spec.vmware_path)
    .bind(vcenter_host)
    .bind(&spec.datacenter)
    .bind(spec.cpu_count)
    .bind(spec.memory_mb)
    .bind(&spec.power_state)
    .bind(&spec.os_type)
    .bind(ossea_config_id)
    .bind(credential_id)
    .execute(pool)
    .await;

    match insert {
        Ok(_) => get_by_id(pool, &context_id).await,
        // Unique-key race: another caller created the row first
        Err(sqlx::Error::Database(e)) if e.is_unique_violation() => get_by_path(pool, &spec.vmware_path, vcenter_host)
            .await?
            .context("Context vanished after unique-key conflict"),
        Err(e) => Err(e).context("Failed to create VM context"),
    }
}

pub async fn get_by_id(pool: &Pool<MySql>, context_id: &str) -> anyhow::Result<VmContext> {
    let context = sqlx::query_as::<_, VmContext>("SELECT * FROM vm_contexts WHERE context_id = ?")
        .bind(context_id)
        .fetch_one(pool)
        .await
        .context("Failed to fetch VM context")?;

    Ok(context)
}

pub async fn get_by_path(
    pool: &Pool<MySql>,
    vmware_path: &str,
    vcenter_host: &str,
) -> anyhow::Result<Option<VmContext>> {
    let context = sqlx::query_as::<_, VmContext>(
        "SELECT * FROM vm_contexts WHERE vmware_path = ? AND vcenter_host = ?",
    )
    .bind(vmware_path)
    .bind(vcenter_host)
    .fetch_optional(pool)
    .await
    .context("Failed to fetch VM context by path")?;

    Ok(context)
}

pub async fn list_all(pool: &Pool<MySql>) -> anyhow::Result<Vec<VmContext>> {
    let contexts = sqlx::query_as::<_, VmContext>("SELECT * FROM vm_contexts ORDER BY created_at")
        .fetch_all(pool)
        .await
        .context("Failed to list VM contexts")?;

    Ok(contexts)
}

pub async fn update_status(
    pool: &Pool<MySql>,
    context_id: &str,
    status: &str,
) -> anyhow::Result<()> {
    sqlx::query("UPDATE vm_contexts SET status = ? WHERE context_id = ?")
        .bind(status)
        .bind(context_id)
        .execute(pool)
        .await
        .context("Failed to update VM context status")?;

    Ok(())
}

/// Refreshes the cached spec columns from a fresh discovery. Display-only:
/// workflows always consume the discovery payload directly.
pub async fn update_cached_specs(
    pool: &Pool<MySql>,
    context_id: &str,
    spec: &VmSpec,
) -> anyhow::Result<()> {
    sqlx::query(
        r#"UPDATE vm_contexts
           SET vm_name = ?, cpu_count = ?, memory_mb = ?, power_state = ?, os_type = ?
           WHERE context_id = ?"#,
    )
    .bind(&spec.vm_name)
    .bind(spec.cpu_count)
    .bind(spec.memory_mb)
    .bind(&spec.power_state)
    .bind(&spec.os_type)
    .bind(context_id)
    .execute(pool)
    .await
    .context("Failed to refresh cached VM specs")?;

    Ok(())
}

/// Persists the sanitized summary of the last operation so the UI can render
/// post-mortem detail without walking the job-step log.
pub async fn set_last_operation_summary(
    pool: &Pool<MySql>,
    context_id: &str,
    summary: &str,
) -> anyhow::Result<()> {
    sqlx::query("UPDATE vm_contexts SET last_operation_summary = ? WHERE context_id = ?")
        .bind(summary)
        .bind(context_id)
        .execute(pool)
        .await
        .context("Failed to store last operation summary")?;

    Ok(())
}

/// Explicit removal; cascades to disks, jobs, volumes, exports, and
/// mappings via foreign keys.
pub async fn delete_vm_context(pool: &Pool<MySql>, context_id: &str) -> anyhow::Result<()> {
    sqlx::query("DELETE FROM vm_contexts WHERE context_id = ?")
        .bind(context_id)
        .execute(pool)
        .await
        .context("Failed to delete VM context")?;

    Ok(())
}
