use crate::models::export::NbdExport;
use anyhow::Context;
use sqlx::{MySql, Pool};

pub async fn create_export(
    pool: &Pool<MySql>,
    export_name: &str,
    volume_id: &str,
    vm_disk_id: i64,
    job_id: &str,
    backing_path: &str,
    read_only: bool,
    port: i32,
) -> anyhow::Result<NbdExport> {
    sqlx::query(
        r#"INSERT INTO nbd_exports (
            export_name, volume_id, vm_disk_id, job_id, backing_path, read_only, port
        ) VALUES (?, ?, ?, ?, ?, ?, ?)"#,
    )
    .bind(export_name)
    .bind(volume_id)
    .bind(vm_disk_id)
    .bind(job_id)
    .bind(backing_path)
    .bind(read_only)
    .bind(port)
    .execute(pool)
    .await
    .context("Failed to create export record")?;

    get_by_name(pool, export_name)
        .await?
        .context("Export row missing after insert")
}

pub async fn get_by_name(pool: &Pool<MySql>, export_name: &str) -> anyhow::Result<Option<NbdExport>> {
    let export = sqlx::query_as::<_, NbdExport>("SELECT * FROM nbd_exports WHERE export_name = ?")
        .bind(export_name)
        .fetch_optional(pool)
        .await
        .context("Failed to fetch export")?;

    Ok(export)
}

pub async fn list_all(pool: &Pool<MySql>) -> anyhow::Result<Vec<NbdExport>> {
    let exports = sqlx::query_as::<_, NbdExport>("SELECT * FROM nbd_exports ORDER BY export_name")
        .fetch_all(pool)
        .await
        .context("Failed to list exports")?;

    Ok(exports)
}

pub async fn list_for_volume(pool: &Pool<MySql>, volume_id: &str) -> anyhow::Result<Vec<NbdExport>> {
    let exports = sqlx::query_as::<_, NbdExport>("SELECT * FROM nbd_exports WHERE volume_id = ?")
        .bind(volume_id)
        .fetch_all(pool)
        .await
        .context("Failed to list exports for volume")?;

    Ok(exports)
}

/// Idempotent: deleting an export that is already gone is success.
pub async fn delete_by_name(pool: &Pool<MySql>, export_name: &str) -> anyhow::Result<bool> {
    let result = sqlx::query("DELETE FROM nbd_exports WHERE export_name = ?")
        .bind(export_name)
        .execute(pool)
        .await
        .context("Failed to delete export record")?;

    Ok(result.rows_affected() > 0)
}
