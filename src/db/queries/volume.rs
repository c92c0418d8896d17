use crate::models::volume::{DeviceMapping, OrphanedAttachment, OsseaVolume};
use anyhow::Context;
use sqlx::{MySql, Pool};

pub async fn insert_volume(
    pool: &Pool<MySql>,
    volume_id: &str,
    vm_disk_id: Option<i64>,
    size_gb: i64,
) -> anyhow::Result<OsseaVolume> {
    sqlx::query(
        r#"INSERT INTO ossea_volumes (volume_id, vm_disk_id, size_gb, status)
           VALUES (?, ?, ?, 'creating')"#,
    )
    .bind(volume_id)
    .bind(vm_disk_id)
    .bind(size_gb)
    .execute(pool)
    .await
    .context("Failed to insert volume")?;

    get_by_volume_id(pool, volume_id).await
}

pub async fn get_by_volume_id(pool: &Pool<MySql>, volume_id: &str) -> anyhow::Result<OsseaVolume> {
    let volume = sqlx::query_as::<_, OsseaVolume>("SELECT * FROM ossea_volumes WHERE volume_id = ?")
        .bind(volume_id)
        .fetch_one(pool)
        .await
        .context("Failed to fetch volume")?;

    Ok(volume)
}

pub async fn get_for_disk(pool: &Pool<MySql>, vm_disk_id: i64) -> anyhow::Result<Option<OsseaVolume>> {
    let volume = sqlx::query_as::<_, OsseaVolume>("SELECT * FROM ossea_volumes WHERE vm_disk_id = ?")
        .bind(vm_disk_id)
        .fetch_optional(pool)
        .await
        .context("Failed to fetch volume for disk")?;

    Ok(volume)
}

/// All volumes backing a context's disks, in bus/unit order.
pub async fn list_for_context(
    pool: &Pool<MySql>,
    vm_context_id: &str,
) -> anyhow::Result<Vec<OsseaVolume>> {
    let volumes = sqlx::query_as::<_, OsseaVolume>(
        r#"SELECT v.* FROM ossea_volumes v
           JOIN vm_disks d ON v.vm_disk_id = d.id
           WHERE d.vm_context_id = ?
           ORDER BY d.bus_number, d.unit_number"#,
    )
    .bind(vm_context_id)
    .fetch_all(pool)
    .await
    .context("Failed to list volumes for context")?;

    Ok(volumes)
}

/// Records an attachment. "volume attached + device path + mode" is one
/// logical transition; the daemon commits it together with the mapping row
/// inside a transaction via `record_attachment_with_mapping`.
pub async fn mark_attached(
    pool: &Pool<MySql>,
    volume_id: &str,
    attached_vm_id: &str,
    operation_mode: &str,
    device_path: Option<&str>,
) -> anyhow::Result<()> {
    sqlx::query(
        r#"UPDATE ossea_volumes
           SET attached_vm_id = ?, operation_mode = ?, device_path = ?, status = 'attached'
           WHERE volume_id = ?"#,
    )
    .bind(attached_vm_id)
    .bind(operation_mode)
    .bind(device_path)
    .bind(volume_id)
    .execute(pool)
    .await
    .context("Failed to mark volume attached")?;

    Ok(())
}

pub async fn mark_detached(pool: &Pool<MySql>, volume_id: &str) -> anyhow::Result<()> {
    sqlx::query(
        r#"UPDATE ossea_volumes
           SET attached_vm_id = NULL, operation_mode = NULL, device_path = NULL, status = 'available'
           WHERE volume_id = ?"#,
    )
    .bind(volume_id)
    .execute(pool)
    .await
    .context("Failed to mark volume detached")?;

    Ok(())
}

pub async fn mark_available(pool: &Pool<MySql>, volume_id: &str) -> anyhow::Result<()> {
    sqlx::query("UPDATE ossea_volumes SET status = 'available' WHERE volume_id = ?")
        .bind(volume_id)
        .execute(pool)
        .await
        .context("Failed to mark volume available")?;

    Ok(())
}

pub async fn delete_volume_row(pool: &Pool<MySql>, volume_id: &str) -> anyhow::Result<()> {
    sqlx::query("DELETE FROM ossea_volumes WHERE volume_id = ?")
        .bind(volume_id)
        .execute(pool)
        .await
        .context("Failed to delete volume row")?;

    Ok(())
}

/// Commits "attached + device known + stable mapping present" as one
/// transition. A partial failure rolls the whole attachment record back so
/// compensation logic sees a clean state.
pub async fn record_attachment_with_mapping(
    pool: &Pool<MySql>,
    volume_id: &str,
    attached_vm_id: &str,
    operation_mode: &str,
    device_path: &str,
    stable_name: &str,
    symlink_path: &str,
) -> anyhow::Result<()> {
    let mut tx = pool.begin().await?;

    sqlx::query(
        r#"UPDATE ossea_volumes
           SET attached_vm_id = ?, operation_mode = ?, device_path = ?, status = 'attached'
           WHERE volume_id = ?"#,
    )
    .bind(attached_vm_id)
    .bind(operation_mode)
    .bind(device_path)
    .bind(volume_id)
    .execute(&mut *tx)
    .await
    .context("Failed to record attachment")?;

    sqlx::query(
        r#"INSERT INTO device_mappings (
            volume_id, stable_name, symlink_path, kernel_path, operation_mode, attachment_state
        ) VALUES (?, ?, ?, ?, ?, 'attached')
        ON DUPLICATE KEY UPDATE
            kernel_path = VALUES(kernel_path),
            operation_mode = VALUES(operation_mode),
            attachment_state = 'attached'"#,
    )
    .bind(volume_id)
    .bind(stable_name)
    .bind(symlink_path)
    .bind(device_path)
    .bind(operation_mode)
    .execute(&mut *tx)
    .await
    .context("Failed to record device mapping")?;

    tx.commit().await?;
    Ok(())
}

/// The context that owns a volume, through its disk link. Detached scratch
/// volumes have none.
pub async fn context_for_volume(
    pool: &Pool<MySql>,
    volume_id: &str,
) -> anyhow::Result<Option<String>> {
    let context_id: Option<String> = sqlx::query_scalar(
        r#"SELECT d.vm_context_id FROM ossea_volumes v
           JOIN vm_disks d ON v.vm_disk_id = d.id
           WHERE v.volume_id = ?"#,
    )
    .bind(volume_id)
    .fetch_optional(pool)
    .await
    .context("Failed to resolve context for volume")?;

    Ok(context_id)
}

pub async fn get_device_mapping(
    pool: &Pool<MySql>,
    volume_id: &str,
) -> anyhow::Result<Option<DeviceMapping>> {
    let mapping =
        sqlx::query_as::<_, DeviceMapping>("SELECT * FROM device_mappings WHERE volume_id = ?")
            .bind(volume_id)
            .fetch_optional(pool)
            .await
            .context("Failed to fetch device mapping")?;

    Ok(mapping)
}

/// Detach keeps the row: the stable name stays reserved for this volume and
/// reattach reuses it.
pub async fn mark_mapping_detached(pool: &Pool<MySql>, volume_id: &str) -> anyhow::Result<()> {
    sqlx::query(
        r#"UPDATE device_mappings
           SET attachment_state = 'detached', kernel_path = NULL
           WHERE volume_id = ?"#,
    )
    .bind(volume_id)
    .execute(pool)
    .await
    .context("Failed to mark device mapping detached")?;

    Ok(())
}

pub async fn record_orphaned_attachment(
    pool: &Pool<MySql>,
    volume_id: &str,
    vm_context_id: Option<&str>,
    reason: &str,
    detail: &str,
) -> anyhow::Result<()> {
    sqlx::query(
        r#"INSERT INTO orphaned_attachments (volume_id, vm_context_id, reason, detail)
           VALUES (?, ?, ?, ?)"#,
    )
    .bind(volume_id)
    .bind(vm_context_id)
    .bind(reason)
    .bind(detail)
    .execute(pool)
    .await
    .context("Failed to record orphaned attachment")?;

    Ok(())
}

/// Unacknowledged correlation failures block further volume operations on
/// the affected context.
pub async fn unacknowledged_orphans_for_context(
    pool: &Pool<MySql>,
    vm_context_id: &str,
) -> anyhow::Result<Vec<OrphanedAttachment>> {
    let orphans = sqlx::query_as::<_, OrphanedAttachment>(
        "SELECT * FROM orphaned_attachments WHERE vm_context_id = ? AND acknowledged = FALSE",
    )
    .bind(vm_context_id)
    .fetch_all(pool)
    .await
    .context("Failed to list orphaned attachments")?;

    Ok(orphans)
}
