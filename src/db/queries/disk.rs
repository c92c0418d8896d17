use crate::models::disk::VmDisk;
use crate::models::vm_context::DiskSpec;
use anyhow::Context;
use sqlx::{MySql, Pool};

/// Upserts a disk row keyed by (vm_context_id, disk_key).
///
/// Disk identity survives across replication jobs: re-running a replication
/// updates size and job linkage in place and never inserts a duplicate. The
/// CBT cursor is deliberately not touched here; only a completed copy may
/// move it.
pub async fn upsert_disk(
    pool: &Pool<MySql>,
    vm_context_id: &str,
    spec: &DiskSpec,
    replication_job_id: &str,
) -> anyhow::Result<VmDisk> {
    sqlx::query(
        r#"INSERT INTO vm_disks (
            vm_context_id, disk_key, size_bytes, unit_number, bus_number, datastore, replication_job_id
        ) VALUES (?, ?, ?, ?, ?, ?, ?)
        ON DUPLICATE KEY UPDATE
            size_bytes = VALUES(size_bytes),
            unit_number = VALUES(unit_number),
            bus_number = VALUES(bus_number),
            datastore = VALUES(datastore),
            replication_job_id = VALUES(replication_job_id)"#,
    )
    .bind(vm_context_id)
    .bind(&spec.disk_key)
    .bind(spec.size_bytes)
    .bind(spec.unit_number)
    .bind(spec.bus_number)
    .bind(&spec.datastore)
    .bind(replication_job_id)
    .execute(pool)
    .await
    .context("Failed to upsert VM disk")?;

    get_disk(pool, vm_context_id, &spec.disk_key)
        .await?
        .context("Disk row missing after upsert")
}

pub async fn get_disk(
    pool: &Pool<MySql>,
    vm_context_id: &str,
    disk_key: &str,
) -> anyhow::Result<Option<VmDisk>> {
    let disk = sqlx::query_as::<_, VmDisk>(
        "SELECT * FROM vm_disks WHERE vm_context_id = ? AND disk_key = ?",
    )
    .bind(vm_context_id)
    .bind(disk_key)
    .fetch_optional(pool)
    .await
    .context("Failed to fetch VM disk")?;

    Ok(disk)
}

pub async fn get_disk_by_id(pool: &Pool<MySql>, id: i64) -> anyhow::Result<VmDisk> {
    let disk = sqlx::query_as::<_, VmDisk>("SELECT * FROM vm_disks WHERE id = ?")
        .bind(id)
        .fetch_one(pool)
        .await
        .context("Failed to fetch VM disk by id")?;

    Ok(disk)
}

/// Disks ordered by bus then unit, the order in which failover reattaches
/// them to the destination VM.
pub async fn list_disks_for_context(
    pool: &Pool<MySql>,
    vm_context_id: &str,
) -> anyhow::Result<Vec<VmDisk>> {
    let disks = sqlx::query_as::<_, VmDisk>(
        "SELECT * FROM vm_disks WHERE vm_context_id = ? ORDER BY bus_number, unit_number",
    )
    .bind(vm_context_id)
    .fetch_all(pool)
    .await
    .context("Failed to list VM disks")?;

    Ok(disks)
}

/// Stores the CBT cursor for one disk after a successful copy. Replaying the
/// same cursor is a no-op by design.
pub async fn set_change_id(
    pool: &Pool<MySql>,
    vm_context_id: &str,
    disk_key: &str,
    change_id: &str,
) -> anyhow::Result<()> {
    sqlx::query(
        "UPDATE vm_disks SET change_id = ? WHERE vm_context_id = ? AND disk_key = ?",
    )
    .bind(change_id)
    .bind(vm_context_id)
    .bind(disk_key)
    .execute(pool)
    .await
    .context("Failed to store CBT change id")?;

    Ok(())
}

pub async fn set_volume_link(
    pool: &Pool<MySql>,
    disk_id: i64,
    ossea_volume_id: i64,
) -> anyhow::Result<()> {
    sqlx::query("UPDATE vm_disks SET ossea_volume_id = ? WHERE id = ?")
        .bind(ossea_volume_id)
        .bind(disk_id)
        .execute(pool)
        .await
        .context("Failed to link disk to volume")?;

    Ok(())
}
