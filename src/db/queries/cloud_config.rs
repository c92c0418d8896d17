use crate::models::cloud_config::OsseaConfig;
use anyhow::Context;
use sqlx::{MySql, Pool};

/// The active destination-cloud configuration. Process-wide state read from
/// the database, never a compile-time constant; the volume daemon calls this
/// on every attach decision.
pub async fn get_active(pool: &Pool<MySql>) -> anyhow::Result<Option<OsseaConfig>> {
    let config =
        sqlx::query_as::<_, OsseaConfig>("SELECT * FROM ossea_configs WHERE is_active = TRUE")
            .fetch_optional(pool)
            .await
            .context("Failed to fetch active cloud config")?;

    Ok(config)
}

pub async fn get_by_id(pool: &Pool<MySql>, id: i64) -> anyhow::Result<OsseaConfig> {
    let config = sqlx::query_as::<_, OsseaConfig>("SELECT * FROM ossea_configs WHERE id = ?")
        .bind(id)
        .fetch_one(pool)
        .await
        .context("Failed to fetch cloud config")?;

    Ok(config)
}

pub async fn list_all(pool: &Pool<MySql>) -> anyhow::Result<Vec<OsseaConfig>> {
    let configs = sqlx::query_as::<_, OsseaConfig>("SELECT * FROM ossea_configs ORDER BY id")
        .fetch_all(pool)
        .await
        .context("Failed to list cloud configs")?;

    Ok(configs)
}

#[allow(clippy::too_many_arguments)]
pub async fn create_config(
    pool: &Pool<MySql>,
    name: &str,
    api_url: &str,
    api_key_ciphertext: &str,
    secret_key_ciphertext: &str,
    zone_id: &str,
    template_id: &str,
    service_offering_id: &str,
    disk_offering_id: &str,
    default_network_id: &str,
    oma_vm_id: &str,
) -> anyhow::Result<OsseaConfig> {
    sqlx::query(
        r#"INSERT INTO ossea_configs (
            name, api_url, api_key_ciphertext, secret_key_ciphertext, zone_id,
            template_id, service_offering_id, disk_offering_id, default_network_id, oma_vm_id
        ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"#,
    )
    .bind(name)
    .bind(api_url)
    .bind(api_key_ciphertext)
    .bind(secret_key_ciphertext)
    .bind(zone_id)
    .bind(template_id)
    .bind(service_offering_id)
    .bind(disk_offering_id)
    .bind(default_network_id)
    .bind(oma_vm_id)
    .execute(pool)
    .await
    .context("Failed to create cloud config")?;

    let config = sqlx::query_as::<_, OsseaConfig>("SELECT * FROM ossea_configs WHERE name = ?")
        .bind(name)
        .fetch_one(pool)
        .await
        .context("Config row missing after insert")?;

    Ok(config)
}

/// Activates one configuration; the at-most-one-active invariant is held by
/// clearing the flag everywhere else inside the same transaction.
pub async fn set_active(pool: &Pool<MySql>, id: i64) -> anyhow::Result<()> {
    let mut tx = pool.begin().await?;

    sqlx::query("UPDATE ossea_configs SET is_active = FALSE WHERE is_active = TRUE")
        .execute(&mut *tx)
        .await
        .context("Failed to clear active cloud config")?;

    sqlx::query("UPDATE ossea_configs SET is_active = TRUE WHERE id = ?")
        .bind(id)
        .execute(&mut *tx)
        .await
        .context("Failed to set active cloud config")?;

    tx.commit().await?;
    Ok(())
}
