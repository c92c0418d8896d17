use crate::models::network_mapping::NetworkMapping;
use anyhow::Context;
use sqlx::{MySql, Pool};

pub async fn upsert_mapping(
    pool: &Pool<MySql>,
    vm_context_id: &str,
    source_network_name: &str,
    destination_network_id: Option<&str>,
    test_network_id: Option<&str>,
) -> anyhow::Result<NetworkMapping> {
    sqlx::query(
        r#"INSERT INTO network_mappings (
            vm_context_id, source_network_name, destination_network_id, test_network_id
        ) VALUES (?, ?, ?, ?)
        ON DUPLICATE KEY UPDATE
            destination_network_id = VALUES(destination_network_id),
            test_network_id = VALUES(test_network_id)"#,
    )
    .bind(vm_context_id)
    .bind(source_network_name)
    .bind(destination_network_id)
    .bind(test_network_id)
    .execute(pool)
    .await
    .context("Failed to upsert network mapping")?;

    let mapping = sqlx::query_as::<_, NetworkMapping>(
        "SELECT * FROM network_mappings WHERE vm_context_id = ? AND source_network_name = ?",
    )
    .bind(vm_context_id)
    .bind(source_network_name)
    .fetch_one(pool)
    .await
    .context("Mapping row missing after upsert")?;

    Ok(mapping)
}

pub async fn list_for_context(
    pool: &Pool<MySql>,
    vm_context_id: &str,
) -> anyhow::Result<Vec<NetworkMapping>> {
    let mappings = sqlx::query_as::<_, NetworkMapping>(
        "SELECT * FROM network_mappings WHERE vm_context_id = ?",
    )
    .bind(vm_context_id)
    .fetch_all(pool)
    .await
    .context("Failed to list network mappings")?;

    Ok(mappings)
}

pub async fn delete_mapping(
    pool: &Pool<MySql>,
    vm_context_id: &str,
    source_network_name: &str,
) -> anyhow::Result<bool> {
    let result = sqlx::query(
        "DELETE FROM network_mappings WHERE vm_context_id = ? AND source_network_name = ?",
    )
    .bind(vm_context_id)
    .bind(source_network_name)
    .execute(pool)
    .await
    .context("Failed to delete network mapping")?;

    Ok(result.rows_affected() > 0)
}
