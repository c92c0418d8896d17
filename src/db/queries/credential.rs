use crate::models::credential::VmwareCredential;
use anyhow::Context;
use sqlx::{MySql, Pool};

pub async fn create_credential(
    pool: &Pool<MySql>,
    name: &str,
    vcenter_host: &str,
    username: &str,
    password_ciphertext: &str,
    datacenter: Option<&str>,
) -> anyhow::Result<VmwareCredential> {
    crate::credentials::validate_ciphertext(password_ciphertext)?;

    sqlx::query(
        r#"INSERT INTO vmware_credentials (name, vcenter_host, username, password_ciphertext, datacenter)
           VALUES (?, ?, ?, ?, ?)"#,
    )
    .bind(name)
    .bind(vcenter_host)
    .bind(username)
    .bind(password_ciphertext)
    .bind(datacenter)
    .execute(pool)
    .await
    .context("Failed to create credential")?;

    let credential =
        sqlx::query_as::<_, VmwareCredential>("SELECT * FROM vmware_credentials WHERE name = ?")
            .bind(name)
            .fetch_one(pool)
            .await
            .context("Credential row missing after insert")?;

    Ok(credential)
}

pub async fn get_by_id(pool: &Pool<MySql>, id: i64) -> anyhow::Result<VmwareCredential> {
    let credential =
        sqlx::query_as::<_, VmwareCredential>("SELECT * FROM vmware_credentials WHERE id = ?")
            .bind(id)
            .fetch_one(pool)
            .await
            .context("Failed to fetch credential")?;

    Ok(credential)
}

pub async fn get_default(pool: &Pool<MySql>) -> anyhow::Result<Option<VmwareCredential>> {
    let credential = sqlx::query_as::<_, VmwareCredential>(
        "SELECT * FROM vmware_credentials WHERE is_default = TRUE LIMIT 1",
    )
    .fetch_optional(pool)
    .await
    .context("Failed to fetch default credential")?;

    Ok(credential)
}

pub async fn list_all(pool: &Pool<MySql>) -> anyhow::Result<Vec<VmwareCredential>> {
    let credentials =
        sqlx::query_as::<_, VmwareCredential>("SELECT * FROM vmware_credentials ORDER BY id")
            .fetch_all(pool)
            .await
            .context("Failed to list credentials")?;

    Ok(credentials)
}
