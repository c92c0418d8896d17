use crate::db_manager::error::DatabaseError;
use crate::PROJECT_ROOT;
use colored::Colorize;
use log::info;
use sqlx::{MySql, Pool};
use std::env;

const SCHEMA_VERSION_KEY: &str = "ossea_migrate_schema_version";

/// Manages database schema migrations
pub struct MigrationManager;

impl MigrationManager {
    /// Initializes and migrates the appliance database schema
    pub async fn initialize_schema(pool: &Pool<MySql>) -> Result<(), DatabaseError> {
        info!("Initializing appliance database schema...");

        Self::initialize_metadata_table(pool).await?;

        let target_version = Self::get_target_schema_version()?;
        let current_version = Self::get_current_schema_version(pool).await?;

        if current_version == target_version {
            info!("Schema version check: OK (version {})", current_version);
            return Ok(());
        }

        if current_version > target_version {
            return Err(DatabaseError::SchemaVersionMismatch {
                current: current_version.to_string(),
                target: target_version.to_string(),
            });
        }

        for version in (current_version + 1)..=target_version {
            Self::apply_schema_version(pool, version).await?;
        }

        Self::set_schema_version(pool, target_version).await?;
        info!("{}", format!("✓ Schema migrated to version {}", target_version).green());
        Ok(())
    }

    /// Gets the target schema version from the environment or defaults to 1
    fn get_target_schema_version() -> Result<i64, DatabaseError> {
        let version = env::var("OSSEA_MIGRATE_SCHEMA_VERSION")
            .unwrap_or_else(|_| "1".to_string())
            .parse::<i64>()
            .map_err(|_| DatabaseError::Other("Invalid schema version".into()))?;

        Ok(version)
    }

    /// Gets the current schema version from the database
    async fn get_current_schema_version(pool: &Pool<MySql>) -> Result<i64, DatabaseError> {
        let version: Option<String> =
            sqlx::query_scalar("SELECT meta_value FROM metadata WHERE meta_key = ?")
                .bind(SCHEMA_VERSION_KEY)
                .fetch_optional(pool)
                .await
                .map_err(DatabaseError::SqlxError)?;

        Ok(version.and_then(|v| v.parse().ok()).unwrap_or(0))
    }

    async fn set_schema_version(pool: &Pool<MySql>, version: i64) -> Result<(), DatabaseError> {
        sqlx::query(
            "INSERT INTO metadata (meta_key, meta_value) VALUES (?, ?) \
             ON DUPLICATE KEY UPDATE meta_value = VALUES(meta_value)",
        )
        .bind(SCHEMA_VERSION_KEY)
        .bind(version.to_string())
        .execute(pool)
        .await
        .map_err(DatabaseError::SqlxError)?;

        Ok(())
    }

    /// The metadata table must exist before version bookkeeping can work.
    async fn initialize_metadata_table(pool: &Pool<MySql>) -> Result<(), DatabaseError> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS metadata (
                id BIGINT AUTO_INCREMENT PRIMARY KEY,
                meta_key VARCHAR(255) NOT NULL UNIQUE,
                meta_value TEXT NOT NULL,
                created_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP,
                updated_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP ON UPDATE CURRENT_TIMESTAMP
            )",
        )
        .execute(pool)
        .await
        .map_err(DatabaseError::SqlxError)?;

        Ok(())
    }

    /// Applies one schema version from its SQL file
    async fn apply_schema_version(pool: &Pool<MySql>, version: i64) -> Result<(), DatabaseError> {
        let schema_path = format!("{}/sql/v{}/mysql_up.sql", PROJECT_ROOT, version);
        info!("{}", format!("Applying schema from {}", schema_path).blue());

        let sql = std::fs::read_to_string(&schema_path).map_err(|e| {
            DatabaseError::MigrationError(format!("Failed to read {}: {}", schema_path, e))
        })?;

        for statement in split_sql_statements(&sql) {
            sqlx::query(&statement).execute(pool).await.map_err(|e| {
                DatabaseError::MigrationError(format!(
                    "Statement failed while applying version {}: {}",
                    version, e
                ))
            })?;
        }

        Ok(())
    }
}

/// Split an SQL script into individual statements, skipping comments and
/// blank lines.
pub fn split_sql_statements(sql: &str) -> Vec<String> {
    let mut statements = Vec::new();
    let mut current_statement = String::new();

    for line in sql.lines() {
        let trimmed = line.trim();

        if trimmed.is_empty() || trimmed.starts_with("--") || trimmed.starts_with('#') {
            continue;
        }

        current_statement.push_str(line);
        current_statement.push('\n');

        if trimmed.ends_with(';') {
            let stmt = current_statement.trim().trim_end_matches(';').trim().to_string();
            if !stmt.is_empty() {
                statements.push(stmt);
            }
            current_statement.clear();
        }
    }

    let tail = current_statement.trim();
    if !tail.is_empty() {
        statements.push(tail.trim_end_matches(';').trim().to_string());
    }

    statements
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_statements_and_drops_comments() {
        let sql = "-- header\nCREATE TABLE a (id INT);\n\n# note\nCREATE TABLE b (\n  id INT\n);\n";
        let statements = split_sql_statements(sql);
        assert_eq!(statements.len(), 2);
        assert!(statements[0].starts_with("CREATE TABLE a"));
        assert!(statements[1].contains("CREATE TABLE b"));
    }

    #[test]
    fn shipped_schema_parses_into_statements() {
        let sql = include_str!("../../sql/v1/mysql_up.sql");
        let statements = split_sql_statements(sql);
        assert!(statements.iter().all(|s| s.to_uppercase().starts_with("CREATE TABLE")));
        assert!(statements.iter().any(|s| s.contains("uq_vm_disk_identity")));
    }
}
