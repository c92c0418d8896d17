use crate::db_manager::error::DatabaseError;
use log::info;
use sqlx::{MySql, MySqlPool, Pool};

/// Name of the shared appliance database. The orchestrator and the volume
/// daemon open separate pools against the same schema.
const DATABASE_NAME: &str = "ossea_migrate";

/// Manages the database connection for one process
pub struct ConnectionManager {
    /// Main appliance database pool
    pool: Pool<MySql>,
}

impl ConnectionManager {
    /// Creates a new connection manager
    pub async fn new(base_url: &str) -> Result<Self, DatabaseError> {
        // Connect to the MySQL server without specifying a database
        info!("Connecting to MySQL server at {}", base_url);
        let server_pool = MySqlPool::connect(base_url)
            .await
            .map_err(|e| DatabaseError::ConnectionError(e.to_string()))?;

        Self::ensure_database_exists(&server_pool, DATABASE_NAME).await?;

        let db_url = format!("{}/{}", base_url, DATABASE_NAME);
        info!("Connecting to appliance database at {}", db_url);
        let pool = MySqlPool::connect(&db_url).await.map_err(|e| {
            DatabaseError::ConnectionError(format!("Failed to connect to appliance database: {}", e))
        })?;

        info!("✓ Database connection established");

        Ok(Self { pool })
    }

    /// Ensures a database exists, creating it if necessary
    pub async fn ensure_database_exists(
        pool: &Pool<MySql>,
        db_name: &str,
    ) -> Result<(), DatabaseError> {
        info!("Ensuring database exists: {}", db_name);
        let query = format!("CREATE DATABASE IF NOT EXISTS `{}`", db_name);
        sqlx::query(&query)
            .execute(pool)
            .await
            .map_err(DatabaseError::SqlxError)?;

        info!("✓ Database {} exists or was created", db_name);
        Ok(())
    }

    /// Gets the database pool
    pub fn pool(&self) -> &Pool<MySql> {
        &self.pool
    }
}
