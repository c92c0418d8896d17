use crate::db_manager::connection::ConnectionManager;
use crate::db_manager::error::DatabaseError;
use crate::db_manager::migration::MigrationManager;
use sqlx::{MySql, Pool};

/// Central manager for all database operations
pub struct DatabaseManager {
    /// Connection manager for the database pool
    connection_manager: ConnectionManager,
}

impl DatabaseManager {
    /// Creates a new database manager and brings the schema up to the
    /// target version.
    pub async fn new(connection_url: &str) -> Result<Self, DatabaseError> {
        let connection_manager = ConnectionManager::new(connection_url).await?;

        let manager = Self { connection_manager };

        manager.initialize_schema().await?;

        Ok(manager)
    }

    /// Opens a pool without running migrations. The volume daemon uses this:
    /// schema ownership stays with the orchestrator.
    pub async fn connect_existing(connection_url: &str) -> Result<Self, DatabaseError> {
        let connection_manager = ConnectionManager::new(connection_url).await?;
        Ok(Self { connection_manager })
    }

    /// Initializes the database schema
    pub async fn initialize_schema(&self) -> Result<(), DatabaseError> {
        MigrationManager::initialize_schema(self.get_pool()).await
    }

    /// Gets the database pool
    pub fn get_pool(&self) -> &Pool<MySql> {
        self.connection_manager.pool()
    }
}
