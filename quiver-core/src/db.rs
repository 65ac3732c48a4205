use std::time::Duration;

use sqlx::postgres::PgPoolOptions;
use sqlx::{Pool, Postgres};

use crate::config::CoreConfig;
use crate::errors::Result;

/// Wrapper around a Postgres connection pool used by the storage services.
///
/// The pool is safe for concurrent transactional use; one flush of the
/// ingestion pipeline runs inside one transaction acquired from here.
#[derive(Clone)]
pub struct DatabasePool {
    pool: Pool<Postgres>,
}

impl DatabasePool {
    /// Establishes a new connection pool based on the core configuration.
    pub async fn connect(config: &CoreConfig) -> Result<Self> {
        Self::connect_with_url(config.database_url()).await
    }

    /// Establishes a connection pool directly from a database URL.
    pub async fn connect_with_url(database_url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(8)
            .acquire_timeout(Duration::from_secs(5))
            .connect(database_url)
            .await?;

        Ok(Self { pool })
    }

    pub fn inner(&self) -> &Pool<Postgres> {
        &self.pool
    }

    /// Cheap liveness probe used by the health endpoints.
    pub async fn ping(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}
