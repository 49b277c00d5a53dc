use std::time::Duration;

use async_trait::async_trait;
use sqlx::postgres::PgPoolOptions;
use sqlx::{Pool, Postgres};

use crate::config::CoreConfig;
use crate::errors::Result;

/// Wrapper around the Postgres connection pool shared by the stores.
#[derive(Clone)]
pub struct DatabasePool {
    pool: Pool<Postgres>,
}

impl DatabasePool {
    /// Establishes a new connection pool based on the core configuration.
    pub async fn connect(config: &CoreConfig) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_db_connections.max(1))
            .acquire_timeout(Duration::from_secs(5))
            .connect(config.database_url())
            .await?;

        Ok(Self { pool })
    }

    /// Establishes a connection pool directly from a database URL.
    pub async fn connect_with_url(database_url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .acquire_timeout(Duration::from_secs(5))
            .connect(database_url)
            .await?;

        Ok(Self { pool })
    }

    /// Wraps an already configured pool.
    pub fn from_pool(pool: Pool<Postgres>) -> Self {
        Self { pool }
    }

    pub fn inner(&self) -> &Pool<Postgres> {
        &self.pool
    }
}

/// Trait implemented by components that own a piece of the schema.
#[async_trait]
pub trait DatabaseMigrator {
    async fn run_migrations(&self, pool: &DatabasePool) -> Result<()>;
}

/// Run migrations by delegating to the provided migrators, in order.
pub async fn run_migrations(
    pool: &DatabasePool,
    migrators: &[Box<dyn DatabaseMigrator + Send + Sync>],
) -> Result<()> {
    for migrator in migrators {
        migrator.run_migrations(pool).await?;
    }
    Ok(())
}
