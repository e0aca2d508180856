//! Postgres implementations of the reconciler's collaborators.
//!
//! This module provides:
//! - Connection pool management and migrations
//! - [`PgWorkspaceStore`]: the workspace table
//! - [`PgNodeRegistry`]: nodes and their image caches
//! - [`PgLeases`]: TTL leases and counters shared by every reconciler process
//! - [`PgRegistryResolver`] / [`PgImageCatalog`]: registries and images
//! - [`WorkspaceEventFeed`]: lifecycle events written by the API
//! - [`CleanupWorker`]: prunes expired leases and old events
//!
//! The database layer uses SQLx with Postgres.

mod cleanup;
mod error;
mod events;
mod leases;
mod nodes;
mod registries;
mod workspaces;

pub use cleanup::{CleanupWorker, CleanupWorkerConfig};
pub use error::DbError;
pub use events::{WorkspaceEventFeed, WorkspaceEventFeedConfig};
pub use leases::PgLeases;
pub use nodes::PgNodeRegistry;
pub use registries::{PgImageCatalog, PgRegistryResolver};
pub use workspaces::PgWorkspaceStore;

use std::path::PathBuf;
use std::time::Duration;

use sqlx::postgres::{PgPool, PgPoolOptions};
use tracing::info;

#[derive(Debug, Clone)]
pub struct DbConfig {
    pub database_url: String,
    pub max_connections: u32,
    pub min_connections: u32,
    pub acquire_timeout: Duration,
    pub idle_timeout: Duration,
    pub max_lifetime: Duration,
}

impl Default for DbConfig {
    fn default() -> Self {
        Self {
            database_url: "postgres://localhost/fleet".to_string(),
            max_connections: 10,
            min_connections: 1,
            acquire_timeout: Duration::from_secs(5),
            idle_timeout: Duration::from_secs(600),
            max_lifetime: Duration::from_secs(1800),
        }
    }
}

impl DbConfig {
    /// Reads `DATABASE_URL`, `DB_MAX_CONNECTIONS` and `DB_MIN_CONNECTIONS`.
    /// Unparseable pool sizes fall back to the defaults.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let sized = |key: &str, default: u32| {
            std::env::var(key)
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(default)
        };

        Self {
            database_url: std::env::var("DATABASE_URL").unwrap_or(defaults.database_url.clone()),
            max_connections: sized("DB_MAX_CONNECTIONS", defaults.max_connections),
            min_connections: sized("DB_MIN_CONNECTIONS", defaults.min_connections),
            ..defaults
        }
    }
}

/// Pool shared by every Postgres-backed collaborator.
#[derive(Clone)]
pub struct Database {
    pool: PgPool,
}

impl Database {
    pub async fn connect(config: &DbConfig) -> Result<Self, DbError> {
        info!(
            max_connections = config.max_connections,
            min_connections = config.min_connections,
            "Connecting to database"
        );

        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(config.acquire_timeout)
            .idle_timeout(Some(config.idle_timeout))
            .max_lifetime(Some(config.max_lifetime))
            .connect(&config.database_url)
            .await
            .map_err(DbError::Connect)?;

        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn health_check(&self) -> Result<(), DbError> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(DbError::Query)?;
        Ok(())
    }

    /// Applies `migrations/`, looked up relative to the working directory
    /// first and then to this crate.
    pub async fn run_migrations(&self) -> Result<(), DbError> {
        let candidates = [
            PathBuf::from("./migrations"),
            PathBuf::from("services/control-plane/migrations"),
            PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("migrations"),
        ];
        let mut last_error = None;

        for dir in &candidates {
            match sqlx::migrate::Migrator::new(dir.clone()).await {
                Ok(migrator) => {
                    info!(migrations_dir = %dir.display(), "Running database migrations");
                    migrator.run(&self.pool).await.map_err(DbError::Migration)?;
                    return Ok(());
                }
                Err(e) => last_error = Some(e.to_string()),
            }
        }

        Err(DbError::MigrationDirNotFound {
            tried: candidates
                .iter()
                .map(|dir| dir.display().to_string())
                .collect::<Vec<_>>()
                .join(", "),
            last_error: last_error.unwrap_or_else(|| "unknown error".to_string()),
        })
    }

    pub fn workspace_store(&self) -> PgWorkspaceStore {
        PgWorkspaceStore::new(self.pool.clone())
    }

    pub fn node_registry(&self) -> PgNodeRegistry {
        PgNodeRegistry::new(self.pool.clone())
    }

    pub fn leases(&self) -> PgLeases {
        PgLeases::new(self.pool.clone())
    }

    pub fn registry_resolver(&self) -> PgRegistryResolver {
        PgRegistryResolver::new(self.pool.clone())
    }

    pub fn image_catalog(&self) -> PgImageCatalog {
        PgImageCatalog::new(self.pool.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_db_config_defaults() {
        let config = DbConfig::default();
        assert_eq!(config.database_url, "postgres://localhost/fleet");
        assert!(config.min_connections <= config.max_connections);
    }
}
