use std::time::Duration;

use sqlx::PgPool;
use tokio::sync::watch;
use tracing::{info, instrument, warn};

use super::PgLeases;

#[derive(Debug, Clone)]
pub struct CleanupWorkerConfig {
    pub interval: Duration,
    /// Relayed lifecycle events older than this are deleted.
    pub event_retention_hours: i32,
}

impl Default for CleanupWorkerConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(600),
            event_retention_hours: 24,
        }
    }
}

/// Deletes expired lease rows and old `workspace_events` rows.
pub struct CleanupWorker {
    pool: PgPool,
    leases: PgLeases,
    config: CleanupWorkerConfig,
}

impl CleanupWorker {
    pub fn new(pool: PgPool, config: CleanupWorkerConfig) -> Self {
        Self {
            leases: PgLeases::new(pool.clone()),
            pool,
            config,
        }
    }

    #[instrument(skip(self, shutdown), name = "cleanup_worker")]
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            interval_secs = self.config.interval.as_secs(),
            event_retention_hours = self.config.event_retention_hours,
            "Starting cleanup worker"
        );

        let mut interval = tokio::time::interval(self.config.interval);
        interval.tick().await;

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.run_cleanup().await;
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("Cleanup worker shutting down");
                        break;
                    }
                }
            }
        }
    }

    /// One pass. Returns the number of rows deleted.
    pub async fn run_cleanup(&self) -> u64 {
        let mut total_deleted = 0u64;

        match self.leases.purge_expired().await {
            Ok(count) => total_deleted += count,
            Err(e) => warn!(error = %e, "Failed to purge expired leases"),
        }

        match self.prune_events().await {
            Ok(count) => {
                if count > 0 {
                    info!(deleted = count, "Pruned old workspace events");
                }
                total_deleted += count;
            }
            Err(e) => warn!(error = %e, "Failed to prune workspace events"),
        }

        total_deleted
    }

    async fn prune_events(&self) -> Result<u64, sqlx::Error> {
        let result = sqlx::query(
            "DELETE FROM workspace_events WHERE created_at < now() - make_interval(hours => $1)",
        )
        .bind(self.config.event_retention_hours)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retention_outlives_cleanup_interval() {
        let config = CleanupWorkerConfig::default();
        let retention =
            Duration::from_secs(u64::try_from(config.event_retention_hours).unwrap() * 3600);
        assert!(retention > config.interval);
    }
}
