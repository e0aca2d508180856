use std::time::Duration;

use async_trait::async_trait;
use fleet_reconcile::{DistributedLock, LockError, TtlCounter};
use sqlx::postgres::PgPool;

/// Lease and counter table shared by every reconciler process.
///
/// One row per key. A row whose `expires_at` has passed is treated as absent
/// and is overwritten by the next writer.
#[derive(Clone)]
pub struct PgLeases {
    pool: PgPool,
}

impl PgLeases {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Drops expired rows. Correctness never depends on it.
    pub async fn purge_expired(&self) -> Result<u64, LockError> {
        let result = sqlx::query("DELETE FROM leases WHERE expires_at <= now()")
            .execute(&self.pool)
            .await
            .map_err(backend)?;
        Ok(result.rows_affected())
    }
}

fn backend(err: sqlx::Error) -> LockError {
    LockError::Backend(err.to_string())
}

#[async_trait]
impl DistributedLock for PgLeases {
    async fn acquire(&self, key: &str, ttl: Duration) -> Result<bool, LockError> {
        let taken: Option<String> = sqlx::query_scalar(
            "INSERT INTO leases (key, value, expires_at) \
             VALUES ($1, 1, now() + make_interval(secs => $2)) \
             ON CONFLICT (key) DO UPDATE \
             SET value = 1, expires_at = EXCLUDED.expires_at \
             WHERE leases.expires_at <= now() \
             RETURNING key",
        )
        .bind(key)
        .bind(ttl.as_secs_f64())
        .fetch_optional(&self.pool)
        .await
        .map_err(backend)?;
        Ok(taken.is_some())
    }

    async fn release(&self, key: &str) -> Result<(), LockError> {
        sqlx::query("DELETE FROM leases WHERE key = $1")
            .bind(key)
            .execute(&self.pool)
            .await
            .map_err(backend)?;
        Ok(())
    }
}

#[async_trait]
impl TtlCounter for PgLeases {
    async fn get(&self, key: &str) -> Result<Option<u32>, LockError> {
        let value: Option<i32> = sqlx::query_scalar(
            "SELECT value FROM leases WHERE key = $1 AND expires_at > now()",
        )
        .bind(key)
        .fetch_optional(&self.pool)
        .await
        .map_err(backend)?;
        Ok(value.and_then(|v| u32::try_from(v).ok()))
    }

    async fn set(&self, key: &str, value: u32, ttl: Duration) -> Result<(), LockError> {
        sqlx::query(
            "INSERT INTO leases (key, value, expires_at) \
             VALUES ($1, $2, now() + make_interval(secs => $3)) \
             ON CONFLICT (key) DO UPDATE \
             SET value = EXCLUDED.value, expires_at = EXCLUDED.expires_at",
        )
        .bind(key)
        .bind(i32::try_from(value).unwrap_or(i32::MAX))
        .bind(ttl.as_secs_f64())
        .execute(&self.pool)
        .await
        .map_err(backend)?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), LockError> {
        DistributedLock::release(self, key).await
    }
}
