use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{Context, Result};

use crate::db::DbConfig;

#[derive(Debug, Clone)]
pub struct Config {
    pub listen_addr: SocketAddr,
    pub log_level: String,
    pub dev_mode: bool,
    pub database: DbConfig,
    pub node_api_timeout: Duration,
    pub auto_stop_interval: Duration,
    pub sync_interval: Duration,
    /// Upper bound on sync attempts running at once in this process.
    pub sync_concurrency: usize,
    pub engine: EngineConfig,
}

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> Result<T>
where
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match std::env::var(key) {
        Ok(raw) => raw.parse().with_context(|| format!("invalid {key}: {raw}")),
        Err(_) => Ok(default),
    }
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let listen_addr = std::env::var("FLEET_LISTEN_ADDR")
            .unwrap_or_else(|_| "127.0.0.1:8080".to_string())
            .parse()?;

        let log_level = std::env::var("FLEET_LOG_LEVEL").unwrap_or_else(|_| "info".to_string());

        let dev_mode = std::env::var("FLEET_DEV")
            .map(|v| v == "1" || v.to_lowercase() == "true")
            .unwrap_or(false);

        let database = DbConfig::from_env();

        Ok(Self {
            listen_addr,
            log_level,
            dev_mode,
            database,
            node_api_timeout: Duration::from_secs(env_or("FLEET_NODE_API_TIMEOUT_SECS", 30)?),
            auto_stop_interval: Duration::from_secs(env_or("FLEET_AUTO_STOP_INTERVAL_SECS", 60)?),
            sync_interval: Duration::from_secs(env_or("FLEET_SYNC_INTERVAL_SECS", 10)?),
            sync_concurrency: env_or("FLEET_SYNC_CONCURRENCY", 64)?,
            engine: EngineConfig::default(),
        })
    }
}

/// Reconciler tunables.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Per-workspace sync lock. Outlives the slowest remote call.
    pub sync_lock_ttl: Duration,
    /// Lock held while auto-stop flips one workspace's desired state.
    pub auto_stop_lock_ttl: Duration,
    pub sweep_lease_ttl: Duration,
    /// Auto-stop lease; never released, so it also spaces runs apart.
    pub auto_stop_lease_ttl: Duration,
    pub auto_stop_batch: usize,
    pub sweep_batch: usize,

    pub archive_gate_ttl: Duration,
    pub max_archiving_per_node: usize,
    pub archive_retry_ttl: Duration,
    pub archive_retry_limit: u32,
    /// Inactivity after which an archive in progress is abandoned.
    pub archive_timeout: Duration,

    /// STARTED workspaces on a node above which restores move elsewhere.
    pub rebalance_threshold: usize,

    pub build_poll_delay: Duration,
    pub build_attempts: u32,
    pub build_backoff: Duration,

    pub drain_attempts: u32,
    pub drain_backoff: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            sync_lock_ttl: fleet_reconcile::DEFAULT_SYNC_LOCK_TTL,
            auto_stop_lock_ttl: Duration::from_secs(30),
            sweep_lease_ttl: fleet_reconcile::DEFAULT_SWEEP_LEASE_TTL,
            auto_stop_lease_ttl: Duration::from_secs(60),
            auto_stop_batch: 10,
            sweep_batch: 100,
            archive_gate_ttl: Duration::from_secs(10),
            max_archiving_per_node: 3,
            archive_retry_ttl: Duration::from_secs(720),
            archive_retry_limit: 3,
            archive_timeout: Duration::from_secs(30 * 60),
            rebalance_threshold: 35,
            build_poll_delay: Duration::from_secs(1),
            build_attempts: 10,
            build_backoff: Duration::from_secs(1),
            drain_attempts: 10,
            drain_backoff: Duration::from_secs(1),
        }
    }
}

impl EngineConfig {
    /// Defaults with every sleep removed.
    pub fn without_delays() -> Self {
        Self {
            build_poll_delay: Duration::ZERO,
            build_backoff: Duration::ZERO,
            drain_backoff: Duration::ZERO,
            ..Self::default()
        }
    }
}
