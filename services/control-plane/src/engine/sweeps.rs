//! Periodic sweeps that feed the resync queue.
//!
//! Each sweep is gated by a leader lease so that across all reconciler
//! processes at most one runs it per period.

use std::time::Duration;

use chrono::Utc;
use fleet_id::{OrgId, WorkspaceId};
use futures_util::future::join_all;
use tokio::sync::watch;
use tracing::{debug, error, info, instrument, warn};

use super::{sync_lock_key, SyncError, WorkspaceManager};
use crate::model::{DesiredState, Node, WorkspacePatch};

pub const AUTO_STOP_LEASE: &str = "auto-stop-check-worker-selected";
pub const SYNC_STATES_LEASE: &str = "sync-states";
pub const SYNC_ARCHIVED_LEASE: &str = "sync-archived-desired-states";

impl WorkspaceManager {
    /// Leader lease for one sweep period.
    async fn take_lease(&self, key: &str, ttl: Duration) -> bool {
        match self.deps().locks.acquire(key, ttl).await {
            Ok(taken) => taken,
            Err(e) => {
                warn!(error = %e, lease = key, "Failed to take sweep lease");
                false
            }
        }
    }

    async fn drop_lease(&self, key: &str) {
        if let Err(e) = self.deps().locks.release(key).await {
            warn!(error = %e, lease = key, "Failed to release sweep lease");
        }
    }

    /// Flips idle STARTED workspaces to desired STOPPED. Returns how many.
    ///
    /// The lease is never released: its TTL is what spaces runs apart.
    #[instrument(skip(self))]
    pub async fn auto_stop_check(&self) -> usize {
        if !self
            .take_lease(AUTO_STOP_LEASE, self.config().auto_stop_lease_ttl)
            .await
        {
            return 0;
        }

        let nodes = match self.deps().nodes.find_all().await {
            Ok(nodes) => nodes,
            Err(e) => {
                error!(error = %e, "Failed to list nodes for auto-stop");
                return 0;
            }
        };

        let per_node = nodes
            .iter()
            .filter(|node| node.is_ready())
            .map(|node| self.auto_stop_node(node));
        let stopped: usize = join_all(per_node).await.into_iter().sum();
        if stopped > 0 {
            info!(stopped, "Auto-stopped idle workspaces");
        }
        stopped
    }

    async fn auto_stop_node(&self, node: &Node) -> usize {
        let candidates = match self
            .store()
            .find_auto_stop_candidates(
                &node.id,
                &OrgId::unassigned(),
                self.config().auto_stop_batch,
                Utc::now(),
            )
            .await
        {
            Ok(candidates) => candidates,
            Err(e) => {
                error!(error = %e, node_id = %node.id, "Failed to find auto-stop candidates");
                return 0;
            }
        };

        let results = join_all(candidates.iter().map(|w| self.auto_stop_one(w.id))).await;
        results.iter().filter(|r| matches!(r, Ok(true))).count()
    }

    async fn auto_stop_one(&self, id: WorkspaceId) -> Result<bool, SyncError> {
        let key = sync_lock_key(&id);
        if !self
            .deps()
            .locks
            .acquire(&key, self.config().auto_stop_lock_ttl)
            .await?
        {
            return Ok(false);
        }

        let patch = WorkspacePatch {
            desired_state: Some(DesiredState::Stopped),
            ..WorkspacePatch::default()
        };
        let result = self.patch(&id, patch).await;
        if let Err(e) = self.deps().locks.release(&key).await {
            warn!(error = %e, workspace_id = %id, "Failed to release sync lock");
        }

        match result {
            Ok(()) => {
                debug!(workspace_id = %id, "Auto-stopping workspace");
                self.request_sync(id);
                Ok(true)
            }
            Err(e) => {
                error!(error = %e, workspace_id = %id, "Error processing auto-stop state for workspace");
                Err(e)
            }
        }
    }

    /// Queues workspaces whose state lags their desired state. Returns how many.
    #[instrument(skip(self))]
    pub async fn sync_states(&self) -> usize {
        if !self
            .take_lease(SYNC_STATES_LEASE, self.config().sweep_lease_ttl)
            .await
        {
            return 0;
        }

        let queued = match self.store().find_needing_sync(self.config().sweep_batch).await {
            Ok(workspaces) => {
                for workspace in &workspaces {
                    self.request_sync(workspace.id);
                }
                workspaces.len()
            }
            Err(e) => {
                error!(error = %e, "Failed to find workspaces needing sync");
                0
            }
        };

        self.drop_lease(SYNC_STATES_LEASE).await;
        queued
    }

    /// Queues workspaces on their way to ARCHIVED. Returns how many.
    #[instrument(skip(self))]
    pub async fn sync_archived_states(&self) -> usize {
        if !self
            .take_lease(SYNC_ARCHIVED_LEASE, self.config().sweep_lease_ttl)
            .await
        {
            return 0;
        }

        let queued = match self
            .store()
            .find_archive_candidates(self.config().sweep_batch, self.config().max_archiving_per_node)
            .await
        {
            Ok(workspaces) => {
                for workspace in &workspaces {
                    self.request_sync(workspace.id);
                }
                workspaces.len()
            }
            Err(e) => {
                error!(error = %e, "Failed to find workspaces to archive");
                0
            }
        };

        self.drop_lease(SYNC_ARCHIVED_LEASE).await;
        queued
    }
}

/// Runs the sweeps on their timers.
pub struct SweepWorker {
    manager: WorkspaceManager,
    auto_stop_interval: Duration,
    sync_interval: Duration,
}

impl SweepWorker {
    pub fn new(manager: WorkspaceManager, auto_stop_interval: Duration, sync_interval: Duration) -> Self {
        Self {
            manager,
            auto_stop_interval,
            sync_interval,
        }
    }

    /// Run the sweeps until shutdown is signaled.
    #[instrument(skip(self, shutdown), name = "sweep_worker")]
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            auto_stop_interval_secs = self.auto_stop_interval.as_secs(),
            sync_interval_secs = self.sync_interval.as_secs(),
            "Starting sweep worker"
        );

        let mut auto_stop = tokio::time::interval(self.auto_stop_interval);
        let mut sync = tokio::time::interval(self.sync_interval);
        auto_stop.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        sync.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = auto_stop.tick() => {
                    self.manager.auto_stop_check().await;
                }
                _ = sync.tick() => {
                    self.manager.sync_states().await;
                    self.manager.sync_archived_states().await;
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("Sweep worker shutting down");
                        break;
                    }
                }
            }
        }
    }
}
