//! Cleanup of the node a workspace migrated away from.

use fleet_id::{NodeId, WorkspaceId};
use fleet_reconcile::linear_backoff;
use tracing::{error, info, warn};

use super::{tolerate_gone, SyncError, WorkspaceManager};
use crate::model::WorkspacePatch;
use crate::node_client::NodeWorkspaceState;

impl WorkspaceManager {
    /// Drains `prev_node_id` in the background. Failures are logged only;
    /// `prev_node_id` then stays set.
    pub(super) fn spawn_drain(&self, id: WorkspaceId, prev_node_id: NodeId) {
        let manager = self.clone();
        tokio::spawn(async move {
            if let Err(e) = manager.drain_previous_node(id, prev_node_id).await {
                error!(
                    error = %e,
                    workspace_id = %id,
                    node_id = %prev_node_id,
                    "Failed to clean up workspace on previous node"
                );
            }
        });
    }

    async fn drain_previous_node(&self, id: WorkspaceId, prev_node_id: NodeId) -> Result<(), SyncError> {
        let clear_prev = WorkspacePatch::default().with_prev_node(None);

        let Some(node) = self.deps().nodes.find_one(&prev_node_id).await? else {
            warn!(
                workspace_id = %id,
                node_id = %prev_node_id,
                "Previously assigned node not found"
            );
            return self.patch(&id, clear_prev).await;
        };
        let client = self.client(&node);

        tolerate_gone(client.destroy(&id).await)?;

        for attempt in 0..self.config().drain_attempts {
            match client.info(&id).await {
                Ok(info) if info.state == NodeWorkspaceState::Destroyed => break,
                Ok(_) => {}
                Err(e) if e.is_gone() => break,
                Err(e) => return Err(e.into()),
            }
            tokio::time::sleep(linear_backoff(attempt, self.config().drain_backoff)).await;
        }

        tolerate_gone(client.remove_destroyed(&id).await)?;
        self.patch(&id, clear_prev).await?;
        self.recalculate_usage(&prev_node_id).await;
        info!(workspace_id = %id, node_id = %prev_node_id, "Previous node drained");
        Ok(())
    }
}
