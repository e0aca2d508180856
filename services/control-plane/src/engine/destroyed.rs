//! Desired state DESTROYED.

use fleet_reconcile::SyncOutcome;
use tracing::debug;

use super::{tolerate_gone, SyncResult, WorkspaceManager};
use crate::model::{Workspace, WorkspaceState};
use crate::node_client::NodeWorkspaceState;

impl WorkspaceManager {
    pub(super) async fn handle_destroyed(&self, workspace: &Workspace) -> SyncResult {
        // Archived workspaces hold nothing on any node.
        if workspace.state == WorkspaceState::Archived {
            self.update_state(&workspace.id, WorkspaceState::Destroyed).await?;
            return Ok(SyncOutcome::Done);
        }
        if workspace.state == WorkspaceState::Destroyed {
            return Ok(SyncOutcome::Done);
        }

        let Some(node_id) = workspace.node_id else {
            self.update_state(&workspace.id, WorkspaceState::Destroyed).await?;
            return Ok(SyncOutcome::Done);
        };
        let node = self.node(&node_id).await?;
        if !node.is_ready() {
            debug!(node_id = %node.id, "Node not ready");
            return Ok(SyncOutcome::Done);
        }
        let client = self.client(&node);

        if workspace.state == WorkspaceState::Destroying {
            match client.info(&workspace.id).await {
                Ok(info)
                    if matches!(
                        info.state,
                        NodeWorkspaceState::Destroyed | NodeWorkspaceState::Error
                    ) =>
                {
                    tolerate_gone(client.remove_destroyed(&workspace.id).await)?;
                }
                Ok(_) => {}
                Err(e) if e.is_gone() => {}
                Err(e) => return Err(e.into()),
            }
            self.update_state(&workspace.id, WorkspaceState::Destroyed).await?;
            self.recalculate_usage(&node_id).await;
            return Ok(SyncOutcome::RunAgain);
        }

        let already_destroyed = match client.info(&workspace.id).await {
            Ok(info) => info.state == NodeWorkspaceState::Destroyed,
            Err(e) if e.is_gone() => true,
            Err(e) => return Err(e.into()),
        };
        if !already_destroyed {
            tolerate_gone(client.destroy(&workspace.id).await)?;
        }
        self.update_state(&workspace.id, WorkspaceState::Destroying).await?;
        Ok(SyncOutcome::RunAgain)
    }
}
