//! Desired state STOPPED.

use fleet_reconcile::SyncOutcome;
use tracing::debug;

use super::{SyncError, SyncResult, WorkspaceManager, NODE_ERROR_REASON};
use crate::model::{SnapshotState, Workspace, WorkspacePatch, WorkspaceState};
use crate::node_client::NodeWorkspaceState;

impl WorkspaceManager {
    pub(super) async fn handle_stopped(&self, workspace: &Workspace) -> SyncResult {
        let Some(node_id) = workspace.node_id else {
            return Ok(SyncOutcome::Done);
        };
        let node = self.node(&node_id).await?;
        if !node.is_ready() {
            debug!(node_id = %node.id, "Node not ready");
            return Ok(SyncOutcome::Done);
        }

        match workspace.state {
            WorkspaceState::Started => {
                self.client(&node).stop(&workspace.id).await?;
                self.update_state(&workspace.id, WorkspaceState::Stopping).await?;
                Ok(SyncOutcome::RunAgain)
            }
            WorkspaceState::Stopping => {
                let info = self.client(&node).info(&workspace.id).await?;
                match info.state {
                    NodeWorkspaceState::Stopped => {
                        let patch = WorkspacePatch::state(WorkspaceState::Stopped)
                            .with_snapshot_state(SnapshotState::None);
                        self.patch(&workspace.id, patch).await?;
                        Ok(SyncOutcome::RunAgain)
                    }
                    NodeWorkspaceState::Error => {
                        self.set_error(&workspace.id, Some(NODE_ERROR_REASON.into())).await?;
                        Ok(SyncOutcome::Done)
                    }
                    _ => Ok(SyncOutcome::RunAgain),
                }
            }
            _ => Ok(SyncOutcome::Done),
        }
    }

    pub(super) async fn recover_stopped(&self, workspace: &Workspace) -> Result<bool, SyncError> {
        let node = self.bound_node(workspace).await?;
        let info = self.client(&node).info(&workspace.id).await?;
        if info.state != NodeWorkspaceState::Stopped {
            return Ok(false);
        }
        self.update_state(&workspace.id, WorkspaceState::Stopped).await?;
        Ok(true)
    }
}
