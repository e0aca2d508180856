//! Node selection for new workspaces and image builds.

use fleet_id::NodeId;
use fleet_reconcile::SyncOutcome;
use tracing::info;

use super::{SyncError, SyncResult, WorkspaceManager};
use crate::model::{ImageNodeState, Workspace, WorkspacePatch, WorkspaceState};
use crate::nodes::{NodeFilter, PlacementError};

impl WorkspaceManager {
    /// PENDING_BUILD: run where the image already is, else join a build in
    /// progress, else start a fresh build on a node that is not already
    /// busy building.
    pub(super) async fn assign_build(&self, workspace: &Workspace) -> SyncResult {
        let build = workspace
            .build_info
            .as_ref()
            .ok_or_else(|| SyncError::domain("Workspace has no build info"))?;
        let nodes = &self.deps().nodes;
        let filter = NodeFilter::new(&workspace.region, &workspace.class);

        match nodes
            .get_random_available_node(&filter.clone().with_image(&build.image_ref))
            .await
        {
            Ok(node_id) => {
                self.update_state_on_node(&workspace.id, WorkspaceState::Unknown, Some(node_id))
                    .await?;
                return Ok(SyncOutcome::RunAgain);
            }
            Err(PlacementError::NoAvailableNodes) => {}
            Err(e) => return Err(e.into()),
        }

        for entry in nodes.get_image_nodes(&build.image_ref).await? {
            let Some(node) = nodes.find_one(&entry.node_id).await? else {
                continue;
            };
            if !node.has_room() {
                continue;
            }
            match entry.state {
                ImageNodeState::BuildingImage => {
                    self.update_state_on_node(
                        &workspace.id,
                        WorkspaceState::BuildingImage,
                        Some(node.id),
                    )
                    .await?;
                    return Ok(SyncOutcome::RunAgain);
                }
                ImageNodeState::Error => {
                    self.set_error(&workspace.id, entry.error_reason).await?;
                    return Ok(SyncOutcome::Done);
                }
                ImageNodeState::Ready => {}
            }
        }

        let busy = nodes.get_nodes_with_multiple_images_building().await?;
        let node_id = nodes
            .get_random_available_node(&filter.excluding(busy))
            .await?;
        info!(
            workspace_id = %workspace.id,
            node_id = %node_id,
            image_ref = %build.image_ref,
            "Starting image build"
        );

        self.inner
            .builder
            .spawn(build.clone(), node_id, workspace.organization_id);

        self.update_state_on_node(&workspace.id, WorkspaceState::BuildingImage, Some(node_id))
            .await?;
        self.recalculate_usage(&node_id).await;
        Ok(SyncOutcome::RunAgain)
    }

    /// Binds an unplaced workspace to a random available node.
    pub(super) async fn assign_node(&self, workspace: &Workspace) -> Result<NodeId, SyncError> {
        let filter = NodeFilter::new(&workspace.region, &workspace.class);
        let node_id = self.deps().nodes.get_random_available_node(&filter).await?;
        info!(workspace_id = %workspace.id, node_id = %node_id, "Placed workspace");

        self.patch(&workspace.id, WorkspacePatch::default().with_node(Some(node_id)))
            .await?;
        self.recalculate_usage(&node_id).await;
        Ok(node_id)
    }
}
