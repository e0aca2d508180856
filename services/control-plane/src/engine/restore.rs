//! STARTED from STOPPED or ARCHIVED: start in place, or restore the latest
//! snapshot onto another node.

use fleet_id::NodeId;
use fleet_reconcile::SyncOutcome;
use tracing::{info, warn};

use super::{SyncError, SyncResult, WorkspaceManager};
use crate::model::{Node, Workspace, WorkspacePatch, WorkspaceState};
use crate::node_client::{CreateWorkspaceRequest, RegistryCredentials};
use crate::nodes::NodeFilter;

impl WorkspaceManager {
    pub(super) async fn restore_or_start(&self, workspace: &Workspace) -> SyncResult {
        let mut node_id = workspace.node_id;
        let mut prev_node_id = workspace.prev_node_id;

        if let Some(current) = node_id {
            let node = self.node(&current).await?;

            if node.unschedulable && workspace.has_completed_snapshot() {
                info!(workspace_id = %workspace.id, node_id = %current, "Moving workspace off cordoned node");
                self.detach(workspace, current).await?;
                node_id = None;
                prev_node_id = Some(current);
            } else if workspace.has_completed_snapshot() && self.rebalance(workspace, &node).await? {
                node_id = None;
                prev_node_id = Some(current);
            }
        }

        match node_id {
            None => self.restore_from_snapshot(workspace, prev_node_id).await,
            Some(current) => {
                let node = self.node(&current).await?;
                self.client(&node).start(&workspace.id).await?;
                self.update_state(&workspace.id, WorkspaceState::Starting).await?;
                Ok(SyncOutcome::RunAgain)
            }
        }
    }

    async fn detach(&self, workspace: &Workspace, from: NodeId) -> Result<(), SyncError> {
        let patch = WorkspacePatch::default()
            .with_node(None)
            .with_prev_node(Some(from));
        self.patch(&workspace.id, patch).await
    }

    /// Detaches the workspace from an overloaded node when another node can
    /// take it. Returns whether it was detached.
    async fn rebalance(&self, workspace: &Workspace, node: &Node) -> Result<bool, SyncError> {
        let started = self
            .store()
            .count_on_node(&node.id, WorkspaceState::Started)
            .await?;
        if started <= self.config().rebalance_threshold {
            return Ok(false);
        }

        let image = self
            .deps()
            .images
            .get_image_by_name(&workspace.image, &workspace.organization_id)
            .await?;
        let filter = NodeFilter::new(&workspace.region, &workspace.class).with_image(image.internal_name);
        let candidates = self.deps().nodes.find_available_nodes(&filter).await?;
        if !candidates.iter().any(|n| n.id != node.id) {
            return Ok(false);
        }

        info!(
            workspace_id = %workspace.id,
            node_id = %node.id,
            started,
            "Rebalancing workspace to a less loaded node"
        );
        self.detach(workspace, node.id).await?;
        if let Err(e) = self.client(node).remove_destroyed(&workspace.id).await {
            warn!(
                error = %e,
                workspace_id = %workspace.id,
                node_id = %node.id,
                "Failed to clean up workspace on previous node"
            );
        }
        Ok(true)
    }

    async fn restore_from_snapshot(
        &self,
        workspace: &Workspace,
        prev_node_id: Option<NodeId>,
    ) -> SyncResult {
        if !workspace.has_completed_snapshot() {
            self.set_error(
                &workspace.id,
                Some("Workspace has no node and snapshot is not completed".into()),
            )
            .await?;
            return Ok(SyncOutcome::RunAgain);
        }

        let registry_id = workspace
            .snapshot_registry_id
            .ok_or_else(|| SyncError::domain("No registry found for image"))?;
        let registry = self
            .deps()
            .registries
            .find_one(&registry_id)
            .await?
            .ok_or_else(|| SyncError::domain("No registry found for image"))?;

        let mut snapshot = None;
        for candidate in workspace.snapshot_candidates() {
            match self
                .deps()
                .registry_client
                .image_exists(&candidate, &registry)
                .await
            {
                Ok(true) => {
                    snapshot = Some(candidate);
                    break;
                }
                Ok(false) => {}
                Err(e) => warn!(
                    error = %e,
                    workspace_id = %workspace.id,
                    image = %candidate,
                    registry_id = %registry.id,
                    "Failed to check snapshot image in registry"
                ),
            }
        }
        let Some(snapshot) = snapshot else {
            self.set_error(&workspace.id, Some("No valid snapshot image found".into()))
                .await?;
            return Ok(SyncOutcome::RunAgain);
        };

        let image = self
            .deps()
            .images
            .get_image_by_name(&workspace.image, &workspace.organization_id)
            .await?;
        let filter = NodeFilter::new(&workspace.region, &workspace.class)
            .with_image(image.internal_name)
            .excluding(prev_node_id);
        let node_id = self.deps().nodes.get_random_available_node(&filter).await?;
        let node = self.node(&node_id).await?;

        info!(
            workspace_id = %workspace.id,
            node_id = %node_id,
            snapshot = %snapshot,
            "Restoring workspace from snapshot"
        );
        let mut request = CreateWorkspaceRequest::for_workspace(workspace, snapshot);
        request.registry = Some(RegistryCredentials::from(&registry));
        self.client(&node).create(&request).await?;

        self.update_state_on_node(&workspace.id, WorkspaceState::Restoring, Some(node_id))
            .await?;
        self.recalculate_usage(&node_id).await;
        Ok(SyncOutcome::RunAgain)
    }
}
