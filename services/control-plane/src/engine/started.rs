//! Desired state STARTED.

use fleet_reconcile::SyncOutcome;
use tracing::debug;

use super::{SyncError, SyncResult, WorkspaceManager, NODE_ERROR_REASON};
use crate::dockerfile::entrypoint_from_dockerfile;
use crate::model::{ImageNodeState, SnapshotState, Workspace, WorkspacePatch, WorkspaceState};
use crate::node_client::{CreateWorkspaceRequest, NodeWorkspaceState, RegistryCredentials};

impl WorkspaceManager {
    pub(super) async fn handle_started(&self, workspace: &Workspace) -> SyncResult {
        match workspace.state {
            WorkspaceState::PendingBuild => self.assign_build(workspace).await,
            WorkspaceState::BuildingImage => self.poll_image_build(workspace).await,
            WorkspaceState::Unknown => self.create_on_node(workspace).await,
            WorkspaceState::Archived | WorkspaceState::Stopped => {
                self.restore_or_start(workspace).await
            }
            WorkspaceState::Restoring | WorkspaceState::Creating => {
                self.check_creating(workspace).await
            }
            WorkspaceState::PullingImage | WorkspaceState::Starting => {
                self.check_starting(workspace).await
            }
            _ => Ok(SyncOutcome::Done),
        }
    }

    async fn poll_image_build(&self, workspace: &Workspace) -> SyncResult {
        let image_ref = workspace
            .build_image_ref()
            .ok_or_else(|| SyncError::domain("Workspace has no build info"))?;
        let node_id = workspace
            .node_id
            .ok_or_else(|| SyncError::domain("Workspace has no node assigned"))?;

        let entry = self.deps().nodes.get_image_node(&node_id, image_ref).await?;
        match entry {
            Some(entry) if entry.state == ImageNodeState::Ready => {
                self.update_state(&workspace.id, WorkspaceState::Unknown).await?;
                Ok(SyncOutcome::RunAgain)
            }
            Some(entry) if entry.state == ImageNodeState::Error => {
                self.set_error(&workspace.id, entry.error_reason).await?;
                Ok(SyncOutcome::Done)
            }
            _ => {
                tokio::time::sleep(self.config().build_poll_delay).await;
                Ok(SyncOutcome::RunAgain)
            }
        }
    }

    async fn create_on_node(&self, workspace: &Workspace) -> SyncResult {
        let node_id = match workspace.node_id {
            Some(node_id) => node_id,
            None => self.assign_node(workspace).await?,
        };
        let node = self.node(&node_id).await?;
        if !node.is_ready() {
            debug!(node_id = %node.id, "Node not ready");
            return Ok(SyncOutcome::Done);
        }

        let request = match &workspace.build_info {
            None => {
                let image = self
                    .deps()
                    .images
                    .get_image_by_name(&workspace.image, &workspace.organization_id)
                    .await?;
                let registry = self
                    .deps()
                    .registries
                    .find_one_by_image_name(&image.internal_name, &workspace.organization_id)
                    .await?
                    .ok_or_else(|| SyncError::domain("No registry found for image"))?;

                let mut request = CreateWorkspaceRequest::for_workspace(workspace, image.internal_name);
                request.entrypoint = image.entrypoint;
                request.registry = Some(RegistryCredentials::from(&registry));
                request
            }
            Some(build) => {
                let mut request = CreateWorkspaceRequest::for_workspace(workspace, build.image_ref.clone());
                request.entrypoint = Some(entrypoint_from_dockerfile(&build.dockerfile_content));
                request
            }
        };

        self.client(&node).create(&request).await?;
        self.update_state(&workspace.id, WorkspaceState::Creating).await?;
        Ok(SyncOutcome::RunAgain)
    }

    async fn check_creating(&self, workspace: &Workspace) -> SyncResult {
        // Mid-transfer to another node.
        if workspace.node_id.is_none() {
            return Ok(SyncOutcome::RunAgain);
        }

        let node = self.bound_node(workspace).await?;
        let info = self.client(&node).info(&workspace.id).await?;
        match info.state {
            NodeWorkspaceState::PullingImage => {
                self.update_state(&workspace.id, WorkspaceState::PullingImage).await?;
            }
            NodeWorkspaceState::Error => {
                self.set_error(&workspace.id, Some(NODE_ERROR_REASON.into())).await?;
            }
            _ => {
                self.update_state(&workspace.id, WorkspaceState::Starting).await?;
            }
        }
        Ok(SyncOutcome::RunAgain)
    }

    async fn check_starting(&self, workspace: &Workspace) -> SyncResult {
        let node = self.bound_node(workspace).await?;
        let info = self.client(&node).info(&workspace.id).await?;
        match info.state {
            NodeWorkspaceState::Started => {
                self.mark_started(workspace).await?;
                if let Some(prev) = workspace.prev_node_id {
                    self.spawn_drain(workspace.id, prev);
                }
            }
            NodeWorkspaceState::Error => {
                self.set_error(&workspace.id, Some(NODE_ERROR_REASON.into())).await?;
            }
            _ => {}
        }
        Ok(SyncOutcome::RunAgain)
    }

    /// STARTED, dropping a snapshot state that belonged to the previous run.
    async fn mark_started(&self, workspace: &Workspace) -> Result<(), SyncError> {
        let mut patch = WorkspacePatch::state(WorkspaceState::Started);
        if matches!(
            workspace.snapshot_state,
            SnapshotState::Error | SnapshotState::Completed
        ) {
            patch = patch.with_snapshot_state(SnapshotState::None);
        }
        self.patch(&workspace.id, patch).await
    }

    pub(super) async fn recover_started(&self, workspace: &Workspace) -> Result<bool, SyncError> {
        let node = self.bound_node(workspace).await?;
        let info = self.client(&node).info(&workspace.id).await?;
        if info.state != NodeWorkspaceState::Started {
            return Ok(false);
        }
        let patch = WorkspacePatch::state(WorkspaceState::Started)
            .with_snapshot_state(SnapshotState::None);
        self.patch(&workspace.id, patch).await?;
        Ok(true)
    }
}
