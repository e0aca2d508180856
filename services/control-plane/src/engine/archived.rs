//! Desired state ARCHIVED.
//!
//! Archiving is node-side snapshot work. At most `max_archiving_per_node`
//! workspaces may be ARCHIVING on one node; admission is serialized by the
//! short-lived gate `archive-lock-{node}`. Workspaces already ARCHIVING are
//! always let through.

use chrono::Utc;
use fleet_id::{NodeId, WorkspaceId};
use fleet_reconcile::SyncOutcome;
use tracing::{debug, info, warn};

use super::{SyncError, SyncResult, WorkspaceManager};
use crate::model::{SnapshotState, Workspace, WorkspacePatch, WorkspaceState};
use crate::node_client::NodeWorkspaceState;

pub const ARCHIVE_FAILED_REASON: &str = "Failed to archive workspace";
pub const ARCHIVE_TIMEOUT_REASON: &str = "Archiving operation timed out";

pub fn archive_gate_key(node: &NodeId) -> String {
    format!("archive-lock-{node}")
}

pub fn archive_retry_key(id: &WorkspaceId) -> String {
    format!("archive-error-retry-{id}")
}

impl WorkspaceManager {
    pub(super) async fn handle_archived(&self, workspace: &Workspace) -> SyncResult {
        let Some(node_id) = workspace.node_id else {
            debug!(workspace_id = %workspace.id, "Nothing to archive without a node");
            return Ok(SyncOutcome::Done);
        };

        let gate = archive_gate_key(&node_id);
        if !self
            .deps()
            .locks
            .acquire(&gate, self.config().archive_gate_ttl)
            .await?
        {
            return Ok(SyncOutcome::Done);
        }

        // The gate only covers admission; snapshotting is long-running and
        // must not hold it across polls.
        let admitted = self.admit_archive(workspace, node_id).await;
        let admitted = match admitted {
            // The archive timeout counts from here, not from the last use.
            Ok(true) if workspace.state == WorkspaceState::Stopped => self
                .patch(
                    &workspace.id,
                    WorkspacePatch::state(WorkspaceState::Archiving)
                        .with_last_activity(Utc::now()),
                )
                .await
                .map(|()| true),
            Ok(admitted) => Ok(admitted && workspace.state == WorkspaceState::Archiving),
            Err(e) => Err(e),
        };
        if let Err(e) = self.deps().locks.release(&gate).await {
            warn!(error = %e, node_id = %node_id, "Failed to release archive gate");
        }

        if !admitted? {
            return Ok(SyncOutcome::Done);
        }
        self.continue_archiving(workspace, node_id).await
    }

    async fn admit_archive(&self, workspace: &Workspace, node_id: NodeId) -> Result<bool, SyncError> {
        let in_progress = self
            .store()
            .find_on_node_in_state(&node_id, WorkspaceState::Archiving, 100)
            .await?;
        let admitted = in_progress.iter().any(|w| w.id == workspace.id)
            || in_progress.len() < self.config().max_archiving_per_node;
        if !admitted {
            debug!(
                workspace_id = %workspace.id,
                node_id = %node_id,
                archiving = in_progress.len(),
                "Node at archive capacity"
            );
        }
        Ok(admitted)
    }

    async fn continue_archiving(&self, workspace: &Workspace, node_id: NodeId) -> SyncResult {
        if workspace.snapshot_state == SnapshotState::Error {
            return self.retry_snapshot(&workspace.id).await;
        }

        let timeout = chrono::Duration::from_std(self.config().archive_timeout)
            .unwrap_or(chrono::Duration::MAX);
        if workspace.state == WorkspaceState::Archiving
            && workspace.last_activity_at < Utc::now() - timeout
        {
            self.set_error(&workspace.id, Some(ARCHIVE_TIMEOUT_REASON.into()))
                .await?;
            return Ok(SyncOutcome::Done);
        }

        if workspace.snapshot_state != SnapshotState::Completed {
            return Ok(SyncOutcome::Done);
        }

        let node = self.node(&node_id).await?;
        let client = self.client(&node);
        match client.info(&workspace.id).await {
            Ok(info) => match info.state {
                NodeWorkspaceState::Destroying => return Ok(SyncOutcome::RunAgain),
                NodeWorkspaceState::Destroyed => {}
                _ => match client.destroy(&workspace.id).await {
                    Ok(()) => return Ok(SyncOutcome::RunAgain),
                    Err(e) if e.is_gone() => {}
                    Err(e) => return Err(e.into()),
                },
            },
            Err(e) if e.is_gone() => {}
            Err(e) => return Err(e.into()),
        }

        self.finish_archive(&workspace.id, &node_id).await?;
        Ok(SyncOutcome::Done)
    }

    /// Counts a failed snapshot. Past the retry budget the workspace errors.
    async fn retry_snapshot(&self, id: &WorkspaceId) -> SyncResult {
        let counters = &self.deps().counters;
        let key = archive_retry_key(id);
        let attempts = counters.get(&key).await?.unwrap_or(0);

        if attempts >= self.config().archive_retry_limit {
            self.set_error(id, Some(ARCHIVE_FAILED_REASON.into())).await?;
            counters.delete(&key).await?;
            return Ok(SyncOutcome::Done);
        }

        counters
            .set(&key, attempts + 1, self.config().archive_retry_ttl)
            .await?;
        info!(workspace_id = %id, attempt = attempts + 1, "Retrying workspace snapshot");
        self.patch(id, WorkspacePatch::default().with_snapshot_state(SnapshotState::Pending))
            .await?;
        Ok(SyncOutcome::Done)
    }

    async fn finish_archive(&self, id: &WorkspaceId, node_id: &NodeId) -> Result<(), SyncError> {
        self.update_state_on_node(id, WorkspaceState::Archived, None).await?;
        self.recalculate_usage(node_id).await;
        info!(workspace_id = %id, node_id = %node_id, "Workspace archived");
        Ok(())
    }
}
