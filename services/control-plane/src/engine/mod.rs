//! Workspace reconciliation engine.
//!
//! Each sync attempt for a workspace:
//!
//! 1. takes the per-workspace lock `sync:{id}` (held elsewhere: skip),
//! 2. reads the workspace fresh and dispatches on its desired state,
//! 3. lets the handler take at most one step (remote call + state write),
//! 4. releases the lock and, on [`SyncOutcome::RunAgain`], puts the id back
//!    on the resync queue.
//!
//! Handlers never loop while holding the lock. Failures that are not
//! transient move the workspace to ERROR with the failure as its reason.

mod archived;
mod destroyed;
mod drain;
mod events;
mod placement;
mod queue;
mod restore;
mod started;
mod stopped;
mod sweeps;

pub use events::{EventBus, EventListener, WorkspaceEvent, WorkspaceEventKind};
pub use queue::{resync_queue, ResyncQueue, ResyncReceiver, SyncWorker};
pub use sweeps::SweepWorker;

use std::sync::Arc;

use fleet_id::{NodeId, WorkspaceId};
use fleet_reconcile::{DistributedLock, LockError, SyncOutcome, TtlCounter};
use thiserror::Error;
use tracing::{debug, error, instrument, warn};

use crate::config::EngineConfig;
use crate::image_build::ImageBuilder;
use crate::model::{DesiredState, Node, Workspace, WorkspacePatch, WorkspaceState};
use crate::node_client::{NodeApi, NodeApiError, NodeClientFactory};
use crate::nodes::{NodeRegistry, PlacementError};
use crate::registry::{ImageCatalog, RegistryClient, RegistryError, RegistryResolver};
use crate::store::{StoreError, WorkspaceStore};

/// Reason recorded when the node agent reports the workspace as failed.
pub const NODE_ERROR_REASON: &str = "Workspace is in error state on node";

#[derive(Debug, Error)]
pub enum SyncError {
    #[error(transparent)]
    Node(#[from] NodeApiError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Placement(#[from] PlacementError),

    #[error(transparent)]
    Lock(#[from] LockError),

    /// A condition the workspace cannot recover from on its own.
    #[error("{0}")]
    Domain(String),
}

impl SyncError {
    pub fn domain(reason: impl Into<String>) -> Self {
        Self::Domain(reason.into())
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Node(e) if e.is_transient())
    }
}

pub type SyncResult = Result<SyncOutcome, SyncError>;

/// Collaborators the engine drives.
#[derive(Clone)]
pub struct EngineDeps {
    pub workspaces: Arc<dyn WorkspaceStore>,
    pub nodes: Arc<dyn NodeRegistry>,
    pub clients: Arc<dyn NodeClientFactory>,
    pub registries: Arc<dyn RegistryResolver>,
    pub registry_client: Arc<dyn RegistryClient>,
    pub images: Arc<dyn ImageCatalog>,
    pub locks: Arc<dyn DistributedLock>,
    pub counters: Arc<dyn TtlCounter>,
}

pub fn sync_lock_key(id: &WorkspaceId) -> String {
    format!("sync:{id}")
}

/// Drives workspaces toward their desired state. Cheap to clone.
#[derive(Clone)]
pub struct WorkspaceManager {
    inner: Arc<Inner>,
}

struct Inner {
    deps: EngineDeps,
    config: EngineConfig,
    builder: ImageBuilder,
    resync: ResyncQueue,
}

impl WorkspaceManager {
    pub fn new(deps: EngineDeps, config: EngineConfig, resync: ResyncQueue) -> Self {
        let builder = ImageBuilder::new(
            deps.nodes.clone(),
            deps.clients.clone(),
            config.build_attempts,
            config.build_backoff,
        );
        Self {
            inner: Arc::new(Inner {
                deps,
                config,
                builder,
                resync,
            }),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    fn deps(&self) -> &EngineDeps {
        &self.inner.deps
    }

    fn store(&self) -> &dyn WorkspaceStore {
        self.inner.deps.workspaces.as_ref()
    }

    /// Queues a sync attempt for `id`.
    pub fn request_sync(&self, id: WorkspaceId) {
        self.inner.resync.push(id);
    }

    /// One sync attempt. Never fails: errors end up on the workspace or in
    /// the log.
    #[instrument(skip(self), fields(workspace_id = %id))]
    pub async fn sync_workspace(&self, id: WorkspaceId) -> SyncOutcome {
        let key = sync_lock_key(&id);
        match self.deps().locks.acquire(&key, self.config().sync_lock_ttl).await {
            Ok(true) => {}
            Ok(false) => {
                debug!("Sync already in flight");
                return SyncOutcome::Done;
            }
            Err(e) => {
                warn!(error = %e, "Failed to acquire sync lock");
                return SyncOutcome::Done;
            }
        }

        let outcome = self.sync_locked(id).await;

        if let Err(e) = self.deps().locks.release(&key).await {
            warn!(error = %e, "Failed to release sync lock");
        }
        outcome
    }

    async fn sync_locked(&self, id: WorkspaceId) -> SyncOutcome {
        let workspace = match self.store().find(&id).await {
            Ok(Some(workspace)) => workspace,
            Ok(None) => {
                debug!("Workspace no longer exists");
                return SyncOutcome::Done;
            }
            Err(e) => {
                error!(error = %e, "Failed to load workspace");
                return SyncOutcome::Done;
            }
        };

        if workspace.state == WorkspaceState::Error {
            return SyncOutcome::Done;
        }

        match self.dispatch(&workspace).await {
            Ok(outcome) => outcome,
            Err(e) if e.is_transient() => {
                debug!(error = %e, "Transient node failure; retrying");
                SyncOutcome::RunAgain
            }
            Err(e) => {
                error!(
                    error = %e,
                    state = %workspace.state,
                    desired_state = %workspace.desired_state,
                    "Error processing desired state"
                );
                self.fail(&id, e.to_string()).await;
                SyncOutcome::Done
            }
        }
    }

    async fn dispatch(&self, workspace: &Workspace) -> SyncResult {
        match workspace.desired_state {
            DesiredState::Started => self.handle_started(workspace).await,
            DesiredState::Stopped => self.handle_stopped(workspace).await,
            DesiredState::Destroyed => self.handle_destroyed(workspace).await,
            DesiredState::Archived => self.handle_archived(workspace).await,
        }
    }

    /// Moves the workspace to ERROR unless it was deleted meanwhile.
    async fn fail(&self, id: &WorkspaceId, reason: String) {
        match self.store().find(id).await {
            Ok(Some(_)) => {
                if let Err(e) = self.set_error(id, Some(reason)).await {
                    error!(error = %e, "Failed to record workspace error");
                }
            }
            Ok(None) => debug!("Workspace deleted during sync"),
            Err(e) => error!(error = %e, "Failed to reload workspace after sync error"),
        }
    }

    /// Heals a workspace stuck in ERROR whose node reports it healthy.
    ///
    /// Sync skips ERROR workspaces, so this is only ever triggered on
    /// request. Returns whether the workspace left ERROR.
    #[instrument(skip(self), fields(workspace_id = %id))]
    pub async fn recover(&self, id: WorkspaceId) -> Result<bool, SyncError> {
        let key = sync_lock_key(&id);
        if !self.deps().locks.acquire(&key, self.config().sync_lock_ttl).await? {
            return Ok(false);
        }
        let result = self.recover_locked(&id).await;
        if let Err(e) = self.deps().locks.release(&key).await {
            warn!(error = %e, "Failed to release sync lock");
        }
        result
    }

    async fn recover_locked(&self, id: &WorkspaceId) -> Result<bool, SyncError> {
        let workspace = self.store().get(id).await?;
        if workspace.state != WorkspaceState::Error || workspace.node_id.is_none() {
            return Ok(false);
        }
        match workspace.desired_state {
            DesiredState::Started => self.recover_started(&workspace).await,
            DesiredState::Stopped => self.recover_stopped(&workspace).await,
            DesiredState::Destroyed | DesiredState::Archived => Ok(false),
        }
    }

    // State-mutation helpers. Each reads the row fresh and writes only what
    // changed, so desired-state edits made meanwhile survive.

    async fn update_state(&self, id: &WorkspaceId, state: WorkspaceState) -> Result<(), SyncError> {
        let current = self.store().get(id).await?;
        if current.state == state {
            return Ok(());
        }
        self.store().update(id, &WorkspacePatch::state(state)).await?;
        Ok(())
    }

    /// Like [`Self::update_state`] but also rebinds the node. Skipped
    /// entirely when the state already matches.
    async fn update_state_on_node(
        &self,
        id: &WorkspaceId,
        state: WorkspaceState,
        node_id: Option<NodeId>,
    ) -> Result<(), SyncError> {
        let current = self.store().get(id).await?;
        if current.state == state {
            return Ok(());
        }
        let patch = WorkspacePatch::state(state)
            .with_node(node_id)
            .changes_against(&current);
        self.store().update(id, &patch).await?;
        Ok(())
    }

    async fn set_error(&self, id: &WorkspaceId, reason: Option<String>) -> Result<(), SyncError> {
        let current = self.store().get(id).await?;
        let mut patch = WorkspacePatch::state(WorkspaceState::Error);
        if reason.is_some() {
            patch.error_reason = Some(reason);
        }
        let patch = patch.changes_against(&current);
        if !patch.is_empty() {
            warn!(workspace_id = %id, reason = ?patch.error_reason, "Workspace moved to error");
            self.store().update(id, &patch).await?;
        }
        Ok(())
    }

    async fn patch(&self, id: &WorkspaceId, patch: WorkspacePatch) -> Result<(), SyncError> {
        let current = self.store().get(id).await?;
        let patch = patch.changes_against(&current);
        if !patch.is_empty() {
            self.store().update(id, &patch).await?;
        }
        Ok(())
    }

    /// The node the workspace is bound to.
    async fn bound_node(&self, workspace: &Workspace) -> Result<Node, SyncError> {
        let node_id = workspace
            .node_id
            .ok_or_else(|| SyncError::domain("Workspace has no node assigned"))?;
        self.node(&node_id).await
    }

    async fn node(&self, id: &NodeId) -> Result<Node, SyncError> {
        self.deps()
            .nodes
            .find_one(id)
            .await?
            .ok_or_else(|| SyncError::domain(format!("Node {id} not found")))
    }

    fn client(&self, node: &Node) -> Arc<dyn NodeApi> {
        self.deps().clients.client(node)
    }

    async fn recalculate_usage(&self, node_id: &NodeId) {
        if let Err(e) = self.deps().nodes.recalculate_node_usage(node_id).await {
            warn!(error = %e, node_id = %node_id, "Failed to recalculate node usage");
        }
    }
}

/// Treats "already gone" as success.
fn tolerate_gone(result: Result<(), NodeApiError>) -> Result<(), NodeApiError> {
    match result {
        Err(e) if e.is_gone() => Ok(()),
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_connection_resets_are_transient() {
        assert!(SyncError::from(NodeApiError::ConnectionReset).is_transient());
        assert!(!SyncError::from(NodeApiError::NotFound).is_transient());
        assert!(!SyncError::domain("No available nodes").is_transient());
    }

    #[test]
    fn test_error_reason_is_display() {
        let err = SyncError::from(PlacementError::NoAvailableNodes);
        assert_eq!(err.to_string(), "No available nodes");
        assert_eq!(SyncError::domain("boom").to_string(), "boom");
    }

    #[test]
    fn test_tolerate_gone() {
        assert!(tolerate_gone(Err(NodeApiError::AlreadyDestroyed)).is_ok());
        assert!(tolerate_gone(Err(NodeApiError::NotFound)).is_ok());
        assert!(tolerate_gone(Err(NodeApiError::ConnectionReset)).is_err());
    }
}
