//! Workspace persistence boundary.
//!
//! The reconciler reads a workspace fresh before every mutation and writes
//! only the fields that changed. Concurrent external edits (desired-state
//! changes from the API) therefore win per field: last writer wins.

mod memory;

pub use memory::MemoryWorkspaceStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fleet_id::{NodeId, OrgId, WorkspaceId};
use thiserror::Error;

use crate::model::{UnknownVariant, Workspace, WorkspacePatch, WorkspaceState};

/// Persistence errors.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("workspace {0} not found")]
    NotFound(WorkspaceId),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("corrupt row: {0}")]
    Corrupt(String),
}

impl From<UnknownVariant> for StoreError {
    fn from(err: UnknownVariant) -> Self {
        Self::Corrupt(err.to_string())
    }
}

impl From<fleet_id::IdError> for StoreError {
    fn from(err: fleet_id::IdError) -> Self {
        Self::Corrupt(err.to_string())
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        Self::Corrupt(err.to_string())
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

#[async_trait]
pub trait WorkspaceStore: Send + Sync {
    async fn insert(&self, workspace: &Workspace) -> StoreResult<()>;

    async fn find(&self, id: &WorkspaceId) -> StoreResult<Option<Workspace>>;

    /// Like [`WorkspaceStore::find`] but a missing row is an error.
    async fn get(&self, id: &WorkspaceId) -> StoreResult<Workspace> {
        self.find(id).await?.ok_or(StoreError::NotFound(*id))
    }

    /// Writes the fields set in `patch`.
    async fn update(&self, id: &WorkspaceId, patch: &WorkspacePatch) -> StoreResult<()>;

    /// Workspaces whose state differs from their desired state, excluding
    /// archive requests and terminal states. Most recently active first.
    async fn find_needing_sync(&self, limit: usize) -> StoreResult<Vec<Workspace>>;

    /// Workspaces that want to be archived. Those already ARCHIVING are
    /// always included; new ones are skipped when their node already has
    /// `max_archiving_per_node` archives in flight.
    async fn find_archive_candidates(
        &self,
        limit: usize,
        max_archiving_per_node: usize,
    ) -> StoreResult<Vec<Workspace>>;

    /// STARTED workspaces on `node` idle for longer than their auto-stop
    /// interval, oldest snapshot first. `excluded_org` is never returned.
    async fn find_auto_stop_candidates(
        &self,
        node: &NodeId,
        excluded_org: &OrgId,
        limit: usize,
        now: DateTime<Utc>,
    ) -> StoreResult<Vec<Workspace>>;

    async fn count_on_node(&self, node: &NodeId, state: WorkspaceState) -> StoreResult<usize>;

    /// Most recently active first.
    async fn find_on_node_in_state(
        &self,
        node: &NodeId,
        state: WorkspaceState,
        limit: usize,
    ) -> StoreResult<Vec<Workspace>>;
}
