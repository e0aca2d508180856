use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use fleet_id::{NodeId, OrgId, WorkspaceId};
use tokio::sync::RwLock;

use super::{StoreError, StoreResult, WorkspaceStore};
use crate::model::{DesiredState, Workspace, WorkspacePatch, WorkspaceState};

/// Workspace table held in memory.
#[derive(Debug, Default)]
pub struct MemoryWorkspaceStore {
    rows: RwLock<HashMap<WorkspaceId, Workspace>>,
    writes: AtomicUsize,
}

impl MemoryWorkspaceStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of `update` calls that reached the table.
    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    pub async fn remove(&self, id: &WorkspaceId) -> Option<Workspace> {
        self.rows.write().await.remove(id)
    }

    /// Workspaces bound to `node` that hold a slot there.
    pub async fn occupying(&self, node: &NodeId) -> usize {
        self.rows
            .read()
            .await
            .values()
            .filter(|w| w.node_id.as_ref() == Some(node) && w.state.occupies_node())
            .count()
    }

    async fn select(
        &self,
        filter: impl Fn(&Workspace) -> bool,
        order: impl Fn(&Workspace, &Workspace) -> std::cmp::Ordering,
        limit: usize,
    ) -> Vec<Workspace> {
        let rows = self.rows.read().await;
        let mut matched: Vec<Workspace> = rows.values().filter(|w| filter(w)).cloned().collect();
        matched.sort_by(|a, b| order(a, b));
        matched.truncate(limit);
        matched
    }
}

fn newest_activity_first(a: &Workspace, b: &Workspace) -> std::cmp::Ordering {
    b.last_activity_at.cmp(&a.last_activity_at)
}

#[async_trait]
impl WorkspaceStore for MemoryWorkspaceStore {
    async fn insert(&self, workspace: &Workspace) -> StoreResult<()> {
        self.rows
            .write()
            .await
            .insert(workspace.id, workspace.clone());
        Ok(())
    }

    async fn find(&self, id: &WorkspaceId) -> StoreResult<Option<Workspace>> {
        Ok(self.rows.read().await.get(id).cloned())
    }

    async fn update(&self, id: &WorkspaceId, patch: &WorkspacePatch) -> StoreResult<()> {
        let mut rows = self.rows.write().await;
        let row = rows.get_mut(id).ok_or(StoreError::NotFound(*id))?;
        patch.apply(row);
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn find_needing_sync(&self, limit: usize) -> StoreResult<Vec<Workspace>> {
        Ok(self
            .select(
                |w| {
                    !w.state.is_terminal()
                        && w.desired_state != DesiredState::Archived
                        && !w.state.satisfies(w.desired_state)
                },
                newest_activity_first,
                limit,
            )
            .await)
    }

    async fn find_archive_candidates(
        &self,
        limit: usize,
        max_archiving_per_node: usize,
    ) -> StoreResult<Vec<Workspace>> {
        let mut archiving: HashMap<NodeId, usize> = HashMap::new();
        for w in self.rows.read().await.values() {
            if let (WorkspaceState::Archiving, Some(node)) = (w.state, w.node_id) {
                *archiving.entry(node).or_default() += 1;
            }
        }
        let node_busy = |node: &Option<NodeId>| {
            node.as_ref()
                .and_then(|n| archiving.get(n))
                .is_some_and(|count| *count >= max_archiving_per_node)
        };

        Ok(self
            .select(
                |w| {
                    w.desired_state == DesiredState::Archived
                        && match w.state {
                            WorkspaceState::Archiving => true,
                            WorkspaceState::Archived
                            | WorkspaceState::Destroyed
                            | WorkspaceState::Error => false,
                            _ => !node_busy(&w.node_id),
                        }
                },
                newest_activity_first,
                limit,
            )
            .await)
    }

    async fn find_auto_stop_candidates(
        &self,
        node: &NodeId,
        excluded_org: &OrgId,
        limit: usize,
        now: DateTime<Utc>,
    ) -> StoreResult<Vec<Workspace>> {
        Ok(self
            .select(
                |w| {
                    w.node_id.as_ref() == Some(node)
                        && w.organization_id != *excluded_org
                        && w.state == WorkspaceState::Started
                        && w.auto_stop_interval != 0
                        && w.last_activity_at
                            < now - Duration::minutes(i64::from(w.auto_stop_interval))
                },
                // Oldest snapshot first; never-snapshotted last, like NULLS LAST.
                |a, b| match (a.last_snapshot_at, b.last_snapshot_at) {
                    (Some(x), Some(y)) => x.cmp(&y),
                    (Some(_), None) => std::cmp::Ordering::Less,
                    (None, Some(_)) => std::cmp::Ordering::Greater,
                    (None, None) => std::cmp::Ordering::Equal,
                },
                limit,
            )
            .await)
    }

    async fn count_on_node(&self, node: &NodeId, state: WorkspaceState) -> StoreResult<usize> {
        Ok(self
            .rows
            .read()
            .await
            .values()
            .filter(|w| w.node_id.as_ref() == Some(node) && w.state == state)
            .count())
    }

    async fn find_on_node_in_state(
        &self,
        node: &NodeId,
        state: WorkspaceState,
        limit: usize,
    ) -> StoreResult<Vec<Workspace>> {
        Ok(self
            .select(
                |w| w.node_id.as_ref() == Some(node) && w.state == state,
                newest_activity_first,
                limit,
            )
            .await)
    }
}
