use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use fleet_id::{NodeId, OrgId, RegistryId, WorkspaceId};
use serde::{Deserialize, Serialize};

use super::text_enum;

text_enum! {
    /// Last observed (or forced) lifecycle phase of a workspace.
    pub enum WorkspaceState {
        PendingBuild => "pending_build",
        BuildingImage => "building_image",
        Unknown => "unknown",
        Creating => "creating",
        Restoring => "restoring",
        PullingImage => "pulling_image",
        Starting => "starting",
        Started => "started",
        Stopping => "stopping",
        Stopped => "stopped",
        Destroying => "destroying",
        Destroyed => "destroyed",
        Archiving => "archiving",
        Archived => "archived",
        Error => "error",
    }
}

text_enum! {
    /// Lifecycle phase requested by the API (or by auto-stop).
    pub enum DesiredState {
        Started => "started",
        Stopped => "stopped",
        Destroyed => "destroyed",
        Archived => "archived",
    }
}

text_enum! {
    /// Progress of the most recent filesystem snapshot.
    pub enum SnapshotState {
        None => "none",
        Pending => "pending",
        Completed => "completed",
        Error => "error",
    }
}

impl WorkspaceState {
    /// States the periodic sync sweeps never pick up again on their own.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Destroyed | Self::Error)
    }

    /// States that occupy a slot on the owning node.
    pub fn occupies_node(&self) -> bool {
        !matches!(self, Self::Destroyed | Self::Archived | Self::Error)
    }

    /// Whether this observed state is the one `desired` asks for.
    pub fn satisfies(&self, desired: DesiredState) -> bool {
        self.as_str() == desired.as_str()
    }
}

/// Descriptor of an image built from source rather than pulled pre-built.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildInfo {
    /// Reference the built image is tagged with.
    pub image_ref: String,
    pub dockerfile_content: String,
    /// Content hashes of the uploaded build context.
    pub context_hashes: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VolumeMount {
    pub volume_id: String,
    pub mount_path: String,
}

/// A sandboxed compute workspace.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Workspace {
    pub id: WorkspaceId,
    pub organization_id: OrgId,
    pub state: WorkspaceState,
    pub desired_state: DesiredState,
    pub node_id: Option<NodeId>,
    /// Node the workspace is being migrated away from.
    pub prev_node_id: Option<NodeId>,

    pub region: String,
    pub class: String,
    pub cpu: u32,
    /// GiB.
    pub mem: u32,
    /// GiB.
    pub disk: u32,
    pub env: BTreeMap<String, String>,
    pub volumes: Vec<VolumeMount>,
    pub os_user: String,

    /// Image name as the user knows it; resolved through the image catalog.
    pub image: String,
    pub build_info: Option<BuildInfo>,

    pub snapshot_state: SnapshotState,
    pub snapshot_image: Option<String>,
    pub snapshot_registry_id: Option<RegistryId>,
    /// Every snapshot image pushed for this workspace, oldest first.
    pub existing_snapshot_images: Vec<String>,

    pub last_activity_at: DateTime<Utc>,
    pub last_snapshot_at: Option<DateTime<Utc>>,
    /// Minutes of inactivity before auto-stop. Zero disables it.
    pub auto_stop_interval: u32,
    pub error_reason: Option<String>,
}

impl Workspace {
    /// A workspace as the API creates it: desired STARTED, not yet observed.
    pub fn new(organization_id: OrgId, image: impl Into<String>) -> Self {
        Self {
            id: WorkspaceId::new(),
            organization_id,
            state: WorkspaceState::Unknown,
            desired_state: DesiredState::Started,
            node_id: None,
            prev_node_id: None,
            region: "us".to_string(),
            class: "small".to_string(),
            cpu: 1,
            mem: 1,
            disk: 3,
            env: BTreeMap::new(),
            volumes: Vec::new(),
            os_user: "workspace".to_string(),
            image: image.into(),
            build_info: None,
            snapshot_state: SnapshotState::None,
            snapshot_image: None,
            snapshot_registry_id: None,
            existing_snapshot_images: Vec::new(),
            last_activity_at: Utc::now(),
            last_snapshot_at: None,
            auto_stop_interval: 15,
            error_reason: None,
        }
    }

    pub fn has_completed_snapshot(&self) -> bool {
        self.snapshot_state == SnapshotState::Completed
    }

    /// Reference the node agent should run when the image is known by ref:
    /// the build's own tag for from-source workspaces.
    pub fn build_image_ref(&self) -> Option<&str> {
        self.build_info.as_ref().map(|b| b.image_ref.as_str())
    }

    /// Snapshot images worth trying on restore, most recent first.
    ///
    /// The live `snapshot_image` leads; the history follows newest to oldest
    /// without repeating it.
    pub fn snapshot_candidates(&self) -> Vec<String> {
        let mut candidates: Vec<String> = self.snapshot_image.iter().cloned().collect();
        for image in self.existing_snapshot_images.iter().rev() {
            if !candidates.contains(image) {
                candidates.push(image.clone());
            }
        }
        candidates
    }
}

/// Partial update of the fields the reconciler owns.
///
/// `None` leaves a field untouched. Nullable columns use a nested option so
/// that "clear" (`Some(None)`) is distinct from "leave alone".
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WorkspacePatch {
    pub state: Option<WorkspaceState>,
    pub desired_state: Option<DesiredState>,
    pub node_id: Option<Option<NodeId>>,
    pub prev_node_id: Option<Option<NodeId>>,
    pub snapshot_state: Option<SnapshotState>,
    pub error_reason: Option<Option<String>>,
    pub last_activity_at: Option<DateTime<Utc>>,
}

impl WorkspacePatch {
    pub fn state(state: WorkspaceState) -> Self {
        Self {
            state: Some(state),
            ..Self::default()
        }
    }

    pub fn with_node(mut self, node_id: Option<NodeId>) -> Self {
        self.node_id = Some(node_id);
        self
    }

    pub fn with_prev_node(mut self, prev_node_id: Option<NodeId>) -> Self {
        self.prev_node_id = Some(prev_node_id);
        self
    }

    pub fn with_snapshot_state(mut self, snapshot_state: SnapshotState) -> Self {
        self.snapshot_state = Some(snapshot_state);
        self
    }

    pub fn with_last_activity(mut self, at: DateTime<Utc>) -> Self {
        self.last_activity_at = Some(at);
        self
    }

    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    /// The subset of this patch that would actually change `current`.
    pub fn changes_against(&self, current: &Workspace) -> Self {
        fn keep<T: PartialEq + Clone>(wanted: &Option<T>, current: &T) -> Option<T> {
            wanted.as_ref().filter(|v| *v != current).cloned()
        }

        Self {
            state: keep(&self.state, &current.state),
            desired_state: keep(&self.desired_state, &current.desired_state),
            node_id: keep(&self.node_id, &current.node_id),
            prev_node_id: keep(&self.prev_node_id, &current.prev_node_id),
            snapshot_state: keep(&self.snapshot_state, &current.snapshot_state),
            error_reason: keep(&self.error_reason, &current.error_reason),
            last_activity_at: keep(&self.last_activity_at, &current.last_activity_at),
        }
    }

    pub fn apply(&self, workspace: &mut Workspace) {
        if let Some(state) = self.state {
            workspace.state = state;
        }
        if let Some(desired) = self.desired_state {
            workspace.desired_state = desired;
        }
        if let Some(node_id) = self.node_id {
            workspace.node_id = node_id;
        }
        if let Some(prev) = self.prev_node_id {
            workspace.prev_node_id = prev;
        }
        if let Some(snapshot_state) = self.snapshot_state {
            workspace.snapshot_state = snapshot_state;
        }
        if let Some(reason) = &self.error_reason {
            workspace.error_reason = reason.clone();
        }
        if let Some(at) = self.last_activity_at {
            workspace.last_activity_at = at;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_text_roundtrip() {
        for state in WorkspaceState::ALL {
            let parsed: WorkspaceState = state.as_str().parse().unwrap();
            assert_eq!(parsed, *state);
        }
        assert!("paused".parse::<WorkspaceState>().is_err());
    }

    #[test]
    fn test_satisfies_compares_across_enums() {
        assert!(WorkspaceState::Started.satisfies(DesiredState::Started));
        assert!(WorkspaceState::Archived.satisfies(DesiredState::Archived));
        assert!(!WorkspaceState::Stopping.satisfies(DesiredState::Stopped));
    }

    #[test]
    fn test_snapshot_candidates_newest_first() {
        let mut ws = Workspace::new(OrgId::new(), "python:3.12");
        ws.existing_snapshot_images = vec!["snap:1".into(), "snap:2".into(), "snap:3".into()];
        ws.snapshot_image = Some("snap:3".into());

        assert_eq!(ws.snapshot_candidates(), vec!["snap:3", "snap:2", "snap:1"]);
    }

    #[test]
    fn test_snapshot_candidates_live_image_not_in_history() {
        let mut ws = Workspace::new(OrgId::new(), "python:3.12");
        ws.existing_snapshot_images = vec!["snap:1".into()];
        ws.snapshot_image = Some("snap:9".into());

        assert_eq!(ws.snapshot_candidates(), vec!["snap:9", "snap:1"]);
    }

    #[test]
    fn test_patch_changes_against_drops_noops() {
        let mut ws = Workspace::new(OrgId::new(), "node:22");
        ws.state = WorkspaceState::Stopped;
        let node = NodeId::new();
        ws.node_id = Some(node);

        let patch = WorkspacePatch::state(WorkspaceState::Stopped).with_node(Some(node));
        assert!(patch.changes_against(&ws).is_empty());

        let patch = WorkspacePatch::state(WorkspaceState::Starting).with_node(Some(node));
        let diff = patch.changes_against(&ws);
        assert_eq!(diff, WorkspacePatch::state(WorkspaceState::Starting));
    }

    #[test]
    fn test_patch_can_clear_nullable_fields() {
        let mut ws = Workspace::new(OrgId::new(), "node:22");
        ws.node_id = Some(NodeId::new());
        ws.error_reason = Some("boom".into());

        let patch = WorkspacePatch {
            error_reason: Some(None),
            ..WorkspacePatch::default()
        }
        .with_node(None);
        patch.apply(&mut ws);

        assert_eq!(ws.node_id, None);
        assert_eq!(ws.error_reason, None);
    }
}
