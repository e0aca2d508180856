mod common;

use std::time::Duration;

use common::{Harness, PYTHON_INTERNAL};
use fleet_control_plane::config::EngineConfig;
use fleet_control_plane::model::{
    DesiredState, ImageNodeState, Node, SnapshotState, Workspace, WorkspaceState,
};
use fleet_control_plane::node_client::{MockNodeFactory, NodeOp, NodeWorkspaceState};
use fleet_control_plane::nodes::NodeRegistry;
use fleet_control_plane::registry::DockerRegistry;
use fleet_control_plane::store::WorkspaceStore;
use fleet_reconcile::SyncOutcome;

const SNAPSHOT: &str = "registry.local/snapshots/ws:2";
const OLD_SNAPSHOT: &str = "registry.local/snapshots/ws:1";

async fn cache_image(h: &Harness, node: &Node) {
    h.nodes
        .create_image_node(&node.id, PYTHON_INTERNAL, ImageNodeState::Ready, None)
        .await
        .unwrap();
}

fn snapshotted(h: &Harness, registry: &DockerRegistry) -> Workspace {
    let mut ws = h.workspace();
    ws.state = WorkspaceState::Stopped;
    ws.desired_state = DesiredState::Started;
    ws.snapshot_state = SnapshotState::Completed;
    ws.snapshot_image = Some(SNAPSHOT.into());
    ws.snapshot_registry_id = Some(registry.id);
    ws.existing_snapshot_images = vec![OLD_SNAPSHOT.into(), SNAPSHOT.into()];
    ws
}

#[tokio::test]
async fn test_restore_archived_workspace_onto_cached_node() {
    let h = Harness::new();
    let registry = h.add_catalog().await;
    let cold = h.add_node().await;
    let warm = h.add_node().await;
    cache_image(&h, &warm).await;
    h.registry_client.push(SNAPSHOT).await;

    let mut ws = snapshotted(&h, &registry);
    ws.state = WorkspaceState::Archived;
    h.insert(&ws).await;

    assert_eq!(h.sync(&ws.id).await, SyncOutcome::RunAgain);
    let current = h.get(&ws.id).await;
    assert_eq!(current.state, WorkspaceState::Restoring);
    assert_eq!(current.node_id, Some(warm.id));

    let creates = h.agents.calls_of(NodeOp::Create);
    assert_eq!(creates.len(), 1);
    assert_eq!(creates[0].node_id, warm.id);
    assert_eq!(creates[0].image.as_deref(), Some(SNAPSHOT));
    assert!(h.agents.calls().iter().all(|c| c.node_id != cold.id));

    h.converge(&ws.id).await;
    let current = h.get(&ws.id).await;
    assert_eq!(current.state, WorkspaceState::Started);
    assert_eq!(current.snapshot_state, SnapshotState::None);
}

#[tokio::test]
async fn test_restore_falls_back_to_older_snapshot() {
    let h = Harness::new();
    let registry = h.add_catalog().await;
    let node = h.add_node().await;
    cache_image(&h, &node).await;
    h.registry_client.push(OLD_SNAPSHOT).await;
    h.registry_client.break_image(SNAPSHOT).await;

    let mut ws = snapshotted(&h, &registry);
    ws.state = WorkspaceState::Archived;
    h.insert(&ws).await;

    assert_eq!(h.sync(&ws.id).await, SyncOutcome::RunAgain);
    let creates = h.agents.calls_of(NodeOp::Create);
    assert_eq!(creates[0].image.as_deref(), Some(OLD_SNAPSHOT));
}

#[tokio::test]
async fn test_restore_without_valid_snapshot_errors() {
    let h = Harness::new();
    let registry = h.add_catalog().await;
    let node = h.add_node().await;
    cache_image(&h, &node).await;

    let mut ws = snapshotted(&h, &registry);
    ws.state = WorkspaceState::Archived;
    h.insert(&ws).await;

    assert_eq!(h.sync(&ws.id).await, SyncOutcome::RunAgain);
    let current = h.get(&ws.id).await;
    assert_eq!(current.state, WorkspaceState::Error);
    assert_eq!(current.error_reason.as_deref(), Some("No valid snapshot image found"));
    assert_eq!(h.sync(&ws.id).await, SyncOutcome::Done);
}

#[tokio::test]
async fn test_unplaced_workspace_without_snapshot_errors() {
    let h = Harness::new();
    let registry = h.add_catalog().await;
    let mut ws = snapshotted(&h, &registry);
    ws.state = WorkspaceState::Archived;
    ws.snapshot_state = SnapshotState::Pending;
    h.insert(&ws).await;

    assert_eq!(h.sync(&ws.id).await, SyncOutcome::RunAgain);
    let current = h.get(&ws.id).await;
    assert_eq!(current.state, WorkspaceState::Error);
    assert_eq!(
        current.error_reason.as_deref(),
        Some("Workspace has no node and snapshot is not completed")
    );
}

#[tokio::test]
async fn test_stopped_workspace_starts_in_place() {
    let h = Harness::new();
    let registry = h.add_catalog().await;
    let node = h.add_node().await;
    let mut ws = snapshotted(&h, &registry);
    ws.node_id = Some(node.id);
    h.insert(&ws).await;
    h.agents.set_state(node.id, ws.id, NodeWorkspaceState::Stopped);

    assert_eq!(h.sync(&ws.id).await, SyncOutcome::RunAgain);
    assert_eq!(h.get(&ws.id).await.state, WorkspaceState::Starting);
    assert_eq!(h.agents.calls_of(NodeOp::Start).len(), 1);
    assert!(h.agents.calls_of(NodeOp::Create).is_empty());

    h.converge(&ws.id).await;
    assert_eq!(h.get(&ws.id).await.state, WorkspaceState::Started);
}

async fn wait_for_drain(h: &Harness, ws: &Workspace) -> Workspace {
    for _ in 0..200 {
        let current = h.get(&ws.id).await;
        if current.prev_node_id.is_none() {
            return current;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("previous node was never drained");
}

#[tokio::test]
async fn test_cordoned_node_moves_workspace_and_drains_it() {
    let h = Harness::new();
    let registry = h.add_catalog().await;
    let cordoned = h.add_node().await;
    let target = h.add_node().await;
    h.nodes.update(&cordoned.id, |n| n.unschedulable = true).await;
    cache_image(&h, &cordoned).await;
    cache_image(&h, &target).await;
    h.registry_client.push(SNAPSHOT).await;

    let mut ws = snapshotted(&h, &registry);
    ws.node_id = Some(cordoned.id);
    h.insert(&ws).await;
    h.agents.set_state(cordoned.id, ws.id, NodeWorkspaceState::Stopped);

    assert_eq!(h.sync(&ws.id).await, SyncOutcome::RunAgain);
    let current = h.get(&ws.id).await;
    assert_eq!(current.state, WorkspaceState::Restoring);
    assert_eq!(current.node_id, Some(target.id));
    assert_eq!(current.prev_node_id, Some(cordoned.id));

    h.converge(&ws.id).await;
    let current = wait_for_drain(&h, &ws).await;
    assert_eq!(current.state, WorkspaceState::Started);
    assert_eq!(current.node_id, Some(target.id));
    assert_eq!(h.agents.state_of(cordoned.id, ws.id), None);
    assert_eq!(h.agents.state_of(target.id, ws.id), Some(NodeWorkspaceState::Started));

    let cordoned = h.nodes.find_one(&cordoned.id).await.unwrap().unwrap();
    assert_eq!(cordoned.used, 0);
}

#[tokio::test]
async fn test_drain_clears_prev_when_node_is_gone() {
    let h = Harness::new();
    let node = h.add_node().await;
    let mut ws = h.workspace();
    ws.state = WorkspaceState::Starting;
    ws.node_id = Some(node.id);
    ws.prev_node_id = Some(fleet_id::NodeId::new());
    h.insert(&ws).await;
    h.agents.set_state(node.id, ws.id, NodeWorkspaceState::Started);

    assert_eq!(h.sync(&ws.id).await, SyncOutcome::RunAgain);
    let current = wait_for_drain(&h, &ws).await;
    assert_eq!(current.state, WorkspaceState::Started);
}

#[tokio::test]
async fn test_overloaded_node_rebalances_on_start() {
    let mut config = EngineConfig::without_delays();
    config.rebalance_threshold = 2;
    let h = Harness::build(MockNodeFactory::new(), config);
    let registry = h.add_catalog().await;
    let crowded = h.add_node().await;
    let spare = h.add_node().await;
    cache_image(&h, &crowded).await;
    cache_image(&h, &spare).await;
    h.registry_client.push(SNAPSHOT).await;

    for _ in 0..3 {
        let mut neighbour = h.workspace();
        neighbour.state = WorkspaceState::Started;
        neighbour.node_id = Some(crowded.id);
        h.workspaces.insert(&neighbour).await.unwrap();
    }

    let mut ws = snapshotted(&h, &registry);
    ws.node_id = Some(crowded.id);
    h.insert(&ws).await;
    h.agents.set_state(crowded.id, ws.id, NodeWorkspaceState::Stopped);

    assert_eq!(h.sync(&ws.id).await, SyncOutcome::RunAgain);
    let current = h.get(&ws.id).await;
    assert_eq!(current.node_id, Some(spare.id));
    assert_eq!(current.prev_node_id, Some(crowded.id));
    assert_eq!(current.state, WorkspaceState::Restoring);
    assert_eq!(h.agents.calls_of(NodeOp::RemoveDestroyed).len(), 1);
    assert!(h.agents.calls_of(NodeOp::Start).is_empty());
}

#[tokio::test]
async fn test_busy_node_without_alternative_starts_in_place() {
    let mut config = EngineConfig::without_delays();
    config.rebalance_threshold = 0;
    let h = Harness::build(MockNodeFactory::new(), config);
    let registry = h.add_catalog().await;
    let only = h.add_node().await;
    cache_image(&h, &only).await;

    let mut neighbour = h.workspace();
    neighbour.state = WorkspaceState::Started;
    neighbour.node_id = Some(only.id);
    h.insert(&neighbour).await;

    let mut ws = snapshotted(&h, &registry);
    ws.node_id = Some(only.id);
    h.insert(&ws).await;
    h.agents.set_state(only.id, ws.id, NodeWorkspaceState::Stopped);

    assert_eq!(h.sync(&ws.id).await, SyncOutcome::RunAgain);
    let current = h.get(&ws.id).await;
    assert_eq!(current.node_id, Some(only.id));
    assert_eq!(current.state, WorkspaceState::Starting);
}
