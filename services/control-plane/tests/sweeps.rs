mod common;

use std::time::Duration;

use chrono::Utc;
use common::Harness;
use fleet_control_plane::engine::{
    EventBus, EventListener, SyncWorker, WorkspaceEvent, WorkspaceEventKind,
};
use fleet_control_plane::model::{DesiredState, SnapshotState, Workspace, WorkspaceState};
use fleet_control_plane::node_client::NodeWorkspaceState;
use fleet_control_plane::store::WorkspaceStore;
use fleet_id::{NodeId, OrgId, WorkspaceId};
use fleet_reconcile::DistributedLock;
use tokio::sync::watch;

fn idle_started(h: &Harness, node: NodeId, idle_minutes: i64) -> Workspace {
    let mut ws = h.workspace();
    ws.state = WorkspaceState::Started;
    ws.node_id = Some(node);
    ws.auto_stop_interval = 15;
    ws.last_activity_at = Utc::now() - chrono::Duration::minutes(idle_minutes);
    ws
}

#[tokio::test]
async fn test_auto_stop_flips_idle_workspaces() {
    let mut h = Harness::new();
    let node = h.add_node().await;

    let idle = idle_started(&h, node.id, 30);
    let active = idle_started(&h, node.id, 5);
    let mut warm_pool = idle_started(&h, node.id, 30);
    warm_pool.organization_id = OrgId::unassigned();
    let mut pinned = idle_started(&h, node.id, 30);
    pinned.auto_stop_interval = 0;
    for ws in [&idle, &active, &warm_pool, &pinned] {
        h.insert(ws).await;
    }

    assert_eq!(h.manager.auto_stop_check().await, 1);
    assert_eq!(h.get(&idle.id).await.desired_state, DesiredState::Stopped);
    for ws in [&active, &warm_pool, &pinned] {
        assert_eq!(h.get(&ws.id).await.desired_state, DesiredState::Started);
    }
    assert_eq!(h.queued(), vec![idle.id]);
    assert!(!h.leases.is_live(&format!("sync:{}", idle.id)));
}

#[tokio::test]
async fn test_auto_stop_lease_spaces_runs() {
    let h = Harness::new();
    let node = h.add_node().await;
    let first = idle_started(&h, node.id, 30);
    h.insert(&first).await;

    assert_eq!(h.manager.auto_stop_check().await, 1);
    assert!(h.leases.is_live("auto-stop-check-worker-selected"));

    let second = idle_started(&h, node.id, 30);
    h.insert(&second).await;
    assert_eq!(h.manager.auto_stop_check().await, 0);
    assert_eq!(h.get(&second.id).await.desired_state, DesiredState::Started);
}

#[tokio::test]
async fn test_auto_stop_skips_workspace_being_synced() {
    let h = Harness::new();
    let node = h.add_node().await;
    let ws = idle_started(&h, node.id, 30);
    h.insert(&ws).await;
    h.leases
        .acquire(&format!("sync:{}", ws.id), Duration::from_secs(60))
        .await
        .unwrap();

    assert_eq!(h.manager.auto_stop_check().await, 0);
    assert_eq!(h.get(&ws.id).await.desired_state, DesiredState::Started);
}

#[tokio::test]
async fn test_sync_sweep_queues_lagging_workspaces() {
    let mut h = Harness::new();
    let node = h.add_node().await;

    let mut lagging = h.workspace();
    lagging.state = WorkspaceState::Started;
    lagging.desired_state = DesiredState::Stopped;
    lagging.node_id = Some(node.id);
    let mut converged = h.workspace();
    converged.state = WorkspaceState::Started;
    let mut failed = h.workspace();
    failed.state = WorkspaceState::Error;
    let mut archiving = h.workspace();
    archiving.state = WorkspaceState::Stopped;
    archiving.desired_state = DesiredState::Archived;
    archiving.node_id = Some(node.id);
    for ws in [&lagging, &converged, &failed, &archiving] {
        h.insert(ws).await;
    }

    assert_eq!(h.manager.sync_states().await, 1);
    assert_eq!(h.queued(), vec![lagging.id]);
    // Released right away, unlike the auto-stop lease.
    assert!(!h.leases.is_live("sync-states"));

    assert_eq!(h.manager.sync_archived_states().await, 1);
    assert_eq!(h.queued(), vec![archiving.id]);
    assert!(!h.leases.is_live("sync-archived-desired-states"));
}

#[tokio::test]
async fn test_sweep_skipped_while_lease_held_elsewhere() {
    let mut h = Harness::new();
    let mut lagging = h.workspace();
    lagging.desired_state = DesiredState::Destroyed;
    h.insert(&lagging).await;
    h.leases
        .acquire("sync-states", Duration::from_secs(30))
        .await
        .unwrap();

    assert_eq!(h.manager.sync_states().await, 0);
    assert!(h.queued().is_empty());
}

#[tokio::test]
async fn test_event_listener_requests_sync() {
    let mut h = Harness::new();
    let bus = EventBus::new(16);
    let listener = EventListener::new(h.manager.clone(), &bus);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let handle = tokio::spawn(listener.run(shutdown_rx));

    let id = WorkspaceId::new();
    bus.publish(WorkspaceEvent {
        kind: WorkspaceEventKind::Stopped,
        workspace_id: id,
    });

    let mut queued = Vec::new();
    for _ in 0..200 {
        queued = h.queued();
        if !queued.is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(queued, vec![id]);

    shutdown_tx.send(true).unwrap();
    tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .unwrap()
        .unwrap();
}

#[tokio::test]
async fn test_sync_worker_drives_workspace_to_desired_state() {
    let h = Harness::new();
    let node = h.add_node().await;
    h.add_catalog().await;
    let mut ws = h.workspace();
    ws.snapshot_state = SnapshotState::None;
    h.insert(&ws).await;

    let Harness {
        manager,
        workspaces,
        agents,
        resync,
        ..
    } = h;
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let worker = SyncWorker::new(manager.clone(), resync, 4);
    let handle = tokio::spawn(worker.run(shutdown_rx));

    manager.request_sync(ws.id);

    let mut state = WorkspaceState::Unknown;
    for _ in 0..400 {
        state = workspaces.get(&ws.id).await.unwrap().state;
        if state == WorkspaceState::Started {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(state, WorkspaceState::Started);
    assert_eq!(
        agents.state_of(node.id, ws.id),
        Some(NodeWorkspaceState::Started)
    );

    shutdown_tx.send(true).unwrap();
    tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .unwrap()
        .unwrap();
}
