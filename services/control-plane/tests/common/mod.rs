//! In-memory reconciler wired to a scripted node fleet.

#![allow(dead_code)]

use std::sync::Arc;

use fleet_control_plane::config::EngineConfig;
use fleet_control_plane::engine::{resync_queue, EngineDeps, ResyncReceiver, WorkspaceManager};
use fleet_control_plane::model::{Node, Workspace};
use fleet_control_plane::node_client::MockNodeFactory;
use fleet_control_plane::nodes::MemoryNodeRegistry;
use fleet_control_plane::registry::{
    DockerRegistry, Image, MemoryImageCatalog, MemoryRegistryClient, MemoryRegistryResolver,
};
use fleet_control_plane::store::{MemoryWorkspaceStore, WorkspaceStore};
use fleet_id::{OrgId, RegistryId, WorkspaceId};
use fleet_reconcile::{MemoryLeases, SyncOutcome};

pub const REGISTRY_URL: &str = "https://registry.local";
pub const PYTHON: &str = "python:3.12";
pub const PYTHON_INTERNAL: &str = "registry.local/fleet/python:3.12";

pub struct Harness {
    pub manager: WorkspaceManager,
    pub workspaces: Arc<MemoryWorkspaceStore>,
    pub nodes: Arc<MemoryNodeRegistry>,
    pub agents: MockNodeFactory,
    pub registries: Arc<MemoryRegistryResolver>,
    pub registry_client: Arc<MemoryRegistryClient>,
    pub images: Arc<MemoryImageCatalog>,
    pub leases: Arc<MemoryLeases>,
    pub resync: ResyncReceiver,
}

impl Harness {
    pub fn new() -> Self {
        Self::build(MockNodeFactory::new(), EngineConfig::without_delays())
    }

    /// Node agents only change state when a test says so.
    pub fn manual() -> Self {
        Self::build(MockNodeFactory::new().manual(), EngineConfig::without_delays())
    }

    pub fn build(agents: MockNodeFactory, config: EngineConfig) -> Self {
        let workspaces = Arc::new(MemoryWorkspaceStore::new());
        let nodes = Arc::new(MemoryNodeRegistry::new(workspaces.clone()));
        let registries = Arc::new(MemoryRegistryResolver::new());
        let registry_client = Arc::new(MemoryRegistryClient::new());
        let images = Arc::new(MemoryImageCatalog::new());
        let leases = Arc::new(MemoryLeases::new());

        let deps = EngineDeps {
            workspaces: workspaces.clone(),
            nodes: nodes.clone(),
            clients: Arc::new(agents.clone()),
            registries: registries.clone(),
            registry_client: registry_client.clone(),
            images: images.clone(),
            locks: leases.clone(),
            counters: leases.clone(),
        };
        let (queue, resync) = resync_queue();

        Self {
            manager: WorkspaceManager::new(deps, config, queue),
            workspaces,
            nodes,
            agents,
            registries,
            registry_client,
            images,
            leases,
            resync,
        }
    }

    pub async fn add_node(&self) -> Node {
        self.add_node_in("us", "small").await
    }

    pub async fn add_node_in(&self, region: &str, class: &str) -> Node {
        let node = Node::new("mock://node", region, class, 50);
        self.nodes.insert(node.clone()).await;
        node
    }

    /// Shared registry hosting `python:3.12` as [`PYTHON_INTERNAL`].
    pub async fn add_catalog(&self) -> DockerRegistry {
        let registry = DockerRegistry {
            id: RegistryId::new(),
            url: REGISTRY_URL.to_string(),
            username: "fleet".into(),
            password: "secret".into(),
            project: "fleet".into(),
            organization_id: None,
        };
        self.registries.insert(registry.clone()).await;
        self.images
            .insert(Image {
                name: PYTHON.into(),
                internal_name: PYTHON_INTERNAL.into(),
                entrypoint: Some(vec!["sleep".into(), "infinity".into()]),
                organization_id: None,
            })
            .await;
        registry
    }

    pub fn workspace(&self) -> Workspace {
        Workspace::new(OrgId::new(), PYTHON)
    }

    pub async fn insert(&self, workspace: &Workspace) {
        self.workspaces.insert(workspace).await.unwrap();
    }

    pub async fn get(&self, id: &WorkspaceId) -> Workspace {
        self.workspaces.get(id).await.unwrap()
    }

    pub async fn sync(&self, id: &WorkspaceId) -> SyncOutcome {
        self.manager.sync_workspace(*id).await
    }

    /// Syncs until an attempt reports Done. Returns the number of attempts.
    pub async fn converge(&self, id: &WorkspaceId) -> usize {
        for attempt in 1..=50 {
            if self.sync(id).await == SyncOutcome::Done {
                return attempt;
            }
        }
        panic!("workspace {id} did not converge");
    }

    /// Ids queued for resync since the last call.
    pub fn queued(&mut self) -> Vec<WorkspaceId> {
        std::iter::from_fn(|| self.resync.try_next()).collect()
    }
}
