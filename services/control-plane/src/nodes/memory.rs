use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use fleet_id::NodeId;
use tokio::sync::RwLock;

use super::{NodeFilter, NodeRegistry};
use crate::model::{ImageNode, ImageNodeState, Node};
use crate::store::{MemoryWorkspaceStore, StoreResult};

/// Node fleet held in memory. Usage is recounted from the shared workspace table.
#[derive(Debug)]
pub struct MemoryNodeRegistry {
    nodes: RwLock<HashMap<NodeId, Node>>,
    images: RwLock<HashMap<(NodeId, String), ImageNode>>,
    workspaces: Arc<MemoryWorkspaceStore>,
}

impl MemoryNodeRegistry {
    pub fn new(workspaces: Arc<MemoryWorkspaceStore>) -> Self {
        Self {
            nodes: RwLock::new(HashMap::new()),
            images: RwLock::new(HashMap::new()),
            workspaces,
        }
    }

    pub async fn insert(&self, node: Node) {
        self.nodes.write().await.insert(node.id, node);
    }

    pub async fn remove(&self, id: &NodeId) {
        self.nodes.write().await.remove(id);
    }

    pub async fn update(&self, id: &NodeId, f: impl FnOnce(&mut Node)) {
        if let Some(node) = self.nodes.write().await.get_mut(id) {
            f(node);
        }
    }
}

#[async_trait]
impl NodeRegistry for MemoryNodeRegistry {
    async fn find_one(&self, id: &NodeId) -> StoreResult<Option<Node>> {
        Ok(self.nodes.read().await.get(id).cloned())
    }

    async fn find_all(&self) -> StoreResult<Vec<Node>> {
        Ok(self.nodes.read().await.values().cloned().collect())
    }

    async fn find_available_nodes(&self, filter: &NodeFilter) -> StoreResult<Vec<Node>> {
        let nodes = self.nodes.read().await;
        let images = self.images.read().await;
        Ok(nodes
            .values()
            .filter(|node| filter.admits(node))
            .filter(|node| match &filter.image_ref {
                None => true,
                Some(image_ref) => images
                    .get(&(node.id, image_ref.clone()))
                    .is_some_and(|entry| entry.state == ImageNodeState::Ready),
            })
            .cloned()
            .collect())
    }

    async fn get_nodes_with_multiple_images_building(&self) -> StoreResult<Vec<NodeId>> {
        let mut building: HashMap<NodeId, usize> = HashMap::new();
        for entry in self.images.read().await.values() {
            if entry.state == ImageNodeState::BuildingImage {
                *building.entry(entry.node_id).or_default() += 1;
            }
        }
        Ok(building
            .into_iter()
            .filter(|(_, count)| *count >= 2)
            .map(|(node, _)| node)
            .collect())
    }

    async fn get_image_node(&self, node: &NodeId, image_ref: &str) -> StoreResult<Option<ImageNode>> {
        Ok(self
            .images
            .read()
            .await
            .get(&(*node, image_ref.to_string()))
            .cloned())
    }

    async fn get_image_nodes(&self, image_ref: &str) -> StoreResult<Vec<ImageNode>> {
        Ok(self
            .images
            .read()
            .await
            .values()
            .filter(|entry| entry.image_ref == image_ref)
            .cloned()
            .collect())
    }

    async fn create_image_node(
        &self,
        node: &NodeId,
        image_ref: &str,
        state: ImageNodeState,
        error_reason: Option<String>,
    ) -> StoreResult<()> {
        self.images.write().await.insert(
            (*node, image_ref.to_string()),
            ImageNode {
                node_id: *node,
                image_ref: image_ref.to_string(),
                state,
                error_reason,
            },
        );
        Ok(())
    }

    async fn recalculate_node_usage(&self, node: &NodeId) -> StoreResult<()> {
        let used = self.workspaces.occupying(node).await;
        self.update(node, |n| n.used = u32::try_from(used).unwrap_or(u32::MAX))
            .await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{NodeState, Workspace, WorkspaceState};
    use crate::nodes::PlacementError;
    use crate::store::WorkspaceStore;
    use fleet_id::OrgId;

    fn node(region: &str) -> Node {
        Node::new("http://node.local", region, "small", 10)
    }

    #[tokio::test]
    async fn test_available_filter() {
        let registry = MemoryNodeRegistry::new(Arc::new(MemoryWorkspaceStore::new()));
        let ready = node("us");
        let mut draining = node("us");
        draining.unschedulable = true;
        let mut full = node("us");
        full.used = full.capacity;
        let mut offline = node("us");
        offline.state = NodeState::Unresponsive;
        let elsewhere = node("eu");
        for n in [&ready, &draining, &full, &offline, &elsewhere] {
            registry.insert(n.clone()).await;
        }

        let found = registry
            .find_available_nodes(&NodeFilter::new("us", "small"))
            .await
            .unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id, ready.id);

        let none = registry
            .get_random_available_node(&NodeFilter::new("us", "small").excluding([ready.id]))
            .await;
        assert!(matches!(none, Err(PlacementError::NoAvailableNodes)));
    }

    #[tokio::test]
    async fn test_image_filter_requires_ready_entry() {
        let registry = MemoryNodeRegistry::new(Arc::new(MemoryWorkspaceStore::new()));
        let cached = node("us");
        let building = node("us");
        registry.insert(cached.clone()).await;
        registry.insert(building.clone()).await;
        registry
            .create_image_node(&cached.id, "img:1", ImageNodeState::Ready, None)
            .await
            .unwrap();
        registry
            .create_image_node(&building.id, "img:1", ImageNodeState::BuildingImage, None)
            .await
            .unwrap();

        let id = registry
            .get_random_available_node(&NodeFilter::new("us", "small").with_image("img:1"))
            .await
            .unwrap();
        assert_eq!(id, cached.id);
    }

    #[tokio::test]
    async fn test_multiple_images_building() {
        let registry = MemoryNodeRegistry::new(Arc::new(MemoryWorkspaceStore::new()));
        let busy = NodeId::new();
        let single = NodeId::new();
        for image in ["a", "b"] {
            registry
                .create_image_node(&busy, image, ImageNodeState::BuildingImage, None)
                .await
                .unwrap();
        }
        registry
            .create_image_node(&single, "a", ImageNodeState::BuildingImage, None)
            .await
            .unwrap();
        registry
            .create_image_node(&single, "b", ImageNodeState::Ready, None)
            .await
            .unwrap();

        let nodes = registry.get_nodes_with_multiple_images_building().await.unwrap();
        assert_eq!(nodes, vec![busy]);
    }

    #[tokio::test]
    async fn test_recalculate_usage_counts_occupying_workspaces() {
        let store = Arc::new(MemoryWorkspaceStore::new());
        let registry = MemoryNodeRegistry::new(store.clone());
        let n = node("us");
        registry.insert(n.clone()).await;

        for state in [
            WorkspaceState::Started,
            WorkspaceState::Stopped,
            WorkspaceState::Destroyed,
            WorkspaceState::Archived,
        ] {
            let mut ws = Workspace::new(OrgId::new(), "img");
            ws.state = state;
            ws.node_id = Some(n.id);
            store.insert(&ws).await.unwrap();
        }

        registry.recalculate_node_usage(&n.id).await.unwrap();
        let used = registry.find_one(&n.id).await.unwrap().unwrap().used;
        assert_eq!(used, 2);
    }
}
