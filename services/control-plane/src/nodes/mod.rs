//! Read model over the node fleet and the per-node image cache.

mod memory;

pub use memory::MemoryNodeRegistry;

use async_trait::async_trait;
use fleet_id::NodeId;
use rand::seq::IndexedRandom;
use thiserror::Error;

use crate::model::{ImageNode, ImageNodeState, Node};
use crate::store::{StoreError, StoreResult};

/// Hard placement constraints.
#[derive(Debug, Clone, Default)]
pub struct NodeFilter {
    pub region: String,
    pub class: String,
    /// Only nodes whose image cache holds this ref in READY.
    pub image_ref: Option<String>,
    pub excluded: Vec<NodeId>,
}

impl NodeFilter {
    pub fn new(region: impl Into<String>, class: impl Into<String>) -> Self {
        Self {
            region: region.into(),
            class: class.into(),
            ..Self::default()
        }
    }

    pub fn with_image(mut self, image_ref: impl Into<String>) -> Self {
        self.image_ref = Some(image_ref.into());
        self
    }

    pub fn excluding(mut self, nodes: impl IntoIterator<Item = NodeId>) -> Self {
        self.excluded.extend(nodes);
        self
    }

    /// Region, class and exclusion checks. Image readiness is the registry's job.
    pub fn admits(&self, node: &Node) -> bool {
        node.is_available()
            && node.region == self.region
            && node.class == self.class
            && !self.excluded.contains(&node.id)
    }
}

#[derive(Debug, Error)]
pub enum PlacementError {
    #[error("No available nodes")]
    NoAvailableNodes,

    #[error(transparent)]
    Store(#[from] StoreError),
}

#[async_trait]
pub trait NodeRegistry: Send + Sync {
    async fn find_one(&self, id: &NodeId) -> StoreResult<Option<Node>>;

    async fn find_all(&self) -> StoreResult<Vec<Node>>;

    async fn find_available_nodes(&self, filter: &NodeFilter) -> StoreResult<Vec<Node>>;

    /// Uniformly random pick among [`NodeRegistry::find_available_nodes`].
    async fn get_random_available_node(&self, filter: &NodeFilter) -> Result<NodeId, PlacementError> {
        let nodes = self.find_available_nodes(filter).await?;
        pick_random(&nodes).ok_or(PlacementError::NoAvailableNodes)
    }

    /// Nodes with two or more images in BUILDING_IMAGE.
    async fn get_nodes_with_multiple_images_building(&self) -> StoreResult<Vec<NodeId>>;

    async fn get_image_node(&self, node: &NodeId, image_ref: &str) -> StoreResult<Option<ImageNode>>;

    async fn get_image_nodes(&self, image_ref: &str) -> StoreResult<Vec<ImageNode>>;

    /// Inserts or replaces the `(node, image_ref)` cache entry.
    async fn create_image_node(
        &self,
        node: &NodeId,
        image_ref: &str,
        state: ImageNodeState,
        error_reason: Option<String>,
    ) -> StoreResult<()>;

    /// Recounts the workspaces holding a slot on `node`.
    async fn recalculate_node_usage(&self, node: &NodeId) -> StoreResult<()>;
}

pub(crate) fn pick_random(nodes: &[Node]) -> Option<NodeId> {
    nodes.choose(&mut rand::rng()).map(|n| n.id)
}
