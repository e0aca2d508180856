use fleet_id::NodeId;
use serde::{Deserialize, Serialize};

use super::text_enum;

text_enum! {
    /// Lifecycle of an execution node as reported by fleet management.
    pub enum NodeState {
        Initializing => "initializing",
        Ready => "ready",
        Disabled => "disabled",
        Decommissioned => "decommissioned",
        Unresponsive => "unresponsive",
    }
}

text_enum! {
    /// Build/cache status of an image on a specific node.
    pub enum ImageNodeState {
        BuildingImage => "building_image",
        Ready => "ready",
        Error => "error",
    }
}

/// An execution host running the node agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    pub id: NodeId,
    /// Base URL of the node agent's control API.
    pub api_url: String,
    /// Bearer token presented to the node agent.
    pub api_key: String,
    pub state: NodeState,
    pub region: String,
    pub class: String,
    /// Number of workspaces the node is sized for.
    pub capacity: u32,
    /// Workspaces currently bound to the node in a non-terminal state.
    pub used: u32,
    /// Cordoned: existing workspaces may finish but should migrate away.
    pub unschedulable: bool,
}

impl Node {
    /// A fresh READY node with no workspaces bound.
    pub fn new(
        api_url: impl Into<String>,
        region: impl Into<String>,
        class: impl Into<String>,
        capacity: u32,
    ) -> Self {
        Self {
            id: NodeId::new(),
            api_url: api_url.into(),
            api_key: String::new(),
            state: NodeState::Ready,
            region: region.into(),
            class: class.into(),
            capacity,
            used: 0,
            unschedulable: false,
        }
    }

    pub fn is_ready(&self) -> bool {
        self.state == NodeState::Ready
    }

    pub fn has_room(&self) -> bool {
        self.used < self.capacity
    }

    /// Ready, schedulable and below capacity.
    pub fn is_available(&self) -> bool {
        self.is_ready() && !self.unschedulable && self.has_room()
    }
}

/// Join record `(node, image)` describing whether the image can be run there.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageNode {
    pub node_id: NodeId,
    pub image_ref: String,
    pub state: ImageNodeState,
    pub error_reason: Option<String>,
}
