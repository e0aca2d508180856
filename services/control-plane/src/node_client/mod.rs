//! Client side of the node agent's control API.
//!
//! One [`NodeApi`] handle per node endpoint, handed out by a
//! [`NodeClientFactory`]. "Gone" responses ([`NodeApiError::is_gone`]) are
//! success signals on destroy and cleanup paths only; callers decide.

mod http;
mod mock;

pub use http::{HttpNodeClient, HttpNodeFactory};
pub use mock::{MockNodeFactory, NodeCall, NodeOp};

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use fleet_id::WorkspaceId;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::model::{Node, VolumeMount, Workspace};
use crate::registry::DockerRegistry;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NodeApiError {
    #[error("connection reset by node")]
    ConnectionReset,

    #[error("workspace not found on node")]
    NotFound,

    #[error("workspace already destroyed")]
    AlreadyDestroyed,

    #[error("node returned {status}: {message}")]
    Status { status: u16, message: String },

    #[error("node request failed: {0}")]
    Transport(String),

    #[error("invalid node response: {0}")]
    Decode(String),
}

impl NodeApiError {
    /// Worth retrying as-is on the next pass.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::ConnectionReset)
    }

    /// The workspace no longer exists on the node.
    pub fn is_gone(&self) -> bool {
        matches!(self, Self::NotFound | Self::AlreadyDestroyed)
    }
}

pub type NodeApiResult<T> = Result<T, NodeApiError>;

/// Workspace state as the node agent reports it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeWorkspaceState {
    Creating,
    Restoring,
    PullingImage,
    Starting,
    Started,
    Stopping,
    Stopped,
    Destroying,
    Destroyed,
    Error,
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeWorkspaceInfo {
    pub state: NodeWorkspaceState,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryCredentials {
    pub url: String,
    pub username: String,
    pub password: String,
}

impl From<&DockerRegistry> for RegistryCredentials {
    fn from(registry: &DockerRegistry) -> Self {
        Self {
            url: registry.url.clone(),
            username: registry.username.clone(),
            password: registry.password.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateWorkspaceRequest {
    pub id: WorkspaceId,
    pub image: String,
    pub os_user: String,
    /// Owning organization.
    pub user_id: String,
    /// GiB.
    pub storage_quota: u32,
    /// GiB.
    pub memory_quota: u32,
    pub cpu_quota: u32,
    pub env: BTreeMap<String, String>,
    pub volumes: Vec<VolumeMount>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entrypoint: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub registry: Option<RegistryCredentials>,
}

impl CreateWorkspaceRequest {
    /// Request for `workspace` with `image`; entrypoint and registry unset.
    pub fn for_workspace(workspace: &Workspace, image: impl Into<String>) -> Self {
        Self {
            id: workspace.id,
            image: image.into(),
            os_user: workspace.os_user.clone(),
            user_id: workspace.organization_id.to_string(),
            storage_quota: workspace.disk,
            memory_quota: workspace.mem,
            cpu_quota: workspace.cpu,
            env: workspace.env.clone(),
            volumes: workspace.volumes.clone(),
            entrypoint: None,
            registry: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BuildImageRequest {
    pub image: String,
    pub organization_id: String,
    pub dockerfile: String,
    /// Content hashes of the build context.
    pub context: Vec<String>,
}

#[async_trait]
pub trait NodeApi: Send + Sync {
    async fn create(&self, request: &CreateWorkspaceRequest) -> NodeApiResult<()>;

    async fn start(&self, id: &WorkspaceId) -> NodeApiResult<()>;

    async fn stop(&self, id: &WorkspaceId) -> NodeApiResult<()>;

    async fn destroy(&self, id: &WorkspaceId) -> NodeApiResult<()>;

    /// Drops the node's record of a destroyed workspace.
    async fn remove_destroyed(&self, id: &WorkspaceId) -> NodeApiResult<()>;

    async fn info(&self, id: &WorkspaceId) -> NodeApiResult<NodeWorkspaceInfo>;

    async fn build_image(&self, request: &BuildImageRequest) -> NodeApiResult<()>;

    async fn image_exists(&self, image: &str) -> NodeApiResult<bool>;
}

pub trait NodeClientFactory: Send + Sync {
    fn client(&self, node: &Node) -> Arc<dyn NodeApi>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleet_id::OrgId;

    #[test]
    fn test_unknown_node_state_decodes() {
        let info: NodeWorkspaceInfo = serde_json::from_str(r#"{"state":"resizing"}"#).unwrap();
        assert_eq!(info.state, NodeWorkspaceState::Unknown);

        let info: NodeWorkspaceInfo = serde_json::from_str(r#"{"state":"pulling_image"}"#).unwrap();
        assert_eq!(info.state, NodeWorkspaceState::PullingImage);
    }

    #[test]
    fn test_create_request_wire_shape() {
        let ws = Workspace::new(OrgId::new(), "python:3.12");
        let request = CreateWorkspaceRequest::for_workspace(&ws, "registry.local/python:3.12");
        let json = serde_json::to_value(&request).unwrap();

        assert_eq!(json["osUser"], "workspace");
        assert_eq!(json["storageQuota"], 3);
        assert_eq!(json["userId"], ws.organization_id.to_string());
        assert!(json.get("entrypoint").is_none());
        assert!(json.get("registry").is_none());
    }

    #[test]
    fn test_gone_is_not_transient() {
        assert!(NodeApiError::NotFound.is_gone());
        assert!(NodeApiError::AlreadyDestroyed.is_gone());
        assert!(!NodeApiError::ConnectionReset.is_gone());
        assert!(NodeApiError::ConnectionReset.is_transient());
        assert!(!NodeApiError::Transport("dns".into()).is_transient());
    }
}
