//! Image builds on a chosen node.
//!
//! A build's outcome lands in the node's image cache (`ImageNode`); the
//! workspace waiting on it polls that entry and never sees build errors
//! directly.

use std::sync::Arc;
use std::time::Duration;

use fleet_id::{NodeId, OrgId};
use fleet_reconcile::linear_backoff;
use tokio::task::JoinHandle;
use tracing::{error, info, instrument, warn};

use crate::model::{BuildInfo, ImageNodeState};
use crate::node_client::{BuildImageRequest, NodeClientFactory};
use crate::nodes::NodeRegistry;
use crate::store::StoreError;

pub const BUILD_TIMEOUT_REASON: &str = "Timeout while building";

#[derive(Clone)]
pub struct ImageBuilder {
    nodes: Arc<dyn NodeRegistry>,
    clients: Arc<dyn NodeClientFactory>,
    attempts: u32,
    backoff: Duration,
}

impl ImageBuilder {
    pub fn new(
        nodes: Arc<dyn NodeRegistry>,
        clients: Arc<dyn NodeClientFactory>,
        attempts: u32,
        backoff: Duration,
    ) -> Self {
        Self {
            nodes,
            clients,
            attempts: attempts.max(1),
            backoff,
        }
    }

    /// Runs [`ImageBuilder::build_on_node`] in the background.
    pub fn spawn(&self, build: BuildInfo, node_id: NodeId, org: OrgId) -> JoinHandle<()> {
        let builder = self.clone();
        tokio::spawn(async move {
            if let Err(e) = builder.build_on_node(&build, &node_id, &org).await {
                error!(
                    error = %e,
                    node_id = %node_id,
                    image_ref = %build.image_ref,
                    "Failed to record image build outcome"
                );
            }
        })
    }

    /// Starts the build and records the resulting cache entry.
    ///
    /// Connection resets are retried with linear backoff; any other failure
    /// is final. Returns the state that was recorded.
    #[instrument(skip(self, build), fields(image_ref = %build.image_ref))]
    pub async fn build_on_node(
        &self,
        build: &BuildInfo,
        node_id: &NodeId,
        org: &OrgId,
    ) -> Result<ImageNodeState, StoreError> {
        let image_ref = build.image_ref.as_str();
        let Some(node) = self.nodes.find_one(node_id).await? else {
            return self
                .record(node_id, image_ref, ImageNodeState::Error, Some(format!("Node {node_id} not found")))
                .await;
        };
        let client = self.clients.client(&node);
        let request = BuildImageRequest {
            image: build.image_ref.clone(),
            organization_id: org.to_string(),
            dockerfile: build.dockerfile_content.clone(),
            context: build.context_hashes.clone(),
        };

        let mut attempt = 0;
        loop {
            match client.build_image(&request).await {
                Ok(()) => break,
                Err(e) if e.is_transient() => {
                    attempt += 1;
                    if attempt >= self.attempts {
                        warn!(attempts = attempt, "Image build kept resetting; giving up");
                        return self
                            .record(node_id, image_ref, ImageNodeState::Error, Some(BUILD_TIMEOUT_REASON.into()))
                            .await;
                    }
                    tokio::time::sleep(linear_backoff(attempt, self.backoff)).await;
                }
                Err(e) => {
                    warn!(error = %e, "Image build rejected by node");
                    return self
                        .record(node_id, image_ref, ImageNodeState::Error, Some(e.to_string()))
                        .await;
                }
            }
        }

        // The node may accept the build before the image materializes.
        let state = match client.image_exists(image_ref).await {
            Ok(true) => ImageNodeState::Ready,
            Ok(false) => ImageNodeState::BuildingImage,
            Err(e) => {
                warn!(error = %e, "Image existence check failed after build");
                return self
                    .record(node_id, image_ref, ImageNodeState::Error, Some(e.to_string()))
                    .await;
            }
        };
        info!(state = %state, "Image build accepted");
        self.record(node_id, image_ref, state, None).await
    }

    async fn record(
        &self,
        node_id: &NodeId,
        image_ref: &str,
        state: ImageNodeState,
        reason: Option<String>,
    ) -> Result<ImageNodeState, StoreError> {
        self.nodes
            .create_image_node(node_id, image_ref, state, reason)
            .await?;
        Ok(state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Node;
    use crate::node_client::{MockNodeFactory, NodeApiError, NodeOp};
    use crate::nodes::MemoryNodeRegistry;
    use crate::store::MemoryWorkspaceStore;

    struct Fixture {
        nodes: Arc<MemoryNodeRegistry>,
        mock: MockNodeFactory,
        builder: ImageBuilder,
        node: Node,
        build: BuildInfo,
    }

    async fn fixture(mock: MockNodeFactory) -> Fixture {
        let nodes = Arc::new(MemoryNodeRegistry::new(Arc::new(MemoryWorkspaceStore::new())));
        let node = Node::new("mock://", "us", "small", 10);
        nodes.insert(node.clone()).await;
        let builder = ImageBuilder::new(nodes.clone(), Arc::new(mock.clone()), 10, Duration::ZERO);
        Fixture {
            nodes,
            mock,
            builder,
            node,
            build: BuildInfo {
                image_ref: "registry.local/builds/app:abc".into(),
                dockerfile_content: "FROM alpine".into(),
                context_hashes: vec!["h1".into()],
            },
        }
    }

    async fn entry(f: &Fixture) -> crate::model::ImageNode {
        f.nodes
            .get_image_node(&f.node.id, &f.build.image_ref)
            .await
            .unwrap()
            .unwrap()
    }

    #[tokio::test]
    async fn test_successful_build_records_ready() {
        let f = fixture(MockNodeFactory::new()).await;
        let state = f.builder.build_on_node(&f.build, &f.node.id, &OrgId::new()).await.unwrap();
        assert_eq!(state, ImageNodeState::Ready);
        assert_eq!(entry(&f).await.state, ImageNodeState::Ready);
    }

    #[tokio::test]
    async fn test_accepted_but_missing_records_building() {
        let f = fixture(MockNodeFactory::new().manual()).await;
        let state = f.builder.build_on_node(&f.build, &f.node.id, &OrgId::new()).await.unwrap();
        assert_eq!(state, ImageNodeState::BuildingImage);
    }

    #[tokio::test]
    async fn test_connection_resets_are_retried() {
        let f = fixture(MockNodeFactory::new()).await;
        for _ in 0..3 {
            f.mock.fail_next(NodeOp::BuildImage, NodeApiError::ConnectionReset);
        }
        let state = f.builder.build_on_node(&f.build, &f.node.id, &OrgId::new()).await.unwrap();
        assert_eq!(state, ImageNodeState::Ready);
        assert_eq!(f.mock.calls_of(NodeOp::BuildImage).len(), 4);
    }

    #[tokio::test]
    async fn test_exhausted_retries_record_timeout() {
        let f = fixture(MockNodeFactory::new()).await;
        for _ in 0..10 {
            f.mock.fail_next(NodeOp::BuildImage, NodeApiError::ConnectionReset);
        }
        let state = f.builder.build_on_node(&f.build, &f.node.id, &OrgId::new()).await.unwrap();
        assert_eq!(state, ImageNodeState::Error);
        assert_eq!(f.mock.calls_of(NodeOp::BuildImage).len(), 10);
        assert_eq!(entry(&f).await.error_reason.as_deref(), Some(BUILD_TIMEOUT_REASON));
    }

    #[tokio::test]
    async fn test_other_errors_are_final() {
        let f = fixture(MockNodeFactory::new()).await;
        f.mock.fail_next(
            NodeOp::BuildImage,
            NodeApiError::Status { status: 422, message: "bad dockerfile".into() },
        );
        let state = f.builder.build_on_node(&f.build, &f.node.id, &OrgId::new()).await.unwrap();
        assert_eq!(state, ImageNodeState::Error);
        assert_eq!(f.mock.calls_of(NodeOp::BuildImage).len(), 1);
        assert!(entry(&f).await.error_reason.unwrap().contains("bad dockerfile"));
    }
}
