//! Scripted in-process node agent for tests and local development.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use fleet_id::{NodeId, WorkspaceId};

use super::{
    BuildImageRequest, CreateWorkspaceRequest, NodeApi, NodeApiError, NodeApiResult,
    NodeClientFactory, NodeWorkspaceInfo, NodeWorkspaceState,
};
use crate::model::Node;

/// Operation kinds, used to script failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NodeOp {
    Create,
    Start,
    Stop,
    Destroy,
    RemoveDestroyed,
    Info,
    BuildImage,
    ImageExists,
}

/// One recorded call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeCall {
    pub node_id: NodeId,
    pub op: NodeOp,
    pub workspace_id: Option<WorkspaceId>,
    /// Image for create, build and exists calls.
    pub image: Option<String>,
}

#[derive(Default)]
struct MockState {
    workspaces: HashMap<(NodeId, WorkspaceId), NodeWorkspaceState>,
    images: HashSet<(NodeId, String)>,
    calls: Vec<NodeCall>,
    failures: HashMap<NodeOp, VecDeque<NodeApiError>>,
}

/// Node agents that answer from a shared table.
///
/// With auto-transition on (the default) each mutating call lands in its end
/// state immediately: create/start → started, stop → stopped, destroy →
/// destroyed, build → image present. Turn it off to drive states by hand.
#[derive(Clone, Default)]
pub struct MockNodeFactory {
    state: Arc<Mutex<MockState>>,
    manual: Arc<AtomicBool>,
}

impl MockNodeFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stops calls from changing reported states.
    pub fn manual(self) -> Self {
        self.manual.store(true, Ordering::SeqCst);
        self
    }

    fn lock(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn set_state(&self, node: NodeId, workspace: WorkspaceId, state: NodeWorkspaceState) {
        self.lock().workspaces.insert((node, workspace), state);
    }

    pub fn state_of(&self, node: NodeId, workspace: WorkspaceId) -> Option<NodeWorkspaceState> {
        self.lock().workspaces.get(&(node, workspace)).copied()
    }

    pub fn add_image(&self, node: NodeId, image: impl Into<String>) {
        self.lock().images.insert((node, image.into()));
    }

    /// The next `op` call fails with `err`. Queued failures fire in order.
    pub fn fail_next(&self, op: NodeOp, err: NodeApiError) {
        self.lock().failures.entry(op).or_default().push_back(err);
    }

    pub fn calls(&self) -> Vec<NodeCall> {
        self.lock().calls.clone()
    }

    pub fn calls_of(&self, op: NodeOp) -> Vec<NodeCall> {
        self.lock()
            .calls
            .iter()
            .filter(|c| c.op == op)
            .cloned()
            .collect()
    }

    pub fn clear_calls(&self) {
        self.lock().calls.clear();
    }
}

impl NodeClientFactory for MockNodeFactory {
    fn client(&self, node: &Node) -> Arc<dyn NodeApi> {
        Arc::new(MockNodeClient {
            node_id: node.id,
            factory: self.clone(),
        })
    }
}

struct MockNodeClient {
    node_id: NodeId,
    factory: MockNodeFactory,
}

impl MockNodeClient {
    /// Records the call, then applies a scripted failure or `effect`.
    fn call<T>(
        &self,
        op: NodeOp,
        workspace_id: Option<WorkspaceId>,
        image: Option<&str>,
        effect: impl FnOnce(&mut MockState, bool) -> NodeApiResult<T>,
    ) -> NodeApiResult<T> {
        let manual = self.factory.manual.load(Ordering::SeqCst);
        let mut state = self.factory.lock();
        state.calls.push(NodeCall {
            node_id: self.node_id,
            op,
            workspace_id,
            image: image.map(str::to_string),
        });
        if let Some(err) = state.failures.get_mut(&op).and_then(VecDeque::pop_front) {
            return Err(err);
        }
        effect(&mut state, !manual)
    }

    fn transition(
        &self,
        op: NodeOp,
        id: &WorkspaceId,
        to: NodeWorkspaceState,
    ) -> NodeApiResult<()> {
        let key = (self.node_id, *id);
        self.call(op, Some(*id), None, |state, auto| {
            if !state.workspaces.contains_key(&key) {
                return Err(NodeApiError::NotFound);
            }
            if auto {
                state.workspaces.insert(key, to);
            }
            Ok(())
        })
    }
}

#[async_trait]
impl NodeApi for MockNodeClient {
    async fn create(&self, request: &CreateWorkspaceRequest) -> NodeApiResult<()> {
        let key = (self.node_id, request.id);
        self.call(NodeOp::Create, Some(request.id), Some(&request.image), |state, auto| {
            let to = if auto {
                NodeWorkspaceState::Started
            } else {
                NodeWorkspaceState::Creating
            };
            state.workspaces.insert(key, to);
            Ok(())
        })
    }

    async fn start(&self, id: &WorkspaceId) -> NodeApiResult<()> {
        self.transition(NodeOp::Start, id, NodeWorkspaceState::Started)
    }

    async fn stop(&self, id: &WorkspaceId) -> NodeApiResult<()> {
        self.transition(NodeOp::Stop, id, NodeWorkspaceState::Stopped)
    }

    async fn destroy(&self, id: &WorkspaceId) -> NodeApiResult<()> {
        let key = (self.node_id, *id);
        self.call(NodeOp::Destroy, Some(*id), None, |state, auto| {
            match state.workspaces.get(&key) {
                None => Err(NodeApiError::NotFound),
                Some(NodeWorkspaceState::Destroyed) => Err(NodeApiError::AlreadyDestroyed),
                Some(_) => {
                    if auto {
                        state.workspaces.insert(key, NodeWorkspaceState::Destroyed);
                    }
                    Ok(())
                }
            }
        })
    }

    async fn remove_destroyed(&self, id: &WorkspaceId) -> NodeApiResult<()> {
        let key = (self.node_id, *id);
        self.call(NodeOp::RemoveDestroyed, Some(*id), None, |state, _| {
            state
                .workspaces
                .remove(&key)
                .map(|_| ())
                .ok_or(NodeApiError::NotFound)
        })
    }

    async fn info(&self, id: &WorkspaceId) -> NodeApiResult<NodeWorkspaceInfo> {
        let key = (self.node_id, *id);
        self.call(NodeOp::Info, Some(*id), None, |state, _| {
            state
                .workspaces
                .get(&key)
                .map(|s| NodeWorkspaceInfo { state: *s })
                .ok_or(NodeApiError::NotFound)
        })
    }

    async fn build_image(&self, request: &BuildImageRequest) -> NodeApiResult<()> {
        let key = (self.node_id, request.image.clone());
        self.call(NodeOp::BuildImage, None, Some(&request.image), |state, auto| {
            if auto {
                state.images.insert(key);
            }
            Ok(())
        })
    }

    async fn image_exists(&self, image: &str) -> NodeApiResult<bool> {
        let key = (self.node_id, image.to_string());
        self.call(NodeOp::ImageExists, None, Some(image), |state, _| {
            Ok(state.images.contains(&key))
        })
    }
}
