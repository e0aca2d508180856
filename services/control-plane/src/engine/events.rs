//! Workspace lifecycle events. Each one triggers a sync of its workspace.

use fleet_id::WorkspaceId;
use tokio::sync::{broadcast, watch};
use tracing::{debug, info, instrument, warn};

use super::WorkspaceManager;
use crate::model::text_enum;

text_enum! {
    pub enum WorkspaceEventKind {
        Created => "created",
        Started => "started",
        Stopped => "stopped",
        Archived => "archived",
        Destroyed => "destroyed",
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkspaceEvent {
    pub kind: WorkspaceEventKind,
    pub workspace_id: WorkspaceId,
}

/// In-process fan-out of lifecycle events.
#[derive(Clone, Debug)]
pub struct EventBus {
    tx: broadcast::Sender<WorkspaceEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Returns the number of listeners reached.
    pub fn publish(&self, event: WorkspaceEvent) -> usize {
        self.tx.send(event).unwrap_or(0)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<WorkspaceEvent> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}

/// Turns lifecycle events into sync requests.
pub struct EventListener {
    manager: WorkspaceManager,
    events: broadcast::Receiver<WorkspaceEvent>,
}

impl EventListener {
    pub fn new(manager: WorkspaceManager, bus: &EventBus) -> Self {
        Self {
            manager,
            events: bus.subscribe(),
        }
    }

    #[instrument(skip(self, shutdown), name = "event_listener")]
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!("Starting workspace event listener");

        loop {
            tokio::select! {
                event = self.events.recv() => match event {
                    Ok(event) => {
                        debug!(workspace_id = %event.workspace_id, kind = %event.kind, "Workspace event");
                        self.manager.request_sync(event.workspace_id);
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        // The sweeps pick the missed workspaces up.
                        warn!(skipped, "Event listener lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("Event listener shutting down");
                        break;
                    }
                }
            }
        }
    }
}
