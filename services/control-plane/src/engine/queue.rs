//! Resync queue: where "run again" and every other sync request lands.

use std::sync::Arc;

use fleet_id::WorkspaceId;
use tokio::sync::{mpsc, watch, Semaphore};
use tracing::{debug, info, instrument, warn};

use super::WorkspaceManager;

/// Sending half. Cheap to clone.
#[derive(Clone, Debug)]
pub struct ResyncQueue {
    tx: mpsc::UnboundedSender<WorkspaceId>,
}

impl ResyncQueue {
    pub fn push(&self, id: WorkspaceId) {
        if self.tx.send(id).is_err() {
            debug!(workspace_id = %id, "Resync queue closed; dropping request");
        }
    }
}

#[derive(Debug)]
pub struct ResyncReceiver {
    rx: mpsc::UnboundedReceiver<WorkspaceId>,
}

impl ResyncReceiver {
    /// Next queued id without waiting.
    pub fn try_next(&mut self) -> Option<WorkspaceId> {
        self.rx.try_recv().ok()
    }
}

pub fn resync_queue() -> (ResyncQueue, ResyncReceiver) {
    let (tx, rx) = mpsc::unbounded_channel();
    (ResyncQueue { tx }, ResyncReceiver { rx })
}

/// Drains the resync queue, running sync attempts with bounded concurrency.
pub struct SyncWorker {
    manager: WorkspaceManager,
    receiver: ResyncReceiver,
    permits: Arc<Semaphore>,
}

impl SyncWorker {
    pub fn new(manager: WorkspaceManager, receiver: ResyncReceiver, concurrency: usize) -> Self {
        Self {
            manager,
            receiver,
            permits: Arc::new(Semaphore::new(concurrency.max(1))),
        }
    }

    /// Run until shutdown is signaled or every queue sender is gone.
    #[instrument(skip(self, shutdown), name = "sync_worker")]
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!("Starting sync worker");

        loop {
            let id = tokio::select! {
                id = self.receiver.rx.recv() => match id {
                    Some(id) => id,
                    None => break,
                },
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("Sync worker shutting down");
                        break;
                    }
                    continue;
                }
            };

            let permit = match self.permits.clone().acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => {
                    warn!("Sync worker semaphore closed");
                    break;
                }
            };
            let manager = self.manager.clone();
            tokio::spawn(async move {
                let outcome = manager.sync_workspace(id).await;
                drop(permit);
                if outcome.should_run_again() {
                    manager.request_sync(id);
                }
            });
        }
    }
}
