//! Application state shared across request handlers.

use std::sync::Arc;

use crate::db::Database;
use crate::engine::WorkspaceManager;

/// Passed to every handler through axum's state extractor.
#[derive(Clone)]
pub struct AppState {
    inner: Arc<AppStateInner>,
}

struct AppStateInner {
    db: Option<Database>,
    manager: WorkspaceManager,
}

impl AppState {
    pub fn new(db: Database, manager: WorkspaceManager) -> Self {
        Self::build(Some(db), manager)
    }

    /// State without a database, for in-memory setups. Readiness then only
    /// reflects the process itself.
    pub fn detached(manager: WorkspaceManager) -> Self {
        Self::build(None, manager)
    }

    fn build(db: Option<Database>, manager: WorkspaceManager) -> Self {
        Self {
            inner: Arc::new(AppStateInner { db, manager }),
        }
    }

    pub fn db(&self) -> Option<&Database> {
        self.inner.db.as_ref()
    }

    pub fn manager(&self) -> &WorkspaceManager {
        &self.inner.manager
    }
}
