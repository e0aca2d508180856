//! Relays rows of the `workspace_events` table onto the in-process
//! [`EventBus`].
//!
//! The API writes one row per lifecycle transition it requests. The feed
//! starts at the newest row present at startup: anything older is covered by
//! the periodic sweeps.
//!
//! Delivery is best effort. `event_id` comes from a sequence, so a row whose
//! transaction commits after a higher id has been read is skipped; the sweeps
//! pick such workspaces up on their next pass. [`super::CleanupWorker`]
//! deletes rows past their retention.

use std::time::Duration;

use sqlx::postgres::{PgPool, PgRow};
use sqlx::Row;
use tokio::sync::watch;
use tokio::time::sleep;
use tracing::{debug, info, instrument, warn};

use crate::engine::{EventBus, WorkspaceEvent};
use crate::store::StoreError;

#[derive(Debug, Clone)]
pub struct WorkspaceEventFeedConfig {
    /// Maximum rows fetched per poll.
    pub batch_size: i64,

    /// Sleep between polls that returned nothing.
    pub poll_interval: Duration,
}

impl Default for WorkspaceEventFeedConfig {
    fn default() -> Self {
        Self {
            batch_size: 100,
            poll_interval: Duration::from_millis(250),
        }
    }
}

struct EventRow {
    event_id: i64,
    event: Result<WorkspaceEvent, StoreError>,
}

impl<'r> sqlx::FromRow<'r, PgRow> for EventRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        let kind: String = row.try_get("kind")?;
        let workspace_id: String = row.try_get("workspace_id")?;
        let event = kind
            .parse()
            .map_err(StoreError::from)
            .and_then(|kind| {
                Ok(WorkspaceEvent {
                    kind,
                    workspace_id: workspace_id.parse()?,
                })
            });
        Ok(Self {
            event_id: row.try_get("event_id")?,
            event,
        })
    }
}

pub struct WorkspaceEventFeed {
    pool: PgPool,
    bus: EventBus,
    config: WorkspaceEventFeedConfig,
}

impl WorkspaceEventFeed {
    pub fn new(pool: PgPool, bus: EventBus, config: WorkspaceEventFeedConfig) -> Self {
        Self { pool, bus, config }
    }

    /// Appends an event row. Listeners see it on the next poll.
    pub async fn append(&self, event: WorkspaceEvent) -> Result<i64, sqlx::Error> {
        sqlx::query_scalar(
            "INSERT INTO workspace_events (workspace_id, kind) VALUES ($1, $2) RETURNING event_id",
        )
        .bind(event.workspace_id.to_string())
        .bind(event.kind.as_str())
        .fetch_one(&self.pool)
        .await
    }

    async fn head(&self) -> Result<i64, sqlx::Error> {
        sqlx::query_scalar("SELECT COALESCE(MAX(event_id), 0) FROM workspace_events")
            .fetch_one(&self.pool)
            .await
    }

    async fn after(&self, cursor: i64) -> Result<Vec<EventRow>, sqlx::Error> {
        sqlx::query_as::<_, EventRow>(
            "SELECT event_id, workspace_id, kind FROM workspace_events \
             WHERE event_id > $1 ORDER BY event_id LIMIT $2",
        )
        .bind(cursor)
        .bind(self.config.batch_size)
        .fetch_all(&self.pool)
        .await
    }

    #[instrument(skip(self, shutdown), name = "workspace_event_feed")]
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<(), sqlx::Error> {
        let mut cursor = self.head().await?;
        info!(cursor, "Starting workspace event feed");

        loop {
            if *shutdown.borrow() {
                break;
            }

            let rows = match self.after(cursor).await {
                Ok(rows) => rows,
                Err(e) => {
                    warn!(error = %e, cursor, "Failed to poll workspace events");
                    Vec::new()
                }
            };

            if rows.is_empty() {
                tokio::select! {
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            break;
                        }
                    }
                    _ = sleep(self.config.poll_interval) => {}
                }
                continue;
            }

            debug!(count = rows.len(), "Relaying workspace events");
            for row in rows {
                cursor = row.event_id;
                match row.event {
                    Ok(event) => {
                        self.bus.publish(event);
                    }
                    Err(e) => warn!(event_id = row.event_id, error = %e, "Skipping malformed workspace event"),
                }
            }
        }

        info!(cursor, "Workspace event feed stopped");
        Ok(())
    }
}
