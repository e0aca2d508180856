use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fleet_id::{NodeId, OrgId, WorkspaceId};
use sqlx::postgres::{PgPool, PgRow};
use sqlx::types::Json;
use sqlx::{Postgres, QueryBuilder, Row};

use crate::model::{BuildInfo, VolumeMount, Workspace, WorkspacePatch, WorkspaceState};
use crate::store::{StoreError, StoreResult, WorkspaceStore};

const COLUMNS: &str = "id, organization_id, state, desired_state, node_id, prev_node_id, \
    region, class, cpu, mem, disk, env, volumes, os_user, image, build_info, \
    snapshot_state, snapshot_image, snapshot_registry_id, existing_snapshot_images, \
    last_activity_at, last_snapshot_at, auto_stop_interval, error_reason";

struct WorkspaceRow {
    id: String,
    organization_id: String,
    state: String,
    desired_state: String,
    node_id: Option<String>,
    prev_node_id: Option<String>,
    region: String,
    class: String,
    cpu: i32,
    mem: i32,
    disk: i32,
    env: Json<BTreeMap<String, String>>,
    volumes: Json<Vec<VolumeMount>>,
    os_user: String,
    image: String,
    build_info: Option<Json<BuildInfo>>,
    snapshot_state: String,
    snapshot_image: Option<String>,
    snapshot_registry_id: Option<String>,
    existing_snapshot_images: Json<Vec<String>>,
    last_activity_at: DateTime<Utc>,
    last_snapshot_at: Option<DateTime<Utc>>,
    auto_stop_interval: i32,
    error_reason: Option<String>,
}

impl<'r> sqlx::FromRow<'r, PgRow> for WorkspaceRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            organization_id: row.try_get("organization_id")?,
            state: row.try_get("state")?,
            desired_state: row.try_get("desired_state")?,
            node_id: row.try_get("node_id")?,
            prev_node_id: row.try_get("prev_node_id")?,
            region: row.try_get("region")?,
            class: row.try_get("class")?,
            cpu: row.try_get("cpu")?,
            mem: row.try_get("mem")?,
            disk: row.try_get("disk")?,
            env: row.try_get("env")?,
            volumes: row.try_get("volumes")?,
            os_user: row.try_get("os_user")?,
            image: row.try_get("image")?,
            build_info: row.try_get("build_info")?,
            snapshot_state: row.try_get("snapshot_state")?,
            snapshot_image: row.try_get("snapshot_image")?,
            snapshot_registry_id: row.try_get("snapshot_registry_id")?,
            existing_snapshot_images: row.try_get("existing_snapshot_images")?,
            last_activity_at: row.try_get("last_activity_at")?,
            last_snapshot_at: row.try_get("last_snapshot_at")?,
            auto_stop_interval: row.try_get("auto_stop_interval")?,
            error_reason: row.try_get("error_reason")?,
        })
    }
}

fn unsigned(column: &str, value: i32) -> StoreResult<u32> {
    u32::try_from(value).map_err(|_| StoreError::Corrupt(format!("negative {column}: {value}")))
}

impl TryFrom<WorkspaceRow> for Workspace {
    type Error = StoreError;

    fn try_from(row: WorkspaceRow) -> StoreResult<Self> {
        Ok(Self {
            id: row.id.parse()?,
            organization_id: row.organization_id.parse()?,
            state: row.state.parse()?,
            desired_state: row.desired_state.parse()?,
            node_id: row.node_id.as_deref().map(str::parse).transpose()?,
            prev_node_id: row.prev_node_id.as_deref().map(str::parse).transpose()?,
            region: row.region,
            class: row.class,
            cpu: unsigned("cpu", row.cpu)?,
            mem: unsigned("mem", row.mem)?,
            disk: unsigned("disk", row.disk)?,
            env: row.env.0,
            volumes: row.volumes.0,
            os_user: row.os_user,
            image: row.image,
            build_info: row.build_info.map(|b| b.0),
            snapshot_state: row.snapshot_state.parse()?,
            snapshot_image: row.snapshot_image,
            snapshot_registry_id: row.snapshot_registry_id.as_deref().map(str::parse).transpose()?,
            existing_snapshot_images: row.existing_snapshot_images.0,
            last_activity_at: row.last_activity_at,
            last_snapshot_at: row.last_snapshot_at,
            auto_stop_interval: unsigned("auto_stop_interval", row.auto_stop_interval)?,
            error_reason: row.error_reason,
        })
    }
}

fn limit(n: usize) -> i64 {
    i64::try_from(n).unwrap_or(i64::MAX)
}

fn to_i32(value: u32) -> i32 {
    i32::try_from(value).unwrap_or(i32::MAX)
}

/// The `workspaces` table.
#[derive(Clone)]
pub struct PgWorkspaceStore {
    pool: PgPool,
}

impl PgWorkspaceStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn fetch(&self, mut query: QueryBuilder<'_, Postgres>) -> StoreResult<Vec<Workspace>> {
        let rows = query
            .build_query_as::<WorkspaceRow>()
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(Workspace::try_from).collect()
    }
}

fn select() -> QueryBuilder<'static, Postgres> {
    QueryBuilder::new(format!("SELECT {COLUMNS} FROM workspaces WHERE "))
}

#[async_trait]
impl WorkspaceStore for PgWorkspaceStore {
    async fn insert(&self, w: &Workspace) -> StoreResult<()> {
        sqlx::query(&format!(
            "INSERT INTO workspaces ({COLUMNS}) VALUES \
             ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, \
              $17, $18, $19, $20, $21, $22, $23, $24)"
        ))
        .bind(w.id.to_string())
        .bind(w.organization_id.to_string())
        .bind(w.state.as_str())
        .bind(w.desired_state.as_str())
        .bind(w.node_id.map(|n| n.to_string()))
        .bind(w.prev_node_id.map(|n| n.to_string()))
        .bind(&w.region)
        .bind(&w.class)
        .bind(to_i32(w.cpu))
        .bind(to_i32(w.mem))
        .bind(to_i32(w.disk))
        .bind(Json(&w.env))
        .bind(Json(&w.volumes))
        .bind(&w.os_user)
        .bind(&w.image)
        .bind(w.build_info.as_ref().map(Json))
        .bind(w.snapshot_state.as_str())
        .bind(&w.snapshot_image)
        .bind(w.snapshot_registry_id.map(|r| r.to_string()))
        .bind(Json(&w.existing_snapshot_images))
        .bind(w.last_activity_at)
        .bind(w.last_snapshot_at)
        .bind(to_i32(w.auto_stop_interval))
        .bind(&w.error_reason)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn find(&self, id: &WorkspaceId) -> StoreResult<Option<Workspace>> {
        let row = sqlx::query_as::<_, WorkspaceRow>(&format!(
            "SELECT {COLUMNS} FROM workspaces WHERE id = $1"
        ))
        .bind(id.to_string())
        .fetch_optional(&self.pool)
        .await?;
        row.map(Workspace::try_from).transpose()
    }

    async fn update(&self, id: &WorkspaceId, patch: &WorkspacePatch) -> StoreResult<()> {
        if patch.is_empty() {
            return Ok(());
        }

        let mut query = QueryBuilder::<Postgres>::new("UPDATE workspaces SET updated_at = now()");
        if let Some(state) = patch.state {
            query.push(", state = ").push_bind(state.as_str());
        }
        if let Some(desired) = patch.desired_state {
            query.push(", desired_state = ").push_bind(desired.as_str());
        }
        if let Some(node_id) = patch.node_id {
            query.push(", node_id = ").push_bind(node_id.map(|n| n.to_string()));
        }
        if let Some(prev) = patch.prev_node_id {
            query.push(", prev_node_id = ").push_bind(prev.map(|n| n.to_string()));
        }
        if let Some(snapshot_state) = patch.snapshot_state {
            query.push(", snapshot_state = ").push_bind(snapshot_state.as_str());
        }
        if let Some(reason) = &patch.error_reason {
            query.push(", error_reason = ").push_bind(reason.clone());
        }
        if let Some(at) = patch.last_activity_at {
            query.push(", last_activity_at = ").push_bind(at);
        }
        query.push(" WHERE id = ").push_bind(id.to_string());

        let result = query.build().execute(&self.pool).await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(*id));
        }
        Ok(())
    }

    async fn find_needing_sync(&self, n: usize) -> StoreResult<Vec<Workspace>> {
        let mut query = select();
        query
            .push("state NOT IN ('destroyed', 'error') AND desired_state <> 'archived' ")
            .push("AND desired_state <> state ORDER BY last_activity_at DESC LIMIT ")
            .push_bind(limit(n));
        self.fetch(query).await
    }

    async fn find_archive_candidates(
        &self,
        n: usize,
        max_archiving_per_node: usize,
    ) -> StoreResult<Vec<Workspace>> {
        let mut query = select();
        query
            .push("desired_state = 'archived' AND (state = 'archiving' OR (")
            .push("state NOT IN ('archived', 'destroyed', 'error') AND (node_id IS NULL OR node_id NOT IN (")
            .push("SELECT node_id FROM workspaces WHERE state = 'archiving' AND node_id IS NOT NULL ")
            .push("GROUP BY node_id HAVING COUNT(*) >= ")
            .push_bind(limit(max_archiving_per_node))
            .push(")))) ORDER BY last_activity_at DESC LIMIT ")
            .push_bind(limit(n));
        self.fetch(query).await
    }

    async fn find_auto_stop_candidates(
        &self,
        node: &NodeId,
        excluded_org: &OrgId,
        n: usize,
        now: DateTime<Utc>,
    ) -> StoreResult<Vec<Workspace>> {
        let mut query = select();
        query
            .push("node_id = ")
            .push_bind(node.to_string())
            .push(" AND organization_id <> ")
            .push_bind(excluded_org.to_string())
            .push(" AND state = 'started' AND auto_stop_interval <> 0 AND last_activity_at < ")
            .push_bind(now)
            .push(" - make_interval(mins => auto_stop_interval)")
            .push(" ORDER BY last_snapshot_at ASC NULLS LAST LIMIT ")
            .push_bind(limit(n));
        self.fetch(query).await
    }

    async fn count_on_node(&self, node: &NodeId, state: WorkspaceState) -> StoreResult<usize> {
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM workspaces WHERE node_id = $1 AND state = $2")
                .bind(node.to_string())
                .bind(state.as_str())
                .fetch_one(&self.pool)
                .await?;
        Ok(usize::try_from(count).unwrap_or(0))
    }

    async fn find_on_node_in_state(
        &self,
        node: &NodeId,
        state: WorkspaceState,
        n: usize,
    ) -> StoreResult<Vec<Workspace>> {
        let mut query = select();
        query
            .push("node_id = ")
            .push_bind(node.to_string())
            .push(" AND state = ")
            .push_bind(state.as_str())
            .push(" ORDER BY last_activity_at DESC LIMIT ")
            .push_bind(limit(n));
        self.fetch(query).await
    }
}
