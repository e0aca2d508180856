use async_trait::async_trait;
use fleet_id::NodeId;
use sqlx::postgres::{PgPool, PgRow};
use sqlx::{Postgres, QueryBuilder, Row};

use crate::model::{ImageNode, ImageNodeState, Node};
use crate::nodes::{NodeFilter, NodeRegistry};
use crate::store::{StoreError, StoreResult};

const NODE_COLUMNS: &str =
    "id, api_url, api_key, state, region, class, capacity, used, unschedulable";

struct NodeRow {
    id: String,
    api_url: String,
    api_key: String,
    state: String,
    region: String,
    class: String,
    capacity: i32,
    used: i32,
    unschedulable: bool,
}

impl<'r> sqlx::FromRow<'r, PgRow> for NodeRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            api_url: row.try_get("api_url")?,
            api_key: row.try_get("api_key")?,
            state: row.try_get("state")?,
            region: row.try_get("region")?,
            class: row.try_get("class")?,
            capacity: row.try_get("capacity")?,
            used: row.try_get("used")?,
            unschedulable: row.try_get("unschedulable")?,
        })
    }
}

impl TryFrom<NodeRow> for Node {
    type Error = StoreError;

    fn try_from(row: NodeRow) -> StoreResult<Self> {
        Ok(Self {
            id: row.id.parse()?,
            api_url: row.api_url,
            api_key: row.api_key,
            state: row.state.parse()?,
            region: row.region,
            class: row.class,
            capacity: u32::try_from(row.capacity)
                .map_err(|_| StoreError::Corrupt(format!("negative capacity: {}", row.capacity)))?,
            used: u32::try_from(row.used).unwrap_or(0),
            unschedulable: row.unschedulable,
        })
    }
}

struct ImageNodeRow {
    node_id: String,
    image_ref: String,
    state: String,
    error_reason: Option<String>,
}

impl<'r> sqlx::FromRow<'r, PgRow> for ImageNodeRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            node_id: row.try_get("node_id")?,
            image_ref: row.try_get("image_ref")?,
            state: row.try_get("state")?,
            error_reason: row.try_get("error_reason")?,
        })
    }
}

impl TryFrom<ImageNodeRow> for ImageNode {
    type Error = StoreError;

    fn try_from(row: ImageNodeRow) -> StoreResult<Self> {
        Ok(Self {
            node_id: row.node_id.parse()?,
            image_ref: row.image_ref,
            state: row.state.parse()?,
            error_reason: row.error_reason,
        })
    }
}

/// Nodes and the `image_nodes` cache table.
#[derive(Clone)]
pub struct PgNodeRegistry {
    pool: PgPool,
}

impl PgNodeRegistry {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn nodes(&self, mut query: QueryBuilder<'_, Postgres>) -> StoreResult<Vec<Node>> {
        let rows = query
            .build_query_as::<NodeRow>()
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(Node::try_from).collect()
    }
}

#[async_trait]
impl NodeRegistry for PgNodeRegistry {
    async fn find_one(&self, id: &NodeId) -> StoreResult<Option<Node>> {
        let row = sqlx::query_as::<_, NodeRow>(&format!(
            "SELECT {NODE_COLUMNS} FROM nodes WHERE id = $1"
        ))
        .bind(id.to_string())
        .fetch_optional(&self.pool)
        .await?;
        row.map(Node::try_from).transpose()
    }

    async fn find_all(&self) -> StoreResult<Vec<Node>> {
        self.nodes(QueryBuilder::new(format!(
            "SELECT {NODE_COLUMNS} FROM nodes ORDER BY id"
        )))
        .await
    }

    async fn find_available_nodes(&self, filter: &NodeFilter) -> StoreResult<Vec<Node>> {
        let excluded: Vec<String> = filter.excluded.iter().map(ToString::to_string).collect();

        let mut query = QueryBuilder::new(format!(
            "SELECT {NODE_COLUMNS} FROM nodes n WHERE state = 'ready' \
             AND NOT unschedulable AND used < capacity AND region = "
        ));
        query
            .push_bind(filter.region.clone())
            .push(" AND class = ")
            .push_bind(filter.class.clone())
            .push(" AND id <> ALL(")
            .push_bind(excluded)
            .push(")");
        if let Some(image_ref) = &filter.image_ref {
            query
                .push(
                    " AND EXISTS (SELECT 1 FROM image_nodes i \
                     WHERE i.node_id = n.id AND i.state = 'ready' AND i.image_ref = ",
                )
                .push_bind(image_ref.clone())
                .push(")");
        }
        self.nodes(query).await
    }

    async fn get_nodes_with_multiple_images_building(&self) -> StoreResult<Vec<NodeId>> {
        let ids: Vec<String> = sqlx::query_scalar(
            "SELECT node_id FROM image_nodes WHERE state = 'building_image' \
             GROUP BY node_id HAVING COUNT(*) >= 2",
        )
        .fetch_all(&self.pool)
        .await?;
        ids.iter()
            .map(|id| id.parse().map_err(StoreError::from))
            .collect()
    }

    async fn get_image_node(&self, node: &NodeId, image_ref: &str) -> StoreResult<Option<ImageNode>> {
        let row = sqlx::query_as::<_, ImageNodeRow>(
            "SELECT node_id, image_ref, state, error_reason FROM image_nodes \
             WHERE node_id = $1 AND image_ref = $2",
        )
        .bind(node.to_string())
        .bind(image_ref)
        .fetch_optional(&self.pool)
        .await?;
        row.map(ImageNode::try_from).transpose()
    }

    async fn get_image_nodes(&self, image_ref: &str) -> StoreResult<Vec<ImageNode>> {
        let rows = sqlx::query_as::<_, ImageNodeRow>(
            "SELECT node_id, image_ref, state, error_reason FROM image_nodes \
             WHERE image_ref = $1 ORDER BY updated_at DESC",
        )
        .bind(image_ref)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(ImageNode::try_from).collect()
    }

    async fn create_image_node(
        &self,
        node: &NodeId,
        image_ref: &str,
        state: ImageNodeState,
        error_reason: Option<String>,
    ) -> StoreResult<()> {
        sqlx::query(
            "INSERT INTO image_nodes (node_id, image_ref, state, error_reason) \
             VALUES ($1, $2, $3, $4) \
             ON CONFLICT (node_id, image_ref) DO UPDATE \
             SET state = EXCLUDED.state, error_reason = EXCLUDED.error_reason, updated_at = now()",
        )
        .bind(node.to_string())
        .bind(image_ref)
        .bind(state.as_str())
        .bind(error_reason)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn recalculate_node_usage(&self, node: &NodeId) -> StoreResult<()> {
        sqlx::query(
            "UPDATE nodes SET used = (\
                SELECT COUNT(*) FROM workspaces \
                WHERE node_id = $1 AND state NOT IN ('destroyed', 'archived', 'error')\
             ) WHERE id = $1",
        )
        .bind(node.to_string())
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
