use async_trait::async_trait;
use fleet_id::{OrgId, RegistryId};
use sqlx::postgres::{PgPool, PgRow};
use sqlx::types::Json;
use sqlx::Row;

use crate::registry::{
    pick_registry, DockerRegistry, Image, ImageCatalog, RegistryError, RegistryResolver,
};
use crate::store::StoreError;

const REGISTRY_COLUMNS: &str = "id, url, username, password, project, organization_id";

struct RegistryRow {
    id: String,
    url: String,
    username: String,
    password: String,
    project: String,
    organization_id: Option<String>,
}

impl<'r> sqlx::FromRow<'r, PgRow> for RegistryRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            url: row.try_get("url")?,
            username: row.try_get("username")?,
            password: row.try_get("password")?,
            project: row.try_get("project")?,
            organization_id: row.try_get("organization_id")?,
        })
    }
}

impl TryFrom<RegistryRow> for DockerRegistry {
    type Error = StoreError;

    fn try_from(row: RegistryRow) -> Result<Self, StoreError> {
        Ok(Self {
            id: row.id.parse()?,
            url: row.url,
            username: row.username,
            password: row.password,
            project: row.project,
            organization_id: row.organization_id.as_deref().map(str::parse).transpose()?,
        })
    }
}

/// The `docker_registries` table.
#[derive(Clone)]
pub struct PgRegistryResolver {
    pool: PgPool,
}

impl PgRegistryResolver {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl RegistryResolver for PgRegistryResolver {
    async fn find_one(&self, id: &RegistryId) -> Result<Option<DockerRegistry>, RegistryError> {
        let row = sqlx::query_as::<_, RegistryRow>(&format!(
            "SELECT {REGISTRY_COLUMNS} FROM docker_registries WHERE id = $1"
        ))
        .bind(id.to_string())
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(DockerRegistry::try_from).transpose()?)
    }

    async fn find_one_by_image_name(
        &self,
        image: &str,
        org: &OrgId,
    ) -> Result<Option<DockerRegistry>, RegistryError> {
        let rows = sqlx::query_as::<_, RegistryRow>(&format!(
            "SELECT {REGISTRY_COLUMNS} FROM docker_registries \
             WHERE organization_id IS NULL OR organization_id = $1 ORDER BY id"
        ))
        .bind(org.to_string())
        .fetch_all(&self.pool)
        .await?;
        let registries = rows
            .into_iter()
            .map(DockerRegistry::try_from)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(pick_registry(&registries, image, org))
    }
}

/// The `images` table.
#[derive(Clone)]
pub struct PgImageCatalog {
    pool: PgPool,
}

impl PgImageCatalog {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ImageCatalog for PgImageCatalog {
    async fn get_image_by_name(&self, name: &str, org: &OrgId) -> Result<Image, RegistryError> {
        let row = sqlx::query(
            "SELECT name, internal_name, entrypoint, organization_id FROM images \
             WHERE name = $1 AND (organization_id IS NULL OR organization_id = $2) \
             ORDER BY organization_id NULLS LAST LIMIT 1",
        )
        .bind(name)
        .bind(org.to_string())
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| RegistryError::ImageNotFound(name.to_string()))?;

        let entrypoint: Option<Json<Vec<String>>> = row.try_get("entrypoint")?;
        let owner: Option<String> = row.try_get("organization_id")?;
        Ok(Image {
            name: row.try_get("name")?,
            internal_name: row.try_get("internal_name")?,
            entrypoint: entrypoint.map(|e| e.0),
            organization_id: owner
                .as_deref()
                .map(str::parse)
                .transpose()
                .map_err(StoreError::from)?,
        })
    }
}
