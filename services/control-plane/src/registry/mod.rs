//! Registry credentials, the image catalog and registry existence checks.

mod http;
mod memory;

pub use http::{HttpRegistryClient, ImageReference};
pub use memory::{MemoryImageCatalog, MemoryRegistryClient, MemoryRegistryResolver};

use async_trait::async_trait;
use fleet_id::{OrgId, RegistryId};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::store::StoreError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DockerRegistry {
    pub id: RegistryId,
    /// Host (and optional scheme/port) images are pulled from.
    pub url: String,
    pub username: String,
    pub password: String,
    pub project: String,
    /// `None` for registries shared by every organization.
    pub organization_id: Option<OrgId>,
}

impl DockerRegistry {
    /// Registry URL without its scheme, as it prefixes image names.
    pub fn host(&self) -> &str {
        strip_scheme(&self.url).trim_end_matches('/')
    }

    /// Whether `image` is stored in this registry.
    pub fn hosts_image(&self, image: &str) -> bool {
        let host = self.host();
        image
            .strip_prefix(host)
            .is_some_and(|rest| rest.starts_with('/'))
    }

    pub fn visible_to(&self, org: &OrgId) -> bool {
        self.organization_id.is_none_or(|owner| owner == *org)
    }
}

pub(crate) fn strip_scheme(url: &str) -> &str {
    url.split_once("://").map_or(url, |(_, rest)| rest)
}

/// A published image as the user names it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Image {
    pub name: String,
    /// Fully qualified pull reference inside one of our registries.
    pub internal_name: String,
    pub entrypoint: Option<Vec<String>>,
    /// `None` for images every organization may use.
    pub organization_id: Option<OrgId>,
}

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("Image {0} not found")]
    ImageNotFound(String),

    #[error("invalid image reference: {0}")]
    InvalidReference(String),

    #[error("registry request failed: {0}")]
    Http(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl From<sqlx::Error> for RegistryError {
    fn from(err: sqlx::Error) -> Self {
        Self::Store(StoreError::Database(err))
    }
}

#[async_trait]
pub trait RegistryResolver: Send + Sync {
    async fn find_one(&self, id: &RegistryId) -> Result<Option<DockerRegistry>, RegistryError>;

    /// Registry visible to `org` that stores `image`. The organization's own
    /// registries win over shared ones.
    async fn find_one_by_image_name(
        &self,
        image: &str,
        org: &OrgId,
    ) -> Result<Option<DockerRegistry>, RegistryError>;
}

#[async_trait]
pub trait ImageCatalog: Send + Sync {
    /// Fails with [`RegistryError::ImageNotFound`] when `org` cannot see `name`.
    async fn get_image_by_name(&self, name: &str, org: &OrgId) -> Result<Image, RegistryError>;
}

#[async_trait]
pub trait RegistryClient: Send + Sync {
    async fn image_exists(&self, image: &str, registry: &DockerRegistry) -> Result<bool, RegistryError>;
}

/// Organization-owned candidates first, then shared ones.
pub(crate) fn pick_registry<'a>(
    registries: impl IntoIterator<Item = &'a DockerRegistry>,
    image: &str,
    org: &OrgId,
) -> Option<DockerRegistry> {
    let mut shared = None;
    for registry in registries {
        if !registry.hosts_image(image) || !registry.visible_to(org) {
            continue;
        }
        if registry.organization_id.is_some() {
            return Some(registry.clone());
        }
        shared.get_or_insert_with(|| registry.clone());
    }
    shared
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry(url: &str, org: Option<OrgId>) -> DockerRegistry {
        DockerRegistry {
            id: RegistryId::new(),
            url: url.to_string(),
            username: "u".into(),
            password: "p".into(),
            project: "fleet".into(),
            organization_id: org,
        }
    }

    #[test]
    fn test_hosts_image_matches_whole_host() {
        let reg = registry("https://registry.local:5000/", None);
        assert_eq!(reg.host(), "registry.local:5000");
        assert!(reg.hosts_image("registry.local:5000/fleet/python:3.12"));
        assert!(!reg.hosts_image("registry.local:50000/fleet/python:3.12"));
        assert!(!reg.hosts_image("docker.io/library/python:3.12"));
    }

    #[test]
    fn test_pick_prefers_org_registry() {
        let org = OrgId::new();
        let shared = registry("registry.local", None);
        let own = registry("registry.local", Some(org));
        let foreign = registry("registry.local", Some(OrgId::new()));
        let all = vec![shared.clone(), foreign, own.clone()];

        let picked = pick_registry(&all, "registry.local/fleet/app:1", &org).unwrap();
        assert_eq!(picked.id, own.id);

        let picked = pick_registry(&all, "registry.local/fleet/app:1", &OrgId::new()).unwrap();
        assert_eq!(picked.id, shared.id);

        assert!(pick_registry(&all, "elsewhere.io/app:1", &org).is_none());
    }
}
