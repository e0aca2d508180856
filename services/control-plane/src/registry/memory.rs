use std::collections::HashSet;

use async_trait::async_trait;
use fleet_id::{OrgId, RegistryId};
use tokio::sync::RwLock;

use super::{
    pick_registry, DockerRegistry, Image, ImageCatalog, RegistryClient, RegistryError,
    RegistryResolver,
};

#[derive(Debug, Default)]
pub struct MemoryRegistryResolver {
    registries: RwLock<Vec<DockerRegistry>>,
}

impl MemoryRegistryResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, registry: DockerRegistry) {
        self.registries.write().await.push(registry);
    }
}

#[async_trait]
impl RegistryResolver for MemoryRegistryResolver {
    async fn find_one(&self, id: &RegistryId) -> Result<Option<DockerRegistry>, RegistryError> {
        Ok(self
            .registries
            .read()
            .await
            .iter()
            .find(|r| r.id == *id)
            .cloned())
    }

    async fn find_one_by_image_name(
        &self,
        image: &str,
        org: &OrgId,
    ) -> Result<Option<DockerRegistry>, RegistryError> {
        Ok(pick_registry(self.registries.read().await.iter(), image, org))
    }
}

#[derive(Debug, Default)]
pub struct MemoryImageCatalog {
    images: RwLock<Vec<Image>>,
}

impl MemoryImageCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, image: Image) {
        self.images.write().await.push(image);
    }
}

#[async_trait]
impl ImageCatalog for MemoryImageCatalog {
    async fn get_image_by_name(&self, name: &str, org: &OrgId) -> Result<Image, RegistryError> {
        let images = self.images.read().await;
        let visible = |i: &&Image| i.name == name;
        images
            .iter()
            .filter(visible)
            .find(|i| i.organization_id == Some(*org))
            .or_else(|| {
                images
                    .iter()
                    .filter(visible)
                    .find(|i| i.organization_id.is_none())
            })
            .cloned()
            .ok_or_else(|| RegistryError::ImageNotFound(name.to_string()))
    }
}

/// Registry contents as a set of image names.
#[derive(Debug, Default)]
pub struct MemoryRegistryClient {
    present: RwLock<HashSet<String>>,
    unreachable: RwLock<HashSet<String>>,
}

impl MemoryRegistryClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn push(&self, image: impl Into<String>) {
        self.present.write().await.insert(image.into());
    }

    /// Checks for `image` fail with a transport error.
    pub async fn break_image(&self, image: impl Into<String>) {
        self.unreachable.write().await.insert(image.into());
    }
}

#[async_trait]
impl RegistryClient for MemoryRegistryClient {
    async fn image_exists(&self, image: &str, _registry: &DockerRegistry) -> Result<bool, RegistryError> {
        if self.unreachable.read().await.contains(image) {
            return Err(RegistryError::Http(format!("{image}: connection refused")));
        }
        Ok(self.present.read().await.contains(image))
    }
}
