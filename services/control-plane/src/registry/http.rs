//! Existence checks against an OCI distribution registry.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use tracing::debug;

use super::{strip_scheme, DockerRegistry, RegistryClient, RegistryError};

const MANIFEST_ACCEPT: &str = "application/vnd.oci.image.index.v1+json, \
application/vnd.oci.image.manifest.v1+json, \
application/vnd.docker.distribution.manifest.list.v2+json, \
application/vnd.docker.distribution.manifest.v2+json";

/// `host/repository:tag` or `host/repository@digest`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageReference {
    pub host: String,
    pub repository: String,
    /// Tag or digest.
    pub reference: String,
}

impl ImageReference {
    pub fn parse(image: &str) -> Result<Self, RegistryError> {
        let invalid = || RegistryError::InvalidReference(image.to_string());

        let (host, path) = strip_scheme(image).split_once('/').ok_or_else(invalid)?;
        if host.is_empty() || path.is_empty() {
            return Err(invalid());
        }

        let (repository, reference) = if let Some((repo, digest)) = path.split_once('@') {
            (repo, digest)
        } else {
            // A ':' after the last '/' separates the tag.
            let last_segment = path.rfind('/').map_or(0, |i| i + 1);
            match path[last_segment..].rfind(':') {
                Some(i) => (&path[..last_segment + i], &path[last_segment + i + 1..]),
                None => (path, "latest"),
            }
        };
        if repository.is_empty() || reference.is_empty() {
            return Err(invalid());
        }

        Ok(Self {
            host: host.to_string(),
            repository: repository.to_string(),
            reference: reference.to_string(),
        })
    }
}

pub struct HttpRegistryClient {
    client: reqwest::Client,
}

impl HttpRegistryClient {
    pub fn new(timeout: Duration) -> Result<Self, RegistryError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| RegistryError::Http(e.to_string()))?;
        Ok(Self { client })
    }
}

fn scheme_of(url: &str) -> &str {
    url.split_once("://").map_or("https", |(scheme, _)| scheme)
}

#[async_trait]
impl RegistryClient for HttpRegistryClient {
    async fn image_exists(&self, image: &str, registry: &DockerRegistry) -> Result<bool, RegistryError> {
        let image = ImageReference::parse(image)?;
        let url = format!(
            "{}://{}/v2/{}/manifests/{}",
            scheme_of(&registry.url),
            image.host,
            image.repository,
            image.reference
        );
        debug!(url = %url, registry_id = %registry.id, "Checking image in registry");

        let response = self
            .client
            .head(&url)
            .basic_auth(&registry.username, Some(&registry.password))
            .header(reqwest::header::ACCEPT, MANIFEST_ACCEPT)
            .send()
            .await
            .map_err(|e| RegistryError::Http(e.to_string()))?;

        match response.status() {
            status if status.is_success() => Ok(true),
            StatusCode::NOT_FOUND => Ok(false),
            status => Err(RegistryError::Http(format!("{url} returned {status}"))),
        }
    }
}
