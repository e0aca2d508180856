//! reqwest implementation of the node agent API.

use std::collections::HashMap;
use std::error::Error as StdError;
use std::io;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use fleet_id::{NodeId, WorkspaceId};
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use tracing::{debug, warn};

use super::{
    BuildImageRequest, CreateWorkspaceRequest, NodeApi, NodeApiError, NodeApiResult,
    NodeClientFactory, NodeWorkspaceInfo,
};
use crate::model::Node;

/// Client for one node agent.
pub struct HttpNodeClient {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl HttpNodeClient {
    pub fn new(client: reqwest::Client, node: &Node) -> Self {
        Self {
            client,
            base_url: node.api_url.trim_end_matches('/').to_string(),
            api_key: node.api_key.clone(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn post(&self, path: &str, body: Option<&(impl serde::Serialize + Sync)>) -> NodeApiResult<()> {
        let url = self.url(path);
        debug!(url = %url, "Calling node");

        let mut request = self.client.post(&url).bearer_auth(&self.api_key);
        if let Some(body) = body {
            request = request.json(body);
        }
        let response = request.send().await.map_err(transport_error)?;
        check(response).await?;
        Ok(())
    }

    async fn get<T: DeserializeOwned>(&self, path: &str, query: &[(&str, &str)]) -> NodeApiResult<T> {
        let url = self.url(path);
        debug!(url = %url, "Querying node");

        let response = self
            .client
            .get(&url)
            .bearer_auth(&self.api_key)
            .query(query)
            .send()
            .await
            .map_err(transport_error)?;
        let response = check(response).await?;
        response
            .json()
            .await
            .map_err(|e| NodeApiError::Decode(e.to_string()))
    }
}

/// Maps a non-2xx response onto [`NodeApiError`].
async fn check(response: reqwest::Response) -> NodeApiResult<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let body = response.text().await.unwrap_or_default();
    Err(status_error(status, body))
}

fn status_error(status: StatusCode, body: String) -> NodeApiError {
    if status == StatusCode::NOT_FOUND {
        return NodeApiError::NotFound;
    }
    if status == StatusCode::BAD_REQUEST && body.to_lowercase().contains("already destroyed") {
        return NodeApiError::AlreadyDestroyed;
    }
    NodeApiError::Status {
        status: status.as_u16(),
        message: error_message(&body),
    }
}

/// Node agents answer errors as `{"statusCode": .., "message": ..}`; fall back to the raw body.
fn error_message(body: &str) -> String {
    #[derive(Deserialize)]
    struct ErrorBody {
        message: String,
    }

    serde_json::from_str::<ErrorBody>(body)
        .map(|b| b.message)
        .unwrap_or_else(|_| body.to_string())
}

fn transport_error(err: reqwest::Error) -> NodeApiError {
    if is_connection_reset(&err) {
        return NodeApiError::ConnectionReset;
    }
    NodeApiError::Transport(err.to_string())
}

fn is_connection_reset(err: &(dyn StdError + 'static)) -> bool {
    let mut source: Option<&(dyn StdError + 'static)> = Some(err);
    while let Some(err) = source {
        if let Some(io_err) = err.downcast_ref::<io::Error>() {
            if matches!(
                io_err.kind(),
                io::ErrorKind::ConnectionReset
                    | io::ErrorKind::ConnectionAborted
                    | io::ErrorKind::BrokenPipe
            ) {
                return true;
            }
        }
        if err.to_string().contains("connection closed before message completed") {
            return true;
        }
        source = err.source();
    }
    false
}

#[async_trait]
impl NodeApi for HttpNodeClient {
    async fn create(&self, request: &CreateWorkspaceRequest) -> NodeApiResult<()> {
        self.post("/sandboxes", Some(request)).await
    }

    async fn start(&self, id: &WorkspaceId) -> NodeApiResult<()> {
        self.post(&format!("/sandboxes/{id}/start"), None::<&()>).await
    }

    async fn stop(&self, id: &WorkspaceId) -> NodeApiResult<()> {
        self.post(&format!("/sandboxes/{id}/stop"), None::<&()>).await
    }

    async fn destroy(&self, id: &WorkspaceId) -> NodeApiResult<()> {
        self.post(&format!("/sandboxes/{id}/destroy"), None::<&()>).await
    }

    async fn remove_destroyed(&self, id: &WorkspaceId) -> NodeApiResult<()> {
        self.post(&format!("/sandboxes/{id}/remove-destroyed"), None::<&()>)
            .await
    }

    async fn info(&self, id: &WorkspaceId) -> NodeApiResult<NodeWorkspaceInfo> {
        self.get(&format!("/sandboxes/{id}"), &[]).await
    }

    async fn build_image(&self, request: &BuildImageRequest) -> NodeApiResult<()> {
        self.post("/images/build", Some(request)).await
    }

    async fn image_exists(&self, image: &str) -> NodeApiResult<bool> {
        #[derive(Deserialize)]
        struct Exists {
            exists: bool,
        }

        let response: Exists = self.get("/images/exists", &[("image", image)]).await?;
        Ok(response.exists)
    }
}

/// Hands out one [`HttpNodeClient`] per node, sharing a connection pool.
pub struct HttpNodeFactory {
    client: reqwest::Client,
    clients: Mutex<HashMap<NodeId, (String, Arc<HttpNodeClient>)>>,
}

impl HttpNodeFactory {
    pub fn new(timeout: Duration) -> NodeApiResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| NodeApiError::Transport(e.to_string()))?;

        Ok(Self {
            client,
            clients: Mutex::new(HashMap::new()),
        })
    }
}

impl NodeClientFactory for HttpNodeFactory {
    fn client(&self, node: &Node) -> Arc<dyn NodeApi> {
        let mut clients = match self.clients.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                warn!("node client cache lock poisoned; recovering");
                poisoned.into_inner()
            }
        };

        // Rebuilt when the node re-registers under a new endpoint.
        if let Some((url, client)) = clients.get(&node.id) {
            if *url == node.api_url {
                return client.clone();
            }
        }

        let client = Arc::new(HttpNodeClient::new(self.client.clone(), node));
        clients.insert(node.id, (node.api_url.clone(), client.clone()));
        client
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(StatusCode::NOT_FOUND, "", NodeApiError::NotFound)]
    #[case(
        StatusCode::BAD_REQUEST,
        r#"{"statusCode":400,"message":"Workspace already destroyed"}"#,
        NodeApiError::AlreadyDestroyed
    )]
    #[case(
        StatusCode::BAD_REQUEST,
        r#"{"statusCode":400,"message":"invalid quota"}"#,
        NodeApiError::Status { status: 400, message: "invalid quota".into() }
    )]
    #[case(
        StatusCode::INTERNAL_SERVER_ERROR,
        "boom",
        NodeApiError::Status { status: 500, message: "boom".into() }
    )]
    fn test_status_mapping(#[case] status: StatusCode, #[case] body: &str, #[case] expected: NodeApiError) {
        assert_eq!(status_error(status, body.to_string()), expected);
    }

    #[test]
    fn test_connection_reset_detected_through_source_chain() {
        #[derive(Debug)]
        struct Wrapper(io::Error);

        impl std::fmt::Display for Wrapper {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "request failed")
            }
        }

        impl StdError for Wrapper {
            fn source(&self) -> Option<&(dyn StdError + 'static)> {
                Some(&self.0)
            }
        }

        let reset = Wrapper(io::Error::from(io::ErrorKind::ConnectionReset));
        assert!(is_connection_reset(&reset));

        let refused = Wrapper(io::Error::from(io::ErrorKind::ConnectionRefused));
        assert!(!is_connection_reset(&refused));
    }

    #[test]
    fn test_factory_caches_per_node() {
        let factory = HttpNodeFactory::new(Duration::from_secs(1)).unwrap();
        let mut node = Node::new("http://10.0.0.1:3003/", "us", "small", 10);

        let a = factory.client(&node);
        let b = factory.client(&node);
        assert!(Arc::ptr_eq(&a, &b));

        node.api_url = "http://10.0.0.2:3003".into();
        let c = factory.client(&node);
        assert!(!Arc::ptr_eq(&a, &c));
    }
}
