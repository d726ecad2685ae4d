//! Node listing against the directory API

use crate::node::Node;
use async_trait::async_trait;
use reqwest::StatusCode;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

/// Errors from a single listing request
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ListError {
    #[error("Directory rejected the token")]
    Unauthorized,

    #[error("Directory returned status {0}")]
    Status(u16),

    #[error("Directory request failed: {0}")]
    Transport(String),

    #[error("Invalid directory response: {0}")]
    Decode(String),
}

/// Lists every node visible to the token
#[async_trait]
pub trait NodeLister: Send + Sync {
    async fn list_nodes(&self, token: &str) -> Result<Vec<Node>, ListError>;
}

/// HTTP lister configuration
#[derive(Debug, Clone)]
pub struct HttpNodeListerConfig {
    /// Directory API base URL
    pub base_url: String,
    /// Project the nodes are listed for
    pub project_id: String,
    /// Per-request timeout
    pub timeout: Duration,
}

impl HttpNodeListerConfig {
    pub fn new(base_url: impl Into<String>, project_id: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            project_id: project_id.into(),
            timeout: Duration::from_secs(30),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

/// Lists nodes with `GET <base>/v2/<project>/nodes`
#[derive(Debug, Clone)]
pub struct HttpNodeLister {
    http: reqwest::Client,
    nodes_url: String,
}

impl HttpNodeLister {
    pub fn new(config: HttpNodeListerConfig) -> Result<Self, ListError> {
        let nodes_url = format!(
            "{}/v2/{}/nodes",
            config.base_url.trim_end_matches('/'),
            config.project_id
        );

        let http = reqwest::Client::builder()
            .timeout(config.timeout)
            .user_agent("mw-proxy")
            .build()
            .map_err(|e| ListError::Transport(e.to_string()))?;

        Ok(Self { http, nodes_url })
    }

    pub fn nodes_url(&self) -> &str {
        &self.nodes_url
    }
}

#[async_trait]
impl NodeLister for HttpNodeLister {
    async fn list_nodes(&self, token: &str) -> Result<Vec<Node>, ListError> {
        debug!(url = %self.nodes_url, "Listing directory nodes");

        let response = self
            .http
            .get(&self.nodes_url)
            .header("Accept", "application/json")
            .header("X-Auth-Token", token)
            .send()
            .await
            .map_err(|e| ListError::Transport(e.to_string()))?;

        match response.status() {
            StatusCode::OK => {}
            StatusCode::UNAUTHORIZED => return Err(ListError::Unauthorized),
            status => return Err(ListError::Status(status.as_u16())),
        }

        let body = response
            .bytes()
            .await
            .map_err(|e| ListError::Transport(e.to_string()))?;

        serde_json::from_slice(&body).map_err(|e| ListError::Decode(e.to_string()))
    }
}
