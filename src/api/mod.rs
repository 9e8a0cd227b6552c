pub mod types;

use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

use crate::config::DashConfig;
use crate::stream::{
    EventStream, HttpTransport, ReconnectPolicy, StreamClient, StreamOptions, StreamTarget,
};

pub use types::{
    DeployMethod, DeployRequest, DiscoverRequest, HealthStatus, MessageResponse,
    OrchestrationRequest, RegisterRequest, ServerFilter, ServerInfo, ServerStats, ServerStatus,
    ToolInvocation,
};

pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
pub const MAX_DISCOVERY_LIMIT: u32 = 100;

/// Errors returned by the orchestration API client
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("HTTP request error: {0}")]
    Request(#[from] reqwest::Error),

    #[error("API error (HTTP {status}): {detail}")]
    Status { status: u16, detail: String },

    #[error("Invalid response payload: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("No async runtime available for streaming: {0}")]
    Runtime(#[from] tokio::runtime::TryCurrentError),
}

impl ApiError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, ApiError::Status { status, .. } if *status == StatusCode::NOT_FOUND.as_u16())
    }
}

/// Client for the MCP orchestration HTTP API
#[derive(Debug, Clone)]
pub struct ApiClient {
    client: Client,
    stream_client: Client,
    base_url: String,
}

impl ApiClient {
    pub fn new(base_url: impl Into<String>) -> Result<Self, ApiError> {
        Self::with_timeouts(base_url, DEFAULT_REQUEST_TIMEOUT, DEFAULT_CONNECT_TIMEOUT)
    }

    pub fn from_config(config: &DashConfig) -> Result<Self, ApiError> {
        Self::with_timeouts(
            config.api_url.clone(),
            config.request_timeout(),
            DEFAULT_CONNECT_TIMEOUT,
        )
    }

    pub fn with_timeouts(
        base_url: impl Into<String>,
        request_timeout: Duration,
        connect_timeout: Duration,
    ) -> Result<Self, ApiError> {
        let client = Client::builder()
            .timeout(request_timeout)
            .connect_timeout(connect_timeout)
            .build()?;
        // Streams stay open far longer than any single request
        let stream_client = HttpTransport::stream_client(connect_timeout)?;

        Ok(Self {
            client,
            stream_client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn send<T: DeserializeOwned>(&self, request: RequestBuilder) -> Result<T, ApiError> {
        let response = request.send().await?;
        Self::decode(response).await
    }

    async fn decode<T: DeserializeOwned>(response: Response) -> Result<T, ApiError> {
        if !response.status().is_success() {
            return Err(Self::status_error(response).await);
        }

        let body = response.bytes().await?;
        Ok(serde_json::from_slice(&body)?)
    }

    /// Turn a failed response into an error, preferring the server's `detail`
    async fn status_error(response: Response) -> ApiError {
        let status = response.status();
        let text = response
            .text()
            .await
            .unwrap_or_else(|_| "Unknown error".to_string());

        let detail = serde_json::from_str::<Value>(&text)
            .ok()
            .and_then(|body| match body.get("detail") {
                Some(Value::String(detail)) => Some(detail.clone()),
                Some(other) => Some(other.to_string()),
                None => None,
            })
            .unwrap_or(text);

        warn!("API request failed with HTTP {}: {}", status, detail);
        ApiError::Status {
            status: status.as_u16(),
            detail,
        }
    }

    #[instrument(skip(self))]
    pub async fn health(&self) -> Result<HealthStatus, ApiError> {
        self.send(self.client.get(self.url("/health"))).await
    }

    /// Search for MCP servers matching a free-text query
    #[instrument(skip(self))]
    pub async fn discover(
        &self,
        query: &str,
        limit: Option<u32>,
        auto_deploy: bool,
    ) -> Result<Vec<ServerInfo>, ApiError> {
        let query = query.trim();
        if query.is_empty() {
            return Err(ApiError::InvalidRequest(
                "discovery query must not be empty".to_string(),
            ));
        }

        let limit = limit.unwrap_or(10);
        if limit == 0 || limit > MAX_DISCOVERY_LIMIT {
            return Err(ApiError::InvalidRequest(format!(
                "discovery limit must be between 1 and {}, got {}",
                MAX_DISCOVERY_LIMIT, limit
            )));
        }

        let request = DiscoverRequest {
            query: query.to_string(),
            limit,
            auto_deploy,
        };

        let servers: Vec<ServerInfo> = self
            .send(self.client.post(self.url("/api/discover")).json(&request))
            .await?;
        info!("Discovered {} servers for '{}'", servers.len(), query);
        Ok(servers)
    }

    /// Register a server that is already running somewhere
    #[instrument(skip(self))]
    pub async fn register(
        &self,
        name: &str,
        endpoint: &str,
        github_url: Option<&str>,
    ) -> Result<ServerInfo, ApiError> {
        if name.trim().is_empty() || endpoint.trim().is_empty() {
            return Err(ApiError::InvalidRequest(
                "server name and endpoint are required".to_string(),
            ));
        }

        let request = RegisterRequest {
            name: name.to_string(),
            endpoint: endpoint.to_string(),
            github_url: github_url.map(str::to_string),
        };

        self.send(self.client.post(self.url("/api/register")).json(&request))
            .await
    }

    /// Ask the platform to deploy a repository. Deployment continues in the
    /// background; the returned descriptor reflects the state at request time.
    #[instrument(skip(self))]
    pub async fn deploy(
        &self,
        github_url: &str,
        method: DeployMethod,
        port: Option<u16>,
    ) -> Result<ServerInfo, ApiError> {
        if github_url.trim().is_empty() {
            return Err(ApiError::InvalidRequest(
                "repository URL must not be empty".to_string(),
            ));
        }
        match method {
            DeployMethod::External => {
                return Err(ApiError::InvalidRequest(
                    "external servers are registered, not deployed".to_string(),
                ))
            }
            DeployMethod::Local => {
                return Err(ApiError::InvalidRequest(
                    "local deployment cannot be requested remotely; use docker, npx, e2b or auto"
                        .to_string(),
                ))
            }
            DeployMethod::Docker | DeployMethod::Npx | DeployMethod::E2b | DeployMethod::Auto => {}
        }

        let request = DeployRequest {
            github_url: github_url.to_string(),
            method,
            port,
        };

        let server: ServerInfo = self
            .send(self.client.post(self.url("/api/deploy")).json(&request))
            .await?;
        info!("Deployment of {} requested ({})", server.name, server.status);
        Ok(server)
    }

    #[instrument(skip(self))]
    pub async fn list_servers(&self, filter: ServerFilter) -> Result<Vec<ServerInfo>, ApiError> {
        let request = self
            .client
            .get(self.url("/api/servers"))
            .query(&filter.query_pairs());
        self.send(request).await
    }

    /// Look a server up by id; an unknown id is `Ok(None)`
    #[instrument(skip(self))]
    pub async fn get_server(&self, server_id: &str) -> Result<Option<ServerInfo>, ApiError> {
        match self
            .send(self.client.get(self.url(&format!("/api/servers/{}", server_id))))
            .await
        {
            Ok(server) => Ok(Some(server)),
            Err(e) if e.is_not_found() => {
                debug!("Server {} not found", server_id);
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    /// Remove a server; `false` when it did not exist
    #[instrument(skip(self))]
    pub async fn delete_server(&self, server_id: &str) -> Result<bool, ApiError> {
        let request = self
            .client
            .delete(self.url(&format!("/api/servers/{}", server_id)));
        match self.send::<MessageResponse>(request).await {
            Ok(_) => Ok(true),
            Err(e) if e.is_not_found() => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Run a natural-language task against a deployed server and wait for the result
    #[instrument(skip(self, context))]
    pub async fn orchestrate(
        &self,
        server_id: &str,
        prompt: &str,
        context: Option<Map<String, Value>>,
    ) -> Result<Value, ApiError> {
        let request = Self::orchestration_request(server_id, prompt, context)?;
        self.send(self.client.post(self.url("/api/orchestrate")).json(&request))
            .await
    }

    /// Where the streaming variant of [`orchestrate`](Self::orchestrate) connects to
    pub fn orchestration_target(
        &self,
        server_id: &str,
        prompt: &str,
        context: Option<Map<String, Value>>,
    ) -> Result<StreamTarget, ApiError> {
        let request = Self::orchestration_request(server_id, prompt, context)?;
        Ok(StreamTarget::new(self.url("/api/orchestrate/stream"))
            .with_json_body(serde_json::to_value(&request)?))
    }

    /// Start a streaming orchestration. Progress arrives on the returned
    /// [`EventStream`]; the client is already connecting.
    #[instrument(skip(self, context, policy))]
    pub fn orchestrate_stream(
        &self,
        server_id: &str,
        prompt: &str,
        context: Option<Map<String, Value>>,
        policy: ReconnectPolicy,
    ) -> Result<(StreamClient, EventStream), ApiError> {
        let target = self.orchestration_target(server_id, prompt, context)?;
        let options = StreamOptions::orchestration().with_reconnect(policy);
        let (client, events) =
            StreamClient::over_http(target, options, self.stream_client.clone())?;
        client.connect();
        Ok((client, events))
    }

    /// Call a single tool on a deployed server
    #[instrument(skip(self, args))]
    pub async fn invoke_tool(
        &self,
        server_id: &str,
        tool_name: &str,
        args: Map<String, Value>,
    ) -> Result<Value, ApiError> {
        if server_id.is_empty() || tool_name.trim().is_empty() {
            return Err(ApiError::InvalidRequest(
                "server id and tool name are required".to_string(),
            ));
        }

        let request = ToolInvocation {
            server_id: server_id.to_string(),
            tool_name: tool_name.to_string(),
            args,
        };

        self.send(self.client.post(self.url("/api/invoke")).json(&request))
            .await
    }

    #[instrument(skip(self))]
    pub async fn stats(&self) -> Result<ServerStats, ApiError> {
        self.send(self.client.get(self.url("/api/admin/stats")))
            .await
    }

    /// Drop the platform's discovery cache
    #[instrument(skip(self))]
    pub async fn clear_cache(&self) -> Result<String, ApiError> {
        let response: MessageResponse = self
            .send(self.client.post(self.url("/api/admin/clear-cache")))
            .await?;
        Ok(response.message)
    }

    fn orchestration_request(
        server_id: &str,
        prompt: &str,
        context: Option<Map<String, Value>>,
    ) -> Result<OrchestrationRequest, ApiError> {
        if server_id.is_empty() {
            return Err(ApiError::InvalidRequest(
                "server id must not be empty".to_string(),
            ));
        }
        if prompt.trim().is_empty() {
            return Err(ApiError::InvalidRequest(
                "prompt must not be empty".to_string(),
            ));
        }

        Ok(OrchestrationRequest {
            server_id: server_id.to_string(),
            prompt: prompt.to_string(),
            context,
        })
    }
}
