use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

/// How a server is (or should be) brought up
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum DeployMethod {
    Docker,
    Npx,
    E2b,
    Local,
    #[default]
    Auto,
    /// Registered from an already running endpoint, never deployed by the platform
    External,
}

impl DeployMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeployMethod::Docker => "docker",
            DeployMethod::Npx => "npx",
            DeployMethod::E2b => "e2b",
            DeployMethod::Local => "local",
            DeployMethod::Auto => "auto",
            DeployMethod::External => "external",
        }
    }
}

impl fmt::Display for DeployMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServerStatus {
    Discovered,
    Validated,
    Deployed,
    Failed,
}

impl ServerStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ServerStatus::Discovered => "discovered",
            ServerStatus::Validated => "validated",
            ServerStatus::Deployed => "deployed",
            ServerStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for ServerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An MCP server known to the platform
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerInfo {
    pub id: String,
    pub name: String,
    pub github_url: String,
    #[serde(default)]
    pub description: Option<String>,
    pub deploy_method: DeployMethod,
    pub status: ServerStatus,
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default)]
    pub capabilities: Option<Map<String, Value>>,
    pub created_at: NaiveDateTime,
    #[serde(default)]
    pub error: Option<String>,
}

impl ServerInfo {
    pub fn is_deployed(&self) -> bool {
        self.status == ServerStatus::Deployed
    }

    /// Names of the tools listed in the server's capabilities
    pub fn tool_names(&self) -> Vec<&str> {
        self.capabilities
            .as_ref()
            .and_then(|caps| caps.get("tools"))
            .and_then(Value::as_array)
            .map(|tools| {
                tools
                    .iter()
                    .filter_map(|t| t.get("name").and_then(Value::as_str))
                    .collect()
            })
            .unwrap_or_default()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiscoverRequest {
    pub query: String,
    pub limit: u32,
    pub auto_deploy: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeployRequest {
    pub github_url: String,
    pub method: DeployMethod,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegisterRequest {
    pub name: String,
    pub endpoint: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub github_url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrchestrationRequest {
    pub server_id: String,
    pub prompt: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context: Option<Map<String, Value>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolInvocation {
    pub server_id: String,
    pub tool_name: String,
    pub args: Map<String, Value>,
}

/// Optional filters for listing servers
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ServerFilter {
    pub status: Option<ServerStatus>,
    pub method: Option<DeployMethod>,
}

impl ServerFilter {
    pub fn with_status(mut self, status: ServerStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_method(mut self, method: DeployMethod) -> Self {
        self.method = Some(method);
        self
    }

    pub(crate) fn query_pairs(&self) -> Vec<(&'static str, &'static str)> {
        let mut pairs = Vec::new();
        if let Some(status) = self.status {
            pairs.push(("status", status.as_str()));
        }
        if let Some(method) = self.method {
            pairs.push(("method", method.as_str()));
        }
        pairs
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct HealthStatus {
    pub status: String,
    pub servers_registered: usize,
    #[serde(default)]
    pub version: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct ServerStats {
    pub total_servers: usize,
    pub registered_servers: usize,
    pub deployed_servers: usize,
    pub failed_servers: usize,
    pub discovered_servers: usize,
}

/// Plain acknowledgement returned by mutating admin endpoints
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct MessageResponse {
    pub message: String,
}
