// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Remote tool-server catalog.
//!
//! The runtime treats external tool servers as a pluggable catalog: the
//! connection lifecycle is an external concern, and the agency only needs
//! `list_tools` and `call_tool`.  Agents see each advertised tool as a
//! local `mcp_<server>_<tool>` adapter that proxies through the agency.

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{info, warn};

use hub_tools::RemoteToolDesc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum McpState {
    Authenticating,
    Connecting,
    Connected,
    Discovering,
    Ready,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct McpServer {
    pub id: String,
    pub name: String,
    pub url: String,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    pub state: McpState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default)]
    pub tools: Vec<RemoteToolDesc>,
}

/// Textual result of one remote call; `is_error` maps to a thrown tool
/// error on the agent side.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteCallResult {
    pub content: String,
    pub is_error: bool,
}

#[async_trait]
pub trait RemoteToolClient: Send + Sync {
    async fn list_tools(&self, server: &McpServer) -> anyhow::Result<Vec<RemoteToolDesc>>;
    async fn call_tool(
        &self,
        server: &McpServer,
        tool: &str,
        args: Value,
    ) -> anyhow::Result<RemoteCallResult>;
}

/// HTTP client speaking a minimal `tools/list` / `tools/call` JSON dialect.
pub struct HttpRemoteClient {
    client: reqwest::Client,
}

impl HttpRemoteClient {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }

    fn request(&self, server: &McpServer, path: &str) -> reqwest::RequestBuilder {
        let url = format!("{}/{}", server.url.trim_end_matches('/'), path);
        let mut req = self.client.post(url);
        for (name, value) in &server.headers {
            req = req.header(name.as_str(), value.as_str());
        }
        req
    }
}

impl Default for HttpRemoteClient {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RemoteToolClient for HttpRemoteClient {
    async fn list_tools(&self, server: &McpServer) -> anyhow::Result<Vec<RemoteToolDesc>> {
        let body: Value = self
            .request(server, "tools/list")
            .json(&json!({}))
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        let mut out = Vec::new();
        for t in body["tools"].as_array().into_iter().flatten() {
            let Some(name) = t["name"].as_str() else {
                continue;
            };
            out.push(RemoteToolDesc {
                server_id: server.id.clone(),
                name: name.to_string(),
                description: t["description"].as_str().map(str::to_string),
                parameters: t.get("inputSchema").cloned().filter(|v| !v.is_null()),
            });
        }
        Ok(out)
    }

    async fn call_tool(
        &self,
        server: &McpServer,
        tool: &str,
        args: Value,
    ) -> anyhow::Result<RemoteCallResult> {
        let body: Value = self
            .request(server, "tools/call")
            .json(&json!({ "name": tool, "arguments": args }))
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        // Content is a list of text blocks in the common dialect; fall back
        // to the raw body for servers that return a bare string.
        let content = match body["content"].as_array() {
            Some(blocks) => blocks
                .iter()
                .filter_map(|b| b["text"].as_str())
                .collect::<Vec<_>>()
                .join("\n"),
            None => body["content"].as_str().unwrap_or_default().to_string(),
        };
        Ok(RemoteCallResult {
            content,
            is_error: body["isError"].as_bool().unwrap_or(false),
        })
    }
}

/// The agency-held catalog of configured servers.
pub struct McpCatalog {
    client: Box<dyn RemoteToolClient>,
    servers: Vec<McpServer>,
}

impl McpCatalog {
    pub fn new(client: Box<dyn RemoteToolClient>) -> Self {
        Self {
            client,
            servers: Vec::new(),
        }
    }

    pub fn servers(&self) -> &[McpServer] {
        &self.servers
    }

    pub fn get(&self, id: &str) -> Option<&McpServer> {
        self.servers.iter().find(|s| s.id == id)
    }

    /// Add a server and run discovery.  The server lands in `ready` with a
    /// tool catalog, or `failed` with the error recorded.
    pub async fn add(
        &mut self,
        name: String,
        url: String,
        headers: BTreeMap<String, String>,
    ) -> &McpServer {
        let id = uuid::Uuid::new_v4().to_string();
        let server = McpServer {
            id: id.clone(),
            name,
            url,
            headers,
            state: McpState::Connecting,
            error: None,
            tools: Vec::new(),
        };
        self.servers.push(server);
        self.discover(&id).await;
        self.get(&id).expect("server just inserted")
    }

    pub fn remove(&mut self, id: &str) -> bool {
        let before = self.servers.len();
        self.servers.retain(|s| s.id != id);
        self.servers.len() != before
    }

    /// (Re-)run discovery against one server.
    pub async fn discover(&mut self, id: &str) {
        let Some(idx) = self.servers.iter().position(|s| s.id == id) else {
            return;
        };
        self.servers[idx].state = McpState::Discovering;
        let snapshot = self.servers[idx].clone();
        match self.client.list_tools(&snapshot).await {
            Ok(tools) => {
                info!(server = %snapshot.name, tools = tools.len(), "tool server ready");
                let s = &mut self.servers[idx];
                s.tools = tools;
                s.state = McpState::Ready;
                s.error = None;
            }
            Err(e) => {
                warn!(server = %snapshot.name, "tool server discovery failed: {e}");
                let s = &mut self.servers[idx];
                s.state = McpState::Failed;
                s.error = Some(e.to_string());
            }
        }
    }

    /// Every tool advertised by every ready server.
    pub fn all_tools(&self) -> Vec<RemoteToolDesc> {
        self.servers
            .iter()
            .filter(|s| s.state == McpState::Ready)
            .flat_map(|s| s.tools.iter().cloned())
            .collect()
    }

    /// Proxy one call.  Returns the server's textual response, or an error
    /// when the server is unknown, not ready, or reports `is_error`.
    pub async fn call(&self, server_id: &str, tool: &str, args: Value) -> anyhow::Result<Value> {
        let server = self
            .get(server_id)
            .ok_or_else(|| anyhow::anyhow!("unknown tool server {server_id}"))?;
        if server.state != McpState::Ready {
            anyhow::bail!("tool server {server_id} is not ready");
        }
        let result = self.client.call_tool(server, tool, args).await?;
        if result.is_error {
            anyhow::bail!("{}", result.content);
        }
        Ok(Value::String(result.content))
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
