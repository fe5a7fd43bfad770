// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Process-wide tool and plugin registries plus capability resolution.
//!
//! A blueprint's `capabilities` list is resolved against these registries
//! at agent registration time:
//!
//! - `@tag` selects every tool and plugin bearing that tag;
//! - a bare name selects by exact tool or plugin name;
//! - `mcp:*` / `mcp:<server>` / `mcp:<server>:<tool>` select external tools
//!   advertised by remote tool servers.
//!
//! Duplicate selections are dropped; first-appearance order is preserved.

use std::collections::HashSet;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::plugin::Plugin;
use crate::tool::Tool;

/// One tool advertised by a remote tool server, as cataloged by the agency.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteToolDesc {
    pub server_id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parameters: Option<Value>,
}

impl RemoteToolDesc {
    /// The local tool name an agent exposes for this remote tool.
    pub fn local_name(&self) -> String {
        format!("mcp_{}_{}", self.server_id, self.name)
    }
}

/// What a capability list resolved to.
#[derive(Default, Clone)]
pub struct Selection {
    pub tools: Vec<Arc<dyn Tool>>,
    pub plugins: Vec<Arc<dyn Plugin>>,
    pub remote: Vec<RemoteToolDesc>,
}

/// The process-wide registry.  Immutable once wrapped in an `Arc` and
/// handed to agencies.
#[derive(Default)]
pub struct Hub {
    tools: Vec<Arc<dyn Tool>>,
    plugins: Vec<Arc<dyn Plugin>>,
}

impl Hub {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_tool(&mut self, tool: impl Tool + 'static) {
        self.tools.push(Arc::new(tool));
    }

    pub fn register_tool_arc(&mut self, tool: Arc<dyn Tool>) {
        self.tools.push(tool);
    }

    pub fn register_plugin(&mut self, plugin: impl Plugin + 'static) {
        self.plugins.push(Arc::new(plugin));
    }

    pub fn register_plugin_arc(&mut self, plugin: Arc<dyn Plugin>) {
        self.plugins.push(plugin);
    }

    pub fn tool(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.iter().find(|t| t.name() == name).cloned()
    }

    pub fn plugin(&self, name: &str) -> Option<Arc<dyn Plugin>> {
        self.plugins.iter().find(|p| p.name() == name).cloned()
    }

    pub fn tool_names(&self) -> Vec<String> {
        self.tools.iter().map(|t| t.name().to_string()).collect()
    }

    /// Resolve a blueprint's capability patterns against the registries and
    /// the remote tool catalog.
    pub fn resolve(&self, capabilities: &[String], remote: &[RemoteToolDesc]) -> Selection {
        let mut sel = Selection::default();
        let mut seen_tools = HashSet::new();
        let mut seen_plugins = HashSet::new();
        let mut seen_remote = HashSet::new();

        let mut add_tool = |sel: &mut Selection, t: Arc<dyn Tool>| {
            if seen_tools.insert(t.name().to_string()) {
                sel.tools.push(t);
            }
        };
        let mut add_plugin = |sel: &mut Selection, p: Arc<dyn Plugin>| {
            if seen_plugins.insert(p.name().to_string()) {
                sel.plugins.push(p);
            }
        };
        let mut add_remote = |sel: &mut Selection, r: &RemoteToolDesc| {
            if seen_remote.insert((r.server_id.clone(), r.name.clone())) {
                sel.remote.push(r.clone());
            }
        };

        for pattern in capabilities {
            if let Some(tag) = pattern.strip_prefix('@') {
                for t in self.tools.iter().filter(|t| t.tags().contains(&tag)) {
                    add_tool(&mut sel, t.clone());
                }
                for p in self.plugins.iter().filter(|p| p.tags().contains(&tag)) {
                    add_plugin(&mut sel, p.clone());
                }
            } else if let Some(rest) = pattern.strip_prefix("mcp:") {
                match rest.split_once(':') {
                    // mcp:<server>:<tool>
                    Some((server, tool)) => {
                        for r in remote
                            .iter()
                            .filter(|r| r.server_id == server && r.name == tool)
                        {
                            add_remote(&mut sel, r);
                        }
                    }
                    // mcp:* or mcp:<server>
                    None => {
                        for r in remote.iter().filter(|r| rest == "*" || r.server_id == rest) {
                            add_remote(&mut sel, r);
                        }
                    }
                }
            } else {
                if let Some(t) = self.tool(pattern) {
                    add_tool(&mut sel, t);
                }
                if let Some(p) = self.plugin(pattern) {
                    add_plugin(&mut sel, p);
                }
            }
        }
        sel
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
