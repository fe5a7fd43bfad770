// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::collections::BTreeMap;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

use hub_model::ToolDef;

/// A single tool invocation requested by the model.
#[derive(Debug, Clone)]
pub struct ToolCall {
    /// Opaque identifier assigned by the model (forwarded verbatim).
    pub id: String,
    pub name: String,
    /// Parsed JSON arguments.
    pub args: Value,
}

#[derive(Debug, Error)]
pub enum ToolError {
    #[error("unknown tool: {0}")]
    Unknown(String),

    #[error("{0}")]
    Execution(String),
}

impl ToolError {
    pub fn execution(msg: impl Into<String>) -> Self {
        ToolError::Execution(msg.into())
    }
}

/// Execution context handed to every tool.
///
/// Tools that need more than this (agency handles, actor mailboxes) capture
/// those at construction time instead; the context only carries the
/// per-call facts.
#[derive(Debug, Clone, Default)]
pub struct ToolCtx {
    pub agent_id: String,
    pub call_id: String,
    /// Tenant vars as of the start of the step.
    pub vars: BTreeMap<String, Value>,
}

/// Trait every built-in and plugin-registered tool implements.
///
/// `execute` returning `Ok(None)` records neither a finish nor an error
/// event — used by tools (subagent spawns) whose result arrives
/// asynchronously as a later action.
#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;

    fn description(&self) -> &str {
        ""
    }

    /// JSON Schema of the argument object; `None` advertises an open object.
    fn parameters(&self) -> Option<Value> {
        None
    }

    fn tags(&self) -> &[&str] {
        &[]
    }

    /// Variable names this tool reads, surfaced to blueprint authors.
    fn var_hints(&self) -> &[&str] {
        &[]
    }

    async fn execute(&self, args: Value, ctx: &ToolCtx) -> Result<Option<Value>, ToolError>;
}

/// The wire definition advertised to the model for a tool.
pub fn tool_def(tool: &dyn Tool) -> ToolDef {
    ToolDef {
        name: tool.name().to_string(),
        description: {
            let d = tool.description();
            if d.is_empty() {
                None
            } else {
                Some(d.to_string())
            }
        },
        parameters: tool.parameters(),
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
