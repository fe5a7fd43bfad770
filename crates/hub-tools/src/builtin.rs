// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Default tool set and stock plugins.
//!
//! Blueprints opt in with the `@default` capability tag.

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::plugin::{Plugin, PluginCx};
use crate::tool::{Tool, ToolCtx, ToolError};

/// Returns its `text` argument unchanged.
pub struct EchoTool;

#[async_trait]
impl Tool for EchoTool {
    fn name(&self) -> &str {
        "echo"
    }

    fn description(&self) -> &str {
        "Echo the given text back verbatim."
    }

    fn parameters(&self) -> Option<Value> {
        Some(json!({
            "type": "object",
            "properties": {
                "text": { "type": "string", "description": "Text to echo" }
            },
            "required": ["text"]
        }))
    }

    fn tags(&self) -> &[&str] {
        &["default"]
    }

    async fn execute(&self, args: Value, _ctx: &ToolCtx) -> Result<Option<Value>, ToolError> {
        let text = args["text"]
            .as_str()
            .ok_or_else(|| ToolError::execution("missing 'text'"))?;
        Ok(Some(json!(text)))
    }
}

/// Adds two numbers; returns `{result}`.
pub struct AddTool;

#[async_trait]
impl Tool for AddTool {
    fn name(&self) -> &str {
        "add"
    }

    fn description(&self) -> &str {
        "Add two numbers a and b."
    }

    fn parameters(&self) -> Option<Value> {
        Some(json!({
            "type": "object",
            "properties": {
                "a": { "type": "number" },
                "b": { "type": "number" }
            },
            "required": ["a", "b"]
        }))
    }

    fn tags(&self) -> &[&str] {
        &["default", "math"]
    }

    async fn execute(&self, args: Value, _ctx: &ToolCtx) -> Result<Option<Value>, ToolError> {
        let a = args["a"]
            .as_f64()
            .ok_or_else(|| ToolError::execution("missing number 'a'"))?;
        let b = args["b"]
            .as_f64()
            .ok_or_else(|| ToolError::execution("missing number 'b'"))?;
        let sum = a + b;
        // Integer inputs produce an integer result.
        let result = if sum.fract() == 0.0 && sum.abs() < i64::MAX as f64 {
            json!(sum as i64)
        } else {
            json!(sum)
        };
        Ok(Some(json!({ "result": result })))
    }
}

/// Marker plugin: its presence on an agent enables `$NAME` substitution in
/// tool-call arguments (see [`crate::vars::substitute_args`]).
pub struct VarsPlugin;

pub const VARS_PLUGIN: &str = "vars";

#[async_trait]
impl Plugin for VarsPlugin {
    fn name(&self) -> &str {
        VARS_PLUGIN
    }

    fn tags(&self) -> &[&str] {
        &["default"]
    }

    async fn on_init(&self, _cx: &mut PluginCx) -> anyhow::Result<()> {
        Ok(())
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
