// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Human-in-the-loop approval gate.
//!
//! When the `HITL_TOOLS` var lists tool names, any model turn requesting
//! one of them pauses the run with reason `hitl` before execution.  An
//! `approve` action resumes it, optionally with modified tool calls; a
//! denial records error responses for the gated calls.

use async_trait::async_trait;

use hub_model::ModelResponse;
use hub_tools::{Plugin, PluginCx};

pub const PAUSE_REASON_HITL: &str = "hitl";
pub const HITL_TOOLS_VAR: &str = "HITL_TOOLS";

pub struct HitlPlugin;

#[async_trait]
impl Plugin for HitlPlugin {
    fn name(&self) -> &str {
        "hitl"
    }

    fn var_hints(&self) -> &[&str] {
        &[HITL_TOOLS_VAR]
    }

    async fn on_model_result(
        &self,
        resp: &ModelResponse,
        cx: &mut PluginCx,
    ) -> anyhow::Result<()> {
        let Some(gated) = cx.vars.get(HITL_TOOLS_VAR).and_then(|v| v.as_array()) else {
            return Ok(());
        };
        let gated: Vec<&str> = gated.iter().filter_map(|v| v.as_str()).collect();
        if gated.is_empty() {
            return Ok(());
        }

        let needs_approval = resp
            .message
            .tool_calls()
            .iter()
            .any(|c| gated.contains(&c.name.as_str()));
        if needs_approval {
            cx.request_pause(PAUSE_REASON_HITL);
        }
        Ok(())
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
