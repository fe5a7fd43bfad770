// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Parent ↔ child coordination.
//!
//! The `task` tool spawns a child agent and records a waiter row
//! `(token → tool_call_id, child_id)` in the parent; the parent pauses
//! until every waiter has reported.  The child carries an injected
//! `parent = {threadId, token}` var; on completion the reporter plugin
//! sends a `subagent_result` action back to the parent.  The waiter row is
//! the anti-replay record: it is deleted when its token is redeemed.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, warn};
use uuid::Uuid;

use hub_tools::{Plugin, PluginCx, Tool, ToolCtx, ToolError};

use crate::agency_api::AgencyApi;

/// Pause reason used while subagent waiters are outstanding.
pub const PAUSE_REASON_SUBAGENT: &str = "subagent";

/// The var key carrying the parent reference into a child.
pub const PARENT_VAR: &str = "parent";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Waiter {
    pub token: String,
    pub tool_call_id: String,
    pub child_id: String,
}

/// Shared waiter table.  The cell lives in the parent actor; the `task` /
/// `message_agent` tools push rows during a tool batch and the actor
/// persists the table at the batch boundary.
pub type WaiterCell = Arc<Mutex<Vec<Waiter>>>;

fn parent_var(agent_id: &str, token: &str) -> BTreeMap<String, Value> {
    let mut vars = BTreeMap::new();
    vars.insert(
        PARENT_VAR.to_string(),
        json!({ "threadId": agent_id, "token": token }),
    );
    vars
}

/// Spawn a child agent of the given blueprint and wait for its report.
pub struct TaskTool {
    agency: Arc<dyn AgencyApi>,
    agent_id: String,
    waiters: WaiterCell,
}

impl TaskTool {
    pub fn new(agency: Arc<dyn AgencyApi>, agent_id: impl Into<String>, waiters: WaiterCell) -> Self {
        Self {
            agency,
            agent_id: agent_id.into(),
            waiters,
        }
    }
}

#[async_trait]
impl Tool for TaskTool {
    fn name(&self) -> &str {
        "task"
    }

    fn description(&self) -> &str {
        "Delegate a focused task to a subagent of the given type. The run \
         pauses until the subagent reports back; its result arrives as this \
         tool call's response."
    }

    fn parameters(&self) -> Option<Value> {
        Some(json!({
            "type": "object",
            "properties": {
                "description": {
                    "type": "string",
                    "description": "The task for the subagent"
                },
                "subagent_type": {
                    "type": "string",
                    "description": "Blueprint name of the subagent"
                }
            },
            "required": ["description", "subagent_type"]
        }))
    }

    fn tags(&self) -> &[&str] {
        &["subagent"]
    }

    async fn execute(&self, args: Value, ctx: &ToolCtx) -> Result<Option<Value>, ToolError> {
        let description = args["description"]
            .as_str()
            .ok_or_else(|| ToolError::execution("missing 'description'"))?;
        let subagent_type = args["subagent_type"]
            .as_str()
            .ok_or_else(|| ToolError::execution("missing 'subagent_type'"))?;

        let token = Uuid::new_v4().to_string();
        let child_id = self
            .agency
            .spawn_child(
                &self.agent_id,
                subagent_type,
                description,
                parent_var(&self.agent_id, &token),
            )
            .await
            .map_err(|e| ToolError::execution(format!("failed to spawn subagent: {e}")))?;

        debug!(parent = %self.agent_id, child = %child_id, "subagent spawned");
        self.waiters
            .lock()
            .expect("waiter lock poisoned")
            .push(Waiter {
                token,
                tool_call_id: ctx.call_id.clone(),
                child_id,
            });

        // No tool result yet; the report lands asynchronously.
        Ok(None)
    }
}

/// Send a follow-up message to an existing child and wait for its report.
pub struct MessageAgentTool {
    agency: Arc<dyn AgencyApi>,
    agent_id: String,
    waiters: WaiterCell,
}

impl MessageAgentTool {
    pub fn new(agency: Arc<dyn AgencyApi>, agent_id: impl Into<String>, waiters: WaiterCell) -> Self {
        Self {
            agency,
            agent_id: agent_id.into(),
            waiters,
        }
    }
}

#[async_trait]
impl Tool for MessageAgentTool {
    fn name(&self) -> &str {
        "message_agent"
    }

    fn description(&self) -> &str {
        "Send a message to a subagent previously spawned by this agent and \
         wait for its reply."
    }

    fn parameters(&self) -> Option<Value> {
        Some(json!({
            "type": "object",
            "properties": {
                "agent_id": { "type": "string" },
                "message": { "type": "string" }
            },
            "required": ["agent_id", "message"]
        }))
    }

    fn tags(&self) -> &[&str] {
        &["subagent"]
    }

    async fn execute(&self, args: Value, ctx: &ToolCtx) -> Result<Option<Value>, ToolError> {
        let child_id = args["agent_id"]
            .as_str()
            .ok_or_else(|| ToolError::execution("missing 'agent_id'"))?;
        let message = args["message"]
            .as_str()
            .ok_or_else(|| ToolError::execution("missing 'message'"))?;

        if !self.agency.is_child_of(&self.agent_id, child_id).await {
            return Err(ToolError::execution(format!(
                "{child_id} is not a subagent of this agent"
            )));
        }

        let token = Uuid::new_v4().to_string();
        self.agency
            .reinvoke_child(child_id, message, parent_var(&self.agent_id, &token))
            .await
            .map_err(|e| ToolError::execution(format!("failed to message subagent: {e}")))?;

        self.waiters
            .lock()
            .expect("waiter lock poisoned")
            .push(Waiter {
                token,
                tool_call_id: ctx.call_id.clone(),
                child_id: child_id.to_string(),
            });
        Ok(None)
    }
}

/// Runs on the **child**: when its run completes, report the final text to
/// the parent recorded in the injected `parent` var.
pub struct SubagentReporterPlugin {
    agency: Arc<dyn AgencyApi>,
}

impl SubagentReporterPlugin {
    pub fn new(agency: Arc<dyn AgencyApi>) -> Self {
        Self { agency }
    }
}

#[async_trait]
impl Plugin for SubagentReporterPlugin {
    fn name(&self) -> &str {
        "subagent_reporter"
    }

    async fn on_run_complete(
        &self,
        final_text: Option<&str>,
        cx: &mut PluginCx,
    ) -> anyhow::Result<()> {
        let Some(parent) = cx.vars.get(PARENT_VAR) else {
            return Ok(()); // not a subagent
        };
        let (Some(parent_id), Some(token)) =
            (parent["threadId"].as_str(), parent["token"].as_str())
        else {
            warn!(agent = %cx.agent_id, "parent var is malformed; skipping report");
            return Ok(());
        };

        let action = json!({
            "type": "subagent_result",
            "token": token,
            "childId": cx.agent_id,
            "result": final_text.unwrap_or_default(),
        });
        self.agency.send_action(parent_id, action).await;
        Ok(())
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
