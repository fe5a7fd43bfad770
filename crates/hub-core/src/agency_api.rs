// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! The seam an Agent uses to reach its Agency.
//!
//! Agents never hold the agency actor directly; they talk through this
//! trait so the coupling stays message-shaped and tests can drop in a stub.

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;

/// One agent event relayed to the agency for subscriber fan-out.
#[derive(Debug, Clone)]
pub struct RelayedEvent {
    pub agent_id: String,
    pub agent_type: String,
    /// `{seq, ts, type, data}` wire form.
    pub event: Value,
}

#[async_trait]
pub trait AgencyApi: Send + Sync {
    /// Spawn a child agent of `agent_type`, record the parent relation, and
    /// invoke it with `input`.  `extra_vars` are injected on top of the
    /// tenant vars (the `parent = {threadId, token}` reference travels
    /// here).  Returns the child's id.
    async fn spawn_child(
        &self,
        parent_id: &str,
        agent_type: &str,
        input: &str,
        extra_vars: BTreeMap<String, Value>,
    ) -> anyhow::Result<String>;

    /// Re-invoke an existing agent with a fresh message (used by
    /// `message_agent`).
    async fn reinvoke_child(
        &self,
        child_id: &str,
        input: &str,
        extra_vars: BTreeMap<String, Value>,
    ) -> anyhow::Result<()>;

    /// Whether `child_id` is a child of `parent_id`.
    async fn is_child_of(&self, parent_id: &str, child_id: &str) -> bool;

    /// Deliver a control action to another agent in this agency.
    /// Fire-and-forget: delivery failures are logged by the agency.
    async fn send_action(&self, agent_id: &str, action: Value);

    /// Record a child's completion report on its agency-side record.
    async fn note_child_report(&self, child_id: &str, report: &str);

    /// Proxy one call to a remote tool server.
    async fn call_remote_tool(
        &self,
        server_id: &str,
        tool: &str,
        args: Value,
    ) -> anyhow::Result<Value>;

    /// Open the persistent event channel for a run.  The agency fans
    /// relayed events out to UI subscribers; dropping the sender closes
    /// the channel.
    fn open_relay(&self, agent_id: &str, agent_type: &str)
        -> mpsc::UnboundedSender<RelayedEvent>;
}
