// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
mod agency_api;
mod agent;
mod blueprint;
mod fork;
mod hitl;
mod subagent;
mod summarize;
#[cfg(test)]
mod tests;

pub use agency_api::{AgencyApi, RelayedEvent};
pub use agent::{AgentActor, AgentConfig, AgentError, AgentHandle, AgentParams, ThreadMetadata};
pub use blueprint::{Blueprint, BlueprintError};
pub use fork::{make_fork_token, verify_fork_token, ForkTokenError, FORK_TOKEN_MAX_AGE_SECS};
pub use hitl::{HitlPlugin, HITL_TOOLS_VAR, PAUSE_REASON_HITL};
pub use subagent::{
    MessageAgentTool, SubagentReporterPlugin, TaskTool, Waiter, WaiterCell, PARENT_VAR,
    PAUSE_REASON_SUBAGENT,
};
pub use summarize::{ContextSummarizerPlugin, SUMMARIZED_EVENT};
