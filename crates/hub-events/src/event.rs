// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! The event sum type.
//!
//! Events are persisted as `(seq, ts, type, data)` rows; `seq` is assigned
//! at append time and is the per-agent total order.  The `type` column is a
//! plain string so that plugin-defined event kinds remain valid: a kind the
//! runtime does not know decodes to [`EventBody::Custom`] and is an identity
//! transition for the projection.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use hub_model::{ChatMessage, ToolCallRequest, Usage};

/// One appended record in an agent's log.
#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    pub seq: u64,
    pub ts: DateTime<Utc>,
    pub body: EventBody,
}

impl Event {
    /// Wire shape used by `/events` and the relay: `{seq, ts, type, data}`.
    pub fn to_json(&self) -> Value {
        let (kind, data) = self.body.encode();
        serde_json::json!({
            "seq": self.seq,
            "ts": self.ts,
            "type": kind,
            "data": data,
        })
    }

    /// Parse the wire shape back into an event.  `None` when `seq` or
    /// `type` is missing.
    pub fn from_json(v: &Value) -> Option<Event> {
        let seq = v["seq"].as_u64()?;
        let kind = v["type"].as_str()?;
        let ts = v["ts"]
            .as_str()
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            .map(|t| t.with_timezone(&Utc))
            .unwrap_or_default();
        Some(Event {
            seq,
            ts,
            body: EventBody::decode(kind, v["data"].clone()),
        })
    }
}

// ─── Event kinds ──────────────────────────────────────────────────────────────

pub const AGENT_INVOKED: &str = "agent_invoked";
pub const AGENT_STEP: &str = "agent_step";
pub const AGENT_PAUSED: &str = "agent_paused";
pub const AGENT_RESUMED: &str = "agent_resumed";
pub const AGENT_COMPLETED: &str = "agent_completed";
pub const AGENT_CANCELED: &str = "agent_canceled";
pub const AGENT_ERROR: &str = "agent_error";
pub const USER_MESSAGE: &str = "user_message";
pub const INFERENCE_DETAILS: &str = "inference_details";
pub const CONTENT_MESSAGE: &str = "content_message";
pub const TOOL_START: &str = "tool_start";
pub const TOOL_FINISH: &str = "tool_finish";
pub const TOOL_ERROR: &str = "tool_error";
pub const SYSTEM_MARKER: &str = "system_marker";

/// One full model call captured as a single event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InferenceData {
    pub input_messages: Vec<ChatMessage>,
    pub output_messages: Vec<ChatMessage>,
    #[serde(default)]
    pub usage: Usage,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finish_reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolStartData {
    pub call_id: String,
    pub name: String,
    pub arguments: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolFinishData {
    pub call_id: String,
    pub response: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolErrorData {
    pub call_id: String,
    pub kind: String,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentErrorData {
    pub kind: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum EventBody {
    /// A run was started (or restarted) for this agent.
    Invoked,
    /// The step loop began iteration `step` (0-based).
    Step { step: u32 },
    Paused { reason: String },
    Resumed,
    Completed { final_text: Option<String> },
    Canceled,
    Error(AgentErrorData),
    /// A message supplied by the user (or schedule input).
    UserMessage { message: ChatMessage },
    Inference(InferenceData),
    /// Redundant convenience copy of the assistant output for UIs.
    ContentMessage { message: ChatMessage },
    ToolStart(ToolStartData),
    ToolFinish(ToolFinishData),
    ToolError(ToolErrorData),
    SystemMarker { text: String },
    /// A kind this runtime does not know (plugin-defined, or from a newer
    /// version).  Preserved verbatim.
    Custom { kind: String, data: Value },
}

impl EventBody {
    pub fn kind(&self) -> &str {
        match self {
            EventBody::Invoked => AGENT_INVOKED,
            EventBody::Step { .. } => AGENT_STEP,
            EventBody::Paused { .. } => AGENT_PAUSED,
            EventBody::Resumed => AGENT_RESUMED,
            EventBody::Completed { .. } => AGENT_COMPLETED,
            EventBody::Canceled => AGENT_CANCELED,
            EventBody::Error(_) => AGENT_ERROR,
            EventBody::UserMessage { .. } => USER_MESSAGE,
            EventBody::Inference(_) => INFERENCE_DETAILS,
            EventBody::ContentMessage { .. } => CONTENT_MESSAGE,
            EventBody::ToolStart(_) => TOOL_START,
            EventBody::ToolFinish(_) => TOOL_FINISH,
            EventBody::ToolError(_) => TOOL_ERROR,
            EventBody::SystemMarker { .. } => SYSTEM_MARKER,
            EventBody::Custom { kind, .. } => kind,
        }
    }

    /// Split into the `(type, data)` storage columns.
    pub fn encode(&self) -> (String, Value) {
        let kind = self.kind().to_string();
        let data = match self {
            EventBody::Invoked | EventBody::Resumed | EventBody::Canceled => {
                Value::Object(Default::default())
            }
            EventBody::Step { step } => serde_json::json!({ "step": step }),
            EventBody::Paused { reason } => serde_json::json!({ "reason": reason }),
            EventBody::Completed { final_text } => {
                serde_json::json!({ "finalText": final_text })
            }
            EventBody::Error(d) => to_value(d),
            EventBody::UserMessage { message } => serde_json::json!({ "message": message }),
            EventBody::Inference(d) => to_value(d),
            EventBody::ContentMessage { message } => serde_json::json!({ "message": message }),
            EventBody::ToolStart(d) => to_value(d),
            EventBody::ToolFinish(d) => to_value(d),
            EventBody::ToolError(d) => to_value(d),
            EventBody::SystemMarker { text } => serde_json::json!({ "text": text }),
            EventBody::Custom { data, .. } => data.clone(),
        };
        (kind, data)
    }

    /// Reassemble from the storage columns.  A kind the runtime does not
    /// recognize — or a payload that no longer parses — decodes to
    /// [`EventBody::Custom`] rather than failing.
    pub fn decode(kind: &str, data: Value) -> EventBody {
        let custom = |data: Value| EventBody::Custom {
            kind: kind.to_string(),
            data,
        };
        match kind {
            AGENT_INVOKED => EventBody::Invoked,
            AGENT_RESUMED => EventBody::Resumed,
            AGENT_CANCELED => EventBody::Canceled,
            AGENT_STEP => match data["step"].as_u64() {
                Some(step) => EventBody::Step { step: step as u32 },
                None => custom(data),
            },
            AGENT_PAUSED => match data["reason"].as_str() {
                Some(reason) => EventBody::Paused {
                    reason: reason.to_string(),
                },
                None => custom(data),
            },
            AGENT_COMPLETED => EventBody::Completed {
                final_text: data["finalText"].as_str().map(str::to_string),
            },
            AGENT_ERROR => from_value(data, EventBody::Error, custom),
            USER_MESSAGE => match serde_json::from_value(data["message"].clone()) {
                Ok(message) => EventBody::UserMessage { message },
                Err(_) => custom(data),
            },
            INFERENCE_DETAILS => from_value(data, EventBody::Inference, custom),
            CONTENT_MESSAGE => match serde_json::from_value(data["message"].clone()) {
                Ok(message) => EventBody::ContentMessage { message },
                Err(_) => custom(data),
            },
            TOOL_START => from_value(data, EventBody::ToolStart, custom),
            TOOL_FINISH => from_value(data, EventBody::ToolFinish, custom),
            TOOL_ERROR => from_value(data, EventBody::ToolError, custom),
            SYSTEM_MARKER => match data["text"].as_str() {
                Some(text) => EventBody::SystemMarker {
                    text: text.to_string(),
                },
                None => custom(data),
            },
            _ => custom(data),
        }
    }
}

fn to_value<T: Serialize>(payload: &T) -> Value {
    serde_json::to_value(payload).unwrap_or(Value::Null)
}

fn from_value<T, F, C>(data: Value, wrap: F, custom: C) -> EventBody
where
    T: for<'de> Deserialize<'de>,
    F: FnOnce(T) -> EventBody,
    C: FnOnce(Value) -> EventBody,
{
    match serde_json::from_value::<T>(data.clone()) {
        Ok(payload) => wrap(payload),
        Err(_) => custom(data),
    }
}

// ─── Run state ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    #[default]
    Idle,
    Registered,
    Running,
    Paused,
    Completed,
    Canceled,
    Error,
}

impl RunStatus {
    /// Terminal states do not tick again without an explicit re-invoke.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunStatus::Completed | RunStatus::Canceled | RunStatus::Error
        )
    }
}

/// Lifecycle record persisted in the agent KV under `_runState`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct RunState {
    pub status: RunStatus,
    pub step: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Pending tool-call queue helper used by both the projection and the actor.
pub fn remove_pending(pending: &mut Vec<ToolCallRequest>, call_id: &str) {
    pending.retain(|c| c.id != call_id);
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
