// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Bidirectional converter between the flat legacy chat format and the
//! canonical parts format.
//!
//! The round trip `flat_to_parts → parts_to_flat` is lossless for every
//! representable flat message: plain text for any role, assistant text with
//! reasoning, assistant tool-call lists, and tool responses.  Structured
//! tool responses are stringified on the flat side and re-parsed on the way
//! back.

use serde_json::Value;
use thiserror::Error;

use crate::types::{ChatMessage, FlatMessage, FlatToolCall, Part, Role};

#[derive(Debug, Error)]
pub enum CodecError {
    /// A required field is absent for the message's role.
    #[error("invalid message: {0}")]
    InvalidMessage(String),
}

/// Convert a flat legacy message into the canonical parts form.
pub fn flat_to_parts(flat: &FlatMessage) -> Result<ChatMessage, CodecError> {
    let mut parts = Vec::new();

    match flat.role {
        Role::Tool => {
            let id = flat.tool_call_id.clone().ok_or_else(|| {
                CodecError::InvalidMessage("tool message requires toolCallId".into())
            })?;
            let content = flat.content.clone().ok_or_else(|| {
                CodecError::InvalidMessage("tool message requires content".into())
            })?;
            parts.push(Part::ToolCallResponse {
                id,
                response: parse_tool_response(&content),
            });
        }
        _ => {
            if let Some(reasoning) = &flat.reasoning_content {
                parts.push(Part::Reasoning {
                    text: reasoning.clone(),
                });
            }
            if let Some(content) = &flat.content {
                parts.push(Part::Text {
                    text: content.clone(),
                });
            }
            if let Some(calls) = &flat.tool_calls {
                for c in calls {
                    parts.push(Part::ToolCall {
                        id: c.id.clone(),
                        name: c.name.clone(),
                        arguments: c.arguments.clone(),
                    });
                }
            }
            if parts.is_empty() {
                return Err(CodecError::InvalidMessage(
                    "message carries neither content, reasoning, nor tool calls".into(),
                ));
            }
        }
    }

    Ok(ChatMessage {
        role: flat.role,
        parts,
        finish_reason: None,
        ts: None,
    })
}

/// Convert a canonical message back into the flat legacy form.
pub fn parts_to_flat(msg: &ChatMessage) -> Result<FlatMessage, CodecError> {
    if msg.role == Role::Tool {
        let (id, response) = msg
            .parts
            .iter()
            .find_map(|p| match p {
                Part::ToolCallResponse { id, response } => Some((id.clone(), response)),
                _ => None,
            })
            .ok_or_else(|| {
                CodecError::InvalidMessage("tool message requires a tool_call_response part".into())
            })?;
        return Ok(FlatMessage {
            role: Role::Tool,
            content: Some(stringify_tool_response(response)),
            reasoning_content: None,
            tool_calls: None,
            tool_call_id: Some(id),
        });
    }

    let content = msg.text_content();
    let reasoning_content = msg.reasoning_content();
    let calls: Vec<FlatToolCall> = msg
        .parts
        .iter()
        .filter_map(|p| match p {
            Part::ToolCall {
                id,
                name,
                arguments,
            } => Some(FlatToolCall {
                id: id.clone(),
                name: name.clone(),
                arguments: arguments.clone(),
            }),
            _ => None,
        })
        .collect();

    if content.is_none() && reasoning_content.is_none() && calls.is_empty() {
        return Err(CodecError::InvalidMessage(
            "message carries neither content, reasoning, nor tool calls".into(),
        ));
    }

    Ok(FlatMessage {
        role: msg.role,
        content,
        reasoning_content,
        tool_calls: if calls.is_empty() { None } else { Some(calls) },
        tool_call_id: None,
    })
}

/// A tool response arrives on the flat side as a string.  Structured
/// responses (objects, arrays) were stringified by [`stringify_tool_response`]
/// and are re-parsed here; everything else stays a plain string.
fn parse_tool_response(content: &str) -> Value {
    match serde_json::from_str::<Value>(content) {
        Ok(v @ (Value::Object(_) | Value::Array(_))) => v,
        _ => Value::String(content.to_string()),
    }
}

fn stringify_tool_response(response: &Value) -> String {
    match response {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
