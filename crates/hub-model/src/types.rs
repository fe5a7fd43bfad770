// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

// ─── Message parts ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

/// A single content part in a canonical message.
///
/// The parts form is the storage and projection representation; the flat
/// legacy form (see [`FlatMessage`]) exists for providers and clients that
/// speak plain `content` / `toolCalls` rows.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Part {
    Text {
        text: String,
    },
    Reasoning {
        text: String,
    },
    ToolCall {
        id: String,
        name: String,
        /// Parsed JSON argument object.
        arguments: Value,
    },
    ToolCallResponse {
        id: String,
        /// String or structured object, exactly as the tool returned it.
        response: Value,
    },
    /// Reference to an attached media object (image, file).
    Media {
        url: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        mime: Option<String>,
    },
}

/// Canonical message: a role plus an ordered list of parts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub parts: Vec<Part>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finish_reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ts: Option<DateTime<Utc>>,
}

impl ChatMessage {
    pub fn system(text: impl Into<String>) -> Self {
        Self::text(Role::System, text)
    }

    pub fn user(text: impl Into<String>) -> Self {
        Self::text(Role::User, text)
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self::text(Role::Assistant, text)
    }

    fn text(role: Role, text: impl Into<String>) -> Self {
        Self {
            role,
            parts: vec![Part::Text { text: text.into() }],
            finish_reason: None,
            ts: None,
        }
    }

    /// A role=tool message answering one tool call.
    pub fn tool_response(call_id: impl Into<String>, response: Value) -> Self {
        Self {
            role: Role::Tool,
            parts: vec![Part::ToolCallResponse {
                id: call_id.into(),
                response,
            }],
            finish_reason: None,
            ts: None,
        }
    }

    /// Concatenated text of all `Text` parts, `None` when there are none.
    pub fn text_content(&self) -> Option<String> {
        let chunks: Vec<&str> = self
            .parts
            .iter()
            .filter_map(|p| match p {
                Part::Text { text } => Some(text.as_str()),
                _ => None,
            })
            .collect();
        if chunks.is_empty() {
            None
        } else {
            Some(chunks.join("\n"))
        }
    }

    /// Concatenated reasoning text, `None` when there is none.
    pub fn reasoning_content(&self) -> Option<String> {
        let chunks: Vec<&str> = self
            .parts
            .iter()
            .filter_map(|p| match p {
                Part::Reasoning { text } => Some(text.as_str()),
                _ => None,
            })
            .collect();
        if chunks.is_empty() {
            None
        } else {
            Some(chunks.join("\n"))
        }
    }

    /// All tool calls requested by this message, in order.
    pub fn tool_calls(&self) -> Vec<ToolCallRequest> {
        self.parts
            .iter()
            .filter_map(|p| match p {
                Part::ToolCall {
                    id,
                    name,
                    arguments,
                } => Some(ToolCallRequest {
                    id: id.clone(),
                    name: name.clone(),
                    arguments: arguments.clone(),
                }),
                _ => None,
            })
            .collect()
    }

    /// Structural equality on `(role, parts)` — ignores timestamps and
    /// finish reasons.  Used by the projection to de-duplicate messages
    /// that reappear in a later inference's input.
    pub fn structurally_eq(&self, other: &ChatMessage) -> bool {
        self.role == other.role && self.parts == other.parts
    }
}

/// One tool invocation requested by the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCallRequest {
    pub id: String,
    pub name: String,
    pub arguments: Value,
}

// ─── Legacy flat form ─────────────────────────────────────────────────────────

/// The flat chat row format used by legacy clients and the chat-completions
/// wire dialect: a single `content` string plus optional tool-call fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlatMessage {
    pub role: Role,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(
        default,
        rename = "reasoningContent",
        skip_serializing_if = "Option::is_none"
    )]
    pub reasoning_content: Option<String>,
    #[serde(default, rename = "toolCalls", skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<FlatToolCall>>,
    #[serde(
        default,
        rename = "toolCallId",
        skip_serializing_if = "Option::is_none"
    )]
    pub tool_call_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlatToolCall {
    pub id: String,
    pub name: String,
    pub arguments: Value,
}

// ─── Model request / response ─────────────────────────────────────────────────

/// Tool definition advertised to the model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDef {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// JSON Schema of the argument object.  `None` defaults to an open
    /// object on the wire.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parameters: Option<Value>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub enum ToolChoice {
    #[default]
    Auto,
    /// Force the named function.
    Function(String),
}

#[derive(Debug, Clone, Default, PartialEq)]
pub enum ResponseFormat {
    #[default]
    Text,
    Json,
    Schema(Value),
}

/// A fully assembled model invocation.
#[derive(Debug, Clone, Default)]
pub struct ModelRequest {
    pub model: String,
    pub system_prompt: Option<String>,
    pub messages: Vec<ChatMessage>,
    pub tool_defs: Vec<ToolDef>,
    pub tool_choice: ToolChoice,
    pub response_format: ResponseFormat,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
    pub stop: Option<Vec<String>>,
}

/// Token usage reported by the provider for one call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

/// The outcome of one model call: a single assistant message plus usage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelResponse {
    pub message: ChatMessage,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
