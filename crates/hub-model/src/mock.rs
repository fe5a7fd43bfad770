// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::provider::{Provider, ProviderError};
use crate::types::{ChatMessage, ModelRequest, ModelResponse, Part, Role, Usage};

/// Deterministic mock provider for tests.  Echoes the last user message
/// back as the assistant response.
#[derive(Default)]
pub struct MockProvider;

#[async_trait]
impl Provider for MockProvider {
    fn name(&self) -> &str {
        "mock"
    }

    async fn invoke(
        &self,
        req: &ModelRequest,
        _cancel: &CancellationToken,
    ) -> Result<ModelResponse, ProviderError> {
        let reply = req
            .messages
            .iter()
            .rev()
            .find(|m| m.role == Role::User)
            .and_then(|m| m.text_content())
            .unwrap_or_else(|| "[no input]".into());
        Ok(ModelResponse {
            message: ChatMessage::assistant(format!("MOCK: {reply}")),
            usage: Some(Usage {
                input_tokens: 10,
                output_tokens: 10,
            }),
        })
    }
}

/// A pre-scripted provider.  Each `invoke` pops the next response from the
/// front of the queue, so tests can specify exact call sequences —
/// including tool calls — without network access.
pub struct ScriptedProvider {
    scripts: Mutex<Vec<ModelResponse>>,
    /// The last [`ModelRequest`] seen.  Written on each `invoke` so tests
    /// can inspect what the agent actually sent.
    pub last_request: Arc<Mutex<Option<ModelRequest>>>,
    /// Number of `invoke` calls served so far.
    pub calls: Arc<Mutex<usize>>,
}

impl ScriptedProvider {
    pub fn new(scripts: Vec<ModelResponse>) -> Self {
        Self {
            scripts: Mutex::new(scripts),
            last_request: Arc::new(Mutex::new(None)),
            calls: Arc::new(Mutex::new(0)),
        }
    }

    /// Convenience: a provider that answers every call with the same text.
    pub fn always_text(reply: impl Into<String>) -> Self {
        Self::new(vec![Self::text_response(reply, 5, 5)])
    }

    /// A plain assistant text response with the given usage.
    pub fn text_response(text: impl Into<String>, input: u64, output: u64) -> ModelResponse {
        ModelResponse {
            message: ChatMessage {
                role: Role::Assistant,
                parts: vec![Part::Text { text: text.into() }],
                finish_reason: Some("stop".into()),
                ts: None,
            },
            usage: Some(Usage {
                input_tokens: input,
                output_tokens: output,
            }),
        }
    }

    /// An assistant response consisting of one tool call.
    pub fn tool_call_response(
        id: impl Into<String>,
        name: impl Into<String>,
        arguments: Value,
    ) -> ModelResponse {
        ModelResponse {
            message: ChatMessage {
                role: Role::Assistant,
                parts: vec![Part::ToolCall {
                    id: id.into(),
                    name: name.into(),
                    arguments,
                }],
                finish_reason: Some("tool_calls".into()),
                ts: None,
            },
            usage: Some(Usage {
                input_tokens: 5,
                output_tokens: 5,
            }),
        }
    }
}

#[async_trait]
impl Provider for ScriptedProvider {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn invoke(
        &self,
        req: &ModelRequest,
        cancel: &CancellationToken,
    ) -> Result<ModelResponse, ProviderError> {
        if cancel.is_cancelled() {
            return Err(ProviderError::Canceled);
        }
        *self.last_request.lock().unwrap() = Some(req.clone());
        *self.calls.lock().unwrap() += 1;
        let mut scripts = self.scripts.lock().unwrap();
        if scripts.is_empty() {
            // Fallback once all scripts are consumed.
            return Ok(Self::text_response("[no more scripts]", 0, 0));
        }
        Ok(scripts.remove(0))
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
