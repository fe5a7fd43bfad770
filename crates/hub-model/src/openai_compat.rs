// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Driver for the chat-completions wire dialect.
//!
//! Every OpenAI-compatible service speaks this format: a JSON `messages`
//! array, `tools` as `{type:"function", function:{…}}` entries, tool calls
//! on assistant turns, tool results as role=`tool` rows.  This driver maps
//! [`ModelRequest`] onto that dialect, with bounded retry (see
//! [`RetryPolicy`]) and cooperative cancellation.

use std::collections::BTreeMap;

use chrono::Utc;
use futures::StreamExt;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::codec::parts_to_flat;
use crate::provider::{DeltaFn, Provider, ProviderError};
use crate::retry::{parse_retry_after, RetryPolicy};
use crate::types::{
    ChatMessage, ModelRequest, ModelResponse, Part, ResponseFormat, Role, ToolChoice, Usage,
};

const DEFAULT_API_BASE: &str = "https://api.openai.com/v1";

pub struct ChatCompletionsProvider {
    api_key: Option<String>,
    chat_url: String,
    client: reqwest::Client,
    policy: RetryPolicy,
}

impl ChatCompletionsProvider {
    pub fn new(api_base: &str, api_key: Option<String>, policy: RetryPolicy) -> Self {
        let base = api_base.trim_end_matches('/');
        Self {
            api_key,
            chat_url: format!("{base}/chat/completions"),
            client: reqwest::Client::new(),
            policy,
        }
    }

    /// Resolve `LLM_API_BASE` / `LLM_API_KEY` and the `LLM_RETRY_*` knobs.
    pub fn from_env() -> Self {
        let base = std::env::var("LLM_API_BASE").unwrap_or_else(|_| DEFAULT_API_BASE.into());
        let key = std::env::var("LLM_API_KEY").ok();
        Self::new(&base, key, RetryPolicy::from_env())
    }

    fn build_body(&self, req: &ModelRequest, stream: bool) -> Result<Value, ProviderError> {
        let mut messages: Vec<Value> = Vec::with_capacity(req.messages.len() + 1);
        if let Some(sys) = &req.system_prompt {
            messages.push(json!({ "role": "system", "content": sys }));
        }
        for m in &req.messages {
            messages.push(wire_message(m)?);
        }

        let mut body = json!({
            "model": req.model,
            "messages": messages,
        });

        if !req.tool_defs.is_empty() {
            let tools: Vec<Value> = req
                .tool_defs
                .iter()
                .map(|t| {
                    json!({
                        "type": "function",
                        "function": {
                            "name": t.name,
                            "description": t.description.clone().unwrap_or_default(),
                            // An absent schema defaults to an open object.
                            "parameters": t.parameters.clone()
                                .unwrap_or_else(|| json!({ "type": "object", "properties": {} })),
                        }
                    })
                })
                .collect();
            body["tools"] = json!(tools);
            match &req.tool_choice {
                ToolChoice::Auto => {}
                ToolChoice::Function(name) => {
                    body["tool_choice"] =
                        json!({ "type": "function", "function": { "name": name } });
                }
            }
        }

        match &req.response_format {
            ResponseFormat::Text => {}
            ResponseFormat::Json => {
                body["response_format"] = json!({ "type": "json_object" });
            }
            ResponseFormat::Schema(schema) => {
                body["response_format"] = json!({
                    "type": "json_schema",
                    "json_schema": { "name": "response", "schema": schema },
                });
            }
        }

        if let Some(t) = req.temperature {
            body["temperature"] = json!(t);
        }
        if let Some(max) = req.max_tokens {
            body["max_tokens"] = json!(max);
        }
        if let Some(stop) = &req.stop {
            body["stop"] = json!(stop);
        }
        if stream {
            body["stream"] = json!(true);
            body["stream_options"] = json!({ "include_usage": true });
        }
        Ok(body)
    }

    /// POST the request, retrying retryable statuses per the policy.
    /// Returns the successful `reqwest::Response`; errors are final.
    async fn post_with_retry(
        &self,
        body: &Value,
        cancel: &CancellationToken,
    ) -> Result<reqwest::Response, ProviderError> {
        let mut attempt: u32 = 0;
        loop {
            if cancel.is_cancelled() {
                return Err(ProviderError::Canceled);
            }

            let mut http = self.client.post(&self.chat_url).json(body);
            if let Some(key) = &self.api_key {
                http = http.bearer_auth(key);
            }

            let sent = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(ProviderError::Canceled),
                resp = http.send() => resp,
            };

            let resp = match sent {
                Ok(r) => r,
                Err(e) => {
                    // Transport failures retry on the same schedule as 5xx.
                    if attempt >= self.policy.max_retries {
                        return Err(ProviderError::Network(e.to_string()));
                    }
                    let delay = self.policy.delay(attempt, None);
                    warn!(attempt, ?delay, "model request failed, retrying: {e}");
                    attempt += 1;
                    sleep_or_cancel(delay, cancel).await?;
                    continue;
                }
            };

            let status = resp.status().as_u16();
            if resp.status().is_success() {
                return Ok(resp);
            }

            let retry_after = resp
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| parse_retry_after(v, Utc::now()));
            let body_text = resp.text().await.unwrap_or_default();

            if !self.policy.is_retryable(status) || attempt >= self.policy.max_retries {
                return Err(ProviderError::Http {
                    status,
                    body: body_text,
                });
            }

            let delay = self.policy.delay(attempt, retry_after);
            warn!(status, attempt, ?delay, "retryable model error, backing off");
            attempt += 1;
            sleep_or_cancel(delay, cancel).await?;
        }
    }
}

async fn sleep_or_cancel(
    delay: std::time::Duration,
    cancel: &CancellationToken,
) -> Result<(), ProviderError> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(ProviderError::Canceled),
        _ = tokio::time::sleep(delay) => Ok(()),
    }
}

#[async_trait::async_trait]
impl Provider for ChatCompletionsProvider {
    fn name(&self) -> &str {
        "chat-completions"
    }

    async fn invoke(
        &self,
        req: &ModelRequest,
        cancel: &CancellationToken,
    ) -> Result<ModelResponse, ProviderError> {
        let body = self.build_body(req, false)?;
        debug!(model = %req.model, messages = req.messages.len(), tools = req.tool_defs.len(),
               "sending completion request");

        let resp = self.post_with_retry(&body, cancel).await?;
        let payload: Value = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(ProviderError::Canceled),
            v = resp.json::<Value>() => v.map_err(|e| ProviderError::InvalidResponse(e.to_string()))?,
        };
        parse_completion(&payload)
    }

    async fn stream(
        &self,
        req: &ModelRequest,
        on_delta: DeltaFn<'_>,
        cancel: &CancellationToken,
    ) -> Result<ModelResponse, ProviderError> {
        let body = self.build_body(req, true)?;
        let resp = self.post_with_retry(&body, cancel).await?;

        let mut byte_stream = resp.bytes_stream();
        let mut line_buf = String::new();
        let mut acc = StreamAccumulator::default();

        loop {
            let chunk = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(ProviderError::Canceled),
                c = byte_stream.next() => c,
            };
            let Some(chunk) = chunk else { break };
            let bytes = chunk.map_err(|e| ProviderError::Network(e.to_string()))?;
            line_buf.push_str(&String::from_utf8_lossy(&bytes));

            // SSE events can split across TCP packets; only consume complete lines.
            while let Some(pos) = line_buf.find('\n') {
                let line: String = line_buf.drain(..=pos).collect();
                let Some(data) = line.trim().strip_prefix("data: ") else {
                    continue;
                };
                if data == "[DONE]" {
                    continue;
                }
                let Ok(v) = serde_json::from_str::<Value>(data) else {
                    continue;
                };
                acc.consume(&v, on_delta);
            }
        }

        Ok(acc.finish())
    }
}

// ─── Wire mapping ─────────────────────────────────────────────────────────────

/// Map a canonical message onto one chat-completions row.
///
/// Assistant tool calls become a `tool_calls` array with empty content;
/// tool responses become role=`tool` rows keyed by `tool_call_id`.
fn wire_message(m: &ChatMessage) -> Result<Value, ProviderError> {
    let flat = parts_to_flat(m).map_err(|e| ProviderError::InvalidResponse(e.to_string()))?;

    let role = match m.role {
        Role::System => "system",
        Role::User => "user",
        Role::Assistant => "assistant",
        Role::Tool => "tool",
    };

    let mut row = json!({ "role": role });
    match m.role {
        Role::Tool => {
            row["tool_call_id"] = json!(flat.tool_call_id);
            row["content"] = json!(flat.content.unwrap_or_default());
        }
        Role::Assistant => {
            row["content"] = json!(flat.content.unwrap_or_default());
            if let Some(calls) = flat.tool_calls {
                let wire: Vec<Value> = calls
                    .iter()
                    .map(|c| {
                        json!({
                            "id": c.id,
                            "type": "function",
                            "function": {
                                "name": c.name,
                                "arguments": c.arguments.to_string(),
                            }
                        })
                    })
                    .collect();
                row["tool_calls"] = json!(wire);
            }
        }
        _ => {
            row["content"] = json!(flat.content.unwrap_or_default());
        }
    }
    Ok(row)
}

/// Parse a non-streaming completion payload into a [`ModelResponse`].
fn parse_completion(payload: &Value) -> Result<ModelResponse, ProviderError> {
    let choice = payload["choices"]
        .get(0)
        .ok_or_else(|| ProviderError::InvalidResponse("no choices in response".into()))?;
    let wire_msg = &choice["message"];

    let mut parts = Vec::new();
    if let Some(reasoning) = wire_msg["reasoning_content"].as_str() {
        if !reasoning.is_empty() {
            parts.push(Part::Reasoning {
                text: reasoning.to_string(),
            });
        }
    }
    if let Some(text) = wire_msg["content"].as_str() {
        if !text.is_empty() {
            parts.push(Part::Text {
                text: text.to_string(),
            });
        }
    }
    if let Some(calls) = wire_msg["tool_calls"].as_array() {
        for c in calls {
            let id = c["id"].as_str().unwrap_or_default().to_string();
            let name = c["function"]["name"]
                .as_str()
                .ok_or_else(|| ProviderError::InvalidResponse("tool call without name".into()))?
                .to_string();
            let raw_args = c["function"]["arguments"].as_str().unwrap_or("{}");
            let arguments = serde_json::from_str(raw_args)
                .unwrap_or_else(|_| Value::Object(Default::default()));
            parts.push(Part::ToolCall {
                id,
                name,
                arguments,
            });
        }
    }
    if parts.is_empty() {
        return Err(ProviderError::InvalidResponse(
            "completion carried neither content nor tool calls".into(),
        ));
    }

    let finish_reason = choice["finish_reason"].as_str().map(str::to_string);
    let usage = parse_usage(&payload["usage"]);

    Ok(ModelResponse {
        message: ChatMessage {
            role: Role::Assistant,
            parts,
            finish_reason,
            ts: Some(Utc::now()),
        },
        usage,
    })
}

fn parse_usage(v: &Value) -> Option<Usage> {
    let input = v["prompt_tokens"].as_u64()?;
    let output = v["completion_tokens"].as_u64().unwrap_or(0);
    Some(Usage {
        input_tokens: input,
        output_tokens: output,
    })
}

// ─── Streaming accumulator ───────────────────────────────────────────────────

#[derive(Default)]
struct StreamAccumulator {
    text: String,
    reasoning: String,
    /// Keyed by the parallel-tool-call index; arguments arrive as JSON
    /// fragments across deltas.
    tool_calls: BTreeMap<u64, (String, String, String)>,
    finish_reason: Option<String>,
    usage: Option<Usage>,
}

impl StreamAccumulator {
    fn consume(&mut self, chunk: &Value, on_delta: DeltaFn<'_>) {
        if let Some(u) = parse_usage(&chunk["usage"]) {
            self.usage = Some(u);
        }
        let Some(choice) = chunk["choices"].get(0) else {
            return;
        };
        if let Some(reason) = choice["finish_reason"].as_str() {
            self.finish_reason = Some(reason.to_string());
        }
        let delta = &choice["delta"];
        if let Some(t) = delta["content"].as_str() {
            if !t.is_empty() {
                self.text.push_str(t);
                on_delta(t);
            }
        }
        if let Some(t) = delta["reasoning_content"].as_str() {
            self.reasoning.push_str(t);
        }
        if let Some(calls) = delta["tool_calls"].as_array() {
            for c in calls {
                let index = c["index"].as_u64().unwrap_or(0);
                let entry = self.tool_calls.entry(index).or_default();
                if let Some(id) = c["id"].as_str() {
                    entry.0.push_str(id);
                }
                if let Some(name) = c["function"]["name"].as_str() {
                    entry.1.push_str(name);
                }
                if let Some(args) = c["function"]["arguments"].as_str() {
                    entry.2.push_str(args);
                }
            }
        }
    }

    fn finish(self) -> ModelResponse {
        let mut parts = Vec::new();
        if !self.reasoning.is_empty() {
            parts.push(Part::Reasoning {
                text: self.reasoning,
            });
        }
        if !self.text.is_empty() {
            parts.push(Part::Text { text: self.text });
        }
        for (_, (id, name, args)) in self.tool_calls {
            if name.is_empty() {
                warn!(call_id = %id, "dropping streamed tool call with empty name");
                continue;
            }
            let arguments = serde_json::from_str(&args)
                .unwrap_or_else(|_| Value::Object(Default::default()));
            parts.push(Part::ToolCall {
                id,
                name,
                arguments,
            });
        }
        ModelResponse {
            message: ChatMessage {
                role: Role::Assistant,
                parts,
                finish_reason: self.finish_reason,
                ts: Some(Utc::now()),
            },
            usage: self.usage,
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
