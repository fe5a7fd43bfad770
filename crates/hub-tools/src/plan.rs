// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Accumulates system-prompt fragments, tool definitions, and options into
//! one [`ModelRequest`].
//!
//! The plan starts from the blueprint's prompt; each plugin's
//! `before_model` hook may add fragments, tweak options, and register
//! ephemeral tools.  The final system prompt is the blueprint prompt and
//! all added fragments joined by blank lines.

use hub_model::{ChatMessage, ModelRequest, ResponseFormat, ToolChoice, ToolDef};

#[derive(Debug, Clone)]
pub struct ModelPlan {
    base_prompt: String,
    system_parts: Vec<String>,
    pub model: String,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
    pub tool_choice: ToolChoice,
    pub response_format: ResponseFormat,
    pub stop: Option<Vec<String>>,
    tool_defs: Vec<ToolDef>,
}

impl ModelPlan {
    pub fn new(base_prompt: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            base_prompt: base_prompt.into(),
            system_parts: Vec::new(),
            model: model.into(),
            temperature: None,
            max_tokens: None,
            tool_choice: ToolChoice::Auto,
            response_format: ResponseFormat::Text,
            stop: None,
            tool_defs: Vec::new(),
        }
    }

    /// Append a system-prompt fragment after the blueprint prompt.
    pub fn add_system(&mut self, part: impl Into<String>) {
        let part = part.into();
        if !part.trim().is_empty() {
            self.system_parts.push(part);
        }
    }

    pub fn add_tool_def(&mut self, def: ToolDef) {
        self.tool_defs.push(def);
    }

    pub fn system_prompt(&self) -> String {
        let mut parts: Vec<&str> = Vec::with_capacity(1 + self.system_parts.len());
        if !self.base_prompt.trim().is_empty() {
            parts.push(&self.base_prompt);
        }
        parts.extend(self.system_parts.iter().map(String::as_str));
        parts.join("\n\n")
    }

    pub fn build(self, messages: Vec<ChatMessage>) -> ModelRequest {
        let system = self.system_prompt();
        ModelRequest {
            model: self.model,
            system_prompt: if system.is_empty() { None } else { Some(system) },
            messages,
            tool_defs: self.tool_defs,
            tool_choice: self.tool_choice,
            response_format: self.response_format,
            temperature: self.temperature,
            max_tokens: self.max_tokens,
            stop: self.stop,
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
