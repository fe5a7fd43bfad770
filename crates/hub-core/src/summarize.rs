// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Rolling context summarization.
//!
//! When the projected conversation grows past a threshold, this plugin
//! asks the model for a summary of the older portion before the next turn
//! and injects it as a system fragment, marking the log with a
//! `context_summarized` custom event.  The summarization call observes a
//! hard timeout so a slow model can never wedge the step loop; on timeout
//! or error the turn proceeds without a summary.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use hub_model::{ChatMessage, ModelRequest, Provider};
use hub_tools::{ModelPlan, Plugin, PluginCx};

pub const SUMMARIZED_EVENT: &str = "context_summarized";

const SUMMARY_PROMPT: &str =
    "Summarize the conversation so far in a few sentences. Keep concrete \
     facts, decisions, and unfinished work; drop pleasantries.";

pub struct ContextSummarizerPlugin {
    provider: Arc<dyn Provider>,
    model: String,
    /// Summarize once the conversation exceeds this many messages.
    threshold: usize,
    timeout: Duration,
    /// The latest summary, reused until the conversation outgrows it again.
    summary: Mutex<Option<(usize, String)>>,
}

impl ContextSummarizerPlugin {
    pub fn new(provider: Arc<dyn Provider>, model: impl Into<String>) -> Self {
        Self {
            provider,
            model: model.into(),
            threshold: 40,
            timeout: Duration::from_secs(60),
            summary: Mutex::new(None),
        }
    }

    pub fn with_threshold(mut self, threshold: usize) -> Self {
        self.threshold = threshold;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    async fn summarize(&self, messages: &[ChatMessage]) -> Option<String> {
        let mut history = messages.to_vec();
        history.push(ChatMessage::user(SUMMARY_PROMPT));
        let req = ModelRequest {
            model: self.model.clone(),
            messages: history,
            ..Default::default()
        };
        let cancel = CancellationToken::new();
        let call = self.provider.invoke(&req, &cancel);
        match tokio::time::timeout(self.timeout, call).await {
            Ok(Ok(resp)) => resp.message.text_content(),
            Ok(Err(e)) => {
                warn!("context summarization failed: {e}");
                None
            }
            Err(_) => {
                cancel.cancel();
                warn!(timeout = ?self.timeout, "context summarization timed out");
                None
            }
        }
    }
}

#[async_trait]
impl Plugin for ContextSummarizerPlugin {
    fn name(&self) -> &str {
        "context_summarizer"
    }

    async fn before_model(&self, plan: &mut ModelPlan, cx: &mut PluginCx) -> anyhow::Result<()> {
        let count = cx.messages.len();
        if count < self.threshold {
            return Ok(());
        }

        let cached = {
            let guard = self.summary.lock().expect("summary lock poisoned");
            guard.clone()
        };
        let summary = match cached {
            // Reuse until the conversation grows another threshold's worth.
            Some((at, text)) if count < at + self.threshold => Some(text),
            _ => {
                let fresh = self.summarize(&cx.messages).await;
                if let Some(text) = &fresh {
                    *self.summary.lock().expect("summary lock poisoned") =
                        Some((count, text.clone()));
                    cx.emit(
                        SUMMARIZED_EVENT,
                        json!({ "messageCount": count, "summaryChars": text.len() }),
                    );
                }
                fresh
            }
        };

        if let Some(text) = summary {
            plan.add_system(format!("Summary of the conversation so far:\n{text}"));
        }
        Ok(())
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use hub_model::ScriptedProvider;
    use std::collections::BTreeMap;

    fn cx_with_messages(n: usize) -> PluginCx {
        let mut cx = PluginCx::new("a1", BTreeMap::new());
        cx.messages = (0..n).map(|i| ChatMessage::user(format!("m{i}"))).collect();
        cx
    }

    #[tokio::test]
    async fn below_threshold_is_a_no_op() {
        let provider = Arc::new(ScriptedProvider::always_text("summary"));
        let plugin = ContextSummarizerPlugin::new(provider.clone(), "m").with_threshold(10);
        let mut plan = ModelPlan::new("base", "m");
        let mut cx = cx_with_messages(3);

        plugin.before_model(&mut plan, &mut cx).await.unwrap();
        assert_eq!(plan.system_prompt(), "base");
        assert!(cx.take_custom_events().is_empty());
        assert_eq!(*provider.calls.lock().unwrap(), 0);
    }

    #[tokio::test]
    async fn over_threshold_injects_summary_and_marks_log() {
        let provider = Arc::new(ScriptedProvider::always_text("they discussed rust"));
        let plugin = ContextSummarizerPlugin::new(provider.clone(), "m").with_threshold(5);
        let mut plan = ModelPlan::new("base", "m");
        let mut cx = cx_with_messages(6);

        plugin.before_model(&mut plan, &mut cx).await.unwrap();
        assert!(plan.system_prompt().contains("they discussed rust"));

        let events = cx.take_custom_events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].0, SUMMARIZED_EVENT);
        assert_eq!(events[0].1["messageCount"], 6);
    }

    #[tokio::test]
    async fn summary_is_reused_until_conversation_grows() {
        let provider = Arc::new(ScriptedProvider::new(vec![
            ScriptedProvider::text_response("first summary", 1, 1),
            ScriptedProvider::text_response("second summary", 1, 1),
        ]));
        let plugin = ContextSummarizerPlugin::new(provider.clone(), "m").with_threshold(4);

        let mut plan = ModelPlan::new("base", "m");
        let mut cx = cx_with_messages(4);
        plugin.before_model(&mut plan, &mut cx).await.unwrap();
        assert!(plan.system_prompt().contains("first summary"));

        // Slightly longer conversation: cached summary, no new model call.
        let mut plan = ModelPlan::new("base", "m");
        let mut cx = cx_with_messages(6);
        plugin.before_model(&mut plan, &mut cx).await.unwrap();
        assert!(plan.system_prompt().contains("first summary"));
        assert_eq!(*provider.calls.lock().unwrap(), 1);

        // Past another threshold's worth: re-summarize.
        let mut plan = ModelPlan::new("base", "m");
        let mut cx = cx_with_messages(9);
        plugin.before_model(&mut plan, &mut cx).await.unwrap();
        assert!(plan.system_prompt().contains("second summary"));
    }

    #[tokio::test]
    async fn provider_failure_degrades_to_no_summary() {
        struct Broken;

        #[async_trait]
        impl Provider for Broken {
            fn name(&self) -> &str {
                "broken"
            }
            async fn invoke(
                &self,
                _req: &ModelRequest,
                _cancel: &CancellationToken,
            ) -> Result<hub_model::ModelResponse, hub_model::ProviderError> {
                Err(hub_model::ProviderError::Network("down".into()))
            }
        }

        let plugin = ContextSummarizerPlugin::new(Arc::new(Broken), "m").with_threshold(2);
        let mut plan = ModelPlan::new("base", "m");
        let mut cx = cx_with_messages(5);
        plugin.before_model(&mut plan, &mut cx).await.unwrap();
        assert_eq!(plan.system_prompt(), "base");
        assert!(cx.take_custom_events().is_empty());
    }
}
