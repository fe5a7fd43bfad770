// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Plugin hooks and their dispatch host.
//!
//! A plugin is a bag of optional hooks extending one agent's behavior.
//! Hook failures are logged and swallowed — a misbehaving plugin never
//! takes the run down.  Hooks communicate with the step loop through the
//! [`PluginCx`] they all share within one dispatch: pause requests,
//! ephemeral tool registrations, and custom events to append to the log.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tracing::warn;

use hub_events::Event;
use hub_model::{ChatMessage, ModelResponse};

use crate::plan::ModelPlan;
use crate::tool::{Tool, ToolCall};

/// Mutable per-dispatch context shared by all hooks of one agent.
#[derive(Default)]
pub struct PluginCx {
    pub agent_id: String,
    /// Tenant vars visible to this agent.
    pub vars: BTreeMap<String, Value>,
    /// Read-only snapshot of the projected conversation at dispatch time.
    pub messages: Vec<ChatMessage>,
    pause: Option<String>,
    ephemeral: Vec<Arc<dyn Tool>>,
    custom_events: Vec<(String, Value)>,
}

impl PluginCx {
    pub fn new(agent_id: impl Into<String>, vars: BTreeMap<String, Value>) -> Self {
        Self {
            agent_id: agent_id.into(),
            vars,
            ..Default::default()
        }
    }

    /// Ask the step loop to transition the agent to `paused(reason)`.
    /// The first request wins within a dispatch.
    pub fn request_pause(&mut self, reason: impl Into<String>) {
        if self.pause.is_none() {
            self.pause = Some(reason.into());
        }
    }

    pub fn take_pause(&mut self) -> Option<String> {
        self.pause.take()
    }

    /// Register a tool that lives only for the remainder of this step cycle.
    pub fn register_tool(&mut self, tool: Arc<dyn Tool>) {
        self.ephemeral.push(tool);
    }

    pub fn take_ephemeral(&mut self) -> Vec<Arc<dyn Tool>> {
        std::mem::take(&mut self.ephemeral)
    }

    /// Append a plugin-defined event to the agent's log.
    pub fn emit(&mut self, kind: impl Into<String>, data: Value) {
        self.custom_events.push((kind.into(), data));
    }

    pub fn take_custom_events(&mut self) -> Vec<(String, Value)> {
        std::mem::take(&mut self.custom_events)
    }
}

/// All hooks default to no-ops; implement only what the plugin needs.
/// Returned errors are logged by the host and never propagate.
#[async_trait]
pub trait Plugin: Send + Sync {
    fn name(&self) -> &str;

    fn tags(&self) -> &[&str] {
        &[]
    }

    fn var_hints(&self) -> &[&str] {
        &[]
    }

    /// Once, when the agent first registers.
    async fn on_init(&self, _cx: &mut PluginCx) -> anyhow::Result<()> {
        Ok(())
    }

    /// At the top of every step.
    async fn on_tick(&self, _cx: &mut PluginCx) -> anyhow::Result<()> {
        Ok(())
    }

    /// Before the model call: may add system fragments, tweak options, and
    /// register ephemeral tools via `cx.register_tool`.
    async fn before_model(&self, _plan: &mut ModelPlan, _cx: &mut PluginCx) -> anyhow::Result<()> {
        Ok(())
    }

    async fn on_model_result(
        &self,
        _resp: &ModelResponse,
        _cx: &mut PluginCx,
    ) -> anyhow::Result<()> {
        Ok(())
    }

    async fn on_tool_start(&self, _call: &ToolCall, _cx: &mut PluginCx) -> anyhow::Result<()> {
        Ok(())
    }

    async fn on_tool_result(
        &self,
        _call: &ToolCall,
        _out: &Value,
        _cx: &mut PluginCx,
    ) -> anyhow::Result<()> {
        Ok(())
    }

    async fn on_tool_error(
        &self,
        _call: &ToolCall,
        _err: &str,
        _cx: &mut PluginCx,
    ) -> anyhow::Result<()> {
        Ok(())
    }

    /// After the run reaches `completed`.
    async fn on_run_complete(
        &self,
        _final_text: Option<&str>,
        _cx: &mut PluginCx,
    ) -> anyhow::Result<()> {
        Ok(())
    }

    /// After every event append.
    async fn on_event(&self, _event: &Event, _cx: &mut PluginCx) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Ordered hook dispatcher for one agent's selected plugins.
#[derive(Clone, Default)]
pub struct PluginHost {
    plugins: Vec<Arc<dyn Plugin>>,
}

macro_rules! dispatch {
    ($self:ident, $cx:ident, $hook:ident ( $($arg:expr),* )) => {
        for p in &$self.plugins {
            if let Err(e) = p.$hook($($arg,)* $cx).await {
                warn!(plugin = %p.name(), hook = stringify!($hook), "plugin hook failed: {e}");
            }
        }
    };
}

impl PluginHost {
    pub fn new(plugins: Vec<Arc<dyn Plugin>>) -> Self {
        Self { plugins }
    }

    pub fn is_empty(&self) -> bool {
        self.plugins.is_empty()
    }

    pub fn names(&self) -> Vec<&str> {
        self.plugins.iter().map(|p| p.name()).collect()
    }

    pub fn has(&self, name: &str) -> bool {
        self.plugins.iter().any(|p| p.name() == name)
    }

    pub async fn on_init(&self, cx: &mut PluginCx) {
        dispatch!(self, cx, on_init());
    }

    pub async fn on_tick(&self, cx: &mut PluginCx) {
        dispatch!(self, cx, on_tick());
    }

    pub async fn before_model(&self, plan: &mut ModelPlan, cx: &mut PluginCx) {
        dispatch!(self, cx, before_model(plan));
    }

    pub async fn on_model_result(&self, resp: &ModelResponse, cx: &mut PluginCx) {
        dispatch!(self, cx, on_model_result(resp));
    }

    pub async fn on_tool_start(&self, call: &ToolCall, cx: &mut PluginCx) {
        dispatch!(self, cx, on_tool_start(call));
    }

    pub async fn on_tool_result(&self, call: &ToolCall, out: &Value, cx: &mut PluginCx) {
        dispatch!(self, cx, on_tool_result(call, out));
    }

    pub async fn on_tool_error(&self, call: &ToolCall, err: &str, cx: &mut PluginCx) {
        dispatch!(self, cx, on_tool_error(call, err));
    }

    pub async fn on_run_complete(&self, final_text: Option<&str>, cx: &mut PluginCx) {
        dispatch!(self, cx, on_run_complete(final_text));
    }

    pub async fn on_event(&self, event: &Event, cx: &mut PluginCx) {
        dispatch!(self, cx, on_event(event));
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tool::{ToolCtx, ToolError};
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingPlugin {
        ticks: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Plugin for CountingPlugin {
        fn name(&self) -> &str {
            "counting"
        }
        async fn on_tick(&self, _cx: &mut PluginCx) -> anyhow::Result<()> {
            self.ticks.fetch_add(1, Ordering::Relaxed);
            Ok(())
        }
    }

    struct FailingPlugin;

    #[async_trait]
    impl Plugin for FailingPlugin {
        fn name(&self) -> &str {
            "failing"
        }
        async fn on_tick(&self, _cx: &mut PluginCx) -> anyhow::Result<()> {
            anyhow::bail!("deliberate failure")
        }
    }

    struct EphemeralRegistrar;

    struct Probe;

    #[async_trait]
    impl Tool for Probe {
        fn name(&self) -> &str {
            "probe"
        }
        async fn execute(
            &self,
            _args: Value,
            _ctx: &ToolCtx,
        ) -> Result<Option<Value>, ToolError> {
            Ok(Some(json!("probed")))
        }
    }

    #[async_trait]
    impl Plugin for EphemeralRegistrar {
        fn name(&self) -> &str {
            "registrar"
        }
        async fn before_model(
            &self,
            plan: &mut ModelPlan,
            cx: &mut PluginCx,
        ) -> anyhow::Result<()> {
            plan.add_system("ephemeral tools available");
            cx.register_tool(Arc::new(Probe));
            Ok(())
        }
    }

    #[tokio::test]
    async fn hooks_run_for_all_plugins_in_order() {
        let ticks = Arc::new(AtomicUsize::new(0));
        let host = PluginHost::new(vec![
            Arc::new(CountingPlugin { ticks: ticks.clone() }),
            Arc::new(CountingPlugin { ticks: ticks.clone() }),
        ]);
        let mut cx = PluginCx::new("a1", BTreeMap::new());
        host.on_tick(&mut cx).await;
        assert_eq!(ticks.load(Ordering::Relaxed), 2);
    }

    #[tokio::test]
    async fn failing_hook_does_not_stop_later_plugins() {
        let ticks = Arc::new(AtomicUsize::new(0));
        let host = PluginHost::new(vec![
            Arc::new(FailingPlugin),
            Arc::new(CountingPlugin { ticks: ticks.clone() }),
        ]);
        let mut cx = PluginCx::new("a1", BTreeMap::new());
        host.on_tick(&mut cx).await;
        assert_eq!(ticks.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn before_model_registers_ephemeral_tools() {
        let host = PluginHost::new(vec![Arc::new(EphemeralRegistrar)]);
        let mut cx = PluginCx::new("a1", BTreeMap::new());
        let mut plan = ModelPlan::new("base", "m");
        host.before_model(&mut plan, &mut cx).await;

        assert!(plan.system_prompt().contains("ephemeral tools available"));
        let ephemeral = cx.take_ephemeral();
        assert_eq!(ephemeral.len(), 1);
        assert_eq!(ephemeral[0].name(), "probe");
        // Overlay is drained — a second take yields nothing.
        assert!(cx.take_ephemeral().is_empty());
    }

    #[test]
    fn first_pause_request_wins() {
        let mut cx = PluginCx::new("a1", BTreeMap::new());
        cx.request_pause("hitl");
        cx.request_pause("subagent");
        assert_eq!(cx.take_pause().as_deref(), Some("hitl"));
        assert_eq!(cx.take_pause(), None);
    }

    #[test]
    fn custom_events_are_collected() {
        let mut cx = PluginCx::new("a1", BTreeMap::new());
        cx.emit("context_summarized", json!({"dropped": 4}));
        let events = cx.take_custom_events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].0, "context_summarized");
    }
}
