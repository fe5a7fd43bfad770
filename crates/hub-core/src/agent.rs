// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! The Agent actor.
//!
//! One tokio task owns the agent's store, run state, and step loop;
//! everything else talks to it through a cheap-to-clone [`AgentHandle`]
//! over an mpsc mailbox.  At most one handler runs at a time; the step
//! loop drives itself by posting `Tick` messages back into its own
//! mailbox, so control actions interleave between steps.
//!
//! One step performs either a model call or a batch of tool executions:
//!
//! ```text
//! Tick ─► cap check ─► AGENT_STEP ─► on_tick hooks ─┬─ pending empty:
//!                                                   │    before_model → invoke
//!                                                   │    → INFERENCE_DETAILS
//!                                                   │    → completed | pending
//!                                                   └─ pending: run ≤25 tools
//!                                                        concurrently, then
//!                                                        re-tick
//! ```

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex as StdMutex};

use futures::stream::{FuturesUnordered, StreamExt};
use serde_json::{json, Value};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use hub_events::{
    AgentErrorData, Event, EventBody, EventStore, Projection, RunState, RunStatus, Snapshot,
    StoreError, ToolErrorData, ToolFinishData, ToolStartData,
};
use hub_model::{
    codec::parts_to_flat, ChatMessage, ModelResponse, Provider, ProviderError, ToolCallRequest,
};
use hub_tools::{
    tool_def, vars::substitute_args, Hub, ModelPlan, PluginCx, PluginHost, RemoteToolDesc, Tool,
    ToolCall, ToolCtx, ToolError, VARS_PLUGIN,
};

use crate::agency_api::{AgencyApi, RelayedEvent};
use crate::blueprint::Blueprint;
use crate::fork::{verify_fork_token, ForkTokenError};
use crate::hitl::{HitlPlugin, PAUSE_REASON_HITL};
use crate::subagent::{
    MessageAgentTool, SubagentReporterPlugin, TaskTool, Waiter, WaiterCell, PAUSE_REASON_SUBAGENT,
};

const WAITERS_KEY: &str = "_waiters";
const PENDING_KEY: &str = "_pendingToolCalls";

#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Step-loop cap; 0 disables the cap entirely.
    pub iteration_limit: u32,
    /// Tool calls executed per step; the rest stay queued.
    pub max_parallel_tools: usize,
    /// Take a snapshot when this many events accumulated since the last one.
    pub snapshot_threshold: u64,
    /// Model used when the blueprint does not name one.
    pub default_model: String,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            iteration_limit: 200,
            max_parallel_tools: 25,
            snapshot_threshold: 100,
            default_model: "gpt-4o-mini".into(),
        }
    }
}

/// Registration payload sent by the agency when it creates the agent.
#[derive(Debug, Clone)]
pub struct ThreadMetadata {
    pub agency_id: String,
    pub agent_type: String,
    /// Captured origin context (HTTP request info, schedule id, …).
    pub request: Value,
    pub vars: BTreeMap<String, Value>,
    /// Remote tool servers available to this tenant.
    pub mcp_servers: Vec<RemoteToolDesc>,
}

#[derive(Debug, Error)]
pub enum AgentError {
    #[error("agent is not registered")]
    NotRegistered,

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("invalid action: {0}")]
    InvalidAction(String),

    #[error(transparent)]
    ForkToken(#[from] ForkTokenError),

    #[error("agent has shut down")]
    Gone,
}

enum AgentMsg {
    Register {
        meta: Box<ThreadMetadata>,
        reply: oneshot::Sender<Result<(), AgentError>>,
    },
    Invoke {
        messages: Vec<ChatMessage>,
        vars: BTreeMap<String, Value>,
        reply: oneshot::Sender<Result<(), AgentError>>,
    },
    Action {
        action: Value,
        reply: oneshot::Sender<Result<Value, AgentError>>,
    },
    Tick,
    State {
        reply: oneshot::Sender<Result<Value, AgentError>>,
    },
    Events {
        reply: oneshot::Sender<Result<Vec<Value>, AgentError>>,
    },
    EventsUntil {
        at: u64,
        reply: oneshot::Sender<Result<Vec<Event>, AgentError>>,
    },
    GetProjection {
        at: Option<u64>,
        legacy: bool,
        reply: oneshot::Sender<Result<Value, AgentError>>,
    },
    Export {
        include_snapshot: bool,
        reply: oneshot::Sender<Result<Value, AgentError>>,
    },
    CopyEvents {
        token: String,
        source_id: String,
        forked_at: u64,
        events: Vec<Event>,
        reply: oneshot::Sender<Result<u64, AgentError>>,
    },
    Destroy {
        reply: oneshot::Sender<()>,
    },
}

/// Cheap-to-clone handle to a running agent actor.
#[derive(Clone)]
pub struct AgentHandle {
    pub id: String,
    tx: mpsc::UnboundedSender<AgentMsg>,
    cancel: Arc<StdMutex<CancellationToken>>,
}

impl AgentHandle {
    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<Result<T, AgentError>>) -> AgentMsg,
    ) -> Result<T, AgentError> {
        let (tx, rx) = oneshot::channel();
        self.tx.send(make(tx)).map_err(|_| AgentError::Gone)?;
        rx.await.map_err(|_| AgentError::Gone)?
    }

    pub async fn register(&self, meta: ThreadMetadata) -> Result<(), AgentError> {
        self.request(|reply| AgentMsg::Register {
            meta: Box::new(meta),
            reply,
        })
        .await
    }

    pub async fn invoke(
        &self,
        messages: Vec<ChatMessage>,
        vars: BTreeMap<String, Value>,
    ) -> Result<(), AgentError> {
        self.request(|reply| AgentMsg::Invoke {
            messages,
            vars,
            reply,
        })
        .await
    }

    /// Deliver a control action.  `cancel` additionally aborts any model
    /// call in flight before the actor processes the message.
    pub async fn action(&self, action: Value) -> Result<Value, AgentError> {
        if action["type"] == "cancel" {
            self.cancel
                .lock()
                .expect("cancel lock poisoned")
                .cancel();
        }
        self.request(|reply| AgentMsg::Action { action, reply }).await
    }

    pub async fn state(&self) -> Result<Value, AgentError> {
        self.request(|reply| AgentMsg::State { reply }).await
    }

    pub async fn events(&self) -> Result<Vec<Value>, AgentError> {
        self.request(|reply| AgentMsg::Events { reply }).await
    }

    /// Raw events with `seq <= at`, for forking.
    pub async fn events_until(&self, at: u64) -> Result<Vec<Event>, AgentError> {
        self.request(|reply| AgentMsg::EventsUntil { at, reply }).await
    }

    pub async fn projection(&self, at: Option<u64>, legacy: bool) -> Result<Value, AgentError> {
        self.request(|reply| AgentMsg::GetProjection { at, legacy, reply })
            .await
    }

    pub async fn export(&self, include_snapshot: bool) -> Result<Value, AgentError> {
        self.request(|reply| AgentMsg::Export {
            include_snapshot,
            reply,
        })
        .await
    }

    pub async fn copy_events(
        &self,
        token: String,
        source_id: String,
        forked_at: u64,
        events: Vec<Event>,
    ) -> Result<u64, AgentError> {
        self.request(|reply| AgentMsg::CopyEvents {
            token,
            source_id,
            forked_at,
            events,
            reply,
        })
        .await
    }

    pub async fn destroy(&self) -> Result<(), AgentError> {
        let (tx, rx) = oneshot::channel();
        self.tx
            .send(AgentMsg::Destroy { reply: tx })
            .map_err(|_| AgentError::Gone)?;
        rx.await.map_err(|_| AgentError::Gone)
    }
}

/// Everything needed to start one agent actor.
pub struct AgentParams {
    pub id: String,
    pub blueprint: Blueprint,
    pub store: EventStore,
    pub provider: Arc<dyn Provider>,
    pub hub: Arc<Hub>,
    pub agency: Arc<dyn AgencyApi>,
    pub config: AgentConfig,
}

pub struct AgentActor {
    id: String,
    blueprint: Blueprint,
    store: EventStore,
    provider: Arc<dyn Provider>,
    hub: Arc<Hub>,
    agency: Arc<dyn AgencyApi>,
    config: AgentConfig,

    meta: Option<ThreadMetadata>,
    run_state: RunState,
    proj: Projection,
    pending: Vec<ToolCallRequest>,
    waiters: WaiterCell,
    vars: BTreeMap<String, Value>,

    tools: Vec<Arc<dyn Tool>>,
    /// Ephemeral tools registered during the last `before_model`; consumed
    /// by the following tool batch, then discarded.
    step_overlay: Vec<Arc<dyn Tool>>,
    host: PluginHost,
    relay: Option<mpsc::UnboundedSender<RelayedEvent>>,
    cancel: Arc<StdMutex<CancellationToken>>,

    self_tx: mpsc::UnboundedSender<AgentMsg>,
    initialized: bool,
}

impl AgentActor {
    /// Spawn the actor task and return its handle.
    pub fn spawn(params: AgentParams) -> AgentHandle {
        let (tx, rx) = mpsc::unbounded_channel();
        let cancel = Arc::new(StdMutex::new(CancellationToken::new()));

        let handle = AgentHandle {
            id: params.id.clone(),
            tx: tx.clone(),
            cancel: cancel.clone(),
        };

        let actor = AgentActor {
            id: params.id,
            blueprint: params.blueprint,
            store: params.store,
            provider: params.provider,
            hub: params.hub,
            agency: params.agency,
            config: params.config,
            meta: None,
            run_state: RunState::default(),
            proj: Projection::default(),
            pending: Vec::new(),
            waiters: Arc::new(StdMutex::new(Vec::new())),
            vars: BTreeMap::new(),
            tools: Vec::new(),
            step_overlay: Vec::new(),
            host: PluginHost::default(),
            relay: None,
            cancel,
            self_tx: tx,
            initialized: false,
        };

        tokio::spawn(actor.run(rx));
        handle
    }

    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<AgentMsg>) {
        debug!(agent = %self.id, "agent actor started");
        while let Some(msg) = rx.recv().await {
            match msg {
                AgentMsg::Register { meta, reply } => {
                    let _ = reply.send(self.handle_register(*meta).await);
                }
                AgentMsg::Invoke {
                    messages,
                    vars,
                    reply,
                } => {
                    let _ = reply.send(self.handle_invoke(messages, vars).await);
                }
                AgentMsg::Action { action, reply } => {
                    let _ = reply.send(self.handle_action(action).await);
                }
                AgentMsg::Tick => {
                    if self.run_state.status == RunStatus::Running {
                        self.run_step().await;
                    }
                }
                AgentMsg::State { reply } => {
                    let _ = reply.send(Ok(self.state_view()));
                }
                AgentMsg::Events { reply } => {
                    let result = self
                        .store
                        .list_events()
                        .map(|events| events.iter().map(Event::to_json).collect())
                        .map_err(AgentError::from);
                    let _ = reply.send(result);
                }
                AgentMsg::EventsUntil { at, reply } => {
                    let _ = reply.send(self.store.events_until(at).map_err(AgentError::from));
                }
                AgentMsg::GetProjection { at, legacy, reply } => {
                    let _ = reply.send(self.handle_projection(at, legacy));
                }
                AgentMsg::Export {
                    include_snapshot,
                    reply,
                } => {
                    let _ = reply.send(self.handle_export(include_snapshot));
                }
                AgentMsg::CopyEvents {
                    token,
                    source_id,
                    forked_at,
                    events,
                    reply,
                } => {
                    let _ = reply.send(self.handle_copy_events(token, source_id, forked_at, events));
                }
                AgentMsg::Destroy { reply } => {
                    info!(agent = %self.id, "agent destroyed");
                    let _ = reply.send(());
                    break;
                }
            }
        }
        debug!(agent = %self.id, "agent actor stopped");
    }

    // ── Registration ─────────────────────────────────────────────────────────

    async fn handle_register(&mut self, meta: ThreadMetadata) -> Result<(), AgentError> {
        self.store
            .info_set("agencyId", &json!(meta.agency_id.clone()))?;
        self.store
            .info_set("agentType", &json!(meta.agent_type.clone()))?;
        self.store.info_set("request", &meta.request)?;

        // Tenant vars layered over blueprint vars.
        let mut vars = self.blueprint.vars.clone();
        vars.extend(meta.vars.clone());
        self.vars = vars;

        self.build_toolset(&meta);
        self.meta = Some(meta);

        if !self.initialized {
            self.initialized = true;
            let mut cx = self.plugin_cx();
            let host = self.host.clone();
            host.on_init(&mut cx).await;
            self.apply_cx(&mut cx).await?;
        }

        self.run_state = RunState {
            status: RunStatus::Registered,
            step: 0,
            reason: None,
        };
        self.store.save_run_state(&self.run_state)?;
        info!(agent = %self.id, agent_type = %self.blueprint.name, "agent registered");
        Ok(())
    }

    /// Resolve the blueprint's capabilities and assemble the tool map and
    /// plugin host.  Subagent tools are bound to this agent's waiter table;
    /// remote tools become local `mcp_<server>_<tool>` adapters.  The
    /// reporter, HITL, and vars plugins are stock on every agent.
    fn build_toolset(&mut self, meta: &ThreadMetadata) {
        let selection = self.hub.resolve(&self.blueprint.capabilities, &meta.mcp_servers);

        let mut tools = selection.tools.clone();
        for desc in &selection.remote {
            tools.push(Arc::new(RemoteTool::new(desc.clone(), self.agency.clone())));
        }

        let wants_subagents = self.blueprint.capabilities.iter().any(|c| {
            c == "task" || c == "message_agent" || c == "@subagent"
        });
        if wants_subagents {
            tools.push(Arc::new(TaskTool::new(
                self.agency.clone(),
                self.id.clone(),
                self.waiters.clone(),
            )));
            tools.push(Arc::new(MessageAgentTool::new(
                self.agency.clone(),
                self.id.clone(),
                self.waiters.clone(),
            )));
        }
        self.tools = tools;

        let mut plugins: Vec<Arc<dyn hub_tools::Plugin>> = vec![
            Arc::new(hub_tools::VarsPlugin),
            Arc::new(HitlPlugin),
            Arc::new(SubagentReporterPlugin::new(self.agency.clone())),
        ];
        for p in selection.plugins {
            if !plugins.iter().any(|q| q.name() == p.name()) {
                plugins.push(p);
            }
        }
        self.host = PluginHost::new(plugins);
    }

    // ── Invocation ───────────────────────────────────────────────────────────

    async fn handle_invoke(
        &mut self,
        messages: Vec<ChatMessage>,
        vars: BTreeMap<String, Value>,
    ) -> Result<(), AgentError> {
        if self.meta.is_none() {
            return Err(AgentError::NotRegistered);
        }
        self.vars.extend(vars);

        // Fresh cancellation scope for this run.
        *self.cancel.lock().expect("cancel lock poisoned") = CancellationToken::new();

        if self.relay.is_none() {
            let agent_type = self.agent_type();
            self.relay = Some(self.agency.open_relay(&self.id, &agent_type));
        }

        self.emit(EventBody::Invoked).await?;
        for message in messages {
            if let Ok(flat) = parts_to_flat(&message) {
                self.store.append_message(&flat)?;
            }
            self.emit(EventBody::UserMessage { message }).await?;
        }

        self.run_state = RunState {
            status: RunStatus::Running,
            step: 0,
            reason: None,
        };
        self.store.save_run_state(&self.run_state)?;
        self.tick();
        Ok(())
    }

    // ── The step loop ────────────────────────────────────────────────────────

    async fn run_step(&mut self) {
        match self.try_step().await {
            Ok(()) => {}
            Err(StepError::Canceled) => {
                // The cancel action in the mailbox performs the transition;
                // just stop ticking.
                debug!(agent = %self.id, "step aborted by cancellation");
            }
            Err(StepError::Agent(e)) => {
                error!(agent = %self.id, "run failed: {e}");
                self.fail_run("runtime_error", &e.to_string()).await;
            }
            Err(StepError::Provider(e)) => {
                error!(agent = %self.id, "model call failed: {e}");
                let kind = match e {
                    ProviderError::Http { .. } => "provider_http_error",
                    _ => "runtime_error",
                };
                self.fail_run(kind, &e.to_string()).await;
            }
        }
    }

    async fn try_step(&mut self) -> Result<(), StepError> {
        let limit = self.config.iteration_limit;
        if limit > 0 && self.run_state.step >= limit {
            self.fail_run("max_iterations_exceeded", "max_iterations_exceeded")
                .await;
            return Ok(());
        }

        let step = self.run_state.step;
        self.emit(EventBody::Step { step }).await.map_err(StepError::Agent)?;
        self.run_state.step = step + 1;
        self.store
            .save_run_state(&self.run_state)
            .map_err(|e| StepError::Agent(e.into()))?;

        // Plugin ticks may pause the run before any work happens.
        let mut cx = self.plugin_cx();
        let host = self.host.clone();
        host.on_tick(&mut cx).await;
        let pause = cx.take_pause();
        self.apply_cx(&mut cx).await.map_err(StepError::Agent)?;
        if let Some(reason) = pause {
            self.pause_run(&reason).await.map_err(StepError::Agent)?;
            return Ok(());
        }

        if self.pending.is_empty() {
            self.model_step().await?;
        } else {
            self.tool_step().await?;
        }

        if self.run_state.status == RunStatus::Running && !self.current_cancel().is_cancelled() {
            self.tick();
        }
        Ok(())
    }

    /// One model call: plan → invoke → events → completion or pending calls.
    async fn model_step(&mut self) -> Result<(), StepError> {
        let model = self
            .blueprint
            .model
            .clone()
            .unwrap_or_else(|| self.config.default_model.clone());
        let mut plan = ModelPlan::new(self.blueprint.prompt.clone(), model);

        let mut cx = self.plugin_cx();
        let host = self.host.clone();
        host.before_model(&mut plan, &mut cx).await;
        let ephemeral = cx.take_ephemeral();
        self.apply_cx(&mut cx).await.map_err(StepError::Agent)?;

        // Ephemeral registrations overlay the step's tool map and win on
        // name collisions; the overlay is dropped when the step ends.
        let step_tools: Vec<Arc<dyn Tool>> = ephemeral
            .iter()
            .chain(self.tools.iter())
            .cloned()
            .collect();
        for t in &step_tools {
            plan.add_tool_def(tool_def(t.as_ref()));
        }

        let input_messages = self.proj.messages.clone();
        let req = plan.build(input_messages.clone());

        let cancel = self.current_cancel();
        let resp = match self.provider.invoke(&req, &cancel).await {
            Ok(resp) => resp,
            Err(ProviderError::Canceled) => return Err(StepError::Canceled),
            Err(e) => return Err(StepError::Provider(e)),
        };

        let mut cx = self.plugin_cx();
        host.on_model_result(&resp, &mut cx).await;
        let pause = cx.take_pause();
        self.apply_cx(&mut cx).await.map_err(StepError::Agent)?;

        self.record_inference(&req.messages, &resp)
            .await
            .map_err(StepError::Agent)?;

        let tool_calls = resp.message.tool_calls();
        if tool_calls.is_empty() {
            if let Some(reason) = pause {
                self.pause_run(&reason).await.map_err(StepError::Agent)?;
                return Ok(());
            }
            self.complete_run(resp.message.text_content())
                .await
                .map_err(StepError::Agent)?;
            return Ok(());
        }

        self.pending = tool_calls;
        self.save_pending().map_err(|e| StepError::Agent(e.into()))?;

        // A HITL pause lands after the calls are recorded so approval can
        // inspect and modify them.
        if let Some(reason) = pause {
            self.pause_run(&reason).await.map_err(StepError::Agent)?;
        }
        // Execute ephemeral-aware batches on the next tick; remember the
        // overlay for that tick only.
        self.step_overlay = ephemeral;
        Ok(())
    }

    /// Execute up to `max_parallel_tools` pending calls concurrently.
    /// Events are emitted in completion order on this actor task.
    async fn tool_step(&mut self) -> Result<(), StepError> {
        let batch: Vec<ToolCallRequest> = self
            .pending
            .iter()
            .take(self.config.max_parallel_tools)
            .cloned()
            .collect();

        let overlay = std::mem::take(&mut self.step_overlay);
        let vars_active = self.host.has(VARS_PLUGIN);
        let host = self.host.clone();

        // Phase 1: start events and hook dispatch, in call order.
        let mut started: Vec<ToolCall> = Vec::with_capacity(batch.len());
        for call in &batch {
            let args = if vars_active {
                substitute_args(call.arguments.clone(), &self.vars)
            } else {
                call.arguments.clone()
            };
            let tc = ToolCall {
                id: call.id.clone(),
                name: call.name.clone(),
                args,
            };
            let mut cx = self.plugin_cx();
            host.on_tool_start(&tc, &mut cx).await;
            self.apply_cx(&mut cx).await.map_err(StepError::Agent)?;
            self.emit(EventBody::ToolStart(ToolStartData {
                call_id: tc.id.clone(),
                name: tc.name.clone(),
                arguments: tc.args.clone(),
            }))
            .await
            .map_err(StepError::Agent)?;
            started.push(tc);
        }

        // Phase 2: execute concurrently; record outcomes as they settle.
        let mut futures = FuturesUnordered::new();
        for tc in started {
            let tool = overlay
                .iter()
                .chain(self.tools.iter())
                .find(|t| t.name() == tc.name)
                .cloned();
            let ctx = ToolCtx {
                agent_id: self.id.clone(),
                call_id: tc.id.clone(),
                vars: self.vars.clone(),
            };
            futures.push(async move {
                let outcome = match &tool {
                    Some(tool) => tool.execute(tc.args.clone(), &ctx).await,
                    None => Err(ToolError::Unknown(tc.name.clone())),
                };
                (tc, outcome)
            });
        }

        let mut settled: Vec<(ToolCall, Result<Option<Value>, ToolError>)> = Vec::new();
        while let Some((tc, outcome)) = futures.next().await {
            match &outcome {
                Ok(Some(response)) => {
                    self.emit(EventBody::ToolFinish(ToolFinishData {
                        call_id: tc.id.clone(),
                        response: response.clone(),
                    }))
                    .await
                    .map_err(StepError::Agent)?;
                }
                Ok(None) => {
                    // Deferred outcome (subagent spawn): neither finish nor
                    // error is recorded now.
                    debug!(agent = %self.id, tool = %tc.name, "tool deferred its result");
                }
                Err(e) => {
                    warn!(agent = %self.id, tool = %tc.name, "tool failed: {e}");
                    self.emit(EventBody::ToolError(ToolErrorData {
                        call_id: tc.id.clone(),
                        kind: "tool_execution_error".into(),
                        message: e.to_string(),
                    }))
                    .await
                    .map_err(StepError::Agent)?;
                }
            }
            settled.push((tc, outcome));
        }

        // Phase 3: result hooks after all calls settle; hook failures are
        // logged, never fatal.
        for (tc, outcome) in &settled {
            let mut cx = self.plugin_cx();
            match outcome {
                Ok(Some(out)) => host.on_tool_result(tc, out, &mut cx).await,
                Ok(None) => {}
                Err(e) => host.on_tool_error(tc, &e.to_string(), &mut cx).await,
            }
            self.apply_cx(&mut cx).await.map_err(StepError::Agent)?;
        }

        // Executed calls leave the queue; deferred ones stay pending until
        // their asynchronous result (subagent report) clears them.
        let deferred: Vec<String> = settled
            .iter()
            .filter(|(_, outcome)| matches!(outcome, Ok(None)))
            .map(|(tc, _)| tc.id.clone())
            .collect();
        self.pending.retain(|c| {
            deferred.contains(&c.id) || !settled.iter().any(|(tc, _)| tc.id == c.id)
        });
        self.save_pending().map_err(|e| StepError::Agent(e.into()))?;
        self.save_waiters().map_err(|e| StepError::Agent(e.into()))?;

        // A parent with outstanding waiters pauses until every one reports.
        let has_waiters = !self.waiters.lock().expect("waiter lock poisoned").is_empty();
        if has_waiters && self.run_state.status == RunStatus::Running {
            self.pause_run(PAUSE_REASON_SUBAGENT)
                .await
                .map_err(StepError::Agent)?;
        }
        Ok(())
    }

    async fn record_inference(
        &mut self,
        input_messages: &[ChatMessage],
        resp: &ModelResponse,
    ) -> Result<(), AgentError> {
        self.emit(EventBody::Inference(hub_events::InferenceData {
            input_messages: input_messages.to_vec(),
            output_messages: vec![resp.message.clone()],
            usage: resp.usage.unwrap_or_default(),
            finish_reason: resp.message.finish_reason.clone(),
        }))
        .await?;
        self.emit(EventBody::ContentMessage {
            message: resp.message.clone(),
        })
        .await?;
        if let Ok(flat) = parts_to_flat(&resp.message) {
            self.store.append_message(&flat)?;
        }
        Ok(())
    }

    // ── Transitions ──────────────────────────────────────────────────────────

    async fn pause_run(&mut self, reason: &str) -> Result<(), AgentError> {
        self.run_state.status = RunStatus::Paused;
        self.run_state.reason = Some(reason.to_string());
        self.store.save_run_state(&self.run_state)?;
        self.emit(EventBody::Paused {
            reason: reason.to_string(),
        })
        .await?;
        info!(agent = %self.id, %reason, "run paused");
        Ok(())
    }

    async fn resume_run(&mut self) -> Result<(), AgentError> {
        self.run_state.status = RunStatus::Running;
        self.run_state.reason = None;
        self.store.save_run_state(&self.run_state)?;
        self.emit(EventBody::Resumed).await?;
        self.tick();
        Ok(())
    }

    async fn complete_run(&mut self, final_text: Option<String>) -> Result<(), AgentError> {
        self.run_state.status = RunStatus::Completed;
        self.run_state.reason = None;
        self.store.save_run_state(&self.run_state)?;

        let mut cx = self.plugin_cx();
        let host = self.host.clone();
        host.on_run_complete(final_text.as_deref(), &mut cx).await;
        self.apply_cx(&mut cx).await?;

        self.emit(EventBody::Completed { final_text }).await?;
        self.maybe_snapshot()?;
        self.relay = None;
        info!(agent = %self.id, "run completed");
        Ok(())
    }

    async fn fail_run(&mut self, kind: &str, message: &str) {
        self.run_state.status = RunStatus::Error;
        self.run_state.reason = Some(message.to_string());
        if let Err(e) = self.store.save_run_state(&self.run_state) {
            error!(agent = %self.id, "could not persist error state: {e}");
        }
        let emit = self
            .emit(EventBody::Error(AgentErrorData {
                kind: kind.to_string(),
                message: message.to_string(),
                stack: None,
            }))
            .await;
        if let Err(e) = emit {
            error!(agent = %self.id, "could not persist error event: {e}");
        }
        self.relay = None;
    }

    async fn cancel_run(&mut self) -> Result<(), AgentError> {
        if self.run_state.status.is_terminal() {
            return Ok(());
        }
        self.run_state.status = RunStatus::Canceled;
        self.run_state.reason = None;
        self.pending.clear();
        self.save_pending()?;
        self.store.save_run_state(&self.run_state)?;
        self.emit(EventBody::Canceled).await?;
        self.relay = None;
        info!(agent = %self.id, "run canceled");
        Ok(())
    }

    // ── Actions ──────────────────────────────────────────────────────────────

    async fn handle_action(&mut self, action: Value) -> Result<Value, AgentError> {
        let kind = action["type"]
            .as_str()
            .ok_or_else(|| AgentError::InvalidAction("missing 'type'".into()))?
            .to_string();

        match kind.as_str() {
            "cancel" => {
                self.cancel_run().await?;
                Ok(json!({ "ok": true, "status": "canceled" }))
            }
            "resume" => {
                if self.run_state.status != RunStatus::Paused {
                    return Err(AgentError::InvalidAction("agent is not paused".into()));
                }
                self.resume_run().await?;
                Ok(json!({ "ok": true }))
            }
            "approve" => self.handle_approve(&action).await,
            "subagent_result" => self.handle_subagent_result(&action).await,
            "cancel_subagents" => self.handle_cancel_subagents().await,
            other => Err(AgentError::InvalidAction(format!(
                "unknown action type {other:?}"
            ))),
        }
    }

    async fn handle_approve(&mut self, action: &Value) -> Result<Value, AgentError> {
        if self.run_state.status != RunStatus::Paused
            || self.run_state.reason.as_deref() != Some(PAUSE_REASON_HITL)
        {
            return Err(AgentError::InvalidAction(
                "no approval is pending".into(),
            ));
        }

        let approved = action["approved"].as_bool().unwrap_or(false);
        if !approved {
            // Record a rejection for every gated call so the model can react.
            let pending = std::mem::take(&mut self.pending);
            for call in &pending {
                self.emit(EventBody::ToolError(ToolErrorData {
                    call_id: call.id.clone(),
                    kind: "tool_execution_error".into(),
                    message: "rejected by user".into(),
                }))
                .await?;
            }
            self.save_pending()?;
            self.resume_run().await?;
            return Ok(json!({ "ok": true, "approved": false }));
        }

        if let Some(modified) = action["modifiedToolCalls"].as_array() {
            for m in modified {
                let Some(id) = m["id"].as_str() else { continue };
                if let Some(call) = self.pending.iter_mut().find(|c| c.id == id) {
                    if let Some(name) = m["name"].as_str() {
                        call.name = name.to_string();
                    }
                    if !m["arguments"].is_null() {
                        call.arguments = m["arguments"].clone();
                    }
                }
            }
            self.save_pending()?;
        }
        self.resume_run().await?;
        Ok(json!({ "ok": true, "approved": true }))
    }

    async fn handle_subagent_result(&mut self, action: &Value) -> Result<Value, AgentError> {
        let token = action["token"]
            .as_str()
            .ok_or_else(|| AgentError::InvalidAction("missing 'token'".into()))?;
        let child_id = action["childId"]
            .as_str()
            .ok_or_else(|| AgentError::InvalidAction("missing 'childId'".into()))?;
        let result = action["result"].as_str().unwrap_or_default().to_string();

        // The waiter row is the anti-replay record: redeem deletes it.
        let waiter = {
            let mut waiters = self.waiters.lock().expect("waiter lock poisoned");
            let idx = waiters
                .iter()
                .position(|w| w.token == token && w.child_id == child_id);
            idx.map(|i| waiters.remove(i))
        };
        let Some(waiter) = waiter else {
            return Err(AgentError::InvalidAction(
                "unknown or already-redeemed subagent token".into(),
            ));
        };
        self.save_waiters()?;

        self.emit(EventBody::ToolFinish(ToolFinishData {
            call_id: waiter.tool_call_id.clone(),
            response: json!({ "agentId": child_id, "result": result }),
        }))
        .await?;
        self.pending.retain(|c| c.id != waiter.tool_call_id);
        self.save_pending()?;
        self.agency.note_child_report(child_id, &result).await;

        let all_reported = self.waiters.lock().expect("waiter lock poisoned").is_empty();
        if all_reported
            && self.run_state.status == RunStatus::Paused
            && self.run_state.reason.as_deref() == Some(PAUSE_REASON_SUBAGENT)
        {
            self.resume_run().await?;
        }
        Ok(json!({ "ok": true, "remainingWaiters": !all_reported }))
    }

    async fn handle_cancel_subagents(&mut self) -> Result<Value, AgentError> {
        let waiters: Vec<Waiter> = {
            let mut guard = self.waiters.lock().expect("waiter lock poisoned");
            std::mem::take(&mut *guard)
        };
        for w in &waiters {
            self.agency
                .send_action(&w.child_id, json!({ "type": "cancel" }))
                .await;
        }
        self.save_waiters()?;
        self.emit(EventBody::SystemMarker {
            text: format!("canceled {} subagent(s)", waiters.len()),
        })
        .await?;
        Ok(json!({ "ok": true, "canceled": waiters.len() }))
    }

    // ── Queries ──────────────────────────────────────────────────────────────

    fn state_view(&self) -> Value {
        json!({
            "id": self.id,
            "agentType": self.agent_type(),
            "status": self.run_state.status,
            "step": self.run_state.step,
            "reason": self.run_state.reason,
            "projection": self.proj,
        })
    }

    fn handle_projection(&self, at: Option<u64>, legacy: bool) -> Result<Value, AgentError> {
        let proj = match at {
            None => self.proj.clone(),
            Some(seq) => {
                // Replay from the nearest snapshot at or before the cut.
                match self.store.snapshot_at(seq)? {
                    Some(snap) => {
                        let tail = self.store.events_after(snap.last_event_seq)?;
                        let tail: Vec<Event> =
                            tail.into_iter().filter(|e| e.seq <= seq).collect();
                        hub_events::project_from_snapshot(&snap, &tail)
                    }
                    None => {
                        let events = self.store.events_until(seq)?;
                        hub_events::project(&events)
                    }
                }
            }
        };

        if !legacy {
            return Ok(json!(proj));
        }
        let legacy_messages: Vec<Value> = proj
            .messages
            .iter()
            .filter_map(|m| parts_to_flat(m).ok())
            .map(|f| json!(f))
            .collect();
        let mut out = json!(proj);
        out["messages"] = json!(legacy_messages);
        Ok(out)
    }

    fn handle_export(&self, include_snapshot: bool) -> Result<Value, AgentError> {
        let events: Vec<Value> = self.store.list_events()?.iter().map(Event::to_json).collect();
        let mut out = json!({
            "agentId": self.id,
            "agentType": self.agent_type(),
            "events": events,
        });
        if include_snapshot {
            if let Some(snap) = self.store.latest_snapshot()? {
                out["snapshot"] = json!(snap);
            }
        }
        Ok(out)
    }

    fn handle_copy_events(
        &mut self,
        token: String,
        source_id: String,
        forked_at: u64,
        events: Vec<Event>,
    ) -> Result<u64, AgentError> {
        let agency_id = self
            .meta
            .as_ref()
            .map(|m| m.agency_id.clone())
            .ok_or(AgentError::NotRegistered)?;
        let verified_source = verify_fork_token(&token, &self.id, &agency_id)?;
        if verified_source != source_id {
            return Err(AgentError::ForkToken(ForkTokenError::Unauthorized));
        }

        let inserted = self.store.add_events(&events)?;
        self.store.info_set("forkedFrom", &json!(source_id))?;
        self.store.info_set("forkedAt", &json!(forked_at))?;

        // Rebuild derived state from the imported log.
        let all = self.store.list_events()?;
        self.proj = hub_events::project(&all);
        self.pending = self.proj.pending_tool_calls.clone();
        self.save_pending()?;
        Ok(inserted)
    }

    // ── Internals ────────────────────────────────────────────────────────────

    fn agent_type(&self) -> String {
        self.meta
            .as_ref()
            .map(|m| m.agent_type.clone())
            .unwrap_or_else(|| self.blueprint.name.clone())
    }

    fn tick(&self) {
        let _ = self.self_tx.send(AgentMsg::Tick);
    }

    fn current_cancel(&self) -> CancellationToken {
        self.cancel.lock().expect("cancel lock poisoned").clone()
    }

    fn plugin_cx(&self) -> PluginCx {
        let mut cx = PluginCx::new(self.id.clone(), self.vars.clone());
        cx.messages = self.proj.messages.clone();
        cx
    }

    /// Append an event, fold it into the live projection, relay it, and
    /// dispatch `on_event` hooks (one level deep: custom events emitted by
    /// those hooks are appended without re-dispatch).
    async fn emit(&mut self, body: EventBody) -> Result<Event, AgentError> {
        let event = self.append_and_relay(body)?;
        let mut cx = self.plugin_cx();
        let host = self.host.clone();
        host.on_event(&event, &mut cx).await;
        for (kind, data) in cx.take_custom_events() {
            self.append_and_relay(EventBody::Custom { kind, data })?;
        }
        Ok(event)
    }

    fn append_and_relay(&mut self, body: EventBody) -> Result<Event, AgentError> {
        let event = self.store.append_event(body)?;
        self.proj = hub_events::apply(std::mem::take(&mut self.proj), &event);
        let mut relay_closed = false;
        if let Some(relay) = &self.relay {
            let relayed = RelayedEvent {
                agent_id: self.id.clone(),
                agent_type: self.agent_type(),
                event: event.to_json(),
            };
            relay_closed = relay.send(relayed).is_err();
        }
        if relay_closed {
            self.relay = None;
        }
        Ok(event)
    }

    /// Drain a plugin context after a dispatch: custom events are appended,
    /// pause requests are the caller's concern (taken before this call).
    async fn apply_cx(&mut self, cx: &mut PluginCx) -> Result<(), AgentError> {
        for (kind, data) in cx.take_custom_events() {
            self.append_and_relay(EventBody::Custom { kind, data })?;
        }
        Ok(())
    }

    fn save_pending(&self) -> Result<(), StoreError> {
        self.store.kv_set(
            PENDING_KEY,
            &serde_json::to_value(&self.pending).unwrap_or(Value::Null),
        )
    }

    fn save_waiters(&self) -> Result<(), StoreError> {
        let waiters = self.waiters.lock().expect("waiter lock poisoned").clone();
        self.store.kv_set(
            WAITERS_KEY,
            &serde_json::to_value(&waiters).unwrap_or(Value::Null),
        )
    }

    fn maybe_snapshot(&self) -> Result<(), AgentError> {
        let max_seq = self.store.max_seq()?;
        let last = self
            .store
            .latest_snapshot()?
            .map(|s| s.last_event_seq)
            .unwrap_or(0);
        if max_seq.saturating_sub(last) >= self.config.snapshot_threshold {
            self.store.add_snapshot(&Snapshot {
                last_event_seq: max_seq,
                state: self.proj.clone(),
                created_at: chrono::Utc::now(),
            })?;
            self.store.prune_snapshots(hub_events::SNAPSHOT_KEEP)?;
            debug!(agent = %self.id, seq = max_seq, "snapshot taken");
        }
        Ok(())
    }
}

#[derive(Debug)]
enum StepError {
    Canceled,
    Provider(ProviderError),
    Agent(AgentError),
}

// ─── Remote tool adapter ──────────────────────────────────────────────────────

/// Exposes one remote server tool as a local tool named
/// `mcp_<server>_<tool>`.  Execution proxies through the agency.
struct RemoteTool {
    name: String,
    desc: RemoteToolDesc,
    agency: Arc<dyn AgencyApi>,
}

impl RemoteTool {
    fn new(desc: RemoteToolDesc, agency: Arc<dyn AgencyApi>) -> Self {
        Self {
            name: desc.local_name(),
            desc,
            agency,
        }
    }
}

#[async_trait::async_trait]
impl Tool for RemoteTool {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        self.desc.description.as_deref().unwrap_or("")
    }

    fn parameters(&self) -> Option<Value> {
        self.desc.parameters.clone()
    }

    async fn execute(&self, args: Value, _ctx: &ToolCtx) -> Result<Option<Value>, ToolError> {
        let out = self
            .agency
            .call_remote_tool(&self.desc.server_id, &self.desc.name, args)
            .await
            .map_err(|e| ToolError::execution(e.to_string()))?;
        Ok(Some(out))
    }
}
