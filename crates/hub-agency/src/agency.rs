// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! The Agency actor: the per-tenant controller.
//!
//! One tokio task owns the tenant's store, the live agent handles, the
//! schedule alarms, and the remote tool-server catalog.  Transports and
//! agents talk to it through a clone-able [`AgencyHandle`]; agents reach
//! back through the [`AgencyApi`] bridge, which is message-shaped to keep
//! the actors decoupled.
//!
//! Relayed agent events arrive on a dedicated intake channel and are
//! fanned out to every subscriber of the broadcast stream; WebSocket
//! handlers apply their per-subscriber `agentIds` filters downstream.

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::{json, Value};
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use hub_core::{
    make_fork_token, AgencyApi, AgentActor, AgentConfig, AgentError, AgentHandle, AgentParams,
    Blueprint, BlueprintError, RelayedEvent, ThreadMetadata,
};
use hub_events::{EventStore, StoreError};
use hub_model::{ChatMessage, Provider};
use hub_tools::{Hub, RemoteToolDesc};

use crate::fs::{resolve_path, FileStore, FsError};
use crate::mcp::{McpCatalog, McpServer, RemoteToolClient};
use crate::schedule::{
    compute_next_run, CreateScheduleRequest, OverlapPolicy, RunOutcome, Schedule, ScheduleError,
    ScheduleRun, ScheduleStatus, ScheduleType, UpdateScheduleRequest,
};
use crate::store::{AgencyStore, AgentRow};

#[derive(Debug, Error)]
pub enum AgencyError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("validation error: {0}")]
    Validation(String),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Agent(#[from] AgentError),

    #[error(transparent)]
    Schedule(#[from] ScheduleError),

    #[error(transparent)]
    Fs(#[from] FsError),

    #[error("{0}")]
    Internal(String),

    #[error("agency has shut down")]
    Gone,
}

impl From<BlueprintError> for AgencyError {
    fn from(e: BlueprintError) -> Self {
        AgencyError::Validation(e.to_string())
    }
}

impl From<anyhow::Error> for AgencyError {
    fn from(e: anyhow::Error) -> Self {
        AgencyError::Internal(e.to_string())
    }
}

/// Parameters for spawning one agent.
#[derive(Debug, Clone)]
pub struct SpawnRequest {
    pub agent_type: String,
    /// Initial input: a string becomes the first user message; any other
    /// JSON value is injected as the `INPUT` var.
    pub input: Option<Value>,
    pub related_agent_id: Option<String>,
    pub extra_vars: BTreeMap<String, Value>,
    /// Captured origin context stored on the agent record.
    pub origin: Value,
}

#[derive(Clone)]
pub struct AgencyConfig {
    /// Directory for per-agent databases; `None` keeps everything in memory.
    pub data_dir: Option<PathBuf>,
    pub agent: AgentConfig,
}

impl Default for AgencyConfig {
    fn default() -> Self {
        Self {
            data_dir: None,
            agent: AgentConfig::default(),
        }
    }
}

type Reply<T> = oneshot::Sender<Result<T, AgencyError>>;

enum AgencyMsg {
    CreateBlueprint { bp: Blueprint, reply: Reply<Blueprint> },
    ListBlueprints { reply: Reply<Vec<Blueprint>> },
    DeleteBlueprint { name: String, reply: Reply<()> },

    SpawnAgent { req: SpawnRequest, reply: Reply<String> },
    InvokeAgent {
        agent_id: String,
        messages: Vec<ChatMessage>,
        vars: BTreeMap<String, Value>,
        reply: Reply<()>,
    },
    ListAgents { reply: Reply<Vec<AgentRow>> },
    GetAgent {
        agent_id: String,
        reply: oneshot::Sender<Option<AgentHandle>>,
    },
    AgentTree {
        agent_id: Option<String>,
        reply: Reply<Value>,
    },
    DeleteAgent { agent_id: String, reply: Reply<()> },
    ForkAgent {
        source_id: String,
        at: Option<u64>,
        reply: Reply<String>,
    },
    IsChildOf {
        parent_id: String,
        child_id: String,
        reply: oneshot::Sender<bool>,
    },
    SendAgentAction { agent_id: String, action: Value },
    ChildReport { child_id: String, report: String },

    GetVars { reply: Reply<BTreeMap<String, Value>> },
    PutVars {
        vars: BTreeMap<String, Value>,
        replace: bool,
        reply: Reply<()>,
    },
    DeleteVar { name: String, reply: Reply<()> },

    CreateSchedule {
        req: CreateScheduleRequest,
        reply: Reply<Schedule>,
    },
    UpdateSchedule {
        schedule_id: String,
        patch: UpdateScheduleRequest,
        reply: Reply<Schedule>,
    },
    ListSchedules { reply: Reply<Vec<Schedule>> },
    SetScheduleStatus {
        schedule_id: String,
        status: ScheduleStatus,
        reply: Reply<Schedule>,
    },
    TriggerSchedule { schedule_id: String, reply: Reply<()> },
    ScheduleFire { schedule_id: String },
    ListRuns {
        schedule_id: String,
        reply: Reply<Vec<ScheduleRun>>,
    },

    McpAdd {
        name: String,
        url: String,
        headers: BTreeMap<String, String>,
        reply: Reply<McpServer>,
    },
    McpList { reply: Reply<Vec<McpServer>> },
    McpRetry { server_id: String, reply: Reply<McpServer> },
    McpRemove { server_id: String, reply: Reply<()> },
    McpTools { reply: Reply<Vec<RemoteToolDesc>> },
    McpCall {
        server_id: String,
        tool: String,
        args: Value,
        reply: Reply<Value>,
    },

    FsList {
        path: String,
        agent: Option<String>,
        reply: Reply<Vec<String>>,
    },
    FsRead {
        path: String,
        agent: Option<String>,
        reply: Reply<Option<Vec<u8>>>,
    },
    FsWrite {
        path: String,
        agent: Option<String>,
        data: Vec<u8>,
        reply: Reply<()>,
    },
    FsDelete {
        path: String,
        agent: Option<String>,
        reply: Reply<()>,
    },

    Destroy { reply: oneshot::Sender<()> },
}

/// Cheap-to-clone handle to a running agency actor.
#[derive(Clone)]
pub struct AgencyHandle {
    pub id: String,
    pub name: String,
    tx: mpsc::UnboundedSender<AgencyMsg>,
    events: broadcast::Sender<RelayedEvent>,
}

impl AgencyHandle {
    async fn request<T>(
        &self,
        make: impl FnOnce(Reply<T>) -> AgencyMsg,
    ) -> Result<T, AgencyError> {
        let (tx, rx) = oneshot::channel();
        self.tx.send(make(tx)).map_err(|_| AgencyError::Gone)?;
        rx.await.map_err(|_| AgencyError::Gone)?
    }

    /// Subscribe to the relayed event stream of every agent in the tenant.
    pub fn subscribe(&self) -> broadcast::Receiver<RelayedEvent> {
        self.events.subscribe()
    }

    pub async fn create_blueprint(&self, bp: Blueprint) -> Result<Blueprint, AgencyError> {
        self.request(|reply| AgencyMsg::CreateBlueprint { bp, reply }).await
    }

    pub async fn list_blueprints(&self) -> Result<Vec<Blueprint>, AgencyError> {
        self.request(|reply| AgencyMsg::ListBlueprints { reply }).await
    }

    pub async fn delete_blueprint(&self, name: String) -> Result<(), AgencyError> {
        self.request(|reply| AgencyMsg::DeleteBlueprint { name, reply }).await
    }

    pub async fn spawn_agent(&self, req: SpawnRequest) -> Result<String, AgencyError> {
        self.request(|reply| AgencyMsg::SpawnAgent { req, reply }).await
    }

    pub async fn invoke_agent(
        &self,
        agent_id: String,
        messages: Vec<ChatMessage>,
        vars: BTreeMap<String, Value>,
    ) -> Result<(), AgencyError> {
        self.request(|reply| AgencyMsg::InvokeAgent {
            agent_id,
            messages,
            vars,
            reply,
        })
        .await
    }

    pub async fn list_agents(&self) -> Result<Vec<AgentRow>, AgencyError> {
        self.request(|reply| AgencyMsg::ListAgents { reply }).await
    }

    /// The live handle for one agent, for endpoint forwarding.
    pub async fn agent(&self, agent_id: String) -> Option<AgentHandle> {
        let (tx, rx) = oneshot::channel();
        self.tx
            .send(AgencyMsg::GetAgent {
                agent_id,
                reply: tx,
            })
            .ok()?;
        rx.await.ok().flatten()
    }

    /// `None` id returns the whole forest; an id returns that agent with
    /// its ancestor chain and BFS descendants.
    pub async fn agent_tree(&self, agent_id: Option<String>) -> Result<Value, AgencyError> {
        self.request(|reply| AgencyMsg::AgentTree { agent_id, reply }).await
    }

    pub async fn delete_agent(&self, agent_id: String) -> Result<(), AgencyError> {
        self.request(|reply| AgencyMsg::DeleteAgent { agent_id, reply }).await
    }

    pub async fn fork_agent(
        &self,
        source_id: String,
        at: Option<u64>,
    ) -> Result<String, AgencyError> {
        self.request(|reply| AgencyMsg::ForkAgent {
            source_id,
            at,
            reply,
        })
        .await
    }

    pub async fn get_vars(&self) -> Result<BTreeMap<String, Value>, AgencyError> {
        self.request(|reply| AgencyMsg::GetVars { reply }).await
    }

    pub async fn put_vars(
        &self,
        vars: BTreeMap<String, Value>,
        replace: bool,
    ) -> Result<(), AgencyError> {
        self.request(|reply| AgencyMsg::PutVars {
            vars,
            replace,
            reply,
        })
        .await
    }

    pub async fn delete_var(&self, name: String) -> Result<(), AgencyError> {
        self.request(|reply| AgencyMsg::DeleteVar { name, reply }).await
    }

    pub async fn create_schedule(
        &self,
        req: CreateScheduleRequest,
    ) -> Result<Schedule, AgencyError> {
        self.request(|reply| AgencyMsg::CreateSchedule { req, reply }).await
    }

    pub async fn update_schedule(
        &self,
        schedule_id: String,
        patch: UpdateScheduleRequest,
    ) -> Result<Schedule, AgencyError> {
        self.request(|reply| AgencyMsg::UpdateSchedule {
            schedule_id,
            patch,
            reply,
        })
        .await
    }

    pub async fn list_schedules(&self) -> Result<Vec<Schedule>, AgencyError> {
        self.request(|reply| AgencyMsg::ListSchedules { reply }).await
    }

    pub async fn set_schedule_status(
        &self,
        schedule_id: String,
        status: ScheduleStatus,
    ) -> Result<Schedule, AgencyError> {
        self.request(|reply| AgencyMsg::SetScheduleStatus {
            schedule_id,
            status,
            reply,
        })
        .await
    }

    pub async fn trigger_schedule(&self, schedule_id: String) -> Result<(), AgencyError> {
        self.request(|reply| AgencyMsg::TriggerSchedule { schedule_id, reply })
            .await
    }

    pub async fn schedule_runs(&self, schedule_id: String) -> Result<Vec<ScheduleRun>, AgencyError> {
        self.request(|reply| AgencyMsg::ListRuns { schedule_id, reply }).await
    }

    pub async fn mcp_add(
        &self,
        name: String,
        url: String,
        headers: BTreeMap<String, String>,
    ) -> Result<McpServer, AgencyError> {
        self.request(|reply| AgencyMsg::McpAdd {
            name,
            url,
            headers,
            reply,
        })
        .await
    }

    pub async fn mcp_list(&self) -> Result<Vec<McpServer>, AgencyError> {
        self.request(|reply| AgencyMsg::McpList { reply }).await
    }

    pub async fn mcp_retry(&self, server_id: String) -> Result<McpServer, AgencyError> {
        self.request(|reply| AgencyMsg::McpRetry { server_id, reply }).await
    }

    pub async fn mcp_remove(&self, server_id: String) -> Result<(), AgencyError> {
        self.request(|reply| AgencyMsg::McpRemove { server_id, reply }).await
    }

    pub async fn mcp_tools(&self) -> Result<Vec<RemoteToolDesc>, AgencyError> {
        self.request(|reply| AgencyMsg::McpTools { reply }).await
    }

    pub async fn mcp_call(
        &self,
        server_id: String,
        tool: String,
        args: Value,
    ) -> Result<Value, AgencyError> {
        self.request(|reply| AgencyMsg::McpCall {
            server_id,
            tool,
            args,
            reply,
        })
        .await
    }

    pub async fn fs_list(
        &self,
        path: String,
        agent: Option<String>,
    ) -> Result<Vec<String>, AgencyError> {
        self.request(|reply| AgencyMsg::FsList { path, agent, reply }).await
    }

    pub async fn fs_read(
        &self,
        path: String,
        agent: Option<String>,
    ) -> Result<Option<Vec<u8>>, AgencyError> {
        self.request(|reply| AgencyMsg::FsRead { path, agent, reply }).await
    }

    pub async fn fs_write(
        &self,
        path: String,
        agent: Option<String>,
        data: Vec<u8>,
    ) -> Result<(), AgencyError> {
        self.request(|reply| AgencyMsg::FsWrite {
            path,
            agent,
            data,
            reply,
        })
        .await
    }

    pub async fn fs_delete(&self, path: String, agent: Option<String>) -> Result<(), AgencyError> {
        self.request(|reply| AgencyMsg::FsDelete { path, agent, reply }).await
    }

    /// Destroy every agent, drop the tenant's file prefix, and stop.
    pub async fn destroy(&self) -> Result<(), AgencyError> {
        let (tx, rx) = oneshot::channel();
        self.tx
            .send(AgencyMsg::Destroy { reply: tx })
            .map_err(|_| AgencyError::Gone)?;
        rx.await.map_err(|_| AgencyError::Gone)
    }
}

/// Everything needed to start one agency actor.
pub struct AgencyParams {
    pub id: String,
    pub name: String,
    pub store: AgencyStore,
    pub hub: Arc<Hub>,
    pub provider: Arc<dyn Provider>,
    /// Blueprints registered in the process, merged into listings.
    pub static_blueprints: Vec<Blueprint>,
    pub files: Arc<dyn FileStore>,
    pub remote_client: Box<dyn RemoteToolClient>,
    pub config: AgencyConfig,
}

pub struct AgencyActor {
    id: String,
    store: AgencyStore,
    hub: Arc<Hub>,
    provider: Arc<dyn Provider>,
    static_blueprints: Vec<Blueprint>,
    files: Arc<dyn FileStore>,
    catalog: McpCatalog,
    config: AgencyConfig,

    agents: HashMap<String, AgentHandle>,
    alarms: HashMap<String, JoinHandle<()>>,
    bridge: Arc<AgencyBridge>,
    self_tx: mpsc::UnboundedSender<AgencyMsg>,
    events: broadcast::Sender<RelayedEvent>,
}

impl AgencyActor {
    pub fn spawn(params: AgencyParams) -> AgencyHandle {
        let (tx, rx) = mpsc::unbounded_channel();
        let (relay_tx, relay_rx) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(1024);

        let handle = AgencyHandle {
            id: params.id.clone(),
            name: params.name,
            tx: tx.clone(),
            events: events.clone(),
        };

        let bridge = Arc::new(AgencyBridge {
            tx: tx.clone(),
            relay_tx,
        });

        let actor = AgencyActor {
            id: params.id,
            store: params.store,
            hub: params.hub,
            provider: params.provider,
            static_blueprints: params.static_blueprints,
            files: params.files,
            catalog: McpCatalog::new(params.remote_client),
            config: params.config,
            agents: HashMap::new(),
            alarms: HashMap::new(),
            bridge,
            self_tx: tx,
            events,
        };

        tokio::spawn(actor.run(rx, relay_rx));
        handle
    }

    async fn run(
        mut self,
        mut rx: mpsc::UnboundedReceiver<AgencyMsg>,
        mut relay_rx: mpsc::UnboundedReceiver<RelayedEvent>,
    ) {
        info!(agency = %self.id, "agency actor started");

        // Re-arm alarms for schedules persisted before a restart.
        if let Ok(schedules) = self.store.list_schedules() {
            for s in &schedules {
                self.arm_alarm(s);
            }
        }

        loop {
            tokio::select! {
                msg = rx.recv() => {
                    let Some(msg) = msg else { break };
                    if self.handle_msg(msg).await {
                        break;
                    }
                }
                Some(ev) = relay_rx.recv() => {
                    // No subscribers is fine; fan-out is best-effort.
                    let _ = self.events.send(ev);
                }
            }
        }

        for alarm in self.alarms.values() {
            alarm.abort();
        }
        info!(agency = %self.id, "agency actor stopped");
    }

    /// Returns `true` when the actor should shut down.
    async fn handle_msg(&mut self, msg: AgencyMsg) -> bool {
        match msg {
            AgencyMsg::CreateBlueprint { bp, reply } => {
                let _ = reply.send(self.create_blueprint(bp));
            }
            AgencyMsg::ListBlueprints { reply } => {
                let _ = reply.send(self.list_blueprints());
            }
            AgencyMsg::DeleteBlueprint { name, reply } => {
                let result = match self.store.delete_blueprint(&name) {
                    Ok(true) => Ok(()),
                    Ok(false) => Err(AgencyError::NotFound(format!("blueprint {name}"))),
                    Err(e) => Err(e.into()),
                };
                let _ = reply.send(result);
            }
            AgencyMsg::SpawnAgent { req, reply } => {
                let _ = reply.send(self.spawn_agent(req).await);
            }
            AgencyMsg::InvokeAgent {
                agent_id,
                messages,
                vars,
                reply,
            } => {
                let result = match self.agents.get(&agent_id) {
                    Some(handle) => handle.invoke(messages, vars).await.map_err(Into::into),
                    None => Err(AgencyError::NotFound(format!("agent {agent_id}"))),
                };
                let _ = reply.send(result);
            }
            AgencyMsg::ListAgents { reply } => {
                let _ = reply.send(self.store.list_agents().map_err(Into::into));
            }
            AgencyMsg::GetAgent { agent_id, reply } => {
                let _ = reply.send(self.agents.get(&agent_id).cloned());
            }
            AgencyMsg::AgentTree { agent_id, reply } => {
                let _ = reply.send(self.agent_tree(agent_id));
            }
            AgencyMsg::DeleteAgent { agent_id, reply } => {
                let _ = reply.send(self.delete_agent(&agent_id));
            }
            AgencyMsg::ForkAgent {
                source_id,
                at,
                reply,
            } => {
                let _ = reply.send(self.fork_agent(&source_id, at).await);
            }
            AgencyMsg::IsChildOf {
                parent_id,
                child_id,
                reply,
            } => {
                let is_child = self
                    .store
                    .get_agent(&child_id)
                    .ok()
                    .flatten()
                    .and_then(|row| row.related_agent_id)
                    .is_some_and(|p| p == parent_id);
                let _ = reply.send(is_child);
            }
            AgencyMsg::SendAgentAction { agent_id, action } => {
                if let Some(handle) = self.agents.get(&agent_id).cloned() {
                    tokio::spawn(async move {
                        if let Err(e) = handle.action(action).await {
                            warn!(agent = %agent_id, "relayed action failed: {e}");
                        }
                    });
                } else {
                    warn!(agent = %agent_id, "relayed action for unknown agent dropped");
                }
            }
            AgencyMsg::ChildReport { child_id, report } => {
                self.record_child_report(&child_id, &report);
            }
            AgencyMsg::GetVars { reply } => {
                let _ = reply.send(self.store.vars_all().map_err(Into::into));
            }
            AgencyMsg::PutVars {
                vars,
                replace,
                reply,
            } => {
                let result = if replace {
                    self.store.vars_replace(&vars).map_err(Into::into)
                } else {
                    vars.iter()
                        .try_for_each(|(k, v)| self.store.var_set(k, v))
                        .map_err(Into::into)
                };
                let _ = reply.send(result);
            }
            AgencyMsg::DeleteVar { name, reply } => {
                let result = match self.store.var_delete(&name) {
                    Ok(true) => Ok(()),
                    Ok(false) => Err(AgencyError::NotFound(format!("var {name}"))),
                    Err(e) => Err(e.into()),
                };
                let _ = reply.send(result);
            }
            AgencyMsg::CreateSchedule { req, reply } => {
                let _ = reply.send(self.create_schedule(req));
            }
            AgencyMsg::UpdateSchedule {
                schedule_id,
                patch,
                reply,
            } => {
                let _ = reply.send(self.update_schedule(&schedule_id, patch));
            }
            AgencyMsg::ListSchedules { reply } => {
                let _ = reply.send(self.store.list_schedules().map_err(Into::into));
            }
            AgencyMsg::SetScheduleStatus {
                schedule_id,
                status,
                reply,
            } => {
                let _ = reply.send(self.set_schedule_status(&schedule_id, status));
            }
            AgencyMsg::TriggerSchedule { schedule_id, reply } => {
                let _ = reply.send(self.execute_schedule(&schedule_id, true).await);
            }
            AgencyMsg::ScheduleFire { schedule_id } => {
                if let Err(e) = self.execute_schedule(&schedule_id, false).await {
                    warn!(schedule = %schedule_id, "schedule execution failed: {e}");
                }
            }
            AgencyMsg::ListRuns { schedule_id, reply } => {
                let _ = reply.send(self.store.list_runs(&schedule_id).map_err(Into::into));
            }
            AgencyMsg::McpAdd {
                name,
                url,
                headers,
                reply,
            } => {
                let server = self.catalog.add(name, url, headers).await.clone();
                let _ = reply.send(Ok(server));
            }
            AgencyMsg::McpList { reply } => {
                let _ = reply.send(Ok(self.catalog.servers().to_vec()));
            }
            AgencyMsg::McpRetry { server_id, reply } => {
                self.catalog.discover(&server_id).await;
                let result = self
                    .catalog
                    .get(&server_id)
                    .cloned()
                    .ok_or_else(|| AgencyError::NotFound(format!("tool server {server_id}")));
                let _ = reply.send(result);
            }
            AgencyMsg::McpRemove { server_id, reply } => {
                let result = if self.catalog.remove(&server_id) {
                    Ok(())
                } else {
                    Err(AgencyError::NotFound(format!("tool server {server_id}")))
                };
                let _ = reply.send(result);
            }
            AgencyMsg::McpTools { reply } => {
                let _ = reply.send(Ok(self.catalog.all_tools()));
            }
            AgencyMsg::McpCall {
                server_id,
                tool,
                args,
                reply,
            } => {
                let result = self
                    .catalog
                    .call(&server_id, &tool, args)
                    .await
                    .map_err(Into::into);
                let _ = reply.send(result);
            }
            AgencyMsg::FsList { path, agent, reply } => {
                let result = match resolve_path(&path, agent.as_deref(), false) {
                    Ok(key) => self
                        .files
                        .list(&self.file_key(&key))
                        .await
                        .map(|keys| self.strip_tenant_prefix(keys))
                        .map_err(Into::into),
                    Err(e) => Err(e.into()),
                };
                let _ = reply.send(result);
            }
            AgencyMsg::FsRead { path, agent, reply } => {
                let result = match resolve_path(&path, agent.as_deref(), false) {
                    Ok(key) => self.files.read(&self.file_key(&key)).await.map_err(Into::into),
                    Err(e) => Err(e.into()),
                };
                let _ = reply.send(result);
            }
            AgencyMsg::FsWrite {
                path,
                agent,
                data,
                reply,
            } => {
                let result = match resolve_path(&path, agent.as_deref(), true) {
                    Ok(key) => self
                        .files
                        .write(&self.file_key(&key), data)
                        .await
                        .map_err(Into::into),
                    Err(e) => Err(e.into()),
                };
                let _ = reply.send(result);
            }
            AgencyMsg::FsDelete { path, agent, reply } => {
                let result = match resolve_path(&path, agent.as_deref(), true) {
                    Ok(key) => match self.files.delete(&self.file_key(&key)).await {
                        Ok(true) => Ok(()),
                        Ok(false) => Err(AgencyError::NotFound(path)),
                        Err(e) => Err(e.into()),
                    },
                    Err(e) => Err(e.into()),
                };
                let _ = reply.send(result);
            }
            AgencyMsg::Destroy { reply } => {
                // Agents wind down in the background; the file prefix drops
                // before we acknowledge.
                for (id, handle) in self.agents.drain() {
                    tokio::spawn(async move {
                        if let Err(e) = handle.destroy().await {
                            debug!(agent = %id, "destroy during teardown: {e}");
                        }
                    });
                }
                if let Err(e) = self.files.delete_prefix(&format!("{}/", self.id)).await {
                    warn!(agency = %self.id, "file prefix cleanup failed: {e}");
                }
                let _ = reply.send(());
                return true;
            }
        }
        false
    }

    // ── Blueprints ───────────────────────────────────────────────────────────

    fn create_blueprint(&mut self, bp: Blueprint) -> Result<Blueprint, AgencyError> {
        bp.validate()?;
        let merged = match self.store.get_blueprint(&bp.name)? {
            Some(prior) => bp.merged_over(&prior),
            None => bp,
        };
        self.store.upsert_blueprint(&merged)?;
        Ok(merged)
    }

    /// Dynamic blueprints shadow same-named static ones.
    fn list_blueprints(&self) -> Result<Vec<Blueprint>, AgencyError> {
        let mut out = self.store.list_blueprints()?;
        for s in &self.static_blueprints {
            if !out.iter().any(|b| b.name == s.name) {
                out.push(s.clone());
            }
        }
        out.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(out)
    }

    fn lookup_blueprint(&self, name: &str) -> Result<Blueprint, AgencyError> {
        if let Some(bp) = self.store.get_blueprint(name)? {
            return Ok(bp);
        }
        self.static_blueprints
            .iter()
            .find(|b| b.name == name)
            .cloned()
            .ok_or_else(|| AgencyError::NotFound(format!("blueprint {name}")))
    }

    // ── Agents ───────────────────────────────────────────────────────────────

    async fn spawn_agent(&mut self, req: SpawnRequest) -> Result<String, AgencyError> {
        let blueprint = self.lookup_blueprint(&req.agent_type)?;
        let id = Uuid::new_v4().to_string();

        self.store.insert_agent(&AgentRow {
            id: id.clone(),
            agent_type: req.agent_type.clone(),
            created_at: Utc::now(),
            metadata: req.origin.clone(),
            related_agent_id: req.related_agent_id.clone(),
        })?;

        let store = self.open_agent_store(&id)?;
        let handle = AgentActor::spawn(AgentParams {
            id: id.clone(),
            blueprint,
            store,
            provider: self.provider.clone(),
            hub: self.hub.clone(),
            agency: self.bridge.clone(),
            config: self.config.agent.clone(),
        });
        self.agents.insert(id.clone(), handle.clone());

        let mut vars = self.store.vars_all()?;
        vars.extend(req.extra_vars);
        handle
            .register(ThreadMetadata {
                agency_id: self.id.clone(),
                agent_type: req.agent_type.clone(),
                request: req.origin,
                vars,
                mcp_servers: self.catalog.all_tools(),
            })
            .await?;

        if let Some(input) = req.input {
            let (messages, extra) = match input {
                Value::String(text) => (vec![ChatMessage::user(text)], BTreeMap::new()),
                other => {
                    let mut extra = BTreeMap::new();
                    extra.insert("INPUT".to_string(), other);
                    (Vec::new(), extra)
                }
            };
            handle.invoke(messages, extra).await?;
        }

        info!(agency = %self.id, agent = %id, agent_type = %req.agent_type, "agent spawned");
        Ok(id)
    }

    fn open_agent_store(&self, agent_id: &str) -> Result<EventStore, AgencyError> {
        match &self.config.data_dir {
            None => Ok(EventStore::open_in_memory()?),
            Some(dir) => {
                let agents_dir = dir.join(&self.id).join("agents");
                std::fs::create_dir_all(&agents_dir)
                    .map_err(|e| AgencyError::Internal(format!("creating agent dir: {e}")))?;
                Ok(EventStore::open(agents_dir.join(format!("{agent_id}.db")))?)
            }
        }
    }

    fn delete_agent(&mut self, agent_id: &str) -> Result<(), AgencyError> {
        if !self.store.delete_agent(agent_id)? {
            return Err(AgencyError::NotFound(format!("agent {agent_id}")));
        }
        // Children keep their rows: the parent/child link is a relation,
        // not ownership.
        if let Some(handle) = self.agents.remove(agent_id) {
            tokio::spawn(async move {
                let _ = handle.destroy().await;
            });
        }
        Ok(())
    }

    fn record_child_report(&mut self, child_id: &str, report: &str) {
        let Ok(Some(row)) = self.store.get_agent(child_id) else {
            return;
        };
        let mut metadata = row.metadata;
        if !metadata.is_object() {
            metadata = json!({});
        }
        metadata["subagentStatus"] = json!("completed");
        metadata["report"] = json!(report);
        if let Err(e) = self.store.update_agent_metadata(child_id, &metadata) {
            warn!(agent = %child_id, "could not record child report: {e}");
        }
    }

    fn agent_tree(&self, agent_id: Option<String>) -> Result<Value, AgencyError> {
        let rows = self.store.list_agents()?;
        match agent_id {
            None => {
                // Forest: roots with nested children.
                let roots: Vec<Value> = rows
                    .iter()
                    .filter(|r| r.related_agent_id.is_none())
                    .map(|r| self.nest(r, &rows))
                    .collect();
                Ok(json!({ "roots": roots }))
            }
            Some(id) => {
                let agent = rows
                    .iter()
                    .find(|r| r.id == id)
                    .ok_or_else(|| AgencyError::NotFound(format!("agent {id}")))?;

                // Ancestors: parent chain, nearest first.
                let mut ancestors = Vec::new();
                let mut cursor = agent.related_agent_id.clone();
                while let Some(parent_id) = cursor {
                    let Some(parent) = rows.iter().find(|r| r.id == parent_id) else {
                        break;
                    };
                    ancestors.push(json!(parent));
                    cursor = parent.related_agent_id.clone();
                }

                // Descendants: BFS.
                let mut descendants = Vec::new();
                let mut queue = vec![id.clone()];
                while let Some(next) = queue.pop() {
                    for child in rows.iter().filter(|r| {
                        r.related_agent_id.as_deref() == Some(next.as_str())
                    }) {
                        descendants.push(json!(child));
                        queue.insert(0, child.id.clone());
                    }
                }

                Ok(json!({
                    "agent": agent,
                    "ancestors": ancestors,
                    "descendants": descendants,
                }))
            }
        }
    }

    fn nest(&self, row: &AgentRow, rows: &[AgentRow]) -> Value {
        let children: Vec<Value> = rows
            .iter()
            .filter(|r| r.related_agent_id.as_deref() == Some(row.id.as_str()))
            .map(|r| self.nest(r, rows))
            .collect();
        json!({ "agent": row, "children": children })
    }

    async fn fork_agent(
        &mut self,
        source_id: &str,
        at: Option<u64>,
    ) -> Result<String, AgencyError> {
        let source_row = self
            .store
            .get_agent(source_id)?
            .ok_or_else(|| AgencyError::NotFound(format!("agent {source_id}")))?;
        let source = self
            .agents
            .get(source_id)
            .cloned()
            .ok_or_else(|| AgencyError::NotFound(format!("agent {source_id}")))?;

        let cut = at.unwrap_or(u64::MAX);
        let events = source.events_until(cut).await?;
        let forked_at = events.last().map(|e| e.seq).unwrap_or(0);

        let new_id = self
            .spawn_agent(SpawnRequest {
                agent_type: source_row.agent_type.clone(),
                input: None,
                related_agent_id: None,
                extra_vars: BTreeMap::new(),
                origin: json!({ "forkedFrom": source_id, "forkedAt": forked_at }),
            })
            .await?;

        let token = make_fork_token(source_id, &new_id, &self.id);
        let target = self
            .agents
            .get(&new_id)
            .cloned()
            .ok_or_else(|| AgencyError::Internal("fork target vanished".into()))?;
        target
            .copy_events(token, source_id.to_string(), forked_at, events)
            .await?;
        Ok(new_id)
    }

    // ── Schedules ────────────────────────────────────────────────────────────

    fn create_schedule(&mut self, req: CreateScheduleRequest) -> Result<Schedule, AgencyError> {
        // The blueprint must exist up front; schedule spawns must not fail
        // on a typo months later.
        self.lookup_blueprint(&req.agent_type)?;
        let schedule = req.into_schedule(Utc::now())?;
        self.store.upsert_schedule(&schedule)?;
        self.arm_alarm(&schedule);
        Ok(schedule)
    }

    fn update_schedule(
        &mut self,
        schedule_id: &str,
        patch: UpdateScheduleRequest,
    ) -> Result<Schedule, AgencyError> {
        let mut s = self
            .store
            .get_schedule(schedule_id)?
            .ok_or_else(|| AgencyError::NotFound(format!("schedule {schedule_id}")))?;

        if let Some(name) = patch.name {
            s.name = name;
        }
        if let Some(input) = patch.input {
            s.input = Some(input);
        }
        if let Some(run_at) = patch.run_at {
            s.run_at = Some(run_at);
        }
        if let Some(cron) = patch.cron {
            s.cron = Some(cron);
        }
        if let Some(ms) = patch.interval_ms {
            s.interval_ms = Some(ms);
        }
        if let Some(p) = patch.overlap_policy {
            s.overlap_policy = p;
        }
        if let Some(r) = patch.max_retries {
            s.max_retries = r;
        }
        if let Some(t) = patch.timeout_ms {
            s.timeout_ms = Some(t);
        }
        s.updated_at = Utc::now();
        if s.status == ScheduleStatus::Active {
            s.next_run_at = compute_next_run(&s, Utc::now());
        }
        self.store.upsert_schedule(&s)?;
        self.arm_alarm(&s);
        Ok(s)
    }

    fn set_schedule_status(
        &mut self,
        schedule_id: &str,
        status: ScheduleStatus,
    ) -> Result<Schedule, AgencyError> {
        let mut s = self
            .store
            .get_schedule(schedule_id)?
            .ok_or_else(|| AgencyError::NotFound(format!("schedule {schedule_id}")))?;
        s.status = status;
        s.updated_at = Utc::now();
        s.next_run_at = match status {
            ScheduleStatus::Active => compute_next_run(&s, Utc::now()),
            _ => None,
        };
        self.store.upsert_schedule(&s)?;
        self.arm_alarm(&s);
        Ok(s)
    }

    /// One executor invocation for schedule `S`.  `manual` bypasses the
    /// status and overlap checks (the operator asked for a run, they get
    /// one).
    async fn execute_schedule(
        &mut self,
        schedule_id: &str,
        manual: bool,
    ) -> Result<(), AgencyError> {
        let Some(mut s) = self.store.get_schedule(schedule_id)? else {
            return Err(AgencyError::NotFound(format!("schedule {schedule_id}")));
        };
        if !manual && s.status != ScheduleStatus::Active {
            return Ok(());
        }

        // `queue` has no persisted FIFO and proceeds like `allow`.
        if !manual
            && s.overlap_policy == OverlapPolicy::Skip
            && self.store.has_running_run(&s.id)?
        {
            debug!(schedule = %s.id, "prior run still going; skipping this firing");
            self.advance_schedule(&mut s)?;
            return Ok(());
        }

        let now = Utc::now();
        let mut run = ScheduleRun {
            id: Uuid::new_v4().to_string(),
            schedule_id: s.id.clone(),
            agent_id: None,
            status: RunOutcome::Running,
            scheduled_at: now,
            started_at: Some(now),
            completed_at: None,
            error: None,
            retry_count: 0,
        };
        self.store.upsert_run(&run)?;

        // Retries cover infrastructural spawn failures only; once the agent
        // is running, its own errors are its own story.
        loop {
            let spawn = self
                .spawn_agent(SpawnRequest {
                    agent_type: s.agent_type.clone(),
                    input: s.input.clone(),
                    related_agent_id: None,
                    extra_vars: BTreeMap::new(),
                    origin: json!({ "scheduleId": s.id, "runId": run.id }),
                })
                .await;
            match spawn {
                Ok(agent_id) => {
                    run.status = RunOutcome::Completed;
                    run.agent_id = Some(agent_id);
                    run.completed_at = Some(Utc::now());
                    break;
                }
                Err(e) if run.retry_count < s.max_retries => {
                    warn!(schedule = %s.id, attempt = run.retry_count, "spawn failed, retrying: {e}");
                    run.retry_count += 1;
                }
                Err(e) => {
                    error!(schedule = %s.id, "spawn failed: {e}");
                    run.status = RunOutcome::Failed;
                    run.error = Some(e.to_string());
                    run.completed_at = Some(Utc::now());
                    break;
                }
            }
        }
        self.store.upsert_run(&run)?;

        s.last_run_at = Some(now);
        self.advance_schedule(&mut s)?;
        Ok(())
    }

    /// Post-run bookkeeping: `once` disables itself; everything else
    /// recomputes `next_run_at` and re-arms (replacing any prior alarm).
    fn advance_schedule(&mut self, s: &mut Schedule) -> Result<(), AgencyError> {
        if s.schedule_type == ScheduleType::Once {
            s.status = ScheduleStatus::Disabled;
            s.next_run_at = None;
        } else if s.status == ScheduleStatus::Active {
            s.next_run_at = compute_next_run(s, Utc::now());
        }
        s.updated_at = Utc::now();
        self.store.upsert_schedule(s)?;
        self.arm_alarm(s);
        Ok(())
    }

    /// At most one alarm is pending per schedule; re-arming replaces it.
    fn arm_alarm(&mut self, s: &Schedule) {
        if let Some(old) = self.alarms.remove(&s.id) {
            old.abort();
        }
        if s.status != ScheduleStatus::Active {
            return;
        }
        let Some(next) = s.next_run_at else {
            return;
        };
        let delay = (next - Utc::now()).to_std().unwrap_or_default();
        let tx = self.self_tx.clone();
        let id = s.id.clone();
        self.alarms.insert(
            s.id.clone(),
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                let _ = tx.send(AgencyMsg::ScheduleFire { schedule_id: id });
            }),
        );
    }

    // ── Files ────────────────────────────────────────────────────────────────

    fn file_key(&self, resolved: &str) -> String {
        format!("{}/{}", self.id, resolved)
    }

    fn strip_tenant_prefix(&self, keys: Vec<String>) -> Vec<String> {
        let prefix = format!("{}/", self.id);
        keys.into_iter()
            .map(|k| k.trim_start_matches(&prefix).to_string())
            .collect()
    }
}

// ─── Agent → Agency bridge ────────────────────────────────────────────────────

/// [`AgencyApi`] implementation handed to every agent in this agency.
struct AgencyBridge {
    tx: mpsc::UnboundedSender<AgencyMsg>,
    relay_tx: mpsc::UnboundedSender<RelayedEvent>,
}

impl AgencyBridge {
    async fn request<T>(
        &self,
        make: impl FnOnce(Reply<T>) -> AgencyMsg,
    ) -> anyhow::Result<T> {
        let (tx, rx) = oneshot::channel();
        self.tx
            .send(make(tx))
            .map_err(|_| anyhow::anyhow!("agency has shut down"))?;
        rx.await
            .map_err(|_| anyhow::anyhow!("agency has shut down"))?
            .map_err(|e| anyhow::anyhow!(e.to_string()))
    }
}

#[async_trait]
impl AgencyApi for AgencyBridge {
    async fn spawn_child(
        &self,
        parent_id: &str,
        agent_type: &str,
        input: &str,
        extra_vars: BTreeMap<String, Value>,
    ) -> anyhow::Result<String> {
        let req = SpawnRequest {
            agent_type: agent_type.to_string(),
            input: Some(Value::String(input.to_string())),
            related_agent_id: Some(parent_id.to_string()),
            extra_vars,
            origin: json!({ "spawnedBy": parent_id }),
        };
        self.request(|reply| AgencyMsg::SpawnAgent { req, reply }).await
    }

    async fn reinvoke_child(
        &self,
        child_id: &str,
        input: &str,
        extra_vars: BTreeMap<String, Value>,
    ) -> anyhow::Result<()> {
        let agent_id = child_id.to_string();
        let messages = vec![ChatMessage::user(input)];
        self.request(|reply| AgencyMsg::InvokeAgent {
            agent_id,
            messages,
            vars: extra_vars,
            reply,
        })
        .await
    }

    async fn is_child_of(&self, parent_id: &str, child_id: &str) -> bool {
        let (tx, rx) = oneshot::channel();
        let sent = self.tx.send(AgencyMsg::IsChildOf {
            parent_id: parent_id.to_string(),
            child_id: child_id.to_string(),
            reply: tx,
        });
        if sent.is_err() {
            return false;
        }
        rx.await.unwrap_or(false)
    }

    async fn send_action(&self, agent_id: &str, action: Value) {
        let _ = self.tx.send(AgencyMsg::SendAgentAction {
            agent_id: agent_id.to_string(),
            action,
        });
    }

    async fn note_child_report(&self, child_id: &str, report: &str) {
        let _ = self.tx.send(AgencyMsg::ChildReport {
            child_id: child_id.to_string(),
            report: report.to_string(),
        });
    }

    async fn call_remote_tool(
        &self,
        server_id: &str,
        tool: &str,
        args: Value,
    ) -> anyhow::Result<Value> {
        let server_id = server_id.to_string();
        let tool = tool.to_string();
        self.request(|reply| AgencyMsg::McpCall {
            server_id,
            tool,
            args,
            reply,
        })
        .await
    }

    fn open_relay(
        &self,
        _agent_id: &str,
        _agent_type: &str,
    ) -> mpsc::UnboundedSender<RelayedEvent> {
        self.relay_tx.clone()
    }
}
