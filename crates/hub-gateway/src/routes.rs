// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! The public REST surface, mapping requests onto agency and agent
//! operations.
//!
//! CORS is wide-open and preflights answer 204; every other request passes
//! the shared-secret gate (see [`crate::auth`]) before reaching a handler.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use axum::extract::{Path, Query, RawQuery, Request, State};
use axum::http::{header, HeaderValue, Method, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, patch, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::info;
use uuid::Uuid;

use hub_agency::{
    AgencyHandle, CreateScheduleRequest, ScheduleStatus, SpawnRequest, UpdateScheduleRequest,
};
use hub_core::{AgentHandle, Blueprint};
use hub_events::Event;
use hub_model::{codec::flat_to_parts, ChatMessage, FlatMessage, Part};

use crate::auth::{key_from_query, SecretGate};
use crate::error::GatewayError;

/// Builds one agency actor; the binary wires in stores, providers, and the
/// process hub.
pub type AgencyFactory = Box<dyn Fn(&str, &str) -> AgencyHandle + Send + Sync>;

/// Process-level registry of live agencies.
pub struct AgencyRegistry {
    factory: AgencyFactory,
    inner: tokio::sync::RwLock<HashMap<String, AgencyHandle>>,
}

impl AgencyRegistry {
    pub fn new(factory: AgencyFactory) -> Self {
        Self {
            factory,
            inner: tokio::sync::RwLock::new(HashMap::new()),
        }
    }

    pub async fn create(&self, name: &str) -> Result<AgencyHandle, GatewayError> {
        if name.trim().is_empty() {
            return Err(GatewayError::Validation("agency name must not be empty".into()));
        }
        let mut inner = self.inner.write().await;
        if inner.values().any(|a| a.name == name) {
            return Err(GatewayError::Conflict(format!("agency {name:?} already exists")));
        }
        let id = Uuid::new_v4().to_string();
        let handle = (self.factory)(&id, name);
        inner.insert(id, handle.clone());
        info!(agency = %handle.id, %name, "agency created");
        Ok(handle)
    }

    pub async fn list(&self) -> Vec<AgencyHandle> {
        self.inner.read().await.values().cloned().collect()
    }

    pub async fn get(&self, id: &str) -> Result<AgencyHandle, GatewayError> {
        self.inner
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| GatewayError::NotFound(format!("agency {id}")))
    }

    pub async fn delete(&self, id: &str) -> Result<(), GatewayError> {
        let handle = {
            let mut inner = self.inner.write().await;
            inner
                .remove(id)
                .ok_or_else(|| GatewayError::NotFound(format!("agency {id}")))?
        };
        handle.destroy().await.map_err(GatewayError::from)
    }
}

#[derive(Clone)]
pub struct GatewayState {
    pub gate: SecretGate,
    pub registry: Arc<AgencyRegistry>,
}

pub fn router(state: GatewayState) -> Router {
    Router::new()
        .route("/agencies", post(create_agency).get(list_agencies))
        .route("/agency/:agency_id", delete(delete_agency))
        .route(
            "/agency/:agency_id/blueprints",
            get(list_blueprints).post(create_blueprint),
        )
        .route("/agency/:agency_id/blueprints/:name", delete(delete_blueprint))
        .route("/agency/:agency_id/agents", get(list_agents).post(spawn_agent))
        .route("/agency/:agency_id/agents/tree", get(agent_forest))
        .route("/agency/:agency_id/agents/:agent_id/tree", get(agent_tree))
        .route("/agency/:agency_id/agents/:agent_id", delete(delete_agent))
        .route(
            "/agency/:agency_id/schedules",
            get(list_schedules).post(create_schedule),
        )
        .route("/agency/:agency_id/schedules/:sid", patch(update_schedule))
        .route("/agency/:agency_id/schedules/:sid/pause", post(pause_schedule))
        .route("/agency/:agency_id/schedules/:sid/resume", post(resume_schedule))
        .route("/agency/:agency_id/schedules/:sid/trigger", post(trigger_schedule))
        .route("/agency/:agency_id/schedules/:sid/runs", get(schedule_runs))
        .route("/agency/:agency_id/vars", get(get_vars).put(put_vars))
        .route(
            "/agency/:agency_id/vars/:key",
            get(get_var).put(put_var).delete(delete_var),
        )
        .route("/agency/:agency_id/mcp", get(mcp_list).post(mcp_add))
        .route("/agency/:agency_id/mcp/tools", get(mcp_tools))
        .route("/agency/:agency_id/mcp/call", post(mcp_call))
        .route("/agency/:agency_id/mcp/:sid/retry", post(mcp_retry))
        .route("/agency/:agency_id/mcp/:sid", delete(mcp_remove))
        .route("/agency/:agency_id/fs", get(fs_root_get).put(fs_root_put).delete(fs_root_delete))
        .route(
            "/agency/:agency_id/fs/*path",
            get(fs_get).put(fs_put).delete(fs_delete),
        )
        .route("/agency/:agency_id/ws", get(crate::ws::ws_handler))
        .route("/agency/:agency_id/agent/:agent_id/invoke", post(agent_invoke))
        .route("/agency/:agency_id/agent/:agent_id/action", post(agent_action))
        .route("/agency/:agency_id/agent/:agent_id/state", get(agent_state))
        .route("/agency/:agency_id/agent/:agent_id/events", get(agent_events))
        .route(
            "/agency/:agency_id/agent/:agent_id/projection",
            get(agent_projection),
        )
        .route("/agency/:agency_id/agent/:agent_id/export", get(agent_export))
        .route("/agency/:agency_id/agent/:agent_id/fork", post(agent_fork))
        .route(
            "/agency/:agency_id/agent/:agent_id/internal/copy-events",
            post(agent_copy_events),
        )
        .route(
            "/agency/:agency_id/agent/:agent_id/destroy",
            delete(agent_destroy),
        )
        .layer(middleware::from_fn_with_state(state.clone(), secret_gate_mw))
        .layer(middleware::from_fn(cors_mw))
        .with_state(state)
}

// ── Middleware ────────────────────────────────────────────────────────────────

/// Wide-open CORS; preflights answer 204 without touching the gate.
async fn cors_mw(req: Request, next: Next) -> Response {
    if req.method() == Method::OPTIONS {
        return cors_headers((StatusCode::NO_CONTENT, ()).into_response());
    }
    cors_headers(next.run(req).await)
}

fn cors_headers(mut resp: Response) -> Response {
    let headers = resp.headers_mut();
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_ORIGIN,
        HeaderValue::from_static("*"),
    );
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_METHODS,
        HeaderValue::from_static("GET, POST, PUT, PATCH, DELETE, OPTIONS"),
    );
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_HEADERS,
        HeaderValue::from_static("Content-Type, X-SECRET, X-Agent-Id, X-Agent-Type"),
    );
    resp
}

async fn secret_gate_mw(
    State(state): State<GatewayState>,
    req: Request,
    next: Next,
) -> Response {
    let path = req.uri().path();
    if SecretGate::is_exempt(path) {
        return next.run(req).await;
    }

    let presented_header = req
        .headers()
        .get("x-secret")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    let presented_query = req.uri().query().and_then(key_from_query);
    let ws_offer = req
        .headers()
        .get(header::SEC_WEBSOCKET_PROTOCOL)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);

    let ok = presented_header.map(|s| state.gate.verify(&s)).unwrap_or(false)
        || presented_query.map(|s| state.gate.verify(&s)).unwrap_or(false)
        || ws_offer
            .map(|p| state.gate.verify_subprotocols(&p))
            .unwrap_or(false);

    if ok {
        next.run(req).await
    } else {
        GatewayError::Unauthorized.into_response()
    }
}

// ── Agencies ──────────────────────────────────────────────────────────────────

#[derive(Deserialize)]
struct CreateAgencyBody {
    name: String,
}

async fn create_agency(
    State(state): State<GatewayState>,
    Json(body): Json<CreateAgencyBody>,
) -> Result<Json<Value>, GatewayError> {
    let handle = state.registry.create(&body.name).await?;
    Ok(Json(json!({ "id": handle.id, "name": handle.name })))
}

async fn list_agencies(State(state): State<GatewayState>) -> Json<Value> {
    let agencies: Vec<Value> = state
        .registry
        .list()
        .await
        .iter()
        .map(|a| json!({ "id": a.id, "name": a.name }))
        .collect();
    Json(json!(agencies))
}

async fn delete_agency(
    State(state): State<GatewayState>,
    Path(agency_id): Path<String>,
) -> Result<StatusCode, GatewayError> {
    state.registry.delete(&agency_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn agency_of(
    state: &GatewayState,
    agency_id: &str,
) -> Result<AgencyHandle, GatewayError> {
    state.registry.get(agency_id).await
}

async fn agent_of(
    state: &GatewayState,
    agency_id: &str,
    agent_id: &str,
) -> Result<AgentHandle, GatewayError> {
    let agency = agency_of(state, agency_id).await?;
    agency
        .agent(agent_id.to_string())
        .await
        .ok_or_else(|| GatewayError::NotFound(format!("agent {agent_id}")))
}

// ── Blueprints ────────────────────────────────────────────────────────────────

async fn list_blueprints(
    State(state): State<GatewayState>,
    Path(agency_id): Path<String>,
) -> Result<Json<Value>, GatewayError> {
    let agency = agency_of(&state, &agency_id).await?;
    let blueprints = agency.list_blueprints().await?;
    Ok(Json(json!(blueprints)))
}

async fn create_blueprint(
    State(state): State<GatewayState>,
    Path(agency_id): Path<String>,
    Json(bp): Json<Blueprint>,
) -> Result<Json<Value>, GatewayError> {
    let agency = agency_of(&state, &agency_id).await?;
    let created = agency.create_blueprint(bp).await?;
    Ok(Json(json!(created)))
}

async fn delete_blueprint(
    State(state): State<GatewayState>,
    Path((agency_id, name)): Path<(String, String)>,
) -> Result<StatusCode, GatewayError> {
    let agency = agency_of(&state, &agency_id).await?;
    agency.delete_blueprint(name).await?;
    Ok(StatusCode::NO_CONTENT)
}

// ── Agents ────────────────────────────────────────────────────────────────────

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SpawnBody {
    agent_type: String,
    #[serde(default)]
    input: Option<Value>,
    #[serde(default)]
    related_agent_id: Option<String>,
}

async fn list_agents(
    State(state): State<GatewayState>,
    Path(agency_id): Path<String>,
) -> Result<Json<Value>, GatewayError> {
    let agency = agency_of(&state, &agency_id).await?;
    Ok(Json(json!(agency.list_agents().await?)))
}

async fn spawn_agent(
    State(state): State<GatewayState>,
    Path(agency_id): Path<String>,
    Json(body): Json<SpawnBody>,
) -> Result<Json<Value>, GatewayError> {
    let agency = agency_of(&state, &agency_id).await?;
    let id = agency
        .spawn_agent(SpawnRequest {
            agent_type: body.agent_type.clone(),
            input: body.input,
            related_agent_id: body.related_agent_id,
            extra_vars: BTreeMap::new(),
            origin: json!({ "via": "gateway", "agentType": body.agent_type }),
        })
        .await?;
    Ok(Json(json!({ "id": id })))
}

async fn agent_forest(
    State(state): State<GatewayState>,
    Path(agency_id): Path<String>,
) -> Result<Json<Value>, GatewayError> {
    let agency = agency_of(&state, &agency_id).await?;
    Ok(Json(agency.agent_tree(None).await?))
}

async fn agent_tree(
    State(state): State<GatewayState>,
    Path((agency_id, agent_id)): Path<(String, String)>,
) -> Result<Json<Value>, GatewayError> {
    let agency = agency_of(&state, &agency_id).await?;
    Ok(Json(agency.agent_tree(Some(agent_id)).await?))
}

async fn delete_agent(
    State(state): State<GatewayState>,
    Path((agency_id, agent_id)): Path<(String, String)>,
) -> Result<StatusCode, GatewayError> {
    let agency = agency_of(&state, &agency_id).await?;
    agency.delete_agent(agent_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

// ── Schedules ─────────────────────────────────────────────────────────────────

async fn list_schedules(
    State(state): State<GatewayState>,
    Path(agency_id): Path<String>,
) -> Result<Json<Value>, GatewayError> {
    let agency = agency_of(&state, &agency_id).await?;
    Ok(Json(json!(agency.list_schedules().await?)))
}

async fn create_schedule(
    State(state): State<GatewayState>,
    Path(agency_id): Path<String>,
    Json(req): Json<CreateScheduleRequest>,
) -> Result<Json<Value>, GatewayError> {
    let agency = agency_of(&state, &agency_id).await?;
    Ok(Json(json!(agency.create_schedule(req).await?)))
}

async fn update_schedule(
    State(state): State<GatewayState>,
    Path((agency_id, sid)): Path<(String, String)>,
    Json(patch): Json<UpdateScheduleRequest>,
) -> Result<Json<Value>, GatewayError> {
    let agency = agency_of(&state, &agency_id).await?;
    Ok(Json(json!(agency.update_schedule(sid, patch).await?)))
}

async fn pause_schedule(
    State(state): State<GatewayState>,
    Path((agency_id, sid)): Path<(String, String)>,
) -> Result<Json<Value>, GatewayError> {
    let agency = agency_of(&state, &agency_id).await?;
    Ok(Json(json!(
        agency.set_schedule_status(sid, ScheduleStatus::Paused).await?
    )))
}

async fn resume_schedule(
    State(state): State<GatewayState>,
    Path((agency_id, sid)): Path<(String, String)>,
) -> Result<Json<Value>, GatewayError> {
    let agency = agency_of(&state, &agency_id).await?;
    Ok(Json(json!(
        agency.set_schedule_status(sid, ScheduleStatus::Active).await?
    )))
}

async fn trigger_schedule(
    State(state): State<GatewayState>,
    Path((agency_id, sid)): Path<(String, String)>,
) -> Result<Json<Value>, GatewayError> {
    let agency = agency_of(&state, &agency_id).await?;
    agency.trigger_schedule(sid).await?;
    Ok(Json(json!({ "ok": true })))
}

async fn schedule_runs(
    State(state): State<GatewayState>,
    Path((agency_id, sid)): Path<(String, String)>,
) -> Result<Json<Value>, GatewayError> {
    let agency = agency_of(&state, &agency_id).await?;
    Ok(Json(json!(agency.schedule_runs(sid).await?)))
}

// ── Vars ──────────────────────────────────────────────────────────────────────

async fn get_vars(
    State(state): State<GatewayState>,
    Path(agency_id): Path<String>,
) -> Result<Json<Value>, GatewayError> {
    let agency = agency_of(&state, &agency_id).await?;
    Ok(Json(json!(agency.get_vars().await?)))
}

async fn put_vars(
    State(state): State<GatewayState>,
    Path(agency_id): Path<String>,
    Json(vars): Json<BTreeMap<String, Value>>,
) -> Result<Json<Value>, GatewayError> {
    let agency = agency_of(&state, &agency_id).await?;
    agency.put_vars(vars, true).await?;
    Ok(Json(json!(agency.get_vars().await?)))
}

async fn get_var(
    State(state): State<GatewayState>,
    Path((agency_id, key)): Path<(String, String)>,
) -> Result<Json<Value>, GatewayError> {
    let agency = agency_of(&state, &agency_id).await?;
    let vars = agency.get_vars().await?;
    match vars.get(&key) {
        Some(v) => Ok(Json(v.clone())),
        None => Err(GatewayError::NotFound(format!("var {key}"))),
    }
}

async fn put_var(
    State(state): State<GatewayState>,
    Path((agency_id, key)): Path<(String, String)>,
    Json(value): Json<Value>,
) -> Result<Json<Value>, GatewayError> {
    let agency = agency_of(&state, &agency_id).await?;
    let mut vars = BTreeMap::new();
    vars.insert(key, value.clone());
    agency.put_vars(vars, false).await?;
    Ok(Json(value))
}

async fn delete_var(
    State(state): State<GatewayState>,
    Path((agency_id, key)): Path<(String, String)>,
) -> Result<StatusCode, GatewayError> {
    let agency = agency_of(&state, &agency_id).await?;
    agency.delete_var(key).await?;
    Ok(StatusCode::NO_CONTENT)
}

// ── External tool servers ─────────────────────────────────────────────────────

#[derive(Deserialize)]
struct McpAddBody {
    name: String,
    url: String,
    #[serde(default)]
    headers: BTreeMap<String, String>,
}

async fn mcp_list(
    State(state): State<GatewayState>,
    Path(agency_id): Path<String>,
) -> Result<Json<Value>, GatewayError> {
    let agency = agency_of(&state, &agency_id).await?;
    Ok(Json(json!(agency.mcp_list().await?)))
}

async fn mcp_add(
    State(state): State<GatewayState>,
    Path(agency_id): Path<String>,
    Json(body): Json<McpAddBody>,
) -> Result<Json<Value>, GatewayError> {
    let agency = agency_of(&state, &agency_id).await?;
    Ok(Json(json!(
        agency.mcp_add(body.name, body.url, body.headers).await?
    )))
}

async fn mcp_retry(
    State(state): State<GatewayState>,
    Path((agency_id, sid)): Path<(String, String)>,
) -> Result<Json<Value>, GatewayError> {
    let agency = agency_of(&state, &agency_id).await?;
    Ok(Json(json!(agency.mcp_retry(sid).await?)))
}

async fn mcp_remove(
    State(state): State<GatewayState>,
    Path((agency_id, sid)): Path<(String, String)>,
) -> Result<StatusCode, GatewayError> {
    let agency = agency_of(&state, &agency_id).await?;
    agency.mcp_remove(sid).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn mcp_tools(
    State(state): State<GatewayState>,
    Path(agency_id): Path<String>,
) -> Result<Json<Value>, GatewayError> {
    let agency = agency_of(&state, &agency_id).await?;
    Ok(Json(json!(agency.mcp_tools().await?)))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct McpCallBody {
    server_id: String,
    tool_name: String,
    #[serde(default)]
    arguments: Value,
}

async fn mcp_call(
    State(state): State<GatewayState>,
    Path(agency_id): Path<String>,
    Json(body): Json<McpCallBody>,
) -> Result<Json<Value>, GatewayError> {
    let agency = agency_of(&state, &agency_id).await?;
    let out = agency
        .mcp_call(body.server_id, body.tool_name, body.arguments)
        .await?;
    Ok(Json(json!({ "result": out })))
}

// ── Tenant filesystem ─────────────────────────────────────────────────────────

async fn fs_do(
    state: &GatewayState,
    agency_id: &str,
    path: String,
    method: Method,
    body: Option<Vec<u8>>,
) -> Result<Response, GatewayError> {
    let agency = agency_of(state, agency_id).await?;
    match method {
        Method::GET => {
            // A stored object reads back directly; otherwise list the prefix.
            if let Some(data) = agency.fs_read(path.clone(), None).await? {
                return Ok(data.into_response());
            }
            let entries = agency.fs_list(path, None).await?;
            Ok(Json(json!({ "entries": entries })).into_response())
        }
        Method::PUT => {
            agency
                .fs_write(path, None, body.unwrap_or_default())
                .await?;
            Ok(StatusCode::NO_CONTENT.into_response())
        }
        Method::DELETE => {
            agency.fs_delete(path, None).await?;
            Ok(StatusCode::NO_CONTENT.into_response())
        }
        _ => Err(GatewayError::Validation("unsupported fs method".into())),
    }
}

async fn fs_root_get(
    State(state): State<GatewayState>,
    Path(agency_id): Path<String>,
) -> Result<Response, GatewayError> {
    fs_do(&state, &agency_id, String::new(), Method::GET, None).await
}

async fn fs_root_put(
    State(state): State<GatewayState>,
    Path(agency_id): Path<String>,
    body: axum::body::Bytes,
) -> Result<Response, GatewayError> {
    fs_do(&state, &agency_id, String::new(), Method::PUT, Some(body.to_vec())).await
}

async fn fs_root_delete(
    State(state): State<GatewayState>,
    Path(agency_id): Path<String>,
) -> Result<Response, GatewayError> {
    fs_do(&state, &agency_id, String::new(), Method::DELETE, None).await
}

async fn fs_get(
    State(state): State<GatewayState>,
    Path((agency_id, path)): Path<(String, String)>,
) -> Result<Response, GatewayError> {
    fs_do(&state, &agency_id, path, Method::GET, None).await
}

async fn fs_put(
    State(state): State<GatewayState>,
    Path((agency_id, path)): Path<(String, String)>,
    body: axum::body::Bytes,
) -> Result<Response, GatewayError> {
    fs_do(&state, &agency_id, path, Method::PUT, Some(body.to_vec())).await
}

async fn fs_delete(
    State(state): State<GatewayState>,
    Path((agency_id, path)): Path<(String, String)>,
) -> Result<Response, GatewayError> {
    fs_do(&state, &agency_id, path, Method::DELETE, None).await
}

// ── Agent endpoint forwarding ─────────────────────────────────────────────────

#[derive(Deserialize)]
struct InvokeBody {
    #[serde(default)]
    messages: Option<Vec<Value>>,
    #[serde(default)]
    files: Option<Vec<String>>,
    #[serde(default)]
    vars: Option<BTreeMap<String, Value>>,
}

/// Accept both plain strings and flat legacy rows as input messages.
fn parse_input_messages(
    raw: Vec<Value>,
    files: Option<Vec<String>>,
) -> Result<Vec<ChatMessage>, GatewayError> {
    let mut messages = Vec::with_capacity(raw.len());
    for item in raw {
        let msg = match item {
            Value::String(text) => ChatMessage::user(text),
            obj => {
                let flat: FlatMessage = serde_json::from_value(obj)
                    .map_err(|e| GatewayError::Validation(format!("invalid message: {e}")))?;
                flat_to_parts(&flat)
                    .map_err(|e| GatewayError::Validation(e.to_string()))?
            }
        };
        messages.push(msg);
    }
    // Attached files ride along as media parts on the last user message.
    if let Some(files) = files {
        if let Some(last) = messages.iter_mut().rev().find(|m| m.role == hub_model::Role::User) {
            for url in files {
                last.parts.push(Part::Media { url, mime: None });
            }
        }
    }
    Ok(messages)
}

async fn agent_invoke(
    State(state): State<GatewayState>,
    Path((agency_id, agent_id)): Path<(String, String)>,
    Json(body): Json<InvokeBody>,
) -> Result<Json<Value>, GatewayError> {
    let agent = agent_of(&state, &agency_id, &agent_id).await?;
    let messages = parse_input_messages(body.messages.unwrap_or_default(), body.files)?;
    agent
        .invoke(messages, body.vars.unwrap_or_default())
        .await?;
    Ok(Json(json!({ "ok": true })))
}

async fn agent_action(
    State(state): State<GatewayState>,
    Path((agency_id, agent_id)): Path<(String, String)>,
    Json(action): Json<Value>,
) -> Result<Json<Value>, GatewayError> {
    let agent = agent_of(&state, &agency_id, &agent_id).await?;
    Ok(Json(agent.action(action).await?))
}

async fn agent_state(
    State(state): State<GatewayState>,
    Path((agency_id, agent_id)): Path<(String, String)>,
) -> Result<Json<Value>, GatewayError> {
    let agent = agent_of(&state, &agency_id, &agent_id).await?;
    Ok(Json(agent.state().await?))
}

async fn agent_events(
    State(state): State<GatewayState>,
    Path((agency_id, agent_id)): Path<(String, String)>,
) -> Result<Json<Value>, GatewayError> {
    let agent = agent_of(&state, &agency_id, &agent_id).await?;
    Ok(Json(json!(agent.events().await?)))
}

#[derive(Deserialize)]
struct ProjectionQuery {
    #[serde(default)]
    at: Option<u64>,
    #[serde(default)]
    legacy: Option<bool>,
}

async fn agent_projection(
    State(state): State<GatewayState>,
    Path((agency_id, agent_id)): Path<(String, String)>,
    Query(q): Query<ProjectionQuery>,
) -> Result<Json<Value>, GatewayError> {
    let agent = agent_of(&state, &agency_id, &agent_id).await?;
    Ok(Json(
        agent.projection(q.at, q.legacy.unwrap_or(false)).await?,
    ))
}

async fn agent_export(
    State(state): State<GatewayState>,
    Path((agency_id, agent_id)): Path<(String, String)>,
    RawQuery(query): RawQuery,
) -> Result<Json<Value>, GatewayError> {
    let agent = agent_of(&state, &agency_id, &agent_id).await?;
    let include_snapshot = query
        .as_deref()
        .map(|q| q.contains("includeSnapshot=true"))
        .unwrap_or(false);
    Ok(Json(agent.export(include_snapshot).await?))
}

#[derive(Deserialize)]
struct ForkBody {
    #[serde(default)]
    at: Option<u64>,
}

async fn agent_fork(
    State(state): State<GatewayState>,
    Path((agency_id, agent_id)): Path<(String, String)>,
    Json(body): Json<ForkBody>,
) -> Result<Json<Value>, GatewayError> {
    let agency = agency_of(&state, &agency_id).await?;
    let new_id = agency.fork_agent(agent_id, body.at).await?;
    Ok(Json(json!({ "id": new_id })))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CopyEventsBody {
    token: String,
    source_id: String,
    #[serde(default)]
    forked_at: u64,
    events: Vec<Value>,
}

async fn agent_copy_events(
    State(state): State<GatewayState>,
    Path((agency_id, agent_id)): Path<(String, String)>,
    Json(body): Json<CopyEventsBody>,
) -> Result<Json<Value>, GatewayError> {
    let agent = agent_of(&state, &agency_id, &agent_id).await?;
    let events: Vec<Event> = body
        .events
        .iter()
        .filter_map(Event::from_json)
        .collect();
    if events.len() != body.events.len() {
        return Err(GatewayError::Validation("malformed event in batch".into()));
    }
    let inserted = agent
        .copy_events(body.token, body.source_id, body.forked_at, events)
        .await?;
    Ok(Json(json!({ "inserted": inserted })))
}

async fn agent_destroy(
    State(state): State<GatewayState>,
    Path((agency_id, agent_id)): Path<(String, String)>,
) -> Result<StatusCode, GatewayError> {
    let agency = agency_of(&state, &agency_id).await?;
    agency.delete_agent(agent_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn input_messages_accept_strings_and_flat_rows() {
        let raw = vec![
            json!("hello"),
            json!({ "role": "user", "content": "structured" }),
        ];
        let messages = parse_input_messages(raw, None).unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].text_content().as_deref(), Some("hello"));
        assert_eq!(messages[1].text_content().as_deref(), Some("structured"));
    }

    #[test]
    fn malformed_message_is_validation_error() {
        let raw = vec![json!({ "content": "role is missing" })];
        assert!(matches!(
            parse_input_messages(raw, None),
            Err(GatewayError::Validation(_))
        ));
    }

    #[test]
    fn files_attach_to_last_user_message() {
        let raw = vec![json!("look at this")];
        let messages =
            parse_input_messages(raw, Some(vec!["hub://files/x.png".into()])).unwrap();
        assert_eq!(messages[0].parts.len(), 2);
        assert!(matches!(messages[0].parts[1], Part::Media { .. }));
    }
}
