// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! End-to-end scenarios through the HTTP gateway: each test boots a full
//! in-process stack (gateway → agency actor → agent actors) against a
//! scripted model provider and drives it over real HTTP.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tokio::net::TcpListener;

use hub_agency::{AgencyActor, AgencyConfig, AgencyParams, AgencyStore, MemFileStore};
use hub_core::{AgentConfig, Blueprint};
use hub_gateway::{AgencyRegistry, GatewayState, SecretGate};
use hub_model::{ModelResponse, Provider, ScriptedProvider};
use hub_tools::{AddTool, EchoTool, Hub, RemoteToolDesc};

const SECRET: &str = "test-secret";

struct NoRemote;

#[async_trait::async_trait]
impl hub_agency::RemoteToolClient for NoRemote {
    async fn list_tools(
        &self,
        _server: &hub_agency::McpServer,
    ) -> anyhow::Result<Vec<RemoteToolDesc>> {
        Ok(vec![])
    }
    async fn call_tool(
        &self,
        _server: &hub_agency::McpServer,
        _tool: &str,
        _args: Value,
    ) -> anyhow::Result<hub_agency::RemoteCallResult> {
        anyhow::bail!("no remote tools")
    }
}

/// Boot a gateway whose agencies all share `provider`, bound to an
/// ephemeral port.  Returns the base URL.
async fn start_server(provider: Arc<dyn Provider>) -> String {
    let mut hub = Hub::new();
    hub.register_tool(EchoTool);
    hub.register_tool(AddTool);
    let hub = Arc::new(hub);
    let files = Arc::new(MemFileStore::default());

    let registry = AgencyRegistry::new(Box::new(move |id: &str, name: &str| {
        AgencyActor::spawn(AgencyParams {
            id: id.to_string(),
            name: name.to_string(),
            store: AgencyStore::open_in_memory().unwrap(),
            hub: hub.clone(),
            provider: provider.clone(),
            static_blueprints: vec![],
            files: files.clone(),
            remote_client: Box::new(NoRemote),
            config: AgencyConfig {
                data_dir: None,
                agent: AgentConfig::default(),
            },
        })
    }));

    let state = GatewayState {
        gate: SecretGate::new(SECRET),
        registry: Arc::new(registry),
    };

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, hub_gateway::router(state))
            .await
            .unwrap();
    });
    format!("http://{addr}")
}

fn client() -> reqwest::Client {
    reqwest::Client::new()
}

async fn post(base: &str, path: &str, body: Value) -> Value {
    let resp = client()
        .post(format!("{base}{path}"))
        .header("X-SECRET", SECRET)
        .json(&body)
        .send()
        .await
        .unwrap();
    assert!(
        resp.status().is_success(),
        "POST {path} failed: {} {}",
        resp.status(),
        resp.text().await.unwrap_or_default()
    );
    resp.json().await.unwrap_or(Value::Null)
}

async fn get(base: &str, path: &str) -> Value {
    let resp = client()
        .get(format!("{base}{path}"))
        .header("X-SECRET", SECRET)
        .send()
        .await
        .unwrap();
    assert!(resp.status().is_success(), "GET {path}: {}", resp.status());
    resp.json().await.unwrap_or(Value::Null)
}

async fn create_agency(base: &str) -> String {
    let created = post(base, "/agencies", json!({"name": "acme"})).await;
    created["id"].as_str().unwrap().to_string()
}

async fn create_blueprint(base: &str, agency: &str, name: &str, capabilities: Vec<&str>) {
    let bp = Blueprint {
        name: name.into(),
        prompt: format!("You are {name}."),
        capabilities: capabilities.into_iter().map(String::from).collect(),
        model: None,
        vars: BTreeMap::new(),
        created_at: chrono_now(),
    };
    post(base, &format!("/agency/{agency}/blueprints"), json!(bp)).await;
}

fn chrono_now() -> chrono::DateTime<chrono::Utc> {
    chrono::Utc::now()
}

async fn spawn_agent(base: &str, agency: &str, agent_type: &str, input: Value) -> String {
    let created = post(
        base,
        &format!("/agency/{agency}/agents"),
        json!({"agentType": agent_type, "input": input}),
    )
    .await;
    created["id"].as_str().unwrap().to_string()
}

async fn wait_for_status(base: &str, agency: &str, agent: &str, want: &str) -> Value {
    for _ in 0..300 {
        let state = get(base, &format!("/agency/{agency}/agent/{agent}/state")).await;
        if state["status"] == want {
            return state;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("agent {agent} never reached {want}");
}

// ── Gate and CORS ─────────────────────────────────────────────────────────────

#[tokio::test]
async fn requests_without_secret_are_unauthorized() {
    let base = start_server(Arc::new(ScriptedProvider::always_text("x"))).await;

    let resp = client()
        .get(format!("{base}/agencies"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 401);

    // The `key` query parameter is an accepted alternative.
    let resp = client()
        .get(format!("{base}/agencies?key={SECRET}"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);

    let resp = client()
        .get(format!("{base}/agencies?key=wrong"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 401);
}

#[tokio::test]
async fn preflight_returns_204_with_open_cors() {
    let base = start_server(Arc::new(ScriptedProvider::always_text("x"))).await;
    let resp = client()
        .request(reqwest::Method::OPTIONS, format!("{base}/agencies"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 204);
    assert_eq!(
        resp.headers()
            .get("access-control-allow-origin")
            .and_then(|v| v.to_str().ok()),
        Some("*")
    );
}

#[tokio::test]
async fn duplicate_agency_name_conflicts() {
    let base = start_server(Arc::new(ScriptedProvider::always_text("x"))).await;
    post(&base, "/agencies", json!({"name": "acme"})).await;
    let resp = client()
        .post(format!("{base}/agencies"))
        .header("X-SECRET", SECRET)
        .json(&json!({"name": "acme"}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 409);
}

// ── S1: round-trip inference ──────────────────────────────────────────────────

#[tokio::test]
async fn s1_round_trip_inference() {
    let provider = Arc::new(ScriptedProvider::new(vec![ScriptedProvider::text_response(
        "hi", 3, 1,
    )]));
    let base = start_server(provider).await;
    let agency = create_agency(&base).await;
    create_blueprint(&base, &agency, "echo", vec!["@default"]).await;

    let agent = spawn_agent(&base, &agency, "echo", json!("hi")).await;
    let state = wait_for_status(&base, &agency, &agent, "completed").await;

    let proj = &state["projection"];
    let messages = proj["messages"].as_array().unwrap();
    assert_eq!(messages.len(), 2);
    assert_eq!(messages[0]["role"], "user");
    assert_eq!(messages[0]["parts"][0]["text"], "hi");
    assert_eq!(messages[1]["role"], "assistant");
    assert_eq!(messages[1]["parts"][0]["text"], "hi");
    assert_eq!(proj["totalInputTokens"], 3);
    assert_eq!(proj["totalOutputTokens"], 1);

    let events = get(&base, &format!("/agency/{agency}/agent/{agent}/events")).await;
    let completed = events
        .as_array()
        .unwrap()
        .iter()
        .filter(|e| e["type"] == "agent_completed")
        .count();
    assert_eq!(completed, 1);
}

// ── S2: tool call and resume ──────────────────────────────────────────────────

#[tokio::test]
async fn s2_tool_call_and_resume() {
    let provider = Arc::new(ScriptedProvider::new(vec![
        ScriptedProvider::tool_call_response("c1", "add", json!({"a": 2, "b": 3})),
        ScriptedProvider::text_response("5", 8, 1),
    ]));
    let base = start_server(provider).await;
    let agency = create_agency(&base).await;
    create_blueprint(&base, &agency, "calc", vec!["@default"]).await;

    let agent = spawn_agent(&base, &agency, "calc", json!("what is 2+3?")).await;
    let state = wait_for_status(&base, &agency, &agent, "completed").await;

    let messages = state["projection"]["messages"].as_array().unwrap();
    assert_eq!(messages.len(), 4);
    assert_eq!(messages[1]["parts"][0]["type"], "tool_call");
    assert_eq!(messages[2]["role"], "tool");
    assert_eq!(messages[2]["parts"][0]["response"], json!({"result": 5}));
    assert_eq!(messages[3]["parts"][0]["text"], "5");
}

// ── S3: variable interpolation ────────────────────────────────────────────────

#[tokio::test]
async fn s3_variable_interpolation() {
    let provider = Arc::new(ScriptedProvider::new(vec![
        ScriptedProvider::tool_call_response(
            "c1",
            "echo",
            json!({"text": "Hello $NAME, score=$SCORE"}),
        ),
        ScriptedProvider::text_response("ok", 1, 1),
        ScriptedProvider::tool_call_response("c2", "add", json!({"a": "$SCORE", "b": 1})),
        ScriptedProvider::text_response("100", 1, 1),
    ]));
    let base = start_server(provider).await;
    let agency = create_agency(&base).await;
    create_blueprint(&base, &agency, "greeter", vec!["@default"]).await;

    // Tenant vars are visible to every agent spawned afterwards.
    let resp = client()
        .put(format!("{base}/agency/{agency}/vars"))
        .header("X-SECRET", SECRET)
        .json(&json!({"NAME": "Ada", "SCORE": 99}))
        .send()
        .await
        .unwrap();
    assert!(resp.status().is_success());

    let first = spawn_agent(&base, &agency, "greeter", json!("greet")).await;
    let state = wait_for_status(&base, &agency, &first, "completed").await;
    let messages = state["projection"]["messages"].as_array().unwrap();
    assert_eq!(messages[2]["parts"][0]["response"], "Hello Ada, score=99");

    let second = spawn_agent(&base, &agency, "greeter", json!("sum")).await;
    let state = wait_for_status(&base, &agency, &second, "completed").await;
    let messages = state["projection"]["messages"].as_array().unwrap();
    // The whole-value reference keeps the numeric type: 99 + 1.
    assert_eq!(messages[2]["parts"][0]["response"], json!({"result": 100}));
}

// ── S4: HITL gate ─────────────────────────────────────────────────────────────

#[tokio::test]
async fn s4_hitl_gate() {
    let provider = Arc::new(ScriptedProvider::new(vec![
        ScriptedProvider::tool_call_response("c1", "echo", json!({"text": "original"})),
        ScriptedProvider::text_response("done", 1, 1),
    ]));
    let base = start_server(provider).await;
    let agency = create_agency(&base).await;
    create_blueprint(&base, &agency, "gated", vec!["@default"]).await;

    client()
        .put(format!("{base}/agency/{agency}/vars"))
        .header("X-SECRET", SECRET)
        .json(&json!({"HITL_TOOLS": ["echo"]}))
        .send()
        .await
        .unwrap();

    let agent = spawn_agent(&base, &agency, "gated", json!("go")).await;
    let state = wait_for_status(&base, &agency, &agent, "paused").await;
    assert_eq!(state["reason"], "hitl");

    post(
        &base,
        &format!("/agency/{agency}/agent/{agent}/action"),
        json!({
            "type": "approve",
            "approved": true,
            "modifiedToolCalls": [{"id": "c1", "arguments": {"text": "altered"}}],
        }),
    )
    .await;

    let state = wait_for_status(&base, &agency, &agent, "completed").await;
    let messages = state["projection"]["messages"].as_array().unwrap();
    assert_eq!(messages[2]["parts"][0]["response"], "altered");
}

// ── S5: subagent round trip ───────────────────────────────────────────────────

#[tokio::test]
async fn s5_subagent_round_trip() {
    let provider = Arc::new(ScriptedProvider::new(vec![
        ScriptedProvider::tool_call_response(
            "c1",
            "task",
            json!({"description": "calc 2+2", "subagent_type": "child-agent"}),
        ),
        ScriptedProvider::text_response("4", 2, 1),
        ScriptedProvider::text_response("the answer is 4", 9, 4),
    ]));
    let base = start_server(provider).await;
    let agency = create_agency(&base).await;
    create_blueprint(&base, &agency, "parent-agent", vec!["@default", "task"]).await;
    create_blueprint(&base, &agency, "child-agent", vec!["@default"]).await;

    let parent = spawn_agent(&base, &agency, "parent-agent", json!("delegate")).await;
    let state = wait_for_status(&base, &agency, &parent, "completed").await;

    let messages = state["projection"]["messages"].as_array().unwrap();
    let report = &messages[2]["parts"][0]["response"];
    assert_eq!(report["result"], "4");
    let child_id = report["agentId"].as_str().unwrap();
    assert_eq!(messages[3]["parts"][0]["text"], "the answer is 4");

    // The tree endpoint shows the relation.
    let tree = get(&base, &format!("/agency/{agency}/agents/{parent}/tree")).await;
    assert_eq!(tree["descendants"][0]["id"], json!(child_id));

    // Paused-with-waiter state was passed through on the way: the parent's
    // event log shows the subagent pause and resume.
    let events = get(&base, &format!("/agency/{agency}/agent/{parent}/events")).await;
    let kinds: Vec<&str> = events
        .as_array()
        .unwrap()
        .iter()
        .filter_map(|e| e["type"].as_str())
        .collect();
    assert!(kinds.contains(&"agent_paused"));
    assert!(kinds.contains(&"agent_resumed"));
}

// ── S6: fork ──────────────────────────────────────────────────────────────────

#[tokio::test]
async fn s6_fork_matches_projection_at_cut() {
    let provider = Arc::new(ScriptedProvider::new(vec![
        ScriptedProvider::tool_call_response("c1", "add", json!({"a": 1, "b": 2})),
        ScriptedProvider::text_response("3", 4, 1),
    ]));
    let base = start_server(provider).await;
    let agency = create_agency(&base).await;
    create_blueprint(&base, &agency, "calc", vec!["@default"]).await;

    let source = spawn_agent(&base, &agency, "calc", json!("1+2?")).await;
    wait_for_status(&base, &agency, &source, "completed").await;

    let forked = post(
        &base,
        &format!("/agency/{agency}/agent/{source}/fork"),
        json!({"at": 5}),
    )
    .await;
    let fork_id = forked["id"].as_str().unwrap();

    let source_at = get(
        &base,
        &format!("/agency/{agency}/agent/{source}/projection?at=5"),
    )
    .await;
    let fork_now = get(
        &base,
        &format!("/agency/{agency}/agent/{fork_id}/projection"),
    )
    .await;
    assert_eq!(source_at["messages"], fork_now["messages"]);

    let state = get(&base, &format!("/agency/{agency}/agent/{fork_id}/state")).await;
    assert_ne!(state["status"], "completed", "fork starts un-run");
}

// ── Legacy projection rendering ───────────────────────────────────────────────

#[tokio::test]
async fn projection_legacy_flag_renders_flat_messages() {
    let provider = Arc::new(ScriptedProvider::new(vec![ScriptedProvider::text_response(
        "hello", 2, 1,
    )]));
    let base = start_server(provider).await;
    let agency = create_agency(&base).await;
    create_blueprint(&base, &agency, "echo", vec!["@default"]).await;
    let agent = spawn_agent(&base, &agency, "echo", json!("hi")).await;
    wait_for_status(&base, &agency, &agent, "completed").await;

    let legacy = get(
        &base,
        &format!("/agency/{agency}/agent/{agent}/projection?legacy=true"),
    )
    .await;
    let messages = legacy["messages"].as_array().unwrap();
    assert_eq!(messages[0]["content"], "hi");
    assert_eq!(messages[1]["content"], "hello");
    assert!(messages[0].get("parts").is_none());
}

// ── Export ────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn export_returns_full_event_log() {
    let provider = Arc::new(ScriptedProvider::new(vec![ScriptedProvider::text_response(
        "hi", 1, 1,
    )]));
    let base = start_server(provider).await;
    let agency = create_agency(&base).await;
    create_blueprint(&base, &agency, "echo", vec!["@default"]).await;
    let agent = spawn_agent(&base, &agency, "echo", json!("hi")).await;
    wait_for_status(&base, &agency, &agent, "completed").await;

    let export = get(&base, &format!("/agency/{agency}/agent/{agent}/export")).await;
    let events = export["events"].as_array().unwrap();
    assert!(events.len() >= 5);
    assert_eq!(events[0]["seq"], 1);
    assert_eq!(export["agentId"], json!(agent));
}

// ── Schedules over HTTP ───────────────────────────────────────────────────────

#[tokio::test]
async fn schedule_trigger_and_runs_over_http() {
    let provider = Arc::new(ScriptedProvider::new(vec![ScriptedProvider::text_response(
        "done", 1, 1,
    )]));
    let base = start_server(provider).await;
    let agency = create_agency(&base).await;
    create_blueprint(&base, &agency, "reporter", vec!["@default"]).await;

    let schedule = post(
        &base,
        &format!("/agency/{agency}/schedules"),
        json!({
            "name": "hourly",
            "agentType": "reporter",
            "input": "do the report",
            "type": "interval",
            "intervalMs": 3_600_000,
        }),
    )
    .await;
    let sid = schedule["id"].as_str().unwrap();
    assert_eq!(schedule["status"], "active");

    post(&base, &format!("/agency/{agency}/schedules/{sid}/trigger"), json!({})).await;

    let runs = get(&base, &format!("/agency/{agency}/schedules/{sid}/runs")).await;
    let runs = runs.as_array().unwrap();
    assert_eq!(runs.len(), 1);
    assert_eq!(runs[0]["status"], "completed");
    assert!(runs[0]["agentId"].is_string());

    // Pause clears the next firing; resume recomputes it.
    let paused = post(&base, &format!("/agency/{agency}/schedules/{sid}/pause"), json!({})).await;
    assert_eq!(paused["status"], "paused");
    assert!(paused.get("nextRunAt").is_none());
    let resumed = post(&base, &format!("/agency/{agency}/schedules/{sid}/resume"), json!({})).await;
    assert_eq!(resumed["status"], "active");
    assert!(resumed["nextRunAt"].is_string());
}

// ── Tenant filesystem over HTTP ───────────────────────────────────────────────

#[tokio::test]
async fn fs_write_read_delete_over_http() {
    let base = start_server(Arc::new(ScriptedProvider::always_text("x"))).await;
    let agency = create_agency(&base).await;

    let resp = client()
        .put(format!("{base}/agency/{agency}/fs/shared/notes.txt"))
        .header("X-SECRET", SECRET)
        .body("remember this")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 204);

    let resp = client()
        .get(format!("{base}/agency/{agency}/fs/shared/notes.txt"))
        .header("X-SECRET", SECRET)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.text().await.unwrap(), "remember this");

    // Listing a prefix that is not an object returns entries.
    let listing = get(&base, &format!("/agency/{agency}/fs/shared")).await;
    assert_eq!(listing["entries"].as_array().unwrap().len(), 1);

    let resp = client()
        .delete(format!("{base}/agency/{agency}/fs/shared/notes.txt"))
        .header("X-SECRET", SECRET)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 204);
}

// ── Cancel over HTTP ──────────────────────────────────────────────────────────

#[tokio::test]
async fn cancel_action_cancels_a_paused_run() {
    let provider = Arc::new(ScriptedProvider::new(vec![
        ScriptedProvider::tool_call_response("c1", "echo", json!({"text": "x"})),
    ]));
    let base = start_server(provider).await;
    let agency = create_agency(&base).await;
    create_blueprint(&base, &agency, "gated", vec!["@default"]).await;
    client()
        .put(format!("{base}/agency/{agency}/vars"))
        .header("X-SECRET", SECRET)
        .json(&json!({"HITL_TOOLS": ["echo"]}))
        .send()
        .await
        .unwrap();

    let agent = spawn_agent(&base, &agency, "gated", json!("go")).await;
    wait_for_status(&base, &agency, &agent, "paused").await;

    post(
        &base,
        &format!("/agency/{agency}/agent/{agent}/action"),
        json!({"type": "cancel"}),
    )
    .await;

    let state = wait_for_status(&base, &agency, &agent, "canceled").await;
    assert!(state["projection"]["pendingToolCalls"]
        .as_array()
        .unwrap()
        .is_empty());
}

// ── Provider failure surfaces as agent error ──────────────────────────────────

struct FailingProvider;

#[async_trait::async_trait]
impl Provider for FailingProvider {
    fn name(&self) -> &str {
        "failing"
    }
    async fn invoke(
        &self,
        _req: &hub_model::ModelRequest,
        _cancel: &tokio_util::sync::CancellationToken,
    ) -> Result<ModelResponse, hub_model::ProviderError> {
        Err(hub_model::ProviderError::Http {
            status: 401,
            body: "bad key".into(),
        })
    }
}

#[tokio::test]
async fn provider_http_error_is_terminal() {
    let base = start_server(Arc::new(FailingProvider)).await;
    let agency = create_agency(&base).await;
    create_blueprint(&base, &agency, "echo", vec!["@default"]).await;

    let agent = spawn_agent(&base, &agency, "echo", json!("hi")).await;
    let state = wait_for_status(&base, &agency, &agent, "error").await;
    assert!(state["projection"]["lastError"]
        .as_str()
        .unwrap()
        .contains("401"));

    let events = get(&base, &format!("/agency/{agency}/agent/{agent}/events")).await;
    let err = events
        .as_array()
        .unwrap()
        .iter()
        .find(|e| e["type"] == "agent_error")
        .expect("agent_error event");
    assert_eq!(err["data"]["kind"], "provider_http_error");
}
