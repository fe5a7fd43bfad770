// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Actor-level tests driving the full step loop against scripted providers.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::mpsc;

use hub_events::{EventStore, RunStatus};
use hub_model::{ChatMessage, ScriptedProvider};
use hub_tools::{AddTool, EchoTool, Hub, RemoteToolDesc};

use crate::agency_api::{AgencyApi, RelayedEvent};
use crate::agent::{AgentActor, AgentConfig, AgentHandle, AgentParams, ThreadMetadata};
use crate::blueprint::Blueprint;
use crate::fork::make_fork_token;

/// Agency stub: no children, records actions, remote calls echo back.
#[derive(Default)]
struct StubAgency {
    actions: Mutex<Vec<(String, Value)>>,
    remote_calls: Mutex<Vec<(String, String, Value)>>,
}

#[async_trait]
impl AgencyApi for StubAgency {
    async fn spawn_child(
        &self,
        _parent_id: &str,
        _agent_type: &str,
        _input: &str,
        _extra_vars: BTreeMap<String, Value>,
    ) -> anyhow::Result<String> {
        anyhow::bail!("stub agency cannot spawn")
    }

    async fn reinvoke_child(
        &self,
        _child_id: &str,
        _input: &str,
        _extra_vars: BTreeMap<String, Value>,
    ) -> anyhow::Result<()> {
        Ok(())
    }

    async fn is_child_of(&self, _parent_id: &str, _child_id: &str) -> bool {
        false
    }

    async fn send_action(&self, agent_id: &str, action: Value) {
        self.actions
            .lock()
            .unwrap()
            .push((agent_id.to_string(), action));
    }

    async fn note_child_report(&self, _child_id: &str, _report: &str) {}

    async fn call_remote_tool(
        &self,
        server_id: &str,
        tool: &str,
        args: Value,
    ) -> anyhow::Result<Value> {
        self.remote_calls
            .lock()
            .unwrap()
            .push((server_id.to_string(), tool.to_string(), args.clone()));
        Ok(json!(format!("remote:{server_id}:{tool}")))
    }

    fn open_relay(
        &self,
        _agent_id: &str,
        _agent_type: &str,
    ) -> mpsc::UnboundedSender<RelayedEvent> {
        mpsc::unbounded_channel().0
    }
}

fn default_hub() -> Arc<Hub> {
    let mut hub = Hub::new();
    hub.register_tool(EchoTool);
    hub.register_tool(AddTool);
    Arc::new(hub)
}

fn blueprint(capabilities: &[&str]) -> Blueprint {
    Blueprint {
        name: "echo".into(),
        prompt: "You echo.".into(),
        capabilities: capabilities.iter().map(|s| s.to_string()).collect(),
        model: None,
        vars: BTreeMap::new(),
        created_at: chrono::Utc::now(),
    }
}

fn spawn_agent(
    provider: ScriptedProvider,
    capabilities: &[&str],
    config: AgentConfig,
) -> AgentHandle {
    AgentActor::spawn(AgentParams {
        id: "agent-1".into(),
        blueprint: blueprint(capabilities),
        store: EventStore::open_in_memory().unwrap(),
        provider: Arc::new(provider),
        hub: default_hub(),
        agency: Arc::new(StubAgency::default()),
        config,
    })
}

fn meta_with_vars(vars: BTreeMap<String, Value>) -> ThreadMetadata {
    ThreadMetadata {
        agency_id: "ag-1".into(),
        agent_type: "echo".into(),
        request: json!({"origin": "test"}),
        vars,
        mcp_servers: vec![],
    }
}

async fn wait_for_status(handle: &AgentHandle, want: RunStatus) -> Value {
    let want = json!(want);
    for _ in 0..200 {
        let state = handle.state().await.unwrap();
        if state["status"] == want {
            return state;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("agent never reached status {want}");
}

#[tokio::test]
async fn round_trip_inference_completes() {
    let provider = ScriptedProvider::new(vec![ScriptedProvider::text_response("hi", 3, 1)]);
    let handle = spawn_agent(provider, &["@default"], AgentConfig::default());

    handle.register(meta_with_vars(BTreeMap::new())).await.unwrap();
    handle
        .invoke(vec![ChatMessage::user("hi")], BTreeMap::new())
        .await
        .unwrap();

    let state = wait_for_status(&handle, RunStatus::Completed).await;
    let proj = &state["projection"];
    assert_eq!(proj["messages"].as_array().unwrap().len(), 2);
    assert_eq!(proj["totalInputTokens"], 3);
    assert_eq!(proj["totalOutputTokens"], 1);
    assert_eq!(proj["inferenceCount"], 1);

    let events = handle.events().await.unwrap();
    let completed: Vec<&Value> = events
        .iter()
        .filter(|e| e["type"] == "agent_completed")
        .collect();
    assert_eq!(completed.len(), 1);
}

#[tokio::test]
async fn tool_call_and_resume_completes() {
    let provider = ScriptedProvider::new(vec![
        ScriptedProvider::tool_call_response("c1", "add", json!({"a": 2, "b": 3})),
        ScriptedProvider::text_response("5", 8, 1),
    ]);
    let handle = spawn_agent(provider, &["@default"], AgentConfig::default());

    handle.register(meta_with_vars(BTreeMap::new())).await.unwrap();
    handle
        .invoke(vec![ChatMessage::user("add 2 and 3")], BTreeMap::new())
        .await
        .unwrap();

    let state = wait_for_status(&handle, RunStatus::Completed).await;
    let messages = state["projection"]["messages"].as_array().unwrap();
    // user, assistant tool-call, tool response, assistant "5"
    assert_eq!(messages.len(), 4);
    assert_eq!(messages[2]["role"], "tool");
    assert_eq!(
        messages[2]["parts"][0]["response"],
        json!({"result": 5})
    );
    assert_eq!(messages[3]["parts"][0]["text"], "5");
    assert!(state["projection"]["pendingToolCalls"]
        .as_array()
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn variable_interpolation_in_tool_args() {
    let provider = ScriptedProvider::new(vec![
        ScriptedProvider::tool_call_response(
            "c1",
            "echo",
            json!({"text": "Hello $NAME, score=$SCORE"}),
        ),
        ScriptedProvider::text_response("done", 1, 1),
    ]);
    let handle = spawn_agent(provider, &["@default"], AgentConfig::default());

    let mut vars = BTreeMap::new();
    vars.insert("NAME".to_string(), json!("Ada"));
    vars.insert("SCORE".to_string(), json!(99));
    handle.register(meta_with_vars(vars)).await.unwrap();
    handle
        .invoke(vec![ChatMessage::user("greet")], BTreeMap::new())
        .await
        .unwrap();

    let state = wait_for_status(&handle, RunStatus::Completed).await;
    let messages = state["projection"]["messages"].as_array().unwrap();
    assert_eq!(
        messages[2]["parts"][0]["response"], "Hello Ada, score=99",
        "echo must observe the substituted argument"
    );
}

#[tokio::test]
async fn whole_value_var_reference_preserves_type() {
    let provider = ScriptedProvider::new(vec![
        ScriptedProvider::tool_call_response("c1", "add", json!({"a": "$SCORE", "b": 1})),
        ScriptedProvider::text_response("100", 1, 1),
    ]);
    let handle = spawn_agent(provider, &["@default"], AgentConfig::default());

    let mut vars = BTreeMap::new();
    vars.insert("SCORE".to_string(), json!(99));
    handle.register(meta_with_vars(vars)).await.unwrap();
    handle
        .invoke(vec![ChatMessage::user("sum")], BTreeMap::new())
        .await
        .unwrap();

    let state = wait_for_status(&handle, RunStatus::Completed).await;
    let messages = state["projection"]["messages"].as_array().unwrap();
    assert_eq!(messages[2]["parts"][0]["response"], json!({"result": 100}));
}

#[tokio::test]
async fn hitl_gate_pauses_then_approval_runs_modified_args() {
    let provider = ScriptedProvider::new(vec![
        ScriptedProvider::tool_call_response("c1", "echo", json!({"text": "original"})),
        ScriptedProvider::text_response("after approval", 1, 1),
    ]);
    let handle = spawn_agent(provider, &["@default"], AgentConfig::default());

    let mut vars = BTreeMap::new();
    vars.insert("HITL_TOOLS".to_string(), json!(["echo"]));
    handle.register(meta_with_vars(vars)).await.unwrap();
    handle
        .invoke(vec![ChatMessage::user("go")], BTreeMap::new())
        .await
        .unwrap();

    let state = wait_for_status(&handle, RunStatus::Paused).await;
    assert_eq!(state["reason"], "hitl");

    handle
        .action(json!({
            "type": "approve",
            "approved": true,
            "modifiedToolCalls": [{"id": "c1", "arguments": {"text": "altered"}}],
        }))
        .await
        .unwrap();

    let state = wait_for_status(&handle, RunStatus::Completed).await;
    let messages = state["projection"]["messages"].as_array().unwrap();
    assert_eq!(messages[2]["parts"][0]["response"], "altered");
}

#[tokio::test]
async fn hitl_denial_records_tool_errors_and_continues() {
    let provider = ScriptedProvider::new(vec![
        ScriptedProvider::tool_call_response("c1", "echo", json!({"text": "nope"})),
        ScriptedProvider::text_response("understood", 1, 1),
    ]);
    let handle = spawn_agent(provider, &["@default"], AgentConfig::default());

    let mut vars = BTreeMap::new();
    vars.insert("HITL_TOOLS".to_string(), json!(["echo"]));
    handle.register(meta_with_vars(vars)).await.unwrap();
    handle
        .invoke(vec![ChatMessage::user("go")], BTreeMap::new())
        .await
        .unwrap();

    wait_for_status(&handle, RunStatus::Paused).await;
    handle
        .action(json!({"type": "approve", "approved": false}))
        .await
        .unwrap();

    let state = wait_for_status(&handle, RunStatus::Completed).await;
    let messages = state["projection"]["messages"].as_array().unwrap();
    assert_eq!(messages[2]["parts"][0]["response"], "Error: rejected by user");
}

#[tokio::test]
async fn iteration_cap_surfaces_max_iterations_exceeded() {
    // Every turn returns another tool call, so the loop only stops at the cap.
    let scripts: Vec<_> = (0..10)
        .map(|i| {
            ScriptedProvider::tool_call_response(format!("c{i}"), "echo", json!({"text": "x"}))
        })
        .collect();
    let provider = ScriptedProvider::new(scripts);
    let config = AgentConfig {
        iteration_limit: 3,
        ..Default::default()
    };
    let handle = spawn_agent(provider, &["@default"], config);

    handle.register(meta_with_vars(BTreeMap::new())).await.unwrap();
    handle
        .invoke(vec![ChatMessage::user("loop")], BTreeMap::new())
        .await
        .unwrap();

    let state = wait_for_status(&handle, RunStatus::Error).await;
    assert_eq!(
        state["projection"]["lastError"],
        "max_iterations_exceeded"
    );
}

#[tokio::test]
async fn iteration_cap_zero_disables_the_cap() {
    let provider = ScriptedProvider::new(vec![
        ScriptedProvider::tool_call_response("c1", "echo", json!({"text": "a"})),
        ScriptedProvider::tool_call_response("c2", "echo", json!({"text": "b"})),
        ScriptedProvider::text_response("done", 1, 1),
    ]);
    let config = AgentConfig {
        iteration_limit: 0,
        ..Default::default()
    };
    let handle = spawn_agent(provider, &["@default"], config);

    handle.register(meta_with_vars(BTreeMap::new())).await.unwrap();
    handle
        .invoke(vec![ChatMessage::user("go")], BTreeMap::new())
        .await
        .unwrap();

    wait_for_status(&handle, RunStatus::Completed).await;
}

#[tokio::test]
async fn oversized_tool_batch_executes_n_per_step() {
    // One turn returns 3 calls; with max_parallel_tools=2 the first batch
    // runs 2 and the second runs the remaining 1.
    let mut msg = ScriptedProvider::tool_call_response("c1", "echo", json!({"text": "1"}));
    if let hub_model::Part::ToolCall { .. } = msg.message.parts[0] {
        msg.message.parts.push(hub_model::Part::ToolCall {
            id: "c2".into(),
            name: "echo".into(),
            arguments: json!({"text": "2"}),
        });
        msg.message.parts.push(hub_model::Part::ToolCall {
            id: "c3".into(),
            name: "echo".into(),
            arguments: json!({"text": "3"}),
        });
    }
    let provider = ScriptedProvider::new(vec![msg, ScriptedProvider::text_response("done", 1, 1)]);
    let config = AgentConfig {
        max_parallel_tools: 2,
        ..Default::default()
    };
    let handle = spawn_agent(provider, &["@default"], config);

    handle.register(meta_with_vars(BTreeMap::new())).await.unwrap();
    handle
        .invoke(vec![ChatMessage::user("go")], BTreeMap::new())
        .await
        .unwrap();

    wait_for_status(&handle, RunStatus::Completed).await;
    let events = handle.events().await.unwrap();
    let steps = events.iter().filter(|e| e["type"] == "agent_step").count();
    let finishes = events
        .iter()
        .filter(|e| e["type"] == "tool_finish")
        .count();
    assert_eq!(finishes, 3, "all three calls eventually execute");
    // model, batch of 2, batch of 1, final model call
    assert_eq!(steps, 4);
}

#[tokio::test]
async fn unknown_tool_records_tool_error_response() {
    let provider = ScriptedProvider::new(vec![
        ScriptedProvider::tool_call_response("c1", "ghost", json!({})),
        ScriptedProvider::text_response("sorry", 1, 1),
    ]);
    let handle = spawn_agent(provider, &["@default"], AgentConfig::default());

    handle.register(meta_with_vars(BTreeMap::new())).await.unwrap();
    handle
        .invoke(vec![ChatMessage::user("go")], BTreeMap::new())
        .await
        .unwrap();

    let state = wait_for_status(&handle, RunStatus::Completed).await;
    let messages = state["projection"]["messages"].as_array().unwrap();
    let err_text = messages[2]["parts"][0]["response"].as_str().unwrap();
    assert!(err_text.starts_with("Error: "), "{err_text}");
    assert!(err_text.contains("unknown tool"));
}

#[tokio::test]
async fn cancel_while_paused_transitions_to_canceled() {
    let provider = ScriptedProvider::new(vec![ScriptedProvider::tool_call_response(
        "c1",
        "echo",
        json!({"text": "x"}),
    )]);
    let handle = spawn_agent(provider, &["@default"], AgentConfig::default());

    let mut vars = BTreeMap::new();
    vars.insert("HITL_TOOLS".to_string(), json!(["echo"]));
    handle.register(meta_with_vars(vars)).await.unwrap();
    handle
        .invoke(vec![ChatMessage::user("go")], BTreeMap::new())
        .await
        .unwrap();

    wait_for_status(&handle, RunStatus::Paused).await;
    handle.action(json!({"type": "cancel"})).await.unwrap();

    let state = wait_for_status(&handle, RunStatus::Canceled).await;
    assert!(state["projection"]["pendingToolCalls"]
        .as_array()
        .unwrap()
        .is_empty());

    let events = handle.events().await.unwrap();
    assert!(events.iter().any(|e| e["type"] == "agent_canceled"));
}

#[tokio::test]
async fn invoke_before_register_is_rejected() {
    let provider = ScriptedProvider::always_text("x");
    let handle = spawn_agent(provider, &[], AgentConfig::default());
    let err = handle
        .invoke(vec![ChatMessage::user("hi")], BTreeMap::new())
        .await
        .unwrap_err();
    assert!(matches!(err, crate::agent::AgentError::NotRegistered));
}

#[tokio::test]
async fn copy_events_with_valid_token_imports_and_reprojects() {
    let provider = ScriptedProvider::new(vec![ScriptedProvider::text_response("hi", 3, 1)]);
    let source = spawn_agent(provider, &["@default"], AgentConfig::default());
    source.register(meta_with_vars(BTreeMap::new())).await.unwrap();
    source
        .invoke(vec![ChatMessage::user("hi")], BTreeMap::new())
        .await
        .unwrap();
    wait_for_status(&source, RunStatus::Completed).await;

    let cut = 4; // invoked, user message, step, inference
    let events = source.events_until(cut).await.unwrap();
    assert_eq!(events.len(), 4);

    let target = AgentActor::spawn(AgentParams {
        id: "agent-2".into(),
        blueprint: blueprint(&["@default"]),
        store: EventStore::open_in_memory().unwrap(),
        provider: Arc::new(ScriptedProvider::always_text("unused")),
        hub: default_hub(),
        agency: Arc::new(StubAgency::default()),
        config: AgentConfig::default(),
    });
    target.register(meta_with_vars(BTreeMap::new())).await.unwrap();

    let token = make_fork_token("agent-1", "agent-2", "ag-1");
    let inserted = target
        .copy_events(token, "agent-1".into(), cut, events)
        .await
        .unwrap();
    assert_eq!(inserted, 4);

    let source_proj = source.projection(Some(cut), false).await.unwrap();
    let target_proj = target.projection(None, false).await.unwrap();
    assert_eq!(source_proj["messages"], target_proj["messages"]);
}

#[tokio::test]
async fn copy_events_with_wrong_target_is_rejected() {
    let target = spawn_agent(
        ScriptedProvider::always_text("x"),
        &[],
        AgentConfig::default(),
    );
    target.register(meta_with_vars(BTreeMap::new())).await.unwrap();

    let token = make_fork_token("src", "someone-else", "ag-1");
    let err = target
        .copy_events(token, "src".into(), 1, vec![])
        .await
        .unwrap_err();
    assert!(matches!(err, crate::agent::AgentError::ForkToken(_)));
}

#[tokio::test]
async fn remote_tools_resolve_and_proxy_through_agency() {
    let provider = ScriptedProvider::new(vec![
        ScriptedProvider::tool_call_response("c1", "mcp_github_search", json!({"q": "rust"})),
        ScriptedProvider::text_response("found", 1, 1),
    ]);
    let agency = Arc::new(StubAgency::default());
    let handle = AgentActor::spawn(AgentParams {
        id: "agent-1".into(),
        blueprint: blueprint(&["mcp:*"]),
        store: EventStore::open_in_memory().unwrap(),
        provider: Arc::new(provider),
        hub: default_hub(),
        agency: agency.clone(),
        config: AgentConfig::default(),
    });

    let mut meta = meta_with_vars(BTreeMap::new());
    meta.mcp_servers = vec![RemoteToolDesc {
        server_id: "github".into(),
        name: "search".into(),
        description: Some("Search GitHub".into()),
        parameters: None,
    }];
    handle.register(meta).await.unwrap();
    handle
        .invoke(vec![ChatMessage::user("find rust repos")], BTreeMap::new())
        .await
        .unwrap();

    let state = wait_for_status(&handle, RunStatus::Completed).await;
    let calls = agency.remote_calls.lock().unwrap();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].0, "github");
    assert_eq!(calls[0].1, "search");

    let messages = state["projection"]["messages"].as_array().unwrap();
    assert_eq!(messages[2]["parts"][0]["response"], "remote:github:search");
}
