// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Agency-level tests: spawn, subagent round trips, schedules, forks.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::{json, Value};

use hub_core::{AgentConfig, Blueprint};
use hub_model::ScriptedProvider;
use hub_tools::{AddTool, EchoTool, Hub};

use crate::agency::{AgencyActor, AgencyConfig, AgencyHandle, AgencyParams, SpawnRequest};
use crate::fs::MemFileStore;
use crate::mcp::{McpServer, RemoteCallResult, RemoteToolClient};
use crate::schedule::{CreateScheduleRequest, RunOutcome, ScheduleStatus, ScheduleType};
use crate::store::AgencyStore;

struct NoRemote;

#[async_trait::async_trait]
impl RemoteToolClient for NoRemote {
    async fn list_tools(
        &self,
        _server: &McpServer,
    ) -> anyhow::Result<Vec<hub_tools::RemoteToolDesc>> {
        Ok(vec![])
    }
    async fn call_tool(
        &self,
        _server: &McpServer,
        _tool: &str,
        _args: Value,
    ) -> anyhow::Result<RemoteCallResult> {
        anyhow::bail!("no remote tools")
    }
}

fn blueprint(name: &str, capabilities: &[&str]) -> Blueprint {
    Blueprint {
        name: name.into(),
        prompt: format!("You are {name}."),
        capabilities: capabilities.iter().map(|s| s.to_string()).collect(),
        model: None,
        vars: BTreeMap::new(),
        created_at: Utc::now(),
    }
}

fn agency_with(provider: ScriptedProvider, static_blueprints: Vec<Blueprint>) -> AgencyHandle {
    let mut hub = Hub::new();
    hub.register_tool(EchoTool);
    hub.register_tool(AddTool);

    AgencyActor::spawn(AgencyParams {
        id: "ag-1".into(),
        name: "test-agency".into(),
        store: AgencyStore::open_in_memory().unwrap(),
        hub: Arc::new(hub),
        provider: Arc::new(provider),
        static_blueprints,
        files: Arc::new(MemFileStore::default()),
        remote_client: Box::new(NoRemote),
        config: AgencyConfig {
            data_dir: None,
            agent: AgentConfig::default(),
        },
    })
}

fn spawn_req(agent_type: &str, input: Option<Value>) -> SpawnRequest {
    SpawnRequest {
        agent_type: agent_type.into(),
        input,
        related_agent_id: None,
        extra_vars: BTreeMap::new(),
        origin: json!({"origin": "test"}),
    }
}

async fn wait_for_agent_status(agency: &AgencyHandle, agent_id: &str, want: &str) -> Value {
    for _ in 0..300 {
        if let Some(handle) = agency.agent(agent_id.to_string()).await {
            let state = handle.state().await.unwrap();
            if state["status"] == want {
                return state;
            }
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("agent {agent_id} never reached status {want}");
}

#[tokio::test]
async fn blueprint_upsert_merges_and_preserves_created_at() {
    let agency = agency_with(ScriptedProvider::always_text("x"), vec![]);

    let first = agency
        .create_blueprint(blueprint("helper", &["@default"]))
        .await
        .unwrap();

    let mut second = blueprint("helper", &["@default"]);
    second.prompt = "You help concisely.".into();
    let merged = agency.create_blueprint(second).await.unwrap();

    assert_eq!(merged.created_at, first.created_at);
    assert_eq!(merged.prompt, "You help concisely.");

    let listed = agency.list_blueprints().await.unwrap();
    assert_eq!(listed.len(), 1);
}

#[tokio::test]
async fn invalid_blueprint_is_rejected() {
    let agency = agency_with(ScriptedProvider::always_text("x"), vec![]);
    let err = agency
        .create_blueprint(blueprint("has space", &[]))
        .await
        .unwrap_err();
    assert!(matches!(err, crate::agency::AgencyError::Validation(_)));
}

#[tokio::test]
async fn static_blueprints_appear_in_listing_but_dynamic_shadows() {
    let agency = agency_with(
        ScriptedProvider::always_text("x"),
        vec![blueprint("stock", &[]), blueprint("helper", &[])],
    );
    let mut dynamic = blueprint("helper", &[]);
    dynamic.prompt = "overridden".into();
    agency.create_blueprint(dynamic).await.unwrap();

    let listed = agency.list_blueprints().await.unwrap();
    assert_eq!(listed.len(), 2);
    let helper = listed.iter().find(|b| b.name == "helper").unwrap();
    assert_eq!(helper.prompt, "overridden");
}

#[tokio::test]
async fn spawn_with_string_input_runs_to_completion() {
    let provider = ScriptedProvider::new(vec![ScriptedProvider::text_response("hi", 3, 1)]);
    let agency = agency_with(provider, vec![blueprint("echo", &["@default"])]);

    let id = agency
        .spawn_agent(spawn_req("echo", Some(json!("hi"))))
        .await
        .unwrap();

    let state = wait_for_agent_status(&agency, &id, "completed").await;
    let messages = state["projection"]["messages"].as_array().unwrap();
    assert_eq!(messages.len(), 2);

    let rows = agency.list_agents().await.unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].agent_type, "echo");
}

#[tokio::test]
async fn spawn_unknown_blueprint_is_not_found() {
    let agency = agency_with(ScriptedProvider::always_text("x"), vec![]);
    let err = agency
        .spawn_agent(spawn_req("ghost", None))
        .await
        .unwrap_err();
    assert!(matches!(err, crate::agency::AgencyError::NotFound(_)));
}

#[tokio::test]
async fn subagent_round_trip_reports_back_to_parent() {
    // Call order across the shared scripted provider:
    //   1. parent asks for the `task` tool,
    //   2. the child answers "4",
    //   3. the resumed parent wraps up.
    let provider = ScriptedProvider::new(vec![
        ScriptedProvider::tool_call_response(
            "c1",
            "task",
            json!({"description": "calc 2+2", "subagent_type": "child-agent"}),
        ),
        ScriptedProvider::text_response("4", 2, 1),
        ScriptedProvider::text_response("the child says 4", 9, 4),
    ]);
    let agency = agency_with(
        provider,
        vec![
            blueprint("parent-agent", &["@default", "task"]),
            blueprint("child-agent", &["@default"]),
        ],
    );

    let parent_id = agency
        .spawn_agent(spawn_req("parent-agent", Some(json!("delegate this"))))
        .await
        .unwrap();

    let state = wait_for_agent_status(&agency, &parent_id, "completed").await;
    let messages = state["projection"]["messages"].as_array().unwrap();

    // user, assistant task call, tool report, final assistant text
    assert_eq!(messages.len(), 4, "messages: {messages:?}");
    let report = &messages[2]["parts"][0]["response"];
    assert_eq!(report["result"], "4");
    let child_id = report["agentId"].as_str().unwrap();

    // The child exists, is linked to the parent, and carries the report.
    let rows = agency.list_agents().await.unwrap();
    let child = rows.iter().find(|r| r.id == child_id).unwrap();
    assert_eq!(child.related_agent_id.as_deref(), Some(parent_id.as_str()));

    for _ in 0..100 {
        let rows = agency.list_agents().await.unwrap();
        let child = rows.iter().find(|r| r.id == child_id).unwrap();
        if child.metadata["subagentStatus"] == "completed" {
            assert_eq!(child.metadata["report"], "4");
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    assert_eq!(messages[3]["parts"][0]["text"], "the child says 4");

    // Tree query sees the relation both ways.
    let tree = agency.agent_tree(Some(child_id.to_string())).await.unwrap();
    assert_eq!(tree["ancestors"][0]["id"], json!(parent_id));
    let tree = agency.agent_tree(Some(parent_id.clone())).await.unwrap();
    assert_eq!(tree["descendants"][0]["id"], json!(child_id));
}

#[tokio::test]
async fn fork_copies_prefix_and_projection_matches() {
    let provider = ScriptedProvider::new(vec![ScriptedProvider::text_response("hi", 3, 1)]);
    let agency = agency_with(provider, vec![blueprint("echo", &["@default"])]);

    let source_id = agency
        .spawn_agent(spawn_req("echo", Some(json!("hi"))))
        .await
        .unwrap();
    wait_for_agent_status(&agency, &source_id, "completed").await;

    let fork_id = agency.fork_agent(source_id.clone(), Some(4)).await.unwrap();
    assert_ne!(fork_id, source_id);

    let source = agency.agent(source_id).await.unwrap();
    let target = agency.agent(fork_id.clone()).await.unwrap();

    let source_proj = source.projection(Some(4), false).await.unwrap();
    let target_proj = target.projection(None, false).await.unwrap();
    assert_eq!(source_proj["messages"], target_proj["messages"]);

    let rows = agency.list_agents().await.unwrap();
    let fork_row = rows.iter().find(|r| r.id == fork_id).unwrap();
    assert_eq!(fork_row.metadata["forkedAt"], 4);
}

#[tokio::test]
async fn once_schedule_fires_disables_and_records_one_run() {
    let provider = ScriptedProvider::new(vec![ScriptedProvider::text_response("done", 1, 1)]);
    let agency = agency_with(provider, vec![blueprint("reporter", &["@default"])]);

    let schedule = agency
        .create_schedule(CreateScheduleRequest {
            name: "soon".into(),
            agent_type: "reporter".into(),
            input: Some(json!("run now")),
            schedule_type: ScheduleType::Once,
            run_at: Some(Utc::now() + chrono::Duration::milliseconds(50)),
            cron: None,
            interval_ms: None,
            overlap_policy: None,
            max_retries: None,
            timeout_ms: None,
        })
        .await
        .unwrap();
    assert!(schedule.next_run_at.is_some());

    // Wait for the alarm to fire and the run to be recorded.
    let mut runs = Vec::new();
    for _ in 0..300 {
        runs = agency.schedule_runs(schedule.id.clone()).await.unwrap();
        if !runs.is_empty() && runs[0].status != RunOutcome::Running {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(runs.len(), 1, "exactly one run for a once schedule");
    assert_eq!(runs[0].status, RunOutcome::Completed);
    assert!(runs[0].agent_id.is_some());

    let schedules = agency.list_schedules().await.unwrap();
    assert_eq!(schedules[0].status, ScheduleStatus::Disabled);
    assert_eq!(schedules[0].next_run_at, None);
}

#[tokio::test]
async fn manual_trigger_spawns_immediately() {
    let provider = ScriptedProvider::new(vec![ScriptedProvider::text_response("done", 1, 1)]);
    let agency = agency_with(provider, vec![blueprint("reporter", &["@default"])]);

    let schedule = agency
        .create_schedule(CreateScheduleRequest {
            name: "manual".into(),
            agent_type: "reporter".into(),
            input: Some(json!("triggered")),
            schedule_type: ScheduleType::Interval,
            run_at: None,
            cron: None,
            interval_ms: Some(3_600_000),
            overlap_policy: None,
            max_retries: None,
            timeout_ms: None,
        })
        .await
        .unwrap();

    agency.trigger_schedule(schedule.id.clone()).await.unwrap();
    let runs = agency.schedule_runs(schedule.id.clone()).await.unwrap();
    assert_eq!(runs.len(), 1);
    assert_eq!(runs[0].status, RunOutcome::Completed);
}

#[tokio::test]
async fn schedule_for_unknown_blueprint_is_rejected() {
    let agency = agency_with(ScriptedProvider::always_text("x"), vec![]);
    let err = agency
        .create_schedule(CreateScheduleRequest {
            name: "bad".into(),
            agent_type: "ghost".into(),
            input: None,
            schedule_type: ScheduleType::Interval,
            run_at: None,
            cron: None,
            interval_ms: Some(1000),
            overlap_policy: None,
            max_retries: None,
            timeout_ms: None,
        })
        .await
        .unwrap_err();
    assert!(matches!(err, crate::agency::AgencyError::NotFound(_)));
}

#[tokio::test]
async fn paused_schedule_does_not_fire_and_resume_recomputes() {
    let agency = agency_with(
        ScriptedProvider::always_text("x"),
        vec![blueprint("reporter", &[])],
    );
    let schedule = agency
        .create_schedule(CreateScheduleRequest {
            name: "pausable".into(),
            agent_type: "reporter".into(),
            input: None,
            schedule_type: ScheduleType::Interval,
            run_at: None,
            cron: None,
            interval_ms: Some(50),
            overlap_policy: None,
            max_retries: None,
            timeout_ms: None,
        })
        .await
        .unwrap();

    let paused = agency
        .set_schedule_status(schedule.id.clone(), ScheduleStatus::Paused)
        .await
        .unwrap();
    assert_eq!(paused.next_run_at, None);

    tokio::time::sleep(Duration::from_millis(150)).await;
    assert!(agency
        .schedule_runs(schedule.id.clone())
        .await
        .unwrap()
        .is_empty());

    let resumed = agency
        .set_schedule_status(schedule.id.clone(), ScheduleStatus::Active)
        .await
        .unwrap();
    assert!(resumed.next_run_at.is_some());
}

#[tokio::test]
async fn vars_round_trip_through_agency() {
    let agency = agency_with(ScriptedProvider::always_text("x"), vec![]);

    let mut vars = BTreeMap::new();
    vars.insert("NAME".to_string(), json!("Ada"));
    vars.insert("SCORE".to_string(), json!(99));
    agency.put_vars(vars, true).await.unwrap();

    let got = agency.get_vars().await.unwrap();
    assert_eq!(got.len(), 2);
    assert_eq!(got["NAME"], json!("Ada"));

    agency.delete_var("NAME".into()).await.unwrap();
    assert_eq!(agency.get_vars().await.unwrap().len(), 1);
    assert!(agency.delete_var("NAME".into()).await.is_err());
}

#[tokio::test]
async fn fs_routing_enforces_agent_ownership() {
    let agency = agency_with(ScriptedProvider::always_text("x"), vec![]);

    agency
        .fs_write("/shared/notes.txt".into(), None, b"tenant data".to_vec())
        .await
        .unwrap();
    let data = agency
        .fs_read("/shared/notes.txt".into(), Some("a1".into()))
        .await
        .unwrap();
    assert_eq!(data, Some(b"tenant data".to_vec()));

    agency
        .fs_write("~/journal.md".into(), Some("a1".into()), b"mine".to_vec())
        .await
        .unwrap();
    // Another agent can read it through the agents/ area but not write it.
    let read = agency
        .fs_read("/agents/a1/home/journal.md".into(), Some("a2".into()))
        .await
        .unwrap();
    assert_eq!(read, Some(b"mine".to_vec()));
    let err = agency
        .fs_write(
            "/agents/a1/home/journal.md".into(),
            Some("a2".into()),
            b"overwrite".to_vec(),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, crate::agency::AgencyError::Fs(_)));
}

#[tokio::test]
async fn relay_broadcasts_agent_events_to_subscribers() {
    let provider = ScriptedProvider::new(vec![ScriptedProvider::text_response("hi", 3, 1)]);
    let agency = agency_with(provider, vec![blueprint("echo", &["@default"])]);

    let mut events = agency.subscribe();
    let id = agency
        .spawn_agent(spawn_req("echo", Some(json!("hi"))))
        .await
        .unwrap();
    wait_for_agent_status(&agency, &id, "completed").await;

    let mut kinds = Vec::new();
    while let Ok(ev) = events.try_recv() {
        assert_eq!(ev.agent_id, id);
        assert_eq!(ev.agent_type, "echo");
        kinds.push(ev.event["type"].as_str().unwrap_or_default().to_string());
    }
    assert!(kinds.contains(&"agent_invoked".to_string()), "{kinds:?}");
    assert!(kinds.contains(&"inference_details".to_string()));
    assert!(kinds.contains(&"agent_completed".to_string()));
}

#[tokio::test]
async fn destroy_removes_agents_and_files() {
    let provider = ScriptedProvider::new(vec![ScriptedProvider::text_response("hi", 3, 1)]);
    let files = Arc::new(MemFileStore::default());

    let mut hub = Hub::new();
    hub.register_tool(EchoTool);
    let agency = AgencyActor::spawn(AgencyParams {
        id: "ag-d".into(),
        name: "doomed".into(),
        store: AgencyStore::open_in_memory().unwrap(),
        hub: Arc::new(hub),
        provider: Arc::new(provider),
        static_blueprints: vec![blueprint("echo", &["@default"])],
        files: files.clone(),
        remote_client: Box::new(NoRemote),
        config: AgencyConfig::default(),
    });

    agency
        .fs_write("/shared/x.txt".into(), None, b"data".to_vec())
        .await
        .unwrap();
    agency
        .spawn_agent(spawn_req("echo", Some(json!("hi"))))
        .await
        .unwrap();

    agency.destroy().await.unwrap();
    use crate::fs::FileStore;
    assert!(files.list("ag-d/").await.unwrap().is_empty());
    assert!(agency.list_agents().await.is_err(), "actor is gone");
}
