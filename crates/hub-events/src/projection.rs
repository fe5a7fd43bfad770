// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Pure fold of events into derived agent state.
//!
//! `apply` has no side effects and no knowledge of storage; replaying the
//! same log always yields the same [`Projection`], whether started from
//! the initial state or from a snapshot plus the tail.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use hub_model::{ChatMessage, Role, ToolCallRequest};

use crate::event::{remove_pending, Event, EventBody, RunStatus};
use crate::store::Snapshot;

/// Derived view over an agent's event log.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Projection {
    pub messages: Vec<ChatMessage>,
    pub status: RunStatus,
    pub step: u32,
    pub pending_tool_calls: Vec<ToolCallRequest>,
    pub total_input_tokens: u64,
    pub total_output_tokens: u64,
    pub inference_count: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

/// Fold one event into the state.  Unknown event kinds are identity
/// transitions.
pub fn apply(mut state: Projection, event: &Event) -> Projection {
    match &event.body {
        EventBody::Invoked => {
            state.status = RunStatus::Running;
            state.last_error = None;
        }
        EventBody::Step { step } => {
            state.step = step + 1;
        }
        EventBody::Paused { .. } => {
            state.status = RunStatus::Paused;
        }
        EventBody::Resumed => {
            state.status = RunStatus::Running;
        }
        EventBody::Completed { .. } => {
            state.status = RunStatus::Completed;
            state.pending_tool_calls.clear();
        }
        EventBody::Canceled => {
            // A cancel after completion is a no-op; everything else cancels.
            if state.status != RunStatus::Completed {
                state.status = RunStatus::Canceled;
                state.pending_tool_calls.clear();
            }
        }
        EventBody::Error(data) => {
            state.status = RunStatus::Error;
            state.last_error = Some(data.message.clone());
        }
        EventBody::UserMessage { message } => {
            state.messages.push(message.clone());
        }
        EventBody::Inference(data) => {
            state.inference_count += 1;
            state.total_input_tokens += data.usage.input_tokens;
            state.total_output_tokens += data.usage.output_tokens;

            append_new_input_tail(&mut state.messages, &data.input_messages);
            for out in &data.output_messages {
                state.messages.push(out.clone());
            }

            state.pending_tool_calls = data
                .output_messages
                .iter()
                .flat_map(|m| m.tool_calls())
                .collect();
        }
        EventBody::ToolFinish(data) => {
            state
                .messages
                .push(ChatMessage::tool_response(&data.call_id, data.response.clone()));
            remove_pending(&mut state.pending_tool_calls, &data.call_id);
        }
        EventBody::ToolError(data) => {
            state.messages.push(ChatMessage::tool_response(
                &data.call_id,
                Value::String(format!("Error: {}", data.message)),
            ));
            remove_pending(&mut state.pending_tool_calls, &data.call_id);
        }
        // UI conveniences and markers do not alter derived state.
        EventBody::ContentMessage { .. }
        | EventBody::ToolStart(_)
        | EventBody::SystemMarker { .. }
        | EventBody::Custom { .. } => {}
    }
    state
}

/// On turn N+1 the inference input repeats the already-projected history.
/// Find the longest suffix of `existing` that structurally matches a prefix
/// of the (system-stripped) input and append only what follows it.
fn append_new_input_tail(existing: &mut Vec<ChatMessage>, input: &[ChatMessage]) {
    let input: Vec<&ChatMessage> = input.iter().filter(|m| m.role != Role::System).collect();
    let max_overlap = existing.len().min(input.len());
    let mut overlap = 0;
    for k in (1..=max_overlap).rev() {
        let tail = &existing[existing.len() - k..];
        if tail
            .iter()
            .zip(input[..k].iter())
            .all(|(a, b)| a.structurally_eq(b))
        {
            overlap = k;
            break;
        }
    }
    for m in &input[overlap..] {
        existing.push((*m).clone());
    }
}

/// Fold a full log from the initial state.
pub fn project(events: &[Event]) -> Projection {
    events.iter().fold(Projection::default(), apply)
}

/// Fold only events with `seq <= until`.
pub fn project_until(events: &[Event], until: u64) -> Projection {
    events
        .iter()
        .filter(|e| e.seq <= until)
        .fold(Projection::default(), apply)
}

/// Resume the fold from a snapshot; `events` must carry only rows with
/// `seq > snapshot.last_event_seq`.
pub fn project_from_snapshot(snapshot: &Snapshot, events: &[Event]) -> Projection {
    events
        .iter()
        .filter(|e| e.seq > snapshot.last_event_seq)
        .fold(snapshot.state.clone(), apply)
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
