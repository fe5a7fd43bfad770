// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
mod event;
mod projection;
mod store;

pub use event::{
    AgentErrorData, Event, EventBody, InferenceData, RunState, RunStatus, ToolErrorData,
    ToolFinishData, ToolStartData,
};
pub use projection::{apply, project, project_from_snapshot, project_until, Projection};
pub use store::{EventStore, Snapshot, StoreError, SNAPSHOT_KEEP};
