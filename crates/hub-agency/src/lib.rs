// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
mod agency;
mod fs;
mod mcp;
mod schedule;
mod store;
#[cfg(test)]
mod tests;

pub use agency::{
    AgencyActor, AgencyConfig, AgencyError, AgencyHandle, AgencyParams, SpawnRequest,
};
pub use fs::{resolve_path, FileStore, FsError, MemFileStore};
pub use mcp::{HttpRemoteClient, McpCatalog, McpServer, McpState, RemoteCallResult, RemoteToolClient};
pub use schedule::{
    compute_next_run, CreateScheduleRequest, OverlapPolicy, RunOutcome, Schedule, ScheduleError,
    ScheduleRun, ScheduleStatus, ScheduleType, UpdateScheduleRequest,
};
pub use store::{AgencyStore, AgentRow};
