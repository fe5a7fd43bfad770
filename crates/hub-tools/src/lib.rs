// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
mod builtin;
mod plan;
mod plugin;
mod registry;
mod tool;
pub mod vars;

pub use builtin::{AddTool, EchoTool, VarsPlugin, VARS_PLUGIN};
pub use plan::ModelPlan;
pub use plugin::{Plugin, PluginCx, PluginHost};
pub use registry::{Hub, RemoteToolDesc, Selection};
pub use tool::{tool_def, Tool, ToolCall, ToolCtx, ToolError};
