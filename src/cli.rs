// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::path::PathBuf;

use clap::Parser;

/// Multi-tenant LLM-agent orchestrator.
#[derive(Parser, Debug)]
#[command(name = "agenthub", version, about)]
pub struct Cli {
    /// Address the HTTP gateway binds to.
    #[arg(long, default_value = "127.0.0.1:8787")]
    pub bind: String,

    /// Directory for per-tenant databases.  Omit to keep all state in
    /// memory (development mode).
    #[arg(long)]
    pub data_dir: Option<PathBuf>,

    /// Shared secret gating the public boundary.
    #[arg(long, env = "SECRET")]
    pub secret: Option<String>,

    /// Use the deterministic mock model provider instead of a real
    /// endpoint.  Useful for demos without an API key.
    #[arg(long)]
    pub mock_provider: bool,

    /// Log to stderr at debug level (RUST_LOG overrides).
    #[arg(short, long)]
    pub verbose: bool,
}
