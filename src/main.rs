// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
mod cli;

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing_subscriber::{filter::EnvFilter, fmt, prelude::*};

use hub_agency::{
    AgencyActor, AgencyConfig, AgencyParams, AgencyStore, HttpRemoteClient, MemFileStore,
};
use hub_core::{AgentConfig, Blueprint};
use hub_gateway::{AgencyRegistry, GatewayState, SecretGate};
use hub_model::{ChatCompletionsProvider, MockProvider, Provider};
use hub_tools::{AddTool, EchoTool, Hub, VarsPlugin};

use cli::Cli;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let secret = match cli.secret {
        Some(s) => s,
        None => {
            tracing::warn!("no SECRET configured; using an insecure development secret");
            "dev-secret".to_string()
        }
    };

    let provider: Arc<dyn Provider> = if cli.mock_provider {
        Arc::new(MockProvider)
    } else {
        if std::env::var("LLM_API_KEY").is_err() {
            tracing::warn!("LLM_API_KEY is not set; model calls will fail unless the endpoint is unauthenticated");
        }
        Arc::new(ChatCompletionsProvider::from_env())
    };

    let hub = Arc::new(build_hub(provider.clone()));
    let files = Arc::new(MemFileStore::default());
    let data_dir = cli.data_dir.clone();

    if let Some(dir) = &data_dir {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("creating data dir {}", dir.display()))?;
    }

    let registry = AgencyRegistry::new(Box::new(move |id: &str, name: &str| {
        let store = match &data_dir {
            Some(dir) => AgencyStore::open(dir.join(format!("{id}.db")))
                .expect("agency store must open under the prepared data dir"),
            None => AgencyStore::open_in_memory().expect("in-memory store"),
        };
        AgencyActor::spawn(AgencyParams {
            id: id.to_string(),
            name: name.to_string(),
            store,
            hub: hub.clone(),
            provider: provider.clone(),
            static_blueprints: static_blueprints(),
            files: files.clone(),
            remote_client: Box::new(HttpRemoteClient::new()),
            config: AgencyConfig {
                data_dir: data_dir.clone(),
                agent: AgentConfig::default(),
            },
        })
    }));

    let state = GatewayState {
        gate: SecretGate::new(&secret),
        registry: Arc::new(registry),
    };

    hub_gateway::serve(&cli.bind, state).await
}

/// The process-wide tool and plugin registry.
fn build_hub(provider: Arc<dyn Provider>) -> Hub {
    let mut hub = Hub::new();
    hub.register_tool(EchoTool);
    hub.register_tool(AddTool);
    hub.register_plugin(VarsPlugin);
    // Opt-in by blueprint capability name.
    hub.register_plugin(hub_core::ContextSummarizerPlugin::new(
        provider,
        AgentConfig::default().default_model,
    ));
    hub
}

/// Blueprints every agency starts with; tenants add their own via the API.
fn static_blueprints() -> Vec<Blueprint> {
    vec![Blueprint {
        name: "assistant".into(),
        prompt: "You are a helpful assistant. Use the available tools when they help.".into(),
        capabilities: vec!["@default".into()],
        model: None,
        vars: BTreeMap::new(),
        created_at: chrono::Utc::now(),
    }]
}

fn init_logging(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(false).with_writer(std::io::stderr))
        .init();
}
