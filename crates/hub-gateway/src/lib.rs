// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
mod auth;
mod error;
mod routes;
mod ws;

pub use auth::SecretGate;
pub use error::GatewayError;
pub use routes::{router, AgencyFactory, AgencyRegistry, GatewayState};

use tokio::net::TcpListener;
use tracing::info;

/// Bind and serve until ctrl-c.
pub async fn serve(bind: &str, state: GatewayState) -> anyhow::Result<()> {
    let listener = TcpListener::bind(bind).await?;
    info!(%bind, "gateway listening");
    axum::serve(listener, router(state))
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutting down");
        })
        .await?;
    Ok(())
}
