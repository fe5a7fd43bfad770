// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! UI event stream over WebSocket.
//!
//! Client → server: `{type:"subscribe", agentIds:[…]}` (empty list means
//! every agent) and `{type:"unsubscribe"}`.  Server → client: each relayed
//! agent event as `{…event, agentId, agentType}`.
//!
//! Connections presenting `X-Agent-Id` / `X-Agent-Type` headers are agent
//! senders: their frames feed the relay and they receive no fan-out.  The
//! in-process runtime relays through the agency channel directly, so the
//! sender path here only drains and drops.

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::http::HeaderMap;
use axum::response::Response;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::error::GatewayError;
use crate::routes::GatewayState;

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<GatewayState>,
    Path(agency_id): Path<String>,
    headers: HeaderMap,
) -> Result<Response, GatewayError> {
    let agency = state.registry.get(&agency_id).await?;
    let is_agent_sender = headers.contains_key("x-agent-id");
    let subprotocol = state.gate.ws_subprotocol().to_string();

    Ok(ws
        .protocols([subprotocol])
        .on_upgrade(move |socket| async move {
            if is_agent_sender {
                drain_sender(socket).await;
            } else {
                serve_subscriber(socket, agency).await;
            }
        }))
}

/// Agent-sender connections receive no fan-out.
async fn drain_sender(mut socket: WebSocket) {
    debug!("agent sender connected");
    while let Some(Ok(frame)) = socket.recv().await {
        if matches!(frame, Message::Close(_)) {
            break;
        }
    }
    debug!("agent sender disconnected");
}

async fn serve_subscriber(mut socket: WebSocket, agency: hub_agency::AgencyHandle) {
    info!(agency = %agency.id, "UI subscriber connected");
    let mut events = agency.subscribe();
    let mut subscribed = false;
    let mut filter: Vec<String> = Vec::new();

    loop {
        tokio::select! {
            frame = socket.recv() => {
                match frame {
                    Some(Ok(Message::Text(text))) => {
                        let Ok(cmd) = serde_json::from_str::<Value>(&text) else {
                            warn!("ignoring unparseable WS command");
                            continue;
                        };
                        match cmd["type"].as_str() {
                            Some("subscribe") => {
                                subscribed = true;
                                filter = cmd["agentIds"]
                                    .as_array()
                                    .map(|ids| {
                                        ids.iter()
                                            .filter_map(|v| v.as_str())
                                            .map(str::to_string)
                                            .collect()
                                    })
                                    .unwrap_or_default();
                            }
                            Some("unsubscribe") => {
                                subscribed = false;
                                filter.clear();
                            }
                            other => {
                                debug!(?other, "unknown WS command ignored");
                            }
                        }
                    }
                    Some(Ok(Message::Ping(data))) => {
                        if socket.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        debug!("WS receive error: {e}");
                        break;
                    }
                }
            }
            relayed = events.recv() => {
                match relayed {
                    Ok(ev) => {
                        if !subscribed {
                            continue;
                        }
                        if !filter.is_empty() && !filter.contains(&ev.agent_id) {
                            continue;
                        }
                        let mut frame = ev.event.clone();
                        frame["agentId"] = Value::String(ev.agent_id);
                        frame["agentType"] = Value::String(ev.agent_type);
                        let Ok(text) = serde_json::to_string(&frame) else {
                            continue;
                        };
                        if socket.send(Message::Text(text)).await.is_err() {
                            break;
                        }
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                        warn!("UI subscriber lagged by {n} events");
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
        }
    }
    info!(agency = %agency.id, "UI subscriber disconnected");
}
