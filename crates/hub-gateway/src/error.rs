// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;

use hub_agency::AgencyError;
use hub_core::{AgentError, ForkTokenError};

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("validation error: {0}")]
    Validation(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("unauthorized")]
    Unauthorized,

    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl GatewayError {
    fn status(&self) -> StatusCode {
        match self {
            GatewayError::Validation(_) => StatusCode::BAD_REQUEST,
            GatewayError::NotFound(_) => StatusCode::NOT_FOUND,
            GatewayError::Conflict(_) => StatusCode::CONFLICT,
            GatewayError::Unauthorized => StatusCode::UNAUTHORIZED,
            GatewayError::Forbidden(_) => StatusCode::FORBIDDEN,
            GatewayError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn code(&self) -> &'static str {
        match self {
            GatewayError::Validation(_) => "validation_error",
            GatewayError::NotFound(_) => "not_found",
            GatewayError::Conflict(_) => "conflict",
            GatewayError::Unauthorized => "unauthorized",
            GatewayError::Forbidden(_) => "forbidden",
            GatewayError::Internal(_) => "internal_error",
        }
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let body = json!({ "error": self.code(), "message": self.to_string() });
        (self.status(), Json(body)).into_response()
    }
}

impl From<AgencyError> for GatewayError {
    fn from(e: AgencyError) -> Self {
        match e {
            AgencyError::NotFound(m) => GatewayError::NotFound(m),
            AgencyError::Conflict(m) => GatewayError::Conflict(m),
            AgencyError::Validation(m) => GatewayError::Validation(m),
            AgencyError::Schedule(e) => GatewayError::Validation(e.to_string()),
            AgencyError::Fs(e) => match e {
                hub_agency::FsError::Forbidden(m) => GatewayError::Forbidden(m),
                other => GatewayError::Validation(other.to_string()),
            },
            AgencyError::Agent(e) => GatewayError::from(e),
            other => GatewayError::Internal(other.to_string()),
        }
    }
}

impl From<AgentError> for GatewayError {
    fn from(e: AgentError) -> Self {
        match e {
            AgentError::NotRegistered => GatewayError::Conflict(e.to_string()),
            AgentError::InvalidAction(m) => GatewayError::Validation(m),
            AgentError::ForkToken(ForkTokenError::Expired) => {
                GatewayError::Forbidden("fork_expired".into())
            }
            AgentError::ForkToken(_) => GatewayError::Forbidden("fork_unauthorized".into()),
            AgentError::Gone => GatewayError::NotFound("agent is gone".into()),
            other => GatewayError::Internal(other.to_string()),
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
