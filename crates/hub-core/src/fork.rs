// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Short-lived tokens guarding `/internal/copy-events`.
//!
//! A fork token is `base64(source:target:timestamp:agency)`.  The receiving
//! agent verifies that the token names it as the target, belongs to its own
//! agency, and is within the age window.

use base64::Engine;
use chrono::Utc;
use thiserror::Error;

/// Tokens older than this are rejected.
pub const FORK_TOKEN_MAX_AGE_SECS: i64 = 60;

#[derive(Debug, Error, PartialEq)]
pub enum ForkTokenError {
    #[error("fork token is malformed")]
    Malformed,

    #[error("fork token does not authorize this agent")]
    Unauthorized,

    #[error("fork token has expired")]
    Expired,
}

pub fn make_fork_token(source_id: &str, target_id: &str, agency_id: &str) -> String {
    let ts = Utc::now().timestamp();
    base64::engine::general_purpose::STANDARD
        .encode(format!("{source_id}:{target_id}:{ts}:{agency_id}"))
}

/// Verify a token against the receiving agent's identity.  Returns the
/// source agent id on success.
pub fn verify_fork_token(
    token: &str,
    expected_target: &str,
    expected_agency: &str,
) -> Result<String, ForkTokenError> {
    let decoded = base64::engine::general_purpose::STANDARD
        .decode(token)
        .map_err(|_| ForkTokenError::Malformed)?;
    let decoded = String::from_utf8(decoded).map_err(|_| ForkTokenError::Malformed)?;

    let mut parts = decoded.split(':');
    let (Some(source), Some(target), Some(ts), Some(agency), None) = (
        parts.next(),
        parts.next(),
        parts.next(),
        parts.next(),
        parts.next(),
    ) else {
        return Err(ForkTokenError::Malformed);
    };

    if target != expected_target || agency != expected_agency {
        return Err(ForkTokenError::Unauthorized);
    }

    let ts: i64 = ts.parse().map_err(|_| ForkTokenError::Malformed)?;
    let age = Utc::now().timestamp() - ts;
    if !(0..=FORK_TOKEN_MAX_AGE_SECS).contains(&age) {
        return Err(ForkTokenError::Expired);
    }

    Ok(source.to_string())
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
