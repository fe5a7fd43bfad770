// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! The shared-secret gate.
//!
//! Every request must present the secret as an `X-SECRET` header or a
//! `key` query parameter; WebSocket upgrades may instead carry a
//! `auth-<base64(secret)>` subprotocol.  Designated OAuth callback paths
//! are exempt.  Comparison is constant-time: both sides are hashed to a
//! fixed width and compared with [`subtle::ConstantTimeEq`], so neither
//! length nor prefix leaks.

use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

/// Paths that skip the gate entirely.
const EXEMPT_SUFFIXES: &[&str] = &["/oauth/callback"];

#[derive(Clone)]
pub struct SecretGate {
    digest: [u8; 32],
    ws_subprotocol: String,
}

impl SecretGate {
    pub fn new(secret: &str) -> Self {
        use base64::Engine;
        Self {
            digest: Sha256::digest(secret.as_bytes()).into(),
            ws_subprotocol: format!(
                "auth-{}",
                base64::engine::general_purpose::STANDARD.encode(secret)
            ),
        }
    }

    pub fn verify(&self, candidate: &str) -> bool {
        let candidate: [u8; 32] = Sha256::digest(candidate.as_bytes()).into();
        bool::from(candidate.ct_eq(&self.digest))
    }

    /// The exact `Sec-WebSocket-Protocol` value a UI client must offer.
    pub fn ws_subprotocol(&self) -> &str {
        &self.ws_subprotocol
    }

    /// Check a comma-separated subprotocol offer list.
    pub fn verify_subprotocols(&self, offered: &str) -> bool {
        offered
            .split(',')
            .any(|p| p.trim() == self.ws_subprotocol)
    }

    pub fn is_exempt(path: &str) -> bool {
        EXEMPT_SUFFIXES.iter().any(|s| path.ends_with(s))
    }
}

/// Extract the `key` query parameter from a raw query string.
pub fn key_from_query(query: &str) -> Option<String> {
    for pair in query.split('&') {
        if let Some(value) = pair.strip_prefix("key=") {
            return Some(value.to_string());
        }
    }
    None
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
