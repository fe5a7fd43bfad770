// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Declarative description of an agent role.
///
/// Immutable once created; re-creating under the same name merges over the
/// prior record, preserving `created_at`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Blueprint {
    /// Unique within the agency; alphanumeric plus `-` and `_`.
    pub name: String,
    pub prompt: String,
    #[serde(default)]
    pub capabilities: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default)]
    pub vars: BTreeMap<String, Value>,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Error, PartialEq)]
pub enum BlueprintError {
    #[error("invalid blueprint name {0:?}: use alphanumerics, '-' and '_'")]
    InvalidName(String),

    #[error("blueprint prompt must not be empty")]
    EmptyPrompt,
}

impl Blueprint {
    pub fn validate(&self) -> Result<(), BlueprintError> {
        if self.name.is_empty()
            || !self
                .name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        {
            return Err(BlueprintError::InvalidName(self.name.clone()));
        }
        if self.prompt.trim().is_empty() {
            return Err(BlueprintError::EmptyPrompt);
        }
        Ok(())
    }

    /// Merge a re-creation over the prior record: new fields win, but
    /// `created_at` is preserved and vars are merged key-wise.
    pub fn merged_over(mut self, prior: &Blueprint) -> Blueprint {
        self.created_at = prior.created_at;
        let mut vars = prior.vars.clone();
        vars.extend(self.vars);
        self.vars = vars;
        self
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
