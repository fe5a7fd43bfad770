// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Schedule records and firing-time computation.
//!
//! Three timing shapes: `once` (a fixed instant), `cron` (a cron
//! expression), and `interval` (a fixed period).  The executor lives in the
//! agency actor; this module owns the data model and the `next_run_at`
//! arithmetic.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScheduleType {
    Once,
    Cron,
    Interval,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScheduleStatus {
    Active,
    Paused,
    Disabled,
}

/// Behavior when a schedule fires while its prior run is still going.
///
/// `Queue` carries no persisted FIFO; it degrades to `Allow` (a new run is
/// started regardless).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OverlapPolicy {
    Skip,
    Queue,
    Allow,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Schedule {
    pub id: String,
    pub name: String,
    pub agent_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input: Option<Value>,
    #[serde(rename = "type")]
    pub schedule_type: ScheduleType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cron: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interval_ms: Option<u64>,
    pub status: ScheduleStatus,
    pub overlap_policy: OverlapPolicy,
    pub max_retries: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_run_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_run_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunOutcome {
    Pending,
    Running,
    Completed,
    Failed,
    Skipped,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScheduleRun {
    pub id: String,
    pub schedule_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<String>,
    pub status: RunOutcome,
    pub scheduled_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub retry_count: u32,
}

/// Creation payload accepted by `POST /agency/:id/schedules`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateScheduleRequest {
    pub name: String,
    pub agent_type: String,
    #[serde(default)]
    pub input: Option<Value>,
    #[serde(rename = "type")]
    pub schedule_type: ScheduleType,
    #[serde(default)]
    pub run_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub cron: Option<String>,
    #[serde(default)]
    pub interval_ms: Option<u64>,
    #[serde(default)]
    pub overlap_policy: Option<OverlapPolicy>,
    #[serde(default)]
    pub max_retries: Option<u32>,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

/// Patch payload accepted by `PATCH /agency/:id/schedules/:sid`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateScheduleRequest {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub input: Option<Value>,
    #[serde(default)]
    pub run_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub cron: Option<String>,
    #[serde(default)]
    pub interval_ms: Option<u64>,
    #[serde(default)]
    pub overlap_policy: Option<OverlapPolicy>,
    #[serde(default)]
    pub max_retries: Option<u32>,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

#[derive(Debug, Error, PartialEq)]
pub enum ScheduleError {
    #[error("schedule of type {0:?} requires field {1}")]
    MissingTiming(&'static str, &'static str),

    #[error("invalid cron expression: {0}")]
    InvalidCron(String),
}

impl CreateScheduleRequest {
    pub fn into_schedule(self, now: DateTime<Utc>) -> Result<Schedule, ScheduleError> {
        match self.schedule_type {
            ScheduleType::Once if self.run_at.is_none() => {
                return Err(ScheduleError::MissingTiming("once", "runAt"));
            }
            ScheduleType::Cron => {
                let Some(expr) = &self.cron else {
                    return Err(ScheduleError::MissingTiming("cron", "cron"));
                };
                cron::Schedule::from_str(expr)
                    .map_err(|e| ScheduleError::InvalidCron(e.to_string()))?;
            }
            ScheduleType::Interval if self.interval_ms.is_none() => {
                return Err(ScheduleError::MissingTiming("interval", "intervalMs"));
            }
            _ => {}
        }

        let mut schedule = Schedule {
            id: uuid::Uuid::new_v4().to_string(),
            name: self.name,
            agent_type: self.agent_type,
            input: self.input,
            schedule_type: self.schedule_type,
            run_at: self.run_at,
            cron: self.cron,
            interval_ms: self.interval_ms,
            status: ScheduleStatus::Active,
            overlap_policy: self.overlap_policy.unwrap_or(OverlapPolicy::Skip),
            max_retries: self.max_retries.unwrap_or(0),
            timeout_ms: self.timeout_ms,
            created_at: now,
            updated_at: now,
            last_run_at: None,
            next_run_at: None,
        };
        schedule.next_run_at = compute_next_run(&schedule, now);
        Ok(schedule)
    }
}

/// The next firing instant for an active schedule, or `None` when it will
/// never fire again.
pub fn compute_next_run(schedule: &Schedule, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    match schedule.schedule_type {
        ScheduleType::Once => schedule.run_at.filter(|at| *at > now),
        ScheduleType::Cron => {
            let expr = schedule.cron.as_deref()?;
            let parsed = cron::Schedule::from_str(expr).ok()?;
            parsed.after(&now).next()
        }
        ScheduleType::Interval => {
            let interval = ChronoDuration::milliseconds(schedule.interval_ms? as i64);
            let base = schedule.last_run_at.map_or(now, |last| last.max(now));
            Some(base + interval)
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
