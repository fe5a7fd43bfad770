// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! SQLite persistence for one agency: blueprints, agent rows, schedules
//! with their run log, and the tenant `_vars:*` key-value space.

use std::collections::BTreeMap;
use std::path::Path;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use hub_core::Blueprint;
use hub_events::StoreError;

use crate::schedule::{Schedule, ScheduleRun};

/// At least the last 100 runs per schedule stay queryable.
const RUN_QUERY_LIMIT: usize = 100;

/// Persisted record of one agent identity within the agency.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentRow {
    pub id: String,
    pub agent_type: String,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub metadata: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub related_agent_id: Option<String>,
}

pub struct AgencyStore {
    conn: Connection,
}

impl AgencyStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;
        let store = Self { conn };
        store.init_schema()?;
        Ok(store)
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        let store = Self { conn };
        store.init_schema()?;
        Ok(store)
    }

    fn init_schema(&self) -> Result<(), StoreError> {
        self.conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS blueprints (
                name       TEXT PRIMARY KEY,
                data       TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS agents (
                id               TEXT PRIMARY KEY,
                type             TEXT NOT NULL,
                created_at       TEXT NOT NULL,
                metadata         TEXT NOT NULL DEFAULT '{}',
                related_agent_id TEXT
            );
            CREATE TABLE IF NOT EXISTS agent_schedules (
                id             TEXT PRIMARY KEY,
                name           TEXT NOT NULL,
                agent_type     TEXT NOT NULL,
                input          TEXT,
                type           TEXT NOT NULL CHECK (type IN ('once','cron','interval')),
                run_at         TEXT,
                cron           TEXT,
                interval_ms    INTEGER,
                status         TEXT NOT NULL CHECK (status IN ('active','paused','disabled')),
                overlap_policy TEXT NOT NULL CHECK (overlap_policy IN ('skip','queue','allow')),
                max_retries    INTEGER NOT NULL DEFAULT 0,
                timeout_ms     INTEGER,
                created_at     TEXT NOT NULL,
                updated_at     TEXT NOT NULL,
                last_run_at    TEXT,
                next_run_at    TEXT
            );
            CREATE TABLE IF NOT EXISTS schedule_runs (
                id           TEXT PRIMARY KEY,
                schedule_id  TEXT NOT NULL,
                agent_id     TEXT,
                status       TEXT NOT NULL
                             CHECK (status IN ('pending','running','completed','failed','skipped')),
                scheduled_at TEXT NOT NULL,
                started_at   TEXT,
                completed_at TEXT,
                error        TEXT,
                retry_count  INTEGER NOT NULL DEFAULT 0
            );
            CREATE INDEX IF NOT EXISTS idx_runs_schedule ON schedule_runs (schedule_id, scheduled_at);
            CREATE TABLE IF NOT EXISTS kv (
                key   TEXT PRIMARY KEY,
                value TEXT NOT NULL
            );
            "#,
        )?;
        Ok(())
    }

    // ── Blueprints ───────────────────────────────────────────────────────────

    pub fn upsert_blueprint(&self, bp: &Blueprint) -> Result<(), StoreError> {
        self.conn.execute(
            "INSERT OR REPLACE INTO blueprints (name, data, updated_at) VALUES (?1, ?2, ?3)",
            params![
                bp.name,
                serde_json::to_string(bp)?,
                Utc::now().to_rfc3339()
            ],
        )?;
        Ok(())
    }

    pub fn get_blueprint(&self, name: &str) -> Result<Option<Blueprint>, StoreError> {
        let raw: Option<String> = self
            .conn
            .query_row(
                "SELECT data FROM blueprints WHERE name = ?1",
                params![name],
                |row| row.get(0),
            )
            .optional()?;
        Ok(raw.map(|s| serde_json::from_str(&s)).transpose()?)
    }

    pub fn list_blueprints(&self) -> Result<Vec<Blueprint>, StoreError> {
        let mut stmt = self
            .conn
            .prepare("SELECT data FROM blueprints ORDER BY name")?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
        let mut out = Vec::new();
        for row in rows {
            out.push(serde_json::from_str(&row?)?);
        }
        Ok(out)
    }

    pub fn delete_blueprint(&self, name: &str) -> Result<bool, StoreError> {
        let n = self
            .conn
            .execute("DELETE FROM blueprints WHERE name = ?1", params![name])?;
        Ok(n > 0)
    }

    // ── Agents ───────────────────────────────────────────────────────────────

    pub fn insert_agent(&self, row: &AgentRow) -> Result<(), StoreError> {
        self.conn.execute(
            "INSERT INTO agents (id, type, created_at, metadata, related_agent_id)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                row.id,
                row.agent_type,
                row.created_at.to_rfc3339(),
                row.metadata.to_string(),
                row.related_agent_id,
            ],
        )?;
        Ok(())
    }

    pub fn get_agent(&self, id: &str) -> Result<Option<AgentRow>, StoreError> {
        let row = self
            .conn
            .query_row(
                "SELECT id, type, created_at, metadata, related_agent_id
                 FROM agents WHERE id = ?1",
                params![id],
                row_to_agent,
            )
            .optional()?;
        Ok(row)
    }

    pub fn list_agents(&self) -> Result<Vec<AgentRow>, StoreError> {
        let mut stmt = self.conn.prepare(
            "SELECT id, type, created_at, metadata, related_agent_id
             FROM agents ORDER BY created_at",
        )?;
        let rows = stmt.query_map([], row_to_agent)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    pub fn delete_agent(&self, id: &str) -> Result<bool, StoreError> {
        let n = self
            .conn
            .execute("DELETE FROM agents WHERE id = ?1", params![id])?;
        Ok(n > 0)
    }

    pub fn update_agent_metadata(&self, id: &str, metadata: &Value) -> Result<(), StoreError> {
        self.conn.execute(
            "UPDATE agents SET metadata = ?2 WHERE id = ?1",
            params![id, metadata.to_string()],
        )?;
        Ok(())
    }

    pub fn children_of(&self, id: &str) -> Result<Vec<AgentRow>, StoreError> {
        let mut stmt = self.conn.prepare(
            "SELECT id, type, created_at, metadata, related_agent_id
             FROM agents WHERE related_agent_id = ?1 ORDER BY created_at",
        )?;
        let rows = stmt.query_map(params![id], row_to_agent)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    // ── Schedules ────────────────────────────────────────────────────────────

    pub fn upsert_schedule(&self, s: &Schedule) -> Result<(), StoreError> {
        self.conn.execute(
            "INSERT OR REPLACE INTO agent_schedules
             (id, name, agent_type, input, type, run_at, cron, interval_ms,
              status, overlap_policy, max_retries, timeout_ms,
              created_at, updated_at, last_run_at, next_run_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)",
            params![
                s.id,
                s.name,
                s.agent_type,
                s.input.as_ref().map(|v| v.to_string()),
                enum_str(&s.schedule_type)?,
                s.run_at.map(|t| t.to_rfc3339()),
                s.cron,
                s.interval_ms.map(|v| v as i64),
                enum_str(&s.status)?,
                enum_str(&s.overlap_policy)?,
                s.max_retries as i64,
                s.timeout_ms.map(|v| v as i64),
                s.created_at.to_rfc3339(),
                s.updated_at.to_rfc3339(),
                s.last_run_at.map(|t| t.to_rfc3339()),
                s.next_run_at.map(|t| t.to_rfc3339()),
            ],
        )?;
        Ok(())
    }

    pub fn get_schedule(&self, id: &str) -> Result<Option<Schedule>, StoreError> {
        let row = self
            .conn
            .query_row(
                &format!("{SCHEDULE_SELECT} WHERE id = ?1"),
                params![id],
                row_to_schedule,
            )
            .optional()?;
        row.map(|r| r.map_err(StoreError::from)).transpose()
    }

    pub fn list_schedules(&self) -> Result<Vec<Schedule>, StoreError> {
        let mut stmt = self
            .conn
            .prepare(&format!("{SCHEDULE_SELECT} ORDER BY created_at"))?;
        let rows = stmt.query_map([], row_to_schedule)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row??);
        }
        Ok(out)
    }

    // ── Schedule runs ────────────────────────────────────────────────────────

    pub fn upsert_run(&self, run: &ScheduleRun) -> Result<(), StoreError> {
        self.conn.execute(
            "INSERT OR REPLACE INTO schedule_runs
             (id, schedule_id, agent_id, status, scheduled_at, started_at,
              completed_at, error, retry_count)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                run.id,
                run.schedule_id,
                run.agent_id,
                enum_str(&run.status)?,
                run.scheduled_at.to_rfc3339(),
                run.started_at.map(|t| t.to_rfc3339()),
                run.completed_at.map(|t| t.to_rfc3339()),
                run.error,
                run.retry_count as i64,
            ],
        )?;
        Ok(())
    }

    /// Most recent runs first, capped at the query limit.
    pub fn list_runs(&self, schedule_id: &str) -> Result<Vec<ScheduleRun>, StoreError> {
        let mut stmt = self.conn.prepare(
            "SELECT id, schedule_id, agent_id, status, scheduled_at, started_at,
                    completed_at, error, retry_count
             FROM schedule_runs WHERE schedule_id = ?1
             ORDER BY scheduled_at DESC LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![schedule_id, RUN_QUERY_LIMIT as i64], row_to_run)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row??);
        }
        Ok(out)
    }

    pub fn has_running_run(&self, schedule_id: &str) -> Result<bool, StoreError> {
        let n: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM schedule_runs WHERE schedule_id = ?1 AND status = 'running'",
            params![schedule_id],
            |row| row.get(0),
        )?;
        Ok(n > 0)
    }

    // ── Tenant vars ──────────────────────────────────────────────────────────

    pub fn var_set(&self, name: &str, value: &Value) -> Result<(), StoreError> {
        self.conn.execute(
            "INSERT OR REPLACE INTO kv (key, value) VALUES (?1, ?2)",
            params![format!("_vars:{name}"), value.to_string()],
        )?;
        Ok(())
    }

    pub fn var_get(&self, name: &str) -> Result<Option<Value>, StoreError> {
        let raw: Option<String> = self
            .conn
            .query_row(
                "SELECT value FROM kv WHERE key = ?1",
                params![format!("_vars:{name}")],
                |row| row.get(0),
            )
            .optional()?;
        Ok(raw.map(|s| serde_json::from_str(&s)).transpose()?)
    }

    pub fn var_delete(&self, name: &str) -> Result<bool, StoreError> {
        let n = self.conn.execute(
            "DELETE FROM kv WHERE key = ?1",
            params![format!("_vars:{name}")],
        )?;
        Ok(n > 0)
    }

    pub fn vars_all(&self) -> Result<BTreeMap<String, Value>, StoreError> {
        let mut stmt = self
            .conn
            .prepare("SELECT key, value FROM kv WHERE key LIKE '_vars:%' ORDER BY key")?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?;
        let mut out = BTreeMap::new();
        for row in rows {
            let (key, value) = row?;
            let name = key.trim_start_matches("_vars:").to_string();
            out.insert(name, serde_json::from_str(&value)?);
        }
        Ok(out)
    }

    pub fn vars_replace(&self, vars: &BTreeMap<String, Value>) -> Result<(), StoreError> {
        self.conn
            .execute("DELETE FROM kv WHERE key LIKE '_vars:%'", [])?;
        for (name, value) in vars {
            self.var_set(name, value)?;
        }
        Ok(())
    }
}

const SCHEDULE_SELECT: &str =
    "SELECT id, name, agent_type, input, type, run_at, cron, interval_ms,
            status, overlap_policy, max_retries, timeout_ms,
            created_at, updated_at, last_run_at, next_run_at
     FROM agent_schedules";

fn enum_str<T: Serialize>(v: &T) -> Result<String, StoreError> {
    let value = serde_json::to_value(v)?;
    Ok(value.as_str().unwrap_or_default().to_string())
}

fn enum_from_str<T: for<'de> Deserialize<'de>>(s: String) -> Result<T, serde_json::Error> {
    serde_json::from_value(Value::String(s))
}

fn parse_ts(s: String) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(&s)
        .map(|t| t.with_timezone(&Utc))
        .unwrap_or_default()
}

fn row_to_agent(row: &rusqlite::Row<'_>) -> rusqlite::Result<AgentRow> {
    let metadata: String = row.get(3)?;
    Ok(AgentRow {
        id: row.get(0)?,
        agent_type: row.get(1)?,
        created_at: parse_ts(row.get(2)?),
        metadata: serde_json::from_str(&metadata).unwrap_or(Value::Null),
        related_agent_id: row.get(4)?,
    })
}

type SerdeWrapped<T> = Result<T, serde_json::Error>;

fn row_to_schedule(row: &rusqlite::Row<'_>) -> rusqlite::Result<SerdeWrapped<Schedule>> {
    let id: String = row.get(0)?;
    let name: String = row.get(1)?;
    let agent_type: String = row.get(2)?;
    let input: Option<String> = row.get(3)?;
    let schedule_type: String = row.get(4)?;
    let run_at: Option<String> = row.get(5)?;
    let cron: Option<String> = row.get(6)?;
    let interval_ms: Option<i64> = row.get(7)?;
    let status: String = row.get(8)?;
    let overlap: String = row.get(9)?;
    let max_retries: i64 = row.get(10)?;
    let timeout_ms: Option<i64> = row.get(11)?;
    let created_at: String = row.get(12)?;
    let updated_at: String = row.get(13)?;
    let last_run_at: Option<String> = row.get(14)?;
    let next_run_at: Option<String> = row.get(15)?;

    let build = || -> SerdeWrapped<Schedule> {
        Ok(Schedule {
            id,
            name,
            agent_type,
            input: input.as_deref().map(serde_json::from_str).transpose()?,
            schedule_type: enum_from_str(schedule_type)?,
            run_at: run_at.map(parse_ts),
            cron,
            interval_ms: interval_ms.map(|v| v as u64),
            status: enum_from_str(status)?,
            overlap_policy: enum_from_str(overlap)?,
            max_retries: max_retries as u32,
            timeout_ms: timeout_ms.map(|v| v as u64),
            created_at: parse_ts(created_at),
            updated_at: parse_ts(updated_at),
            last_run_at: last_run_at.map(parse_ts),
            next_run_at: next_run_at.map(parse_ts),
        })
    };
    Ok(build())
}

fn row_to_run(row: &rusqlite::Row<'_>) -> rusqlite::Result<SerdeWrapped<ScheduleRun>> {
    let id: String = row.get(0)?;
    let schedule_id: String = row.get(1)?;
    let agent_id: Option<String> = row.get(2)?;
    let status: String = row.get(3)?;
    let scheduled_at: String = row.get(4)?;
    let started_at: Option<String> = row.get(5)?;
    let completed_at: Option<String> = row.get(6)?;
    let error: Option<String> = row.get(7)?;
    let retry_count: i64 = row.get(8)?;

    let build = || -> SerdeWrapped<ScheduleRun> {
        Ok(ScheduleRun {
            id,
            schedule_id,
            agent_id,
            status: enum_from_str(status)?,
            scheduled_at: parse_ts(scheduled_at),
            started_at: started_at.map(parse_ts),
            completed_at: completed_at.map(parse_ts),
            error,
            retry_count: retry_count as u32,
        })
    };
    Ok(build())
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
