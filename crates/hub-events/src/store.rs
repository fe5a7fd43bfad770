// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! SQLite persistence for one agent: the append-only event log, the plain
//! chat-message table, projection snapshots, and the `_info` / `_runState` /
//! `_vars:*` key-value space.
//!
//! The connection is owned by the agent actor; all methods take `&self`
//! and no locking is needed because only the owning actor touches it.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::Path;
use thiserror::Error;

use hub_model::FlatMessage;

use crate::event::{Event, EventBody, RunState};
use crate::projection::Projection;

/// SQLite's default host-parameter ceiling is 999; chunk below it.
const INSERT_CHUNK_ROWS: usize = 200;

/// Keep this many snapshots when pruning.
pub const SNAPSHOT_KEEP: usize = 3;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("storage error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

/// A cached projection at a specific sequence number.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub last_event_seq: u64,
    pub state: Projection,
    pub created_at: DateTime<Utc>,
}

pub struct EventStore {
    conn: Connection,
}

impl EventStore {
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
            CREATE TABLE IF NOT EXISTS events (
                seq  INTEGER PRIMARY KEY,
                type TEXT NOT NULL,
                data TEXT NOT NULL,
                ts   TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS messages (
                seq               INTEGER PRIMARY KEY AUTOINCREMENT,
                role              TEXT NOT NULL,
                content           TEXT,
                tool_calls        TEXT,
                tool_call_id      TEXT,
                reasoning_content TEXT,
                created_at        TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS snapshots (
                last_event_seq INTEGER PRIMARY KEY,
                state          TEXT NOT NULL,
                created_at     TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS kv (
                key   TEXT PRIMARY KEY,
                value TEXT NOT NULL
            );
            "#,
        )?;
        Ok(())
    }

    // ── Events ───────────────────────────────────────────────────────────────

    /// Append one event; the assigned `seq` is `max_seq() + 1`.
    pub fn append_event(&self, body: EventBody) -> Result<Event, StoreError> {
        let seq = self.max_seq()? + 1;
        let ts = Utc::now();
        let (kind, data) = body.encode();
        self.conn.execute(
            "INSERT INTO events (seq, type, data, ts) VALUES (?1, ?2, ?3, ?4)",
            params![seq as i64, kind, data.to_string(), ts.to_rfc3339()],
        )?;
        Ok(Event { seq, ts, body })
    }

    pub fn list_events(&self) -> Result<Vec<Event>, StoreError> {
        self.select_events("SELECT seq, type, data, ts FROM events ORDER BY seq", &[])
    }

    pub fn events_after(&self, seq: u64) -> Result<Vec<Event>, StoreError> {
        self.select_events(
            "SELECT seq, type, data, ts FROM events WHERE seq > ?1 ORDER BY seq",
            &[&(seq as i64)],
        )
    }

    /// Events with `seq <= until` — the fork source range.
    pub fn events_until(&self, until: u64) -> Result<Vec<Event>, StoreError> {
        self.select_events(
            "SELECT seq, type, data, ts FROM events WHERE seq <= ?1 ORDER BY seq",
            &[&(until as i64)],
        )
    }

    fn select_events(
        &self,
        sql: &str,
        args: &[&dyn rusqlite::ToSql],
    ) -> Result<Vec<Event>, StoreError> {
        let mut stmt = self.conn.prepare(sql)?;
        let rows = stmt.query_map(args, |row| {
            let seq: i64 = row.get(0)?;
            let kind: String = row.get(1)?;
            let data: String = row.get(2)?;
            let ts: String = row.get(3)?;
            Ok((seq, kind, data, ts))
        })?;
        let mut events = Vec::new();
        for row in rows {
            let (seq, kind, data, ts) = row?;
            let data: Value = serde_json::from_str(&data)?;
            let ts = DateTime::parse_from_rfc3339(&ts)
                .map(|t| t.with_timezone(&Utc))
                .unwrap_or_default();
            events.push(Event {
                seq: seq as u64,
                ts,
                body: EventBody::decode(&kind, data),
            });
        }
        Ok(events)
    }

    pub fn max_seq(&self) -> Result<u64, StoreError> {
        let max: Option<i64> =
            self.conn
                .query_row("SELECT MAX(seq) FROM events", [], |row| row.get(0))?;
        Ok(max.unwrap_or(0) as u64)
    }

    pub fn event_count(&self) -> Result<u64, StoreError> {
        let n: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM events", [], |row| row.get(0))?;
        Ok(n as u64)
    }

    /// Bulk-import events from a fork source.  Sequence numbers are
    /// reassigned locally; timestamps are preserved.  Returns the number of
    /// rows inserted.  Inserts are chunked to stay below the SQLite
    /// host-parameter limit.
    pub fn add_events(&self, events: &[Event]) -> Result<u64, StoreError> {
        let mut next = self.max_seq()? + 1;
        let mut inserted = 0u64;
        for chunk in events.chunks(INSERT_CHUNK_ROWS) {
            let mut sql = String::from("INSERT INTO events (seq, type, data, ts) VALUES ");
            let mut args: Vec<Box<dyn rusqlite::ToSql>> = Vec::with_capacity(chunk.len() * 4);
            for (i, ev) in chunk.iter().enumerate() {
                if i > 0 {
                    sql.push(',');
                }
                let base = i * 4;
                sql.push_str(&format!(
                    "(?{}, ?{}, ?{}, ?{})",
                    base + 1,
                    base + 2,
                    base + 3,
                    base + 4
                ));
                let (kind, data) = ev.body.encode();
                args.push(Box::new(next as i64));
                args.push(Box::new(kind));
                args.push(Box::new(data.to_string()));
                args.push(Box::new(ev.ts.to_rfc3339()));
                next += 1;
            }
            let params: Vec<&dyn rusqlite::ToSql> = args.iter().map(|a| a.as_ref()).collect();
            inserted += self.conn.execute(&sql, params.as_slice())? as u64;
        }
        Ok(inserted)
    }

    // ── Snapshots ────────────────────────────────────────────────────────────

    pub fn add_snapshot(&self, snapshot: &Snapshot) -> Result<(), StoreError> {
        self.conn.execute(
            "INSERT OR REPLACE INTO snapshots (last_event_seq, state, created_at)
             VALUES (?1, ?2, ?3)",
            params![
                snapshot.last_event_seq as i64,
                serde_json::to_string(&snapshot.state)?,
                snapshot.created_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    pub fn latest_snapshot(&self) -> Result<Option<Snapshot>, StoreError> {
        self.query_snapshot(
            "SELECT last_event_seq, state, created_at FROM snapshots
             ORDER BY last_event_seq DESC LIMIT 1",
            &[],
        )
    }

    /// The most recent snapshot taken at or before `seq`.
    pub fn snapshot_at(&self, seq: u64) -> Result<Option<Snapshot>, StoreError> {
        self.query_snapshot(
            "SELECT last_event_seq, state, created_at FROM snapshots
             WHERE last_event_seq <= ?1 ORDER BY last_event_seq DESC LIMIT 1",
            &[&(seq as i64)],
        )
    }

    fn query_snapshot(
        &self,
        sql: &str,
        args: &[&dyn rusqlite::ToSql],
    ) -> Result<Option<Snapshot>, StoreError> {
        let row: Option<(i64, String, String)> = self
            .conn
            .query_row(sql, args, |row| {
                Ok((row.get(0)?, row.get(1)?, row.get(2)?))
            })
            .optional()?;
        let Some((seq, state, created_at)) = row else {
            return Ok(None);
        };
        Ok(Some(Snapshot {
            last_event_seq: seq as u64,
            state: serde_json::from_str(&state)?,
            created_at: DateTime::parse_from_rfc3339(&created_at)
                .map(|t| t.with_timezone(&Utc))
                .unwrap_or_default(),
        }))
    }

    /// Delete all but the `keep` most recent snapshots.
    pub fn prune_snapshots(&self, keep: usize) -> Result<usize, StoreError> {
        let n = self.conn.execute(
            "DELETE FROM snapshots WHERE last_event_seq NOT IN
             (SELECT last_event_seq FROM snapshots ORDER BY last_event_seq DESC LIMIT ?1)",
            params![keep as i64],
        )?;
        Ok(n)
    }

    // ── Plain chat rows ──────────────────────────────────────────────────────

    /// Append a flat chat row for providers that want plain history.
    pub fn append_message(&self, msg: &FlatMessage) -> Result<(), StoreError> {
        let role = serde_json::to_value(msg.role)?
            .as_str()
            .unwrap_or("user")
            .to_string();
        self.conn.execute(
            "INSERT INTO messages (role, content, tool_calls, tool_call_id, reasoning_content, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                role,
                msg.content,
                msg.tool_calls
                    .as_ref()
                    .map(|c| serde_json::to_string(c))
                    .transpose()?,
                msg.tool_call_id,
                msg.reasoning_content,
                Utc::now().to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    pub fn list_messages(&self) -> Result<Vec<FlatMessage>, StoreError> {
        let mut stmt = self.conn.prepare(
            "SELECT role, content, tool_calls, tool_call_id, reasoning_content
             FROM messages ORDER BY seq",
        )?;
        let rows = stmt.query_map([], |row| {
            let role: String = row.get(0)?;
            let content: Option<String> = row.get(1)?;
            let tool_calls: Option<String> = row.get(2)?;
            let tool_call_id: Option<String> = row.get(3)?;
            let reasoning_content: Option<String> = row.get(4)?;
            Ok((role, content, tool_calls, tool_call_id, reasoning_content))
        })?;
        let mut out = Vec::new();
        for row in rows {
            let (role, content, tool_calls, tool_call_id, reasoning_content) = row?;
            let role = serde_json::from_value(Value::String(role))?;
            let tool_calls = tool_calls
                .as_deref()
                .map(serde_json::from_str)
                .transpose()?;
            out.push(FlatMessage {
                role,
                content,
                reasoning_content,
                tool_calls,
                tool_call_id,
            });
        }
        Ok(out)
    }

    // ── Key-value space ──────────────────────────────────────────────────────

    pub fn kv_set(&self, key: &str, value: &Value) -> Result<(), StoreError> {
        self.conn.execute(
            "INSERT OR REPLACE INTO kv (key, value) VALUES (?1, ?2)",
            params![key, value.to_string()],
        )?;
        Ok(())
    }

    pub fn kv_get(&self, key: &str) -> Result<Option<Value>, StoreError> {
        let raw: Option<String> = self
            .conn
            .query_row("SELECT value FROM kv WHERE key = ?1", params![key], |row| {
                row.get(0)
            })
            .optional()?;
        Ok(raw.map(|s| serde_json::from_str(&s)).transpose()?)
    }

    pub fn kv_has(&self, key: &str) -> Result<bool, StoreError> {
        Ok(self.kv_get(key)?.is_some())
    }

    pub fn kv_delete(&self, key: &str) -> Result<bool, StoreError> {
        let n = self
            .conn
            .execute("DELETE FROM kv WHERE key = ?1", params![key])?;
        Ok(n > 0)
    }

    pub fn kv_keys(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        let mut stmt = self
            .conn
            .prepare("SELECT key FROM kv WHERE key LIKE ?1 || '%' ORDER BY key")?;
        let rows = stmt.query_map(params![prefix], |row| row.get::<_, String>(0))?;
        let mut keys = Vec::new();
        for row in rows {
            keys.push(row?);
        }
        Ok(keys)
    }

    // ── Typed wrappers over the KV prefixes ──────────────────────────────────

    pub fn save_run_state(&self, state: &RunState) -> Result<(), StoreError> {
        self.kv_set("_runState", &serde_json::to_value(state)?)
    }

    pub fn load_run_state(&self) -> Result<RunState, StoreError> {
        Ok(self
            .kv_get("_runState")?
            .map(serde_json::from_value)
            .transpose()?
            .unwrap_or_default())
    }

    pub fn info_set(&self, key: &str, value: &Value) -> Result<(), StoreError> {
        self.kv_set(&format!("_info:{key}"), value)
    }

    pub fn info_get(&self, key: &str) -> Result<Option<Value>, StoreError> {
        self.kv_get(&format!("_info:{key}"))
    }

    /// Dictionary view over the `_vars:` prefix.  Every read goes to
    /// storage; enumeration scans all keys under the prefix, so a reader
    /// sees exactly the keys previously written and none of those deleted.
    pub fn var_set(&self, name: &str, value: &Value) -> Result<(), StoreError> {
        self.kv_set(&format!("_vars:{name}"), value)
    }

    pub fn var_get(&self, name: &str) -> Result<Option<Value>, StoreError> {
        self.kv_get(&format!("_vars:{name}"))
    }

    pub fn var_has(&self, name: &str) -> Result<bool, StoreError> {
        self.kv_has(&format!("_vars:{name}"))
    }

    pub fn var_delete(&self, name: &str) -> Result<bool, StoreError> {
        self.kv_delete(&format!("_vars:{name}"))
    }

    pub fn vars_all(&self) -> Result<BTreeMap<String, Value>, StoreError> {
        let mut out = BTreeMap::new();
        for key in self.kv_keys("_vars:")? {
            let name = key.trim_start_matches("_vars:").to_string();
            if let Some(value) = self.kv_get(&key)? {
                out.insert(name, value);
            }
        }
        Ok(out)
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{AgentErrorData, ToolFinishData};
    use serde_json::json;

    fn store() -> EventStore {
        EventStore::open_in_memory().unwrap()
    }

    #[test]
    fn append_assigns_monotonic_seq() {
        let s = store();
        let a = s.append_event(EventBody::Invoked).unwrap();
        let b = s.append_event(EventBody::Step { step: 0 }).unwrap();
        assert_eq!(a.seq, 1);
        assert_eq!(b.seq, 2);
        assert_eq!(s.max_seq().unwrap(), 2);
        assert_eq!(s.event_count().unwrap(), 2);
    }

    #[test]
    fn list_and_events_after() {
        let s = store();
        for i in 0..5 {
            s.append_event(EventBody::Step { step: i }).unwrap();
        }
        assert_eq!(s.list_events().unwrap().len(), 5);
        let tail = s.events_after(3).unwrap();
        assert_eq!(tail.len(), 2);
        assert_eq!(tail[0].seq, 4);
    }

    #[test]
    fn events_round_trip_through_storage() {
        let s = store();
        let body = EventBody::ToolFinish(ToolFinishData {
            call_id: "c1".into(),
            response: json!({"result": 5}),
        });
        s.append_event(body.clone()).unwrap();
        let events = s.list_events().unwrap();
        assert_eq!(events[0].body, body);
    }

    #[test]
    fn add_events_reassigns_seq() {
        let s = store();
        s.append_event(EventBody::Invoked).unwrap();

        let imported = vec![
            Event {
                seq: 41,
                ts: Utc::now(),
                body: EventBody::Step { step: 0 },
            },
            Event {
                seq: 42,
                ts: Utc::now(),
                body: EventBody::Completed { final_text: None },
            },
        ];
        let n = s.add_events(&imported).unwrap();
        assert_eq!(n, 2);
        let all = s.list_events().unwrap();
        assert_eq!(all.len(), 3);
        // Imported rows continue the local sequence.
        assert_eq!(all[1].seq, 2);
        assert_eq!(all[2].seq, 3);
    }

    #[test]
    fn add_events_chunks_large_batches() {
        let s = store();
        let batch: Vec<Event> = (0..(INSERT_CHUNK_ROWS * 2 + 7))
            .map(|i| Event {
                seq: i as u64,
                ts: Utc::now(),
                body: EventBody::Step { step: i as u32 },
            })
            .collect();
        let n = s.add_events(&batch).unwrap();
        assert_eq!(n as usize, batch.len());
        assert_eq!(s.event_count().unwrap() as usize, batch.len());
    }

    #[test]
    fn snapshots_store_and_select_by_seq() {
        let s = store();
        for seq in [5u64, 10, 15] {
            s.add_snapshot(&Snapshot {
                last_event_seq: seq,
                state: Projection::default(),
                created_at: Utc::now(),
            })
            .unwrap();
        }
        assert_eq!(s.latest_snapshot().unwrap().unwrap().last_event_seq, 15);
        assert_eq!(s.snapshot_at(12).unwrap().unwrap().last_event_seq, 10);
        assert_eq!(s.snapshot_at(4).unwrap(), None);
    }

    #[test]
    fn prune_keeps_most_recent() {
        let s = store();
        for seq in [5u64, 10, 15, 20] {
            s.add_snapshot(&Snapshot {
                last_event_seq: seq,
                state: Projection::default(),
                created_at: Utc::now(),
            })
            .unwrap();
        }
        let removed = s.prune_snapshots(SNAPSHOT_KEEP).unwrap();
        assert_eq!(removed, 1);
        assert_eq!(s.snapshot_at(9).unwrap(), None, "oldest snapshot pruned");
        assert_eq!(s.latest_snapshot().unwrap().unwrap().last_event_seq, 20);
    }

    #[test]
    fn kv_reads_see_writes_and_deletes() {
        let s = store();
        s.var_set("NAME", &json!("Ada")).unwrap();
        s.var_set("SCORE", &json!(99)).unwrap();
        assert!(s.var_has("NAME").unwrap());
        assert_eq!(s.var_get("SCORE").unwrap(), Some(json!(99)));

        let all = s.vars_all().unwrap();
        assert_eq!(all.len(), 2);

        assert!(s.var_delete("NAME").unwrap());
        assert!(!s.var_has("NAME").unwrap());
        assert_eq!(s.vars_all().unwrap().len(), 1);
        assert!(!s.var_delete("NAME").unwrap(), "second delete is a no-op");
    }

    #[test]
    fn var_prefix_does_not_leak_into_info() {
        let s = store();
        s.var_set("X", &json!(1)).unwrap();
        s.info_set("agencyId", &json!("a1")).unwrap();
        assert_eq!(s.vars_all().unwrap().len(), 1);
        assert_eq!(s.info_get("agencyId").unwrap(), Some(json!("a1")));
    }

    #[test]
    fn run_state_round_trips() {
        let s = store();
        assert_eq!(s.load_run_state().unwrap(), RunState::default());
        let state = RunState {
            status: crate::event::RunStatus::Paused,
            step: 7,
            reason: Some("subagent".into()),
        };
        s.save_run_state(&state).unwrap();
        assert_eq!(s.load_run_state().unwrap(), state);
    }

    #[test]
    fn messages_table_round_trips() {
        let s = store();
        let msg = FlatMessage {
            role: hub_model::Role::Assistant,
            content: Some("hi".into()),
            reasoning_content: Some("hm".into()),
            tool_calls: None,
            tool_call_id: None,
        };
        s.append_message(&msg).unwrap();
        let rows = s.list_messages().unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0], msg);
    }

    #[test]
    fn error_event_survives_storage() {
        let s = store();
        let body = EventBody::Error(AgentErrorData {
            kind: "max_iterations_exceeded".into(),
            message: "step loop cap hit".into(),
            stack: None,
        });
        s.append_event(body.clone()).unwrap();
        assert_eq!(s.list_events().unwrap()[0].body, body);
    }
}
