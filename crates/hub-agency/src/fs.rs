// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Tenant file routing over an object-store seam.
//!
//! Path grammar inside one agency:
//!
//! - `~/…` — the requesting agent's home area (`agents/<id>/home/…`);
//! - `/shared/…` — the tenant-wide shared area;
//! - `/agents/<id>/…` — any agent's area: world-readable within the
//!   tenant, writable only by the owning agent;
//! - anything else — the tenant root area.
//!
//! The store itself is only a key-value blob interface; the concrete
//! backend (local disk, object store) is an external concern.

use std::collections::BTreeMap;
use std::sync::Mutex;

use async_trait::async_trait;
use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum FsError {
    #[error("invalid path: {0}")]
    InvalidPath(String),

    #[error("no agent context for '~' path")]
    NoAgentContext,

    #[error("only the owning agent may write {0}")]
    Forbidden(String),
}

/// Resolve a request path to a store key relative to the tenant prefix.
///
/// `agent` is the requesting agent, when the request came from inside a
/// run; gateway requests carry `None`.  `write` enables the owner check on
/// `/agents/<id>/…` paths.
pub fn resolve_path(path: &str, agent: Option<&str>, write: bool) -> Result<String, FsError> {
    let trimmed = path.trim_start_matches('/');
    if trimmed.split('/').any(|seg| seg == "..") {
        return Err(FsError::InvalidPath(path.to_string()));
    }

    if let Some(rest) = path.strip_prefix("~/").or_else(|| path.strip_prefix("~")) {
        let agent = agent.ok_or(FsError::NoAgentContext)?;
        let rest = rest.trim_start_matches('/');
        return Ok(format!("agents/{agent}/home/{rest}"));
    }

    if let Some(rest) = trimmed.strip_prefix("shared/") {
        return Ok(format!("shared/{rest}"));
    }
    if trimmed == "shared" {
        return Ok("shared/".into());
    }

    if let Some(rest) = trimmed.strip_prefix("agents/") {
        let (owner, _) = rest.split_once('/').unwrap_or((rest, ""));
        if owner.is_empty() {
            return Err(FsError::InvalidPath(path.to_string()));
        }
        if write && agent != Some(owner) {
            return Err(FsError::Forbidden(format!("agents/{owner}")));
        }
        return Ok(format!("agents/{rest}"));
    }

    Ok(format!("root/{trimmed}"))
}

/// Object-store seam: flat keys to blobs.
#[async_trait]
pub trait FileStore: Send + Sync {
    async fn list(&self, prefix: &str) -> anyhow::Result<Vec<String>>;
    async fn read(&self, key: &str) -> anyhow::Result<Option<Vec<u8>>>;
    async fn write(&self, key: &str, data: Vec<u8>) -> anyhow::Result<()>;
    async fn delete(&self, key: &str) -> anyhow::Result<bool>;
    /// Drop everything under a prefix; used when an agency is deleted.
    async fn delete_prefix(&self, prefix: &str) -> anyhow::Result<u64>;
}

/// In-memory backend for tests and single-process deployments.
#[derive(Default)]
pub struct MemFileStore {
    blobs: Mutex<BTreeMap<String, Vec<u8>>>,
}

#[async_trait]
impl FileStore for MemFileStore {
    async fn list(&self, prefix: &str) -> anyhow::Result<Vec<String>> {
        let blobs = self.blobs.lock().expect("fs lock poisoned");
        Ok(blobs
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect())
    }

    async fn read(&self, key: &str) -> anyhow::Result<Option<Vec<u8>>> {
        let blobs = self.blobs.lock().expect("fs lock poisoned");
        Ok(blobs.get(key).cloned())
    }

    async fn write(&self, key: &str, data: Vec<u8>) -> anyhow::Result<()> {
        self.blobs
            .lock()
            .expect("fs lock poisoned")
            .insert(key.to_string(), data);
        Ok(())
    }

    async fn delete(&self, key: &str) -> anyhow::Result<bool> {
        Ok(self
            .blobs
            .lock()
            .expect("fs lock poisoned")
            .remove(key)
            .is_some())
    }

    async fn delete_prefix(&self, prefix: &str) -> anyhow::Result<u64> {
        let mut blobs = self.blobs.lock().expect("fs lock poisoned");
        let keys: Vec<String> = blobs
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect();
        for k in &keys {
            blobs.remove(k);
        }
        Ok(keys.len() as u64)
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn home_resolves_to_requesting_agent() {
        assert_eq!(
            resolve_path("~/notes.md", Some("a1"), false),
            Ok("agents/a1/home/notes.md".into())
        );
    }

    #[test]
    fn home_without_agent_context_fails() {
        assert_eq!(
            resolve_path("~/notes.md", None, false),
            Err(FsError::NoAgentContext)
        );
    }

    #[test]
    fn shared_is_tenant_wide() {
        assert_eq!(
            resolve_path("/shared/data.csv", Some("a1"), true),
            Ok("shared/data.csv".into())
        );
        assert_eq!(
            resolve_path("shared/data.csv", None, false),
            Ok("shared/data.csv".into())
        );
    }

    #[test]
    fn agents_area_is_readable_by_anyone() {
        assert_eq!(
            resolve_path("/agents/a2/out.txt", Some("a1"), false),
            Ok("agents/a2/out.txt".into())
        );
    }

    #[test]
    fn agents_area_writes_require_ownership() {
        assert_eq!(
            resolve_path("/agents/a2/out.txt", Some("a1"), true),
            Err(FsError::Forbidden("agents/a2".into()))
        );
        assert_eq!(
            resolve_path("/agents/a2/out.txt", Some("a2"), true),
            Ok("agents/a2/out.txt".into())
        );
    }

    #[test]
    fn traversal_is_rejected() {
        assert!(matches!(
            resolve_path("/shared/../secrets", Some("a1"), false),
            Err(FsError::InvalidPath(_))
        ));
    }

    #[test]
    fn bare_paths_land_in_tenant_root() {
        assert_eq!(
            resolve_path("report.txt", None, true),
            Ok("root/report.txt".into())
        );
    }

    #[tokio::test]
    async fn mem_store_round_trips_and_prefix_deletes() {
        let store = MemFileStore::default();
        store.write("t1/shared/a.txt", b"one".to_vec()).await.unwrap();
        store.write("t1/shared/b.txt", b"two".to_vec()).await.unwrap();
        store.write("t2/shared/c.txt", b"other".to_vec()).await.unwrap();

        assert_eq!(store.read("t1/shared/a.txt").await.unwrap(), Some(b"one".to_vec()));
        assert_eq!(store.list("t1/").await.unwrap().len(), 2);

        assert_eq!(store.delete_prefix("t1/").await.unwrap(), 2);
        assert!(store.read("t1/shared/a.txt").await.unwrap().is_none());
        assert_eq!(store.read("t2/shared/c.txt").await.unwrap(), Some(b"other".to_vec()));

        assert!(store.delete("t2/shared/c.txt").await.unwrap());
        assert!(!store.delete("t2/shared/c.txt").await.unwrap());
    }
}
