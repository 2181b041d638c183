//! State Log
//!
//! SQLite-backed history of leadership and membership events, one row per
//! audited event, tagged with the reporting node's identity.

use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;
use std::path::Path;
use tokio::sync::Mutex;

use super::{AuditEvent, AuditKind, AuditSink};
use crate::error::{Error, Result};

/// A persisted state log row
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StateLogEntry {
    pub id: i64,
    pub node: String,
    pub state: String,
    pub detail: Option<String>,
    /// RFC 3339 timestamp
    pub at: String,
}

/// Persistent state log backed by SQLite
pub struct StateLog {
    conn: Mutex<Connection>,
}

impl StateLog {
    /// Create or open the state log database
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(dir) = path.parent() {
            if !dir.as_os_str().is_empty() {
                std::fs::create_dir_all(dir)?;
            }
        }
        Self::init(Connection::open(path)?)
    }

    /// Open a throwaway in-memory log
    pub fn in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS server_state_log (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                node TEXT NOT NULL,
                state TEXT NOT NULL,
                detail TEXT,
                created_at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_server_state_log_node
                ON server_state_log(node, id);
            "#,
        )?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Append an event, returning its row id
    pub async fn append(&self, event: &AuditEvent) -> Result<i64> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO server_state_log (node, state, detail, created_at) VALUES (?1, ?2, ?3, ?4)",
            params![
                event.node,
                event.kind.as_str(),
                event.detail,
                event.at.to_rfc3339()
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Most recent rows, newest first
    pub async fn recent(&self, limit: usize) -> Result<Vec<StateLogEntry>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT id, node, state, detail, created_at FROM server_state_log ORDER BY id DESC LIMIT ?1",
        )?;
        let rows = stmt.query_map(params![limit as i64], |row| {
            Ok(StateLogEntry {
                id: row.get(0)?,
                node: row.get(1)?,
                state: row.get(2)?,
                detail: row.get(3)?,
                at: row.get(4)?,
            })
        })?;

        let mut entries = Vec::new();
        for row in rows {
            entries.push(row?);
        }
        Ok(entries)
    }

    /// Last leadership state (`MASTER` / `UN_MASTER`) recorded for a node
    pub async fn last_state(&self, node: &str) -> Result<Option<String>> {
        let conn = self.conn.lock().await;
        let state = conn
            .query_row(
                "SELECT state FROM server_state_log WHERE node = ?1 AND state IN (?2, ?3) ORDER BY id DESC LIMIT 1",
                params![
                    node,
                    AuditKind::LeadershipAcquired.as_str(),
                    AuditKind::LeadershipLost.as_str()
                ],
                |row| row.get(0),
            )
            .optional()?;
        Ok(state)
    }

    /// Total number of rows
    pub async fn count(&self) -> Result<u64> {
        let conn = self.conn.lock().await;
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM server_state_log", [], |row| row.get(0))?;
        Ok(count as u64)
    }
}

#[async_trait::async_trait]
impl AuditSink for StateLog {
    async fn record(&self, event: AuditEvent) {
        if let Err(e) = self.append(&event).await {
            tracing::error!("Failed to persist {} for {}: {}", event.kind, event.node, e);
        }
    }
}

impl From<rusqlite::Error> for Error {
    fn from(e: rusqlite::Error) -> Self {
        Error::State(format!("SQLite error: {}", e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_state_log_persists_leadership_rows() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("state.db");

        {
            let log = StateLog::open(&path).unwrap();
            log.record(AuditEvent::new("10.0.0.1:1", AuditKind::LeadershipAcquired)).await;
            log.record(AuditEvent::new("10.0.0.1:1", AuditKind::MemberAdded).with_detail("10.0.0.2:2"))
                .await;
            log.record(AuditEvent::new("10.0.0.1:1", AuditKind::LeadershipLost)).await;
        }

        let log = StateLog::open(&path).unwrap();
        assert_eq!(log.count().await.unwrap(), 3);
        assert_eq!(log.last_state("10.0.0.1:1").await.unwrap().as_deref(), Some("UN_MASTER"));
        assert!(log.last_state("10.0.0.9:9").await.unwrap().is_none());

        let recent = log.recent(2).await.unwrap();
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].state, "UN_MASTER");
        assert_eq!(recent[1].detail.as_deref(), Some("10.0.0.2:2"));
    }

    #[tokio::test]
    async fn test_in_memory_log() {
        let log = StateLog::in_memory().unwrap();
        let id = log
            .append(&AuditEvent::new("n:1", AuditKind::NodeStarted))
            .await
            .unwrap();
        assert_eq!(id, 1);
        assert_eq!(log.recent(10).await.unwrap()[0].state, "NODE_STARTED");
    }
}
