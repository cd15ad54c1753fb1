use std::path::Path;
use std::sync::Mutex;

use acp2_error::{BridgeError, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::Serialize;
use serde_json::Value;
use tracing::info;

use crate::events::Role;

/// Lifecycle state of a persisted session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Active,
    Idle,
    Terminated,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Idle => "idle",
            Self::Terminated => "terminated",
        }
    }

    pub fn parse(raw: &str) -> Result<Self> {
        match raw {
            "active" => Ok(Self::Active),
            "idle" => Ok(Self::Idle),
            "terminated" => Ok(Self::Terminated),
            other => Err(BridgeError::internal(format!(
                "unknown session status '{other}' in store"
            ))),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionRecord {
    pub id: String,
    pub agent_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub south_session_id: Option<String>,
    pub status: SessionStatus,
    pub created_at: DateTime<Utc>,
    pub last_active_at: DateTime<Utc>,
    pub message_count: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct MessageRecord {
    pub sequence: i64,
    pub role: Role,
    pub content: Vec<Value>,
    #[serde(skip_serializing)]
    pub south_blocks: Option<Value>,
    pub created_at: DateTime<Utc>,
}

/// Partial update for a session row; unset fields are left untouched.
#[derive(Debug, Default)]
pub struct SessionPatch {
    pub south_session_id: Option<String>,
    pub status: Option<SessionStatus>,
    pub last_active_at: Option<DateTime<Utc>>,
    pub message_count: Option<i64>,
}

#[derive(Debug, Default, Clone)]
pub struct SessionFilter {
    pub agent_name: Option<String>,
    pub status: Option<SessionStatus>,
}

/// Durable session store backed by SQLite in WAL mode. A single connection
/// behind a mutex gives the one-writer discipline the transcript invariants
/// need; every operation is atomic.
pub struct SessionStore {
    conn: Mutex<Connection>,
}

impl SessionStore {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|err| {
                    BridgeError::internal(format!("cannot create db directory: {err}"))
                })?;
            }
        }
        let conn = Connection::open(path)
            .map_err(|err| BridgeError::internal(format!("cannot open database: {err}")))?;
        conn.pragma_update(None, "journal_mode", "WAL")
            .map_err(store_err)?;
        let store = Self::bootstrap(conn)?;
        info!(path = %path.display(), "session store opened");
        Ok(store)
    }

    /// In-memory store for tests.
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(store_err)?;
        Self::bootstrap(conn)
    }

    fn bootstrap(conn: Connection) -> Result<Self> {
        conn.pragma_update(None, "foreign_keys", "ON")
            .map_err(store_err)?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS sessions (
                id TEXT PRIMARY KEY,
                agent_name TEXT NOT NULL,
                south_session_id TEXT,
                status TEXT NOT NULL,
                created_at TEXT NOT NULL,
                last_active_at TEXT NOT NULL,
                message_count INTEGER NOT NULL DEFAULT 0
            );
            CREATE TABLE IF NOT EXISTS messages (
                session_id TEXT NOT NULL REFERENCES sessions(id) ON DELETE CASCADE,
                sequence INTEGER NOT NULL,
                role TEXT NOT NULL,
                content_json TEXT NOT NULL,
                south_blocks_json TEXT,
                created_at TEXT NOT NULL,
                PRIMARY KEY (session_id, sequence)
            );
            CREATE INDEX IF NOT EXISTS idx_messages_session ON messages(session_id);",
        )
        .map_err(store_err)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn create_session(&self, id: &str, agent_name: &str) -> Result<SessionRecord> {
        let now = Utc::now();
        let conn = self.lock();
        let inserted = conn
            .execute(
                "INSERT OR IGNORE INTO sessions
                 (id, agent_name, south_session_id, status, created_at, last_active_at, message_count)
                 VALUES (?1, ?2, NULL, ?3, ?4, ?4, 0)",
                params![id, agent_name, SessionStatus::Active.as_str(), rfc3339(&now)],
            )
            .map_err(store_err)?;
        if inserted == 0 {
            return Err(BridgeError::conflict(format!(
                "session '{id}' already exists"
            )));
        }
        Ok(SessionRecord {
            id: id.to_string(),
            agent_name: agent_name.to_string(),
            south_session_id: None,
            status: SessionStatus::Active,
            created_at: now,
            last_active_at: now,
            message_count: 0,
        })
    }

    pub fn get_session(&self, id: &str) -> Result<Option<SessionRecord>> {
        let conn = self.lock();
        conn.query_row(
            "SELECT id, agent_name, south_session_id, status, created_at, last_active_at,
                    message_count
             FROM sessions WHERE id = ?1",
            params![id],
            session_from_row,
        )
        .optional()
        .map_err(store_err)?
        .transpose()
    }

    /// Sessions ordered by `last_active_at` descending; ties broken by id so
    /// the order is deterministic.
    pub fn list_sessions(
        &self,
        filter: &SessionFilter,
        limit: Option<i64>,
        offset: Option<i64>,
    ) -> Result<Vec<SessionRecord>> {
        let mut sql = String::from(
            "SELECT id, agent_name, south_session_id, status, created_at, last_active_at,
                    message_count
             FROM sessions WHERE 1=1",
        );
        let mut args: Vec<String> = Vec::new();
        if let Some(agent) = &filter.agent_name {
            sql.push_str(" AND agent_name = ?");
            args.push(agent.clone());
        }
        if let Some(status) = filter.status {
            sql.push_str(" AND status = ?");
            args.push(status.as_str().to_string());
        }
        sql.push_str(" ORDER BY last_active_at DESC, id ASC");
        sql.push_str(&format!(
            " LIMIT {} OFFSET {}",
            limit.unwrap_or(-1),
            offset.unwrap_or(0)
        ));

        let conn = self.lock();
        let mut stmt = conn.prepare(&sql).map_err(store_err)?;
        let rows = stmt
            .query_map(rusqlite::params_from_iter(args.iter()), session_from_row)
            .map_err(store_err)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(store_err)?;
        rows.into_iter().collect()
    }

    pub fn update_session(&self, id: &str, patch: SessionPatch) -> Result<()> {
        let conn = self.lock();
        let mut sets: Vec<String> = Vec::new();
        let mut args: Vec<String> = Vec::new();
        if let Some(sid) = patch.south_session_id {
            sets.push("south_session_id = ?".to_string());
            args.push(sid);
        }
        if let Some(status) = patch.status {
            sets.push("status = ?".to_string());
            args.push(status.as_str().to_string());
        }
        if let Some(at) = patch.last_active_at {
            sets.push("last_active_at = ?".to_string());
            args.push(rfc3339(&at));
        }
        if let Some(count) = patch.message_count {
            sets.push("message_count = ?".to_string());
            args.push(count.to_string());
        }
        if sets.is_empty() {
            return Ok(());
        }
        args.push(id.to_string());
        let sql = format!("UPDATE sessions SET {} WHERE id = ?", sets.join(", "));
        let updated = conn
            .execute(&sql, rusqlite::params_from_iter(args.iter()))
            .map_err(store_err)?;
        if updated == 0 {
            return Err(BridgeError::not_found(format!("session '{id}'")));
        }
        Ok(())
    }

    /// Delete a session and, via the cascade, its messages. Idempotent:
    /// returns whether a row existed.
    pub fn delete_session(&self, id: &str) -> Result<bool> {
        let conn = self.lock();
        let deleted = conn
            .execute("DELETE FROM sessions WHERE id = ?1", params![id])
            .map_err(store_err)?;
        Ok(deleted > 0)
    }

    /// Append one message, bumping the session's dense sequence counter in
    /// the same transaction. Returns the new sequence number.
    pub fn append_message(
        &self,
        session_id: &str,
        role: Role,
        content: &[Value],
        south_blocks: Option<&Value>,
    ) -> Result<i64> {
        let now = Utc::now();
        let mut conn = self.lock();
        let tx = conn.transaction().map_err(store_err)?;

        let count: i64 = tx
            .query_row(
                "SELECT message_count FROM sessions WHERE id = ?1",
                params![session_id],
                |row| row.get(0),
            )
            .optional()
            .map_err(store_err)?
            .ok_or_else(|| BridgeError::not_found(format!("session '{session_id}'")))?;
        let sequence = count + 1;

        let content_json = serde_json::to_string(content)
            .map_err(|err| BridgeError::internal(format!("cannot encode content: {err}")))?;
        let south_json = south_blocks
            .map(|blocks| {
                serde_json::to_string(blocks).map_err(|err| {
                    BridgeError::internal(format!("cannot encode south blocks: {err}"))
                })
            })
            .transpose()?;

        tx.execute(
            "INSERT INTO messages
             (session_id, sequence, role, content_json, south_blocks_json, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                session_id,
                sequence,
                role.as_str(),
                content_json,
                south_json,
                rfc3339(&now)
            ],
        )
        .map_err(store_err)?;
        tx.execute(
            "UPDATE sessions SET message_count = ?1, last_active_at = ?2 WHERE id = ?3",
            params![sequence, rfc3339(&now), session_id],
        )
        .map_err(store_err)?;
        tx.commit().map_err(store_err)?;
        Ok(sequence)
    }

    pub fn list_messages(
        &self,
        session_id: &str,
        since_sequence: Option<i64>,
        limit: Option<i64>,
    ) -> Result<Vec<MessageRecord>> {
        let conn = self.lock();
        let mut stmt = conn
            .prepare(
                "SELECT sequence, role, content_json, south_blocks_json, created_at
                 FROM messages
                 WHERE session_id = ?1 AND sequence > ?2
                 ORDER BY sequence ASC
                 LIMIT ?3",
            )
            .map_err(store_err)?;
        let rows = stmt
            .query_map(
                params![session_id, since_sequence.unwrap_or(0), limit.unwrap_or(-1)],
                message_from_row,
            )
            .map_err(store_err)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(store_err)?;
        rows.into_iter().collect()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Connection> {
        // A poisoned store mutex means a panic mid-write; propagating the
        // panic is the only safe option.
        self.conn.lock().expect("session store mutex poisoned")
    }
}

type ParsedSession = Result<SessionRecord>;
type ParsedMessage = Result<MessageRecord>;

fn session_from_row(row: &Row<'_>) -> rusqlite::Result<ParsedSession> {
    let status_raw: String = row.get(3)?;
    let created_raw: String = row.get(4)?;
    let active_raw: String = row.get(5)?;
    Ok((|| {
        Ok(SessionRecord {
            id: row.get(0).map_err(store_err)?,
            agent_name: row.get(1).map_err(store_err)?,
            south_session_id: row.get(2).map_err(store_err)?,
            status: SessionStatus::parse(&status_raw)?,
            created_at: parse_rfc3339(&created_raw)?,
            last_active_at: parse_rfc3339(&active_raw)?,
            message_count: row.get(6).map_err(store_err)?,
        })
    })())
}

fn message_from_row(row: &Row<'_>) -> rusqlite::Result<ParsedMessage> {
    let role_raw: String = row.get(1)?;
    let content_raw: String = row.get(2)?;
    let south_raw: Option<String> = row.get(3)?;
    let created_raw: String = row.get(4)?;
    Ok((|| {
        let role = match role_raw.as_str() {
            "user" => Role::User,
            "agent" => Role::Agent,
            other => {
                return Err(BridgeError::internal(format!(
                    "unknown message role '{other}' in store"
                )))
            }
        };
        let content: Vec<Value> = serde_json::from_str(&content_raw)
            .map_err(|err| BridgeError::internal(format!("corrupt content column: {err}")))?;
        let south_blocks = south_raw
            .map(|raw| {
                serde_json::from_str(&raw).map_err(|err| {
                    BridgeError::internal(format!("corrupt south blocks column: {err}"))
                })
            })
            .transpose()?;
        Ok(MessageRecord {
            sequence: row.get(0).map_err(store_err)?,
            role,
            content,
            south_blocks,
            created_at: parse_rfc3339(&created_raw)?,
        })
    })())
}

fn rfc3339(at: &DateTime<Utc>) -> String {
    at.to_rfc3339()
}

fn parse_rfc3339(raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|err| BridgeError::internal(format!("corrupt timestamp in store: {err}")))
}

fn store_err(err: rusqlite::Error) -> BridgeError {
    BridgeError::internal(format!("store: {err}"))
}
