use anyhow::{anyhow, Result};
use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;
use std::sync::Mutex;

use crate::detect::HitPoint;
use crate::{lock_unpoisoned, now_ms};

/// Destination for hits detected during a recording session.
pub trait HitSink: Send + Sync {
    fn append_hit(&self, user_id: &str, session_id: &str, hit: &HitPoint) -> Result<()>;
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct UserRecord {
    pub id: String,
    pub name: String,
    pub created_at: i64,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct SessionRecord {
    pub id: String,
    pub user_id: String,
    pub started_at: i64,
    pub ended_at: Option<i64>,
    pub source_ref: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ThrowRecord {
    pub id: i64,
    pub user_id: String,
    pub session_id: String,
    pub ts: i64,
    pub x_norm: f64,
    pub y_norm: f64,
    pub confidence: f64,
}

/// SQLite store for users, sessions and throws. Timestamps are epoch ms.
pub struct SqliteThrowStore {
    conn: Mutex<Connection>,
}

impl SqliteThrowStore {
    pub fn open(db_path: &str) -> Result<Self> {
        let conn = Connection::open(db_path)
            .map_err(|e| anyhow!("failed to open database {}: {}", db_path, e))?;
        Self::with_connection(conn)
    }

    /// Private in-memory database, for tests and throwaway runs.
    pub fn open_in_memory() -> Result<Self> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self> {
        ensure_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn create_user(&self, user_id: &str, name: &str) -> Result<UserRecord> {
        let created_at = now_ms()?;
        let conn = lock_unpoisoned(&self.conn);
        conn.execute(
            "INSERT INTO users(id, name, created_at) VALUES (?1, ?2, ?3)",
            params![user_id, name, created_at],
        )?;
        Ok(UserRecord {
            id: user_id.to_string(),
            name: name.to_string(),
            created_at,
        })
    }

    pub fn get_user(&self, user_id: &str) -> Result<Option<UserRecord>> {
        let conn = lock_unpoisoned(&self.conn);
        let user = conn
            .query_row(
                "SELECT id, name, created_at FROM users WHERE id = ?1",
                params![user_id],
                |row| {
                    Ok(UserRecord {
                        id: row.get(0)?,
                        name: row.get(1)?,
                        created_at: row.get(2)?,
                    })
                },
            )
            .optional()?;
        Ok(user)
    }

    pub fn create_session(
        &self,
        session_id: &str,
        user_id: &str,
        source_ref: Option<&str>,
    ) -> Result<SessionRecord> {
        let started_at = now_ms()?;
        let conn = lock_unpoisoned(&self.conn);
        conn.execute(
            r#"
            INSERT INTO sessions(id, user_id, started_at, ended_at, source_ref)
            VALUES (?1, ?2, ?3, NULL, ?4)
            "#,
            params![session_id, user_id, started_at, source_ref],
        )?;
        Ok(SessionRecord {
            id: session_id.to_string(),
            user_id: user_id.to_string(),
            started_at,
            ended_at: None,
            source_ref: source_ref.map(str::to_string),
        })
    }

    pub fn get_session(&self, session_id: &str) -> Result<Option<SessionRecord>> {
        let conn = lock_unpoisoned(&self.conn);
        let session = conn
            .query_row(
                "SELECT id, user_id, started_at, ended_at, source_ref FROM sessions WHERE id = ?1",
                params![session_id],
                |row| {
                    Ok(SessionRecord {
                        id: row.get(0)?,
                        user_id: row.get(1)?,
                        started_at: row.get(2)?,
                        ended_at: row.get(3)?,
                        source_ref: row.get(4)?,
                    })
                },
            )
            .optional()?;
        Ok(session)
    }

    pub fn add_throw(
        &self,
        user_id: &str,
        session_id: &str,
        x_norm: f64,
        y_norm: f64,
        confidence: f64,
    ) -> Result<ThrowRecord> {
        let ts = now_ms()?;
        let conn = lock_unpoisoned(&self.conn);
        conn.execute(
            r#"
            INSERT INTO throws(user_id, session_id, ts, x_norm, y_norm, confidence)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            "#,
            params![user_id, session_id, ts, x_norm, y_norm, confidence],
        )?;
        Ok(ThrowRecord {
            id: conn.last_insert_rowid(),
            user_id: user_id.to_string(),
            session_id: session_id.to_string(),
            ts,
            x_norm,
            y_norm,
            confidence,
        })
    }

    /// All throws of a user, oldest first.
    pub fn list_throws_for_user(&self, user_id: &str) -> Result<Vec<ThrowRecord>> {
        let conn = lock_unpoisoned(&self.conn);
        let mut stmt = conn.prepare(
            r#"
            SELECT id, user_id, session_id, ts, x_norm, y_norm, confidence
            FROM throws WHERE user_id = ?1 ORDER BY id ASC
            "#,
        )?;
        let mut rows = stmt.query(params![user_id])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            out.push(ThrowRecord {
                id: row.get(0)?,
                user_id: row.get(1)?,
                session_id: row.get(2)?,
                ts: row.get(3)?,
                x_norm: row.get(4)?,
                y_norm: row.get(5)?,
                confidence: row.get(6)?,
            });
        }
        Ok(out)
    }

    /// Delete every throw of a user. Returns the number of rows removed.
    pub fn clear_throws_for_user(&self, user_id: &str) -> Result<usize> {
        let conn = lock_unpoisoned(&self.conn);
        let removed = conn.execute("DELETE FROM throws WHERE user_id = ?1", params![user_id])?;
        Ok(removed)
    }
}

impl HitSink for SqliteThrowStore {
    fn append_hit(&self, user_id: &str, session_id: &str, hit: &HitPoint) -> Result<()> {
        self.add_throw(user_id, session_id, hit.x_norm, hit.y_norm, hit.confidence)?;
        Ok(())
    }
}

fn ensure_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        PRAGMA journal_mode=WAL;

        CREATE TABLE IF NOT EXISTS users (
          id TEXT PRIMARY KEY,
          name TEXT NOT NULL,
          created_at INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS sessions (
          id TEXT PRIMARY KEY,
          user_id TEXT NOT NULL REFERENCES users(id),
          started_at INTEGER NOT NULL,
          ended_at INTEGER,
          source_ref TEXT
        );

        CREATE TABLE IF NOT EXISTS throws (
          id INTEGER PRIMARY KEY AUTOINCREMENT,
          user_id TEXT NOT NULL REFERENCES users(id),
          session_id TEXT NOT NULL REFERENCES sessions(id),
          ts INTEGER NOT NULL,
          x_norm REAL NOT NULL,
          y_norm REAL NOT NULL,
          confidence REAL NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_throws_user ON throws(user_id);
        CREATE INDEX IF NOT EXISTS idx_throws_session ON throws(session_id);
        "#,
    )?;
    Ok(())
}

/// One hit as recorded by `InMemoryHitSink`.
#[derive(Clone, Debug, PartialEq)]
pub struct RecordedHit {
    pub user_id: String,
    pub session_id: String,
    pub hit: HitPoint,
}

/// Process-local sink that keeps every hit in memory.
#[derive(Debug, Default)]
pub struct InMemoryHitSink {
    hits: Mutex<Vec<RecordedHit>>,
    fail: Mutex<bool>,
}

impl InMemoryHitSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn hits(&self) -> Vec<RecordedHit> {
        lock_unpoisoned(&self.hits).clone()
    }

    /// Make subsequent appends fail.
    pub fn set_fail(&self, fail: bool) {
        *lock_unpoisoned(&self.fail) = fail;
    }
}

impl HitSink for InMemoryHitSink {
    fn append_hit(&self, user_id: &str, session_id: &str, hit: &HitPoint) -> Result<()> {
        if *lock_unpoisoned(&self.fail) {
            return Err(anyhow!("hit sink unavailable"));
        }
        lock_unpoisoned(&self.hits).push(RecordedHit {
            user_id: user_id.to_string(),
            session_id: session_id.to_string(),
            hit: *hit,
        });
        Ok(())
    }
}
