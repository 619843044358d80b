//! Database repository layer
//!
//! Row-level reads and writes for sessions, indexing status, ingest claims,
//! and singleton state values. Every helper takes a plain `&Connection` so it
//! can run either directly or inside the transaction opened by
//! [`Database::write`].

use crate::error::{Error, Result};
use crate::types::*;
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row, Transaction, TransactionBehavior};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::path::PathBuf;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

/// Keys of the `app_state` table
pub mod keys {
    pub const URL: &str = "url";
    pub const TITLE: &str = "title";
    pub const ACTIVE_SESSION: &str = "active_session_id";
    pub const LAST_ERROR: &str = "last_error";
    /// Pre-multi-session single conversation
    pub const LEGACY_CONVERSATION: &str = "conversation";
}

/// Database handle (single connection guarded by a mutex)
pub struct Database {
    conn: Mutex<Connection>,
}

impl Database {
    /// Open or create a database at the given path
    pub fn open(path: &PathBuf) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(path)?;

        // WAL lets the presentation and background processes read while one writes
        conn.execute_batch(
            "
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            ",
        )?;
        conn.busy_timeout(Duration::from_secs(5))?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Open an in-memory database (for testing)
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Run migrations on this database
    pub fn migrate(&self) -> Result<()> {
        let conn = self.lock()?;
        super::schema::run_migrations(&conn)
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| Error::StoreUnavailable("connection lock poisoned".to_string()))
    }

    /// Run a read-only query against the current state.
    pub fn read<T>(&self, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        let conn = self.lock()?;
        f(&conn)
    }

    /// Run a read-modify-write unit atomically.
    ///
    /// The closure sees the rows as they are at apply time; the write lock is
    /// taken up front (`BEGIN IMMEDIATE`) so no other writer, in this process
    /// or another one sharing the file, can interleave. Nothing is committed if
    /// the closure fails.
    pub fn write<T>(&self, f: impl FnOnce(&Transaction<'_>) -> Result<T>) -> Result<T> {
        let mut conn = self.lock()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let value = f(&tx)?;
        tx.commit()?;
        Ok(value)
    }
}

// ============================================
// Timestamp helpers
// ============================================

/// Fixed-width RFC 3339 so stored timestamps sort lexicographically
fn fmt_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

fn parse_ts(raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| Error::StoreUnavailable(format!("corrupt timestamp {:?}: {}", raw, e)))
}

// ============================================
// Session operations
// ============================================

/// Raw session columns before JSON/timestamp decoding
struct SessionRow {
    content_id: String,
    title: String,
    url: String,
    conversation: String,
    created_at: String,
    updated_at: String,
}

impl SessionRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            content_id: row.get(0)?,
            title: row.get(1)?,
            url: row.get(2)?,
            conversation: row.get(3)?,
            created_at: row.get(4)?,
            updated_at: row.get(5)?,
        })
    }

    fn decode(self) -> Result<SessionRecord> {
        Ok(SessionRecord {
            content_id: ContentId::new(self.content_id),
            title: self.title,
            url: self.url,
            conversation: serde_json::from_str(&self.conversation)?,
            created_at: parse_ts(&self.created_at)?,
            updated_at: parse_ts(&self.updated_at)?,
        })
    }
}

const SESSION_COLUMNS: &str = "content_id, title, url, conversation, created_at, updated_at";

/// Load one session
pub fn get_session(conn: &Connection, content_id: &ContentId) -> Result<Option<SessionRecord>> {
    let row = conn
        .query_row(
            &format!("SELECT {} FROM sessions WHERE content_id = ?1", SESSION_COLUMNS),
            [content_id.as_str()],
            SessionRow::from_row,
        )
        .optional()?;
    row.map(SessionRow::decode).transpose()
}

/// Insert or replace a session
pub fn put_session(conn: &Connection, record: &SessionRecord) -> Result<()> {
    conn.execute(
        r#"
        INSERT INTO sessions (content_id, title, url, conversation, created_at, updated_at)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6)
        ON CONFLICT(content_id) DO UPDATE SET
            title = excluded.title,
            url = excluded.url,
            conversation = excluded.conversation,
            updated_at = excluded.updated_at
        "#,
        params![
            record.content_id.as_str(),
            record.title,
            record.url,
            serde_json::to_string(&record.conversation)?,
            fmt_ts(record.created_at),
            fmt_ts(record.updated_at),
        ],
    )?;
    Ok(())
}

/// Delete a session. Returns true if a row was removed.
pub fn delete_session(conn: &Connection, content_id: &ContentId) -> Result<bool> {
    let removed = conn.execute(
        "DELETE FROM sessions WHERE content_id = ?1",
        [content_id.as_str()],
    )?;
    Ok(removed > 0)
}

/// All sessions, most recently active first
pub fn list_sessions(conn: &Connection) -> Result<Vec<SessionRecord>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM sessions ORDER BY updated_at DESC, content_id",
        SESSION_COLUMNS
    ))?;
    let rows = stmt
        .query_map([], SessionRow::from_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    rows.into_iter().map(SessionRow::decode).collect()
}

/// Number of stored sessions
pub fn count_sessions(conn: &Connection) -> Result<i64> {
    let count = conn.query_row("SELECT COUNT(*) FROM sessions", [], |r| r.get(0))?;
    Ok(count)
}

// ============================================
// Singleton state values
// ============================================

/// Read a JSON value from `app_state`
pub fn get_value<T: DeserializeOwned>(conn: &Connection, key: &str) -> Result<Option<T>> {
    let raw: Option<String> = conn
        .query_row("SELECT value FROM app_state WHERE key = ?1", [key], |r| {
            r.get(0)
        })
        .optional()?;
    raw.map(|s| serde_json::from_str(&s).map_err(Error::from))
        .transpose()
}

/// Write a JSON value to `app_state`
pub fn set_value<T: Serialize + ?Sized>(conn: &Connection, key: &str, value: &T) -> Result<()> {
    conn.execute(
        "INSERT INTO app_state (key, value) VALUES (?1, ?2)
         ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        params![key, serde_json::to_string(value)?],
    )?;
    Ok(())
}

/// Remove a value from `app_state`. Returns true if it existed.
pub fn remove_value(conn: &Connection, key: &str) -> Result<bool> {
    let removed = conn.execute("DELETE FROM app_state WHERE key = ?1", [key])?;
    Ok(removed > 0)
}

// ============================================
// Indexing status
// ============================================

/// Persisted status for a content id (`NotStarted` when never recorded)
pub fn get_status(conn: &Connection, content_id: &ContentId) -> Result<IndexingStatus> {
    let raw: Option<String> = conn
        .query_row(
            "SELECT status FROM indexing WHERE content_id = ?1",
            [content_id.as_str()],
            |r| r.get(0),
        )
        .optional()?;
    match raw {
        Some(s) => Ok(serde_json::from_str(&s)?),
        None => Ok(IndexingStatus::NotStarted),
    }
}

/// Store the status for a content id
pub fn put_status(conn: &Connection, content_id: &ContentId, status: IndexingStatus) -> Result<()> {
    conn.execute(
        "INSERT INTO indexing (content_id, status, updated_at) VALUES (?1, ?2, ?3)
         ON CONFLICT(content_id) DO UPDATE SET
            status = excluded.status,
            updated_at = excluded.updated_at",
        params![
            content_id.as_str(),
            serde_json::to_string(&status)?,
            fmt_ts(Utc::now()),
        ],
    )?;
    Ok(())
}

// ============================================
// Ingest claims
// ============================================

/// Claim `url` for an ingest request.
///
/// Returns false when an unexpired claim already exists. Must run inside a
/// write transaction for the check and the insert to be atomic.
pub fn claim_url(conn: &Connection, url: &str, now: DateTime<Utc>, ttl: Duration) -> Result<bool> {
    let existing: Option<String> = conn
        .query_row(
            "SELECT claimed_at FROM ingest_claims WHERE url = ?1",
            [url],
            |r| r.get(0),
        )
        .optional()?;

    if let Some(claimed_at) = existing {
        let age = now.signed_duration_since(parse_ts(&claimed_at)?);
        let ttl = chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::days(36500));
        if age < ttl {
            return Ok(false);
        }
    }

    conn.execute(
        "INSERT INTO ingest_claims (url, claimed_at) VALUES (?1, ?2)
         ON CONFLICT(url) DO UPDATE SET claimed_at = excluded.claimed_at",
        params![url, fmt_ts(now)],
    )?;
    Ok(true)
}

/// Drop the claim on `url`. Returns true if one existed.
pub fn release_url(conn: &Connection, url: &str) -> Result<bool> {
    let removed = conn.execute("DELETE FROM ingest_claims WHERE url = ?1", [url])?;
    Ok(removed > 0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_db() -> Database {
        let db = Database::open_in_memory().unwrap();
        db.migrate().unwrap();
        db
    }

    fn record(id: &str) -> SessionRecord {
        let now = Utc::now();
        SessionRecord {
            content_id: ContentId::from(id),
            title: format!("Video {}", id),
            url: ContentId::from(id).canonical_url(),
            conversation: Conversation::from(vec![Message::user("hello")]),
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn test_session_roundtrip() {
        let db = test_db();
        let session = record("abc");

        db.write(|tx| put_session(tx, &session)).unwrap();
        let loaded = db
            .read(|conn| get_session(conn, &session.content_id))
            .unwrap()
            .unwrap();

        assert_eq!(loaded, session);
        assert_eq!(db.read(count_sessions).unwrap(), 1);
    }

    #[test]
    fn test_failed_write_rolls_back() {
        let db = test_db();
        let session = record("abc");

        let result: Result<()> = db.write(|tx| {
            put_session(tx, &session)?;
            Err(Error::StoreUnavailable("boom".to_string()))
        });
        assert!(result.is_err());
        assert_eq!(db.read(count_sessions).unwrap(), 0);
    }

    #[test]
    fn test_app_state_values() {
        let db = test_db();

        db.write(|tx| set_value(tx, keys::URL, "https://x/watch?v=1"))
            .unwrap();
        let url: Option<String> = db.read(|conn| get_value(conn, keys::URL)).unwrap();
        assert_eq!(url.as_deref(), Some("https://x/watch?v=1"));

        assert!(db.write(|tx| remove_value(tx, keys::URL)).unwrap());
        let url: Option<String> = db.read(|conn| get_value(conn, keys::URL)).unwrap();
        assert!(url.is_none());
    }

    #[test]
    fn test_status_defaults_to_not_started() {
        let db = test_db();
        let id = ContentId::from("abc");

        assert_eq!(
            db.read(|conn| get_status(conn, &id)).unwrap(),
            IndexingStatus::NotStarted
        );

        db.write(|tx| put_status(tx, &id, IndexingStatus::Indexing { chunk_count: 4 }))
            .unwrap();
        assert_eq!(
            db.read(|conn| get_status(conn, &id)).unwrap(),
            IndexingStatus::Indexing { chunk_count: 4 }
        );
    }

    #[test]
    fn test_claims_expire_after_ttl() {
        let db = test_db();
        let url = "https://x/watch?v=1";
        let ttl = Duration::from_secs(60);
        let now = Utc::now();

        assert!(db.write(|tx| claim_url(tx, url, now, ttl)).unwrap());
        assert!(!db.write(|tx| claim_url(tx, url, now, ttl)).unwrap());

        let later = now + chrono::Duration::seconds(61);
        assert!(db.write(|tx| claim_url(tx, url, later, ttl)).unwrap());

        assert!(db.write(|tx| release_url(tx, url)).unwrap());
        assert!(db.write(|tx| claim_url(tx, url, later, ttl)).unwrap());
    }
}
