//! Durable, restart-surviving storage for admin token records.
//!
//! Backed by a single SQLite file via `rusqlite`. All operations are durable
//! before returning: writes run inside a transaction with
//! `PRAGMA synchronous = FULL`.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{Connection, OptionalExtension, params};

use crate::error::{Error, Result};

const SCHEMA_VERSION: i64 = 1;

/// A revocable bearer credential record. Plaintext is never persisted.
#[derive(Debug, Clone)]
pub struct AdminToken {
    /// Monotonically assigned id, stable across restarts.
    pub id: i64,
    /// Hash scheme tag: `"bcrypt"` or `"sha256"`.
    pub scheme: String,
    /// The stored hash (bcrypt's self-describing hash string, or a sha256 hex digest).
    pub hash: String,
    /// Per-record salt, hex-encoded; only present for the `sha256` fallback scheme.
    pub salt: Option<String>,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
    /// Revocation timestamp, if revoked. Once set, permanently invalid.
    pub revoked_at: Option<DateTime<Utc>>,
}

impl AdminToken {
    /// Whether this record has been revoked.
    #[must_use]
    pub fn is_revoked(&self) -> bool {
        self.revoked_at.is_some()
    }
}

/// Durable token store interface: `append_token` / `revoke_by_id` / `list` / `count_active`.
#[async_trait]
pub trait TokenStore: Send + Sync + 'static {
    /// Durably persist a newly-minted token record and return it with its assigned id.
    async fn append_token(&self, scheme: &str, hash: &str, salt: Option<&str>) -> Result<AdminToken>;

    /// Mark a token permanently revoked. Idempotent: revoking an already-revoked
    /// token returns the existing record unchanged.
    async fn revoke_by_id(&self, id: i64) -> Result<AdminToken>;

    /// List every token record (active and revoked), oldest first.
    async fn list(&self) -> Result<Vec<AdminToken>>;

    /// Count tokens that have not been revoked.
    async fn count_active(&self) -> Result<usize>;
}

/// `rusqlite`-backed implementation of [`TokenStore`].
pub struct SqliteTokenStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteTokenStore {
    /// Open (creating if necessary) the token store at `path`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Persistence`] if the file cannot be opened, the schema
    /// cannot be created, or the on-disk schema is newer than this build
    /// understands.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path).map_err(|e| Error::Persistence(e.to_string()))?;
        conn.pragma_update(None, "synchronous", "FULL")
            .map_err(|e| Error::Persistence(e.to_string()))?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS schema_meta (schema_version INTEGER NOT NULL);
             CREATE TABLE IF NOT EXISTS admin_tokens (
                 id          INTEGER PRIMARY KEY,
                 scheme      TEXT NOT NULL,
                 hash        TEXT NOT NULL,
                 salt        TEXT,
                 created_at  TEXT NOT NULL,
                 revoked_at  TEXT
             );",
        )
        .map_err(|e| Error::Persistence(e.to_string()))?;

        let existing_version: Option<i64> = conn
            .query_row("SELECT schema_version FROM schema_meta LIMIT 1", [], |r| r.get(0))
            .optional()
            .map_err(|e| Error::Persistence(e.to_string()))?;

        match existing_version {
            None => {
                conn.execute(
                    "INSERT INTO schema_meta (schema_version) VALUES (?1)",
                    params![SCHEMA_VERSION],
                )
                .map_err(|e| Error::Persistence(e.to_string()))?;
            }
            Some(v) if v > SCHEMA_VERSION => {
                return Err(Error::Persistence(format!(
                    "token store schema_version {v} is newer than this build supports ({SCHEMA_VERSION})"
                )));
            }
            Some(_) => {}
        }

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }
}

#[async_trait]
impl TokenStore for SqliteTokenStore {
    async fn append_token(&self, scheme: &str, hash: &str, salt: Option<&str>) -> Result<AdminToken> {
        let conn = self.conn.clone();
        let scheme = scheme.to_string();
        let hash = hash.to_string();
        let salt = salt.map(str::to_string);

        tokio::task::spawn_blocking(move || {
            let conn = conn.lock();
            let created_at = Utc::now();
            conn.execute(
                "INSERT INTO admin_tokens (scheme, hash, salt, created_at, revoked_at)
                 VALUES (?1, ?2, ?3, ?4, NULL)",
                params![scheme, hash, salt, created_at.to_rfc3339()],
            )
            .map_err(|e| Error::Persistence(e.to_string()))?;
            let id = conn.last_insert_rowid();
            Ok(AdminToken {
                id,
                scheme,
                hash,
                salt,
                created_at,
                revoked_at: None,
            })
        })
        .await
        .map_err(|e| Error::Internal(e.to_string()))?
    }

    async fn revoke_by_id(&self, id: i64) -> Result<AdminToken> {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let conn = conn.lock();
            let existing = row_by_id(&conn, id)?.ok_or(Error::TokenNotFound(id))?;
            if existing.is_revoked() {
                return Ok(existing);
            }
            let revoked_at = Utc::now();
            conn.execute(
                "UPDATE admin_tokens SET revoked_at = ?1 WHERE id = ?2",
                params![revoked_at.to_rfc3339(), id],
            )
            .map_err(|e| Error::Persistence(e.to_string()))?;
            Ok(AdminToken {
                revoked_at: Some(revoked_at),
                ..existing
            })
        })
        .await
        .map_err(|e| Error::Internal(e.to_string()))?
    }

    async fn list(&self) -> Result<Vec<AdminToken>> {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let conn = conn.lock();
            let mut stmt = conn
                .prepare("SELECT id, scheme, hash, salt, created_at, revoked_at FROM admin_tokens ORDER BY id ASC")
                .map_err(|e| Error::Persistence(e.to_string()))?;
            let rows = stmt
                .query_map([], row_to_token)
                .map_err(|e| Error::Persistence(e.to_string()))?;
            rows.collect::<rusqlite::Result<Vec<_>>>()
                .map_err(|e| Error::Persistence(e.to_string()))
        })
        .await
        .map_err(|e| Error::Internal(e.to_string()))?
    }

    async fn count_active(&self) -> Result<usize> {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let conn = conn.lock();
            let count: i64 = conn
                .query_row(
                    "SELECT COUNT(*) FROM admin_tokens WHERE revoked_at IS NULL",
                    [],
                    |r| r.get(0),
                )
                .map_err(|e| Error::Persistence(e.to_string()))?;
            Ok(count as usize)
        })
        .await
        .map_err(|e| Error::Internal(e.to_string()))?
    }
}

fn row_by_id(conn: &Connection, id: i64) -> Result<Option<AdminToken>> {
    conn.query_row(
        "SELECT id, scheme, hash, salt, created_at, revoked_at FROM admin_tokens WHERE id = ?1",
        params![id],
        row_to_token,
    )
    .optional()
    .map_err(|e| Error::Persistence(e.to_string()))
}

fn row_to_token(row: &rusqlite::Row<'_>) -> rusqlite::Result<AdminToken> {
    let created_at: String = row.get(4)?;
    let revoked_at: Option<String> = row.get(5)?;
    Ok(AdminToken {
        id: row.get(0)?,
        scheme: row.get(1)?,
        hash: row.get(2)?,
        salt: row.get(3)?,
        created_at: DateTime::parse_from_rfc3339(&created_at)
            .map(|dt| dt.with_timezone(&Utc))
            .unwrap_or_else(|_| Utc::now()),
        revoked_at: revoked_at.and_then(|s| {
            DateTime::parse_from_rfc3339(&s)
                .ok()
                .map(|dt| dt.with_timezone(&Utc))
        }),
    })
}
