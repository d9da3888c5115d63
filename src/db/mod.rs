//! Embedded relational store for users, auth sessions, novels, and jobs.
//!
//! Connections are short-lived: each operation opens, runs, and closes.
//! WAL mode keeps concurrent readers cheap.

use chrono::Utc;
use rusqlite::Connection;
use std::path::{Path, PathBuf};

use crate::types::Result;

/// RFC 3339 UTC timestamp used for every persisted time column.
pub fn utc_now() -> String {
    Utc::now().to_rfc3339()
}

/// Handle to the embedded database file.
#[derive(Debug, Clone)]
pub struct Database {
    path: PathBuf,
}

impl Database {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    /// Open a fresh connection for one operation.
    pub fn connect(&self) -> Result<Connection> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(&self.path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        conn.busy_timeout(std::time::Duration::from_secs(30))?;
        Ok(conn)
    }

    /// Create all tables; idempotent.
    pub fn init_schema(&self) -> Result<()> {
        let conn = self.connect()?;
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS users (
              id TEXT PRIMARY KEY,
              username TEXT NOT NULL UNIQUE,
              password_hash TEXT NOT NULL,
              created_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS auth_sessions (
              id TEXT PRIMARY KEY,
              token_hash TEXT NOT NULL UNIQUE,
              user_id TEXT,
              guest_id TEXT,
              created_at TEXT NOT NULL,
              expires_at TEXT NOT NULL,
              revoked_at TEXT,
              last_seen_at TEXT,
              FOREIGN KEY(user_id) REFERENCES users(id)
            );
            CREATE INDEX IF NOT EXISTS idx_auth_sessions_user_id ON auth_sessions(user_id);
            CREATE INDEX IF NOT EXISTS idx_auth_sessions_guest_id ON auth_sessions(guest_id);

            CREATE TABLE IF NOT EXISTS novels (
              id TEXT PRIMARY KEY,
              owner_user_id TEXT NOT NULL,
              title TEXT NOT NULL DEFAULT '',
              visibility TEXT NOT NULL DEFAULT 'private',
              status TEXT NOT NULL DEFAULT 'created',
              created_at TEXT NOT NULL,
              updated_at TEXT NOT NULL,
              source_meta TEXT NOT NULL DEFAULT '{}',
              stats TEXT NOT NULL DEFAULT '{}',
              last_job_id TEXT NOT NULL DEFAULT '',
              last_error TEXT NOT NULL DEFAULT '',
              FOREIGN KEY(owner_user_id) REFERENCES users(id)
            );
            CREATE INDEX IF NOT EXISTS idx_novels_owner_user_id ON novels(owner_user_id);
            CREATE INDEX IF NOT EXISTS idx_novels_visibility ON novels(visibility);

            CREATE TABLE IF NOT EXISTS pipeline_jobs (
              id TEXT PRIMARY KEY,
              novel_id TEXT NOT NULL,
              owner_user_id TEXT NOT NULL,
              spec TEXT NOT NULL DEFAULT '{}',
              status TEXT NOT NULL DEFAULT 'queued',
              current_step INTEGER,
              progress REAL NOT NULL DEFAULT 0.0,
              started_at TEXT NOT NULL DEFAULT '',
              finished_at TEXT NOT NULL DEFAULT '',
              created_at TEXT NOT NULL,
              log_path TEXT NOT NULL DEFAULT '',
              error TEXT NOT NULL DEFAULT '',
              result TEXT NOT NULL DEFAULT '{}',
              FOREIGN KEY(novel_id) REFERENCES novels(id),
              FOREIGN KEY(owner_user_id) REFERENCES users(id)
            );
            CREATE INDEX IF NOT EXISTS idx_pipeline_jobs_owner_user_id ON pipeline_jobs(owner_user_id);
            CREATE INDEX IF NOT EXISTS idx_pipeline_jobs_novel_id ON pipeline_jobs(novel_id);
            "#,
        )?;
        Ok(())
    }
}
