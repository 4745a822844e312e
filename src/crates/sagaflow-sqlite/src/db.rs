//! Database handle and schema bootstrap

use std::path::Path;
use std::str::FromStr;

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use tracing::debug;

use sagaflow_journal::{JournalError, Result};

/// Tables realizing the persisted layout: the per-instance event stream,
/// instance documents, periodic snapshots, the step cache, the outbox and
/// the agent-belief and pending-approval projections.
const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS workflow_events (
    workflow_id  TEXT    NOT NULL,
    version      INTEGER NOT NULL,
    type         TEXT    NOT NULL,
    payload      TEXT    NOT NULL,
    committed_at INTEGER NOT NULL,
    PRIMARY KEY (workflow_id, version)
);

CREATE TABLE IF NOT EXISTS workflow_instances (
    workflow_id TEXT PRIMARY KEY,
    phase       TEXT    NOT NULL,
    document    TEXT    NOT NULL,
    updated_at  INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS workflow_snapshots (
    workflow_id TEXT    NOT NULL,
    version     INTEGER NOT NULL,
    state       TEXT    NOT NULL,
    PRIMARY KEY (workflow_id, version)
);

CREATE TABLE IF NOT EXISTS step_cache (
    step_id     TEXT NOT NULL,
    fingerprint TEXT NOT NULL,
    result      TEXT NOT NULL,
    expires_at  INTEGER,
    PRIMARY KEY (step_id, fingerprint)
);

CREATE TABLE IF NOT EXISTS outbox (
    id           TEXT PRIMARY KEY,
    workflow_id  TEXT    NOT NULL,
    command      TEXT    NOT NULL,
    not_before   INTEGER NOT NULL,
    attempts     INTEGER NOT NULL DEFAULT 0,
    last_error   TEXT,
    leased_until INTEGER
);
CREATE INDEX IF NOT EXISTS idx_outbox_due ON outbox (not_before, leased_until);

CREATE TABLE IF NOT EXISTS agent_beliefs (
    agent_id      TEXT NOT NULL,
    task_category TEXT NOT NULL,
    alpha         REAL NOT NULL,
    beta          REAL NOT NULL,
    observations  INTEGER NOT NULL,
    updated_at    INTEGER NOT NULL,
    PRIMARY KEY (agent_id, task_category)
);

CREATE TABLE IF NOT EXISTS approvals_pending (
    workflow_id  TEXT PRIMARY KEY,
    approver_id  TEXT    NOT NULL,
    options      TEXT    NOT NULL,
    deadline     INTEGER,
    requested_at INTEGER NOT NULL
);
"#;

/// Pooled SQLite database with the journal schema applied
#[derive(Clone, Debug)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Open (creating if missing) a database file in WAL mode
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let options = SqliteConnectOptions::new()
            .filename(path.as_ref())
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .map_err(storage)?;
        let db = Self { pool };
        db.migrate().await?;
        debug!(path = %path.as_ref().display(), "sqlite journal opened");
        Ok(db)
    }

    /// Private in-memory database, used by tests
    ///
    /// In-memory SQLite is per-connection, so the pool is pinned to one
    /// connection.
    pub async fn open_in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:").map_err(storage)?;
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .map_err(storage)?;
        let db = Self { pool };
        db.migrate().await?;
        Ok(db)
    }

    async fn migrate(&self) -> Result<()> {
        for statement in SCHEMA.split(';') {
            let statement = statement.trim();
            if statement.is_empty() {
                continue;
            }
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .map_err(storage)?;
        }
        Ok(())
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

pub(crate) fn storage(err: sqlx::Error) -> JournalError {
    JournalError::Storage(err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_schema_bootstrap_is_idempotent() {
        let db = Database::open_in_memory().await.unwrap();
        db.migrate().await.unwrap();

        let tables: Vec<String> =
            sqlx::query_scalar("SELECT name FROM sqlite_master WHERE type = 'table' ORDER BY name")
                .fetch_all(db.pool())
                .await
                .unwrap();
        for expected in [
            "agent_beliefs",
            "approvals_pending",
            "outbox",
            "step_cache",
            "workflow_events",
            "workflow_instances",
            "workflow_snapshots",
        ] {
            assert!(tables.iter().any(|t| t == expected), "missing {expected}");
        }
    }

    #[tokio::test]
    async fn test_open_creates_file(){
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("journal.db");
        let _db = Database::open(&path).await.unwrap();
        assert!(path.exists());
    }
}
