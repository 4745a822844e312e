//! # sagaflow-sqlite - SQLite persistence for the sagaflow journal
//!
//! Production backend for the store traits in `sagaflow-journal`, realizing
//! the persisted layout as SQLite tables: `workflow_events` (the primary
//! stream), `workflow_instances`, `workflow_snapshots`, `step_cache`,
//! `outbox`, `agent_beliefs` and `approvals_pending`. A single
//! [`SqliteJournal`] implements every trait over one WAL-mode pool so one
//! engine tick commits in one SQL transaction.
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use sagaflow_sqlite::{Database, SqliteJournal};
//!
//! # async fn example() -> sagaflow_journal::Result<()> {
//! let db = Database::open(".sagaflow/journal.db").await?;
//! let journal = Arc::new(SqliteJournal::new(db));
//! // Hand the journal to the engine as its EventStore/OutboxStore/etc.
//! # Ok(())
//! # }
//! ```

pub mod db;
pub mod journal;

pub use db::Database;
pub use journal::SqliteJournal;
