//! SQLite connection management.
//!
//! Every project store and the settings store are opened through
//! [`connect`]. Connections run in WAL mode so the indexing writer and the
//! read-serving MCP path can interleave, with a bounded busy timeout so lock
//! contention surfaces as an ordinary error instead of an abort. Foreign keys
//! are enforced on every connection; cascading deletes depend on it.

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use std::path::Path;
use std::time::Duration;

use crate::error::Result;

/// Open (creating if missing) the database at `db_path`.
pub async fn connect(db_path: &Path, busy_timeout: Duration) -> Result<SqlitePool> {
    // Ensure parent directory exists
    if let Some(parent) = db_path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }

    let options = SqliteConnectOptions::new()
        .filename(db_path)
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .busy_timeout(busy_timeout)
        .foreign_keys(true);

    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect_with(options)
        .await?;

    Ok(pool)
}
