//! Shared database plumbing: open, schema versioning, LRU eviction.

use crate::error::StateError;
use rusqlite::Connection;
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

/// Version stamped into every state file. Bump on incompatible layout
/// changes; the daemon refuses to start on mismatch.
pub const SCHEMA_VERSION: i64 = 1;

/// Open (or create) a state database file and verify its schema version.
///
/// # Errors
///
/// Returns [`StateError::SchemaMismatch`] when the file was written by an
/// incompatible version, or a database error on I/O failure.
pub fn open_database(path: &Path) -> Result<Connection, StateError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| {
            StateError::CreateDir(parent.display().to_string(), e.to_string())
        })?;
    }
    let conn = Connection::open(path)?;
    init_meta(&conn)?;
    Ok(conn)
}

/// Open an in-memory database (tests).
///
/// # Errors
///
/// Returns error if the database cannot be created.
pub fn open_in_memory() -> Result<Connection, StateError> {
    let conn = Connection::open_in_memory()?;
    init_meta(&conn)?;
    Ok(conn)
}

fn init_meta(conn: &Connection) -> Result<(), StateError> {
    conn.execute_batch(
        r"
        CREATE TABLE IF NOT EXISTS meta (
            key TEXT PRIMARY KEY,
            value INTEGER NOT NULL
        );
        ",
    )?;

    let stored: Option<i64> = conn
        .query_row(
            "SELECT value FROM meta WHERE key = 'schema_version'",
            [],
            |row| row.get(0),
        )
        .map(Some)
        .or_else(|e| match e {
            rusqlite::Error::QueryReturnedNoRows => Ok(None),
            other => Err(other),
        })?;

    match stored {
        None => {
            conn.execute(
                "INSERT INTO meta (key, value) VALUES ('schema_version', ?1)",
                [SCHEMA_VERSION],
            )?;
            Ok(())
        }
        Some(found) if found == SCHEMA_VERSION => Ok(()),
        Some(found) => Err(StateError::SchemaMismatch {
            found,
            expected: SCHEMA_VERSION,
        }),
    }
}

/// Seconds since epoch, used for `last_touched` columns.
#[must_use]
pub(crate) fn now_secs() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

/// Milliseconds since epoch.
#[must_use]
pub(crate) fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// Evict the single least-recently-touched row when `table` holds
/// `max_entries` or more rows.
///
/// Returns `true` when a row was evicted. The table must carry a
/// `last_touched` column and `key_sql` must name its primary key column(s)
/// for the delete.
pub(crate) fn evict_one_lru(
    conn: &Connection,
    table: &str,
    key_sql: &str,
    max_entries: usize,
) -> Result<bool, StateError> {
    let count: i64 =
        conn.query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |row| row.get(0))?;
    if (count as usize) < max_entries {
        return Ok(false);
    }

    let deleted = conn.execute(
        &format!(
            "DELETE FROM {table} WHERE rowid IN \
             (SELECT rowid FROM {table} ORDER BY last_touched ASC, rowid ASC LIMIT 1)"
        ),
        [],
    )?;
    if deleted > 0 {
        tracing::debug!(table, key = key_sql, "Evicted least-recently-touched row");
    }
    Ok(deleted > 0)
}
