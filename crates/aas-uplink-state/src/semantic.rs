//! Semantic subsystem state: drift fingerprints, lifecycle rows, the context
//! dictionary, fidelity history and streaming-drift model state.
//!
//! Owned by the semantic worker — the single writer for all five tables.

use crate::db::{evict_one_lru, now_millis, now_secs, open_database, open_in_memory};
use crate::error::StateError;
use rusqlite::{Connection, OptionalExtension};
use std::collections::HashMap;
use std::path::Path;

/// Default cap shared by the semantic tables.
pub const DEFAULT_MAX_ENTRIES: usize = 100_000;

/// Structural fingerprint of one metric (value excluded).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FingerprintRow {
    /// Metric path within the asset (dot form)
    pub path: String,
    /// XSD value type
    pub value_type: String,
    /// Unit of measurement, if any
    pub unit: Option<String>,
    /// Semantic identifier, if any
    pub semantic_id: Option<String>,
}

/// Persisted lifecycle row of one asset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LifecycleRow {
    /// The asset identifier
    pub asset_id: String,
    /// State name (`online` / `stale` / `offline`)
    pub state: String,
    /// Last observed publish (Unix ms)
    pub last_seen_ms: i64,
    /// Last state change (Unix ms)
    pub last_change_ms: i64,
    /// Retained topics known for the asset
    pub topics: Vec<String>,
}

/// SQLite-backed store for the semantic subsystem.
pub struct SemanticStore {
    conn: Connection,
    max_entries: usize,
    evictions: u64,
}

impl SemanticStore {
    /// Open or create the store at `path`.
    ///
    /// # Errors
    ///
    /// Returns error on I/O failure or schema version mismatch.
    pub fn open(path: &Path, max_entries: usize) -> Result<Self, StateError> {
        Self::from_conn(open_database(path)?, max_entries)
    }

    /// In-memory store for tests.
    ///
    /// # Errors
    ///
    /// Returns error if the database cannot be created.
    pub fn in_memory() -> Result<Self, StateError> {
        Self::from_conn(open_in_memory()?, DEFAULT_MAX_ENTRIES)
    }

    fn from_conn(conn: Connection, max_entries: usize) -> Result<Self, StateError> {
        conn.execute_batch(
            r"
            CREATE TABLE IF NOT EXISTS fingerprints (
                asset_id TEXT NOT NULL,
                path TEXT NOT NULL,
                value_type TEXT NOT NULL,
                unit TEXT,
                semantic_id TEXT,
                last_touched INTEGER NOT NULL,
                PRIMARY KEY (asset_id, path)
            );
            CREATE INDEX IF NOT EXISTS idx_fingerprints_asset ON fingerprints(asset_id);

            CREATE TABLE IF NOT EXISTS lifecycle (
                asset_id TEXT PRIMARY KEY,
                state TEXT NOT NULL,
                last_seen_ms INTEGER NOT NULL,
                last_change_ms INTEGER NOT NULL,
                topics TEXT NOT NULL,
                last_touched INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS contexts (
                hash TEXT PRIMARY KEY,
                bundle TEXT NOT NULL,
                last_touched INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS fidelity_history (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                asset_id TEXT NOT NULL,
                timestamp_ms INTEGER NOT NULL,
                overall REAL NOT NULL,
                structural REAL NOT NULL,
                semantic REAL NOT NULL,
                entropy REAL NOT NULL,
                metric_count INTEGER NOT NULL,
                last_touched INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_fidelity_asset
                ON fidelity_history(asset_id, timestamp_ms DESC);

            CREATE TABLE IF NOT EXISTS drift_state (
                asset_id TEXT PRIMARY KEY,
                model TEXT,
                observation_count INTEGER NOT NULL DEFAULT 0,
                last_touched INTEGER NOT NULL
            );
            ",
        )?;
        Ok(Self {
            conn,
            max_entries,
            evictions: 0,
        })
    }

    // ---- fingerprints ----

    /// Load the stored fingerprint set for an asset, keyed by path.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails.
    pub fn fingerprints(&self, asset_id: &str) -> Result<HashMap<String, FingerprintRow>, StateError> {
        let mut stmt = self.conn.prepare(
            "SELECT path, value_type, unit, semantic_id FROM fingerprints WHERE asset_id = ?1",
        )?;
        let rows = stmt.query_map([asset_id], |row| {
            Ok(FingerprintRow {
                path: row.get(0)?,
                value_type: row.get(1)?,
                unit: row.get(2)?,
                semantic_id: row.get(3)?,
            })
        })?;
        let mut out = HashMap::new();
        for row in rows {
            let row = row?;
            out.insert(row.path.clone(), row);
        }
        Ok(out)
    }

    /// Replace the fingerprint set for an asset with the current snapshot.
    ///
    /// # Errors
    ///
    /// Returns error if the commit fails.
    pub fn replace_fingerprints(
        &mut self,
        asset_id: &str,
        rows: &[FingerprintRow],
    ) -> Result<(), StateError> {
        let now = now_secs();
        let tx = self.conn.transaction()?;
        tx.execute("DELETE FROM fingerprints WHERE asset_id = ?1", [asset_id])?;
        for row in rows {
            if evict_one_lru(&tx, "fingerprints", "path", self.max_entries)? {
                self.evictions += 1;
            }
            tx.execute(
                "INSERT OR REPLACE INTO fingerprints \
                 (asset_id, path, value_type, unit, semantic_id, last_touched) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                (
                    asset_id,
                    &row.path,
                    &row.value_type,
                    &row.unit,
                    &row.semantic_id,
                    now,
                ),
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    // ---- lifecycle ----

    /// Load all persisted lifecycle rows.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails or a topics column is corrupt.
    pub fn lifecycle_rows(&self) -> Result<Vec<LifecycleRow>, StateError> {
        let mut stmt = self.conn.prepare(
            "SELECT asset_id, state, last_seen_ms, last_change_ms, topics FROM lifecycle",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, i64>(2)?,
                row.get::<_, i64>(3)?,
                row.get::<_, String>(4)?,
            ))
        })?;

        let mut out = Vec::new();
        for row in rows {
            let (asset_id, state, last_seen_ms, last_change_ms, topics_json) = row?;
            let topics: Vec<String> =
                serde_json::from_str(&topics_json).map_err(|e| StateError::Corrupt {
                    table: "lifecycle",
                    reason: e.to_string(),
                })?;
            out.push(LifecycleRow {
                asset_id,
                state,
                last_seen_ms,
                last_change_ms,
                topics,
            });
        }
        Ok(out)
    }

    /// Insert or update the lifecycle row for an asset.
    ///
    /// # Errors
    ///
    /// Returns error if the commit fails.
    pub fn upsert_lifecycle(&mut self, row: &LifecycleRow) -> Result<(), StateError> {
        let topics_json = serde_json::to_string(&row.topics).map_err(|e| StateError::Corrupt {
            table: "lifecycle",
            reason: e.to_string(),
        })?;
        let tx = self.conn.transaction()?;
        let exists: i64 = tx.query_row(
            "SELECT COUNT(*) FROM lifecycle WHERE asset_id = ?1",
            [row.asset_id.as_str()],
            |r| r.get(0),
        )?;
        if exists == 0 && evict_one_lru(&tx, "lifecycle", "asset_id", self.max_entries)? {
            self.evictions += 1;
        }
        tx.execute(
            "INSERT OR REPLACE INTO lifecycle \
             (asset_id, state, last_seen_ms, last_change_ms, topics, last_touched) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            (
                &row.asset_id,
                &row.state,
                row.last_seen_ms,
                row.last_change_ms,
                topics_json,
                now_secs(),
            ),
        )?;
        tx.commit()?;
        Ok(())
    }

    // ---- context dictionary ----

    /// Fetch a context bundle (JSON) by its hash.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails.
    pub fn context(&self, hash: &str) -> Result<Option<String>, StateError> {
        let bundle = self
            .conn
            .query_row(
                "SELECT bundle FROM contexts WHERE hash = ?1",
                [hash],
                |row| row.get(0),
            )
            .optional()?;
        Ok(bundle)
    }

    /// Store a context bundle keyed by its hash.
    ///
    /// # Errors
    ///
    /// Returns error if the commit fails.
    pub fn put_context(&mut self, hash: &str, bundle: &str) -> Result<(), StateError> {
        let tx = self.conn.transaction()?;
        let exists: i64 = tx.query_row(
            "SELECT COUNT(*) FROM contexts WHERE hash = ?1",
            [hash],
            |r| r.get(0),
        )?;
        if exists == 0 && evict_one_lru(&tx, "contexts", "hash", self.max_entries)? {
            self.evictions += 1;
        }
        tx.execute(
            "INSERT OR REPLACE INTO contexts (hash, bundle, last_touched) VALUES (?1, ?2, ?3)",
            (hash, bundle, now_secs()),
        )?;
        tx.commit()?;
        Ok(())
    }

    /// All context bundles, for republication after reconnect.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails.
    pub fn contexts(&self) -> Result<Vec<(String, String)>, StateError> {
        let mut stmt = self.conn.prepare("SELECT hash, bundle FROM contexts")?;
        let rows = stmt
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    // ---- fidelity history ----

    /// Append a fidelity report row for an asset.
    ///
    /// # Errors
    ///
    /// Returns error if the commit fails.
    #[allow(clippy::too_many_arguments)]
    pub fn append_fidelity(
        &mut self,
        asset_id: &str,
        overall: f64,
        structural: f64,
        semantic: f64,
        entropy: f64,
        metric_count: usize,
    ) -> Result<(), StateError> {
        let tx = self.conn.transaction()?;
        if evict_one_lru(&tx, "fidelity_history", "id", self.max_entries)? {
            self.evictions += 1;
        }
        tx.execute(
            "INSERT INTO fidelity_history \
             (asset_id, timestamp_ms, overall, structural, semantic, entropy, \
              metric_count, last_touched) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            (
                asset_id,
                now_millis(),
                overall,
                structural,
                semantic,
                entropy,
                metric_count as i64,
                now_secs(),
            ),
        )?;
        tx.commit()?;
        Ok(())
    }

    /// Most recent overall fidelity score for an asset, if any.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails.
    pub fn last_fidelity(&self, asset_id: &str) -> Result<Option<f64>, StateError> {
        let score = self
            .conn
            .query_row(
                "SELECT overall FROM fidelity_history WHERE asset_id = ?1 \
                 ORDER BY timestamp_ms DESC, id DESC LIMIT 1",
                [asset_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(score)
    }

    // ---- streaming drift model state ----

    /// Load the serialised streaming-drift model and observation count per
    /// asset, for restoring the detector after a restart.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails.
    pub fn drift_state(&self) -> Result<HashMap<String, (Option<String>, u64)>, StateError> {
        let mut stmt = self
            .conn
            .prepare("SELECT asset_id, model, observation_count FROM drift_state")?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, Option<String>>(1)?,
                row.get::<_, i64>(2)?,
            ))
        })?;
        let mut out = HashMap::new();
        for row in rows {
            let (asset, model, count) = row?;
            out.insert(asset, (model, count.max(0) as u64));
        }
        Ok(out)
    }

    /// Persist an asset's serialised streaming-drift model and observation
    /// count. Last-writer-wins per asset.
    ///
    /// # Errors
    ///
    /// Returns error if the commit fails.
    pub fn upsert_drift_state(
        &mut self,
        asset_id: &str,
        model: Option<&str>,
        observation_count: u64,
    ) -> Result<(), StateError> {
        let tx = self.conn.transaction()?;
        let exists: i64 = tx.query_row(
            "SELECT COUNT(*) FROM drift_state WHERE asset_id = ?1",
            [asset_id],
            |row| row.get(0),
        )?;
        if exists == 0 && evict_one_lru(&tx, "drift_state", "asset_id", self.max_entries)? {
            self.evictions += 1;
        }
        tx.execute(
            "INSERT OR REPLACE INTO drift_state \
             (asset_id, model, observation_count, last_touched) \
             VALUES (?1, ?2, ?3, ?4)",
            (asset_id, model, observation_count as i64, now_secs()),
        )?;
        tx.commit()?;
        Ok(())
    }

    /// Rows evicted since open, across all capped tables.
    #[must_use]
    pub fn evictions(&self) -> u64 {
        self.evictions
    }
}
