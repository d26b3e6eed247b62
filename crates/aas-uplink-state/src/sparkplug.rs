//! Sparkplug session state: metric aliases, birth cache, `bdSeq` counter.
//!
//! Owned by the broker I/O worker — the single writer. Alias allocation is
//! dense and monotone per `(edge_node, device)` starting at 0; once
//! allocated, a metric name keeps its alias for the life of the file.

use crate::db::{evict_one_lru, now_secs, open_database, open_in_memory};
use crate::error::StateError;
use rusqlite::{Connection, OptionalExtension};
use std::collections::HashMap;
use std::path::Path;

/// Default cap for the alias table.
pub const DEFAULT_MAX_ALIASES: usize = 100_000;

/// A cached device birth: topic plus serialised payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BirthRow {
    /// Device the birth belongs to
    pub device_id: String,
    /// Topic the birth was published on
    pub topic: String,
    /// Serialised birth payload
    pub payload: Vec<u8>,
}

/// Persistent Sparkplug state: aliases, birth cache, session counter.
pub struct SparkplugStore {
    conn: Connection,
    /// (edge_node, device) -> metric name -> alias
    aliases: HashMap<(String, String), HashMap<String, u64>>,
    max_aliases: usize,
    evictions: u64,
}

impl SparkplugStore {
    /// Open or create the store at `path`.
    ///
    /// # Errors
    ///
    /// Returns error on I/O failure or schema version mismatch.
    pub fn open(path: &Path, max_aliases: usize) -> Result<Self, StateError> {
        Self::from_conn(open_database(path)?, max_aliases)
    }

    /// In-memory store for tests.
    ///
    /// # Errors
    ///
    /// Returns error if the database cannot be created.
    pub fn in_memory() -> Result<Self, StateError> {
        Self::from_conn(open_in_memory()?, DEFAULT_MAX_ALIASES)
    }

    fn from_conn(conn: Connection, max_aliases: usize) -> Result<Self, StateError> {
        conn.execute_batch(
            r"
            CREATE TABLE IF NOT EXISTS aliases (
                edge_node TEXT NOT NULL,
                device_id TEXT NOT NULL,
                metric_name TEXT NOT NULL,
                alias INTEGER NOT NULL,
                last_touched INTEGER NOT NULL,
                PRIMARY KEY (edge_node, device_id, metric_name)
            );
            CREATE INDEX IF NOT EXISTS idx_aliases_device
                ON aliases(edge_node, device_id);

            CREATE TABLE IF NOT EXISTS births (
                edge_node TEXT NOT NULL,
                device_id TEXT NOT NULL,
                topic TEXT NOT NULL,
                payload BLOB NOT NULL,
                last_touched INTEGER NOT NULL,
                PRIMARY KEY (edge_node, device_id)
            );

            CREATE TABLE IF NOT EXISTS session (
                edge_node TEXT PRIMARY KEY,
                bd_seq INTEGER NOT NULL
            );
            ",
        )?;

        let mut store = Self {
            conn,
            aliases: HashMap::new(),
            max_aliases,
            evictions: 0,
        };
        store.load_aliases()?;
        Ok(store)
    }

    fn load_aliases(&mut self) -> Result<(), StateError> {
        let mut stmt = self
            .conn
            .prepare("SELECT edge_node, device_id, metric_name, alias FROM aliases")?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, i64>(3)?,
            ))
        })?;
        for row in rows {
            let (edge, device, name, alias) = row?;
            self.aliases
                .entry((edge, device))
                .or_default()
                .insert(name, alias as u64);
        }
        drop(stmt);
        tracing::info!(
            devices = self.aliases.len(),
            "Loaded metric aliases from database"
        );
        Ok(())
    }

    /// Look up or allocate the alias for a metric.
    ///
    /// Allocation is `max(alias in (edge_node, device)) + 1`, starting at 0,
    /// committed before the caller announces it in a DBIRTH. Aliases are
    /// never reused within a `(edge_node, device)` domain.
    ///
    /// # Errors
    ///
    /// Returns error if the commit fails; the caller must then abort the
    /// DBIRTH and retry.
    pub fn alias(
        &mut self,
        edge_node: &str,
        device_id: &str,
        metric_name: &str,
    ) -> Result<u64, StateError> {
        let key = (edge_node.to_string(), device_id.to_string());
        if let Some(alias) = self.aliases.get(&key).and_then(|m| m.get(metric_name)) {
            let alias = *alias;
            self.conn.execute(
                "UPDATE aliases SET last_touched = ?1 \
                 WHERE edge_node = ?2 AND device_id = ?3 AND metric_name = ?4",
                (now_secs(), edge_node, device_id, metric_name),
            )?;
            return Ok(alias);
        }

        let next = self
            .aliases
            .get(&key)
            .and_then(|m| m.values().max().copied())
            .map_or(0, |max| max + 1);

        let tx = self.conn.transaction()?;
        if evict_one_lru(&tx, "aliases", "metric_name", self.max_aliases)? {
            self.evictions += 1;
        }
        tx.execute(
            "INSERT INTO aliases (edge_node, device_id, metric_name, alias, last_touched) \
             VALUES (?1, ?2, ?3, ?4, ?5)",
            (edge_node, device_id, metric_name, next as i64, now_secs()),
        )?;
        tx.commit()?;

        // An evicted row may still sit in the in-memory map; allocation uses
        // the map's max so aliases stay dense and never reused.
        self.aliases
            .entry(key)
            .or_default()
            .insert(metric_name.to_string(), next);
        tracing::debug!(edge_node, device_id, metric_name, alias = next, "Assigned alias");
        Ok(next)
    }

    /// Full name→alias map for a device, as announced at its last birth.
    #[must_use]
    pub fn device_aliases(&self, edge_node: &str, device_id: &str) -> HashMap<String, u64> {
        self.aliases
            .get(&(edge_node.to_string(), device_id.to_string()))
            .cloned()
            .unwrap_or_default()
    }

    /// Store (or replace) the cached DBIRTH for a device.
    ///
    /// # Errors
    ///
    /// Returns error if the commit fails.
    pub fn store_birth(
        &mut self,
        edge_node: &str,
        device_id: &str,
        topic: &str,
        payload: &[u8],
    ) -> Result<(), StateError> {
        self.conn.execute(
            "INSERT OR REPLACE INTO births \
             (edge_node, device_id, topic, payload, last_touched) \
             VALUES (?1, ?2, ?3, ?4, ?5)",
            (edge_node, device_id, topic, payload, now_secs()),
        )?;
        Ok(())
    }

    /// Remove a device's cached birth (on DDEATH).
    ///
    /// # Errors
    ///
    /// Returns error if the delete fails.
    pub fn remove_birth(&mut self, edge_node: &str, device_id: &str) -> Result<(), StateError> {
        self.conn.execute(
            "DELETE FROM births WHERE edge_node = ?1 AND device_id = ?2",
            (edge_node, device_id),
        )?;
        Ok(())
    }

    /// All cached births for an edge node, for rebirth and reconnect.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails.
    pub fn births(&self, edge_node: &str) -> Result<Vec<BirthRow>, StateError> {
        let mut stmt = self.conn.prepare(
            "SELECT device_id, topic, payload FROM births WHERE edge_node = ?1 \
             ORDER BY device_id ASC",
        )?;
        let rows = stmt
            .query_map([edge_node], |row| {
                Ok(BirthRow {
                    device_id: row.get(0)?,
                    topic: row.get(1)?,
                    payload: row.get(2)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Current persistent `bdSeq` for an edge node (0 when never started).
    ///
    /// # Errors
    ///
    /// Returns error if the query fails.
    pub fn bd_seq(&self, edge_node: &str) -> Result<u64, StateError> {
        let stored: Option<i64> = self
            .conn
            .query_row(
                "SELECT bd_seq FROM session WHERE edge_node = ?1",
                [edge_node],
                |row| row.get(0),
            )
            .optional()?;
        Ok(stored.map_or(0, |v| v as u64))
    }

    /// Value the next session's `bdSeq` will take (prior + 1, or 0 for a
    /// fresh store), without persisting it.
    ///
    /// The last-will NDEATH must carry the session's `bdSeq` before the
    /// connect succeeds, so the value is peeked for the will and committed
    /// with [`SparkplugStore::commit_bd_seq`] once the broker accepts the
    /// connection. The counter is 64-bit internally and wraps modulo 256
    /// only on transmit.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails.
    pub fn peek_next_bd_seq(&self, edge_node: &str) -> Result<u64, StateError> {
        let current: Option<i64> = self
            .conn
            .query_row(
                "SELECT bd_seq FROM session WHERE edge_node = ?1",
                [edge_node],
                |row| row.get(0),
            )
            .optional()?;
        Ok(current.map_or(0, |c| (c as u64) + 1))
    }

    /// Persist the `bdSeq` of an established session.
    ///
    /// # Errors
    ///
    /// Returns error if the commit fails.
    pub fn commit_bd_seq(&mut self, edge_node: &str, bd_seq: u64) -> Result<(), StateError> {
        self.conn.execute(
            "INSERT OR REPLACE INTO session (edge_node, bd_seq) VALUES (?1, ?2)",
            (edge_node, bd_seq as i64),
        )?;
        Ok(())
    }

    /// Rows evicted from the alias table since open.
    #[must_use]
    pub fn evictions(&self) -> u64 {
        self.evictions
    }

    /// Number of aliases held in memory.
    #[must_use]
    pub fn alias_count(&self) -> usize {
        self.aliases.values().map(HashMap::len).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aliases_are_dense_per_device_from_zero() {
        let mut store = SparkplugStore::in_memory().unwrap();

        assert_eq!(store.alias("edge", "Robot7", "Serial").unwrap(), 0);
        assert_eq!(store.alias("edge", "Robot7", "Temp").unwrap(), 1);
        assert_eq!(store.alias("edge", "Press02", "Serial").unwrap(), 0);

        // Stable on re-lookup.
        assert_eq!(store.alias("edge", "Robot7", "Serial").unwrap(), 0);
        assert_eq!(store.alias("edge", "Robot7", "Temp").unwrap(), 1);
    }

    #[test]
    fn aliases_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sparkplug.db");

        {
            let mut store = SparkplugStore::open(&path, 1000).unwrap();
            assert_eq!(store.alias("edge", "Robot7", "Serial").unwrap(), 0);
            assert_eq!(store.alias("edge", "Robot7", "Temp").unwrap(), 1);
        }

        let mut store = SparkplugStore::open(&path, 1000).unwrap();
        assert_eq!(store.alias("edge", "Robot7", "Temp").unwrap(), 1);
        assert_eq!(store.alias("edge", "Robot7", "Pressure").unwrap(), 2);
    }

    #[test]
    fn alias_allocation_stays_dense_at_scale() {
        let mut store = SparkplugStore::in_memory().unwrap();
        for i in 0..1000u64 {
            let alias = store.alias("edge", "dev", &format!("metric{i}")).unwrap();
            assert_eq!(alias, i);
        }
    }

    #[test]
    fn alias_table_at_capacity_evicts_one_row() {
        let conn = open_in_memory().unwrap();
        let mut store = SparkplugStore::from_conn(conn, 3).unwrap();

        store.alias("edge", "dev", "a").unwrap();
        store.alias("edge", "dev", "b").unwrap();
        store.alias("edge", "dev", "c").unwrap();
        assert_eq!(store.evictions(), 0);

        store.alias("edge", "dev", "d").unwrap();
        assert_eq!(store.evictions(), 1);

        let count: i64 = store
            .conn
            .query_row("SELECT COUNT(*) FROM aliases", [], |r| r.get(0))
            .unwrap();
        assert_eq!(count, 3);
        // Dense allocation continues past evictions.
        assert_eq!(store.alias("edge", "dev", "e").unwrap(), 4);
    }

    #[test]
    fn birth_cache_is_last_writer_wins_and_deletable() {
        let mut store = SparkplugStore::in_memory().unwrap();

        store.store_birth("edge", "Robot7", "t1", b"first").unwrap();
        store.store_birth("edge", "Robot7", "t1", b"second").unwrap();
        store.store_birth("edge", "Press02", "t2", b"press").unwrap();

        let births = store.births("edge").unwrap();
        assert_eq!(births.len(), 2);
        let robot = births.iter().find(|b| b.device_id == "Robot7").unwrap();
        assert_eq!(robot.payload, b"second");

        store.remove_birth("edge", "Robot7").unwrap();
        assert_eq!(store.births("edge").unwrap().len(), 1);
    }

    #[test]
    fn bd_seq_starts_at_zero_and_increments() {
        let mut store = SparkplugStore::in_memory().unwrap();
        assert_eq!(store.peek_next_bd_seq("edge").unwrap(), 0);
        // Peeking again without a commit returns the same value.
        assert_eq!(store.peek_next_bd_seq("edge").unwrap(), 0);

        store.commit_bd_seq("edge", 0).unwrap();
        assert_eq!(store.peek_next_bd_seq("edge").unwrap(), 1);
        assert_eq!(store.bd_seq("edge").unwrap(), 0);
    }

    #[test]
    fn bd_seq_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sparkplug.db");
        {
            let mut store = SparkplugStore::open(&path, 100).unwrap();
            store.commit_bd_seq("edge", 0).unwrap();
            store.commit_bd_seq("edge", 1).unwrap();
        }
        let store = SparkplugStore::open(&path, 100).unwrap();
        assert_eq!(store.peek_next_bd_seq("edge").unwrap(), 2);
    }
}
