//! Retained-plane payload hashes for deduplication.
//!
//! One row per retained topic, last-writer-wins, loaded into memory at open
//! so the dedupe check never touches disk on the hot path.

use crate::db::{now_secs, open_database, open_in_memory};
use crate::error::StateError;
use rusqlite::Connection;
use std::collections::HashMap;
use std::path::Path;

/// Default cap for the hash table.
pub const DEFAULT_MAX_HASHES: usize = 500_000;

/// Per-topic fingerprint of the last published payload.
pub struct HashStore {
    conn: Connection,
    cache: HashMap<String, String>,
    max_entries: usize,
    evictions: u64,
}

impl HashStore {
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
        Self::from_conn(open_in_memory()?, DEFAULT_MAX_HASHES)
    }

    fn from_conn(conn: Connection, max_entries: usize) -> Result<Self, StateError> {
        conn.execute_batch(
            r"
            CREATE TABLE IF NOT EXISTS hashes (
                topic TEXT PRIMARY KEY,
                hash TEXT NOT NULL,
                last_touched INTEGER NOT NULL
            );
            ",
        )?;

        let mut cache = HashMap::new();
        {
            let mut stmt = conn.prepare("SELECT topic, hash FROM hashes")?;
            let rows = stmt.query_map([], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })?;
            for row in rows {
                let (topic, hash) = row?;
                cache.insert(topic, hash);
            }
        }
        tracing::debug!(entries = cache.len(), "Loaded payload hashes from database");

        Ok(Self {
            conn,
            cache,
            max_entries,
            evictions: 0,
        })
    }

    /// True when `hash` differs from the stored hash for `topic` (or the
    /// topic was never published).
    #[must_use]
    pub fn has_changed(&self, topic: &str, hash: &str) -> bool {
        self.cache.get(topic).map(String::as_str) != Some(hash)
    }

    /// Record the hash of a just-published payload. Last-writer-wins.
    ///
    /// # Errors
    ///
    /// Returns error if the commit fails.
    pub fn update(&mut self, topic: &str, hash: &str) -> Result<(), StateError> {
        let mut evicted: Option<String> = None;
        let tx = self.conn.transaction()?;
        if !self.cache.contains_key(topic) && self.cache.len() >= self.max_entries {
            let victim: Option<String> = tx
                .query_row(
                    "SELECT topic FROM hashes ORDER BY last_touched ASC, rowid ASC LIMIT 1",
                    [],
                    |row| row.get(0),
                )
                .map(Some)
                .or_else(|e| match e {
                    rusqlite::Error::QueryReturnedNoRows => Ok(None),
                    other => Err(other),
                })?;
            if let Some(victim) = victim {
                tx.execute("DELETE FROM hashes WHERE topic = ?1", [victim.as_str()])?;
                evicted = Some(victim);
            }
        }
        tx.execute(
            "INSERT OR REPLACE INTO hashes (topic, hash, last_touched) VALUES (?1, ?2, ?3)",
            (topic, hash, now_secs()),
        )?;
        tx.commit()?;

        if let Some(victim) = evicted {
            self.cache.remove(&victim);
            self.evictions += 1;
            tracing::debug!(topic = %victim, "Evicted least-recently-touched hash row");
        }
        self.cache.insert(topic.to_string(), hash.to_string());
        Ok(())
    }

    /// Clear the stored hash for a topic (retained state was cleared).
    ///
    /// # Errors
    ///
    /// Returns error if the delete fails.
    pub fn forget(&mut self, topic: &str) -> Result<(), StateError> {
        self.conn.execute("DELETE FROM hashes WHERE topic = ?1", [topic])?;
        self.cache.remove(topic);
        Ok(())
    }

    /// Number of tracked topics.
    #[must_use]
    pub fn len(&self) -> usize {
        self.cache.len()
    }

    /// True when no topics are tracked.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.cache.is_empty()
    }

    /// Rows evicted since open.
    #[must_use]
    pub fn evictions(&self) -> u64 {
        self.evictions
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unseen_topic_counts_as_changed() {
        let store = HashStore::in_memory().unwrap();
        assert!(store.has_changed("a/b", "h1"));
    }

    #[test]
    fn unchanged_hash_is_deduplicated() {
        let mut store = HashStore::in_memory().unwrap();
        store.update("a/b", "h1").unwrap();
        assert!(!store.has_changed("a/b", "h1"));
        assert!(store.has_changed("a/b", "h2"));
    }

    #[test]
    fn hashes_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hashes.db");
        {
            let mut store = HashStore::open(&path, 100).unwrap();
            store.update("a/b", "h1").unwrap();
        }
        let store = HashStore::open(&path, 100).unwrap();
        assert!(!store.has_changed("a/b", "h1"));
    }

    #[test]
    fn capacity_evicts_exactly_one() {
        let mut store = HashStore::from_conn(open_in_memory().unwrap(), 2).unwrap();
        store.update("t1", "h").unwrap();
        store.update("t2", "h").unwrap();
        store.update("t3", "h").unwrap();
        assert_eq!(store.evictions(), 1);

        let count: i64 = store
            .conn
            .query_row("SELECT COUNT(*) FROM hashes", [], |r| r.get(0))
            .unwrap();
        assert_eq!(count, 2);
    }

    #[test]
    fn updating_existing_topic_does_not_evict() {
        let mut store = HashStore::from_conn(open_in_memory().unwrap(), 2).unwrap();
        store.update("t1", "h1").unwrap();
        store.update("t2", "h1").unwrap();
        store.update("t1", "h2").unwrap();
        assert_eq!(store.evictions(), 0);
        assert!(!store.has_changed("t1", "h2"));
    }
}
