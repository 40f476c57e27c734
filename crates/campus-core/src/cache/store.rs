//! SQLite-backed local cache
//!
//! Records are JSON payloads keyed by `(entity_type, parent_key, id)`.
//! `parent_key` is the remote path the records were mirrored from, so one
//! entity type can be cached for many conversations or courses side by side.
//!
//! Every `(entity_type, parent_key)` pair can be observed through a
//! `watch` channel: a receiver sees the current collection immediately and
//! a new one after every mutation that changed it.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;

use chrono::Utc;
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::Value;
use tokio::sync::watch;
use tracing::debug;

use super::error::{CacheError, CacheResult};
use super::schema::{init_schema, needs_init};
use crate::config::Config;

const UPSERT_SQL: &str = "INSERT OR REPLACE INTO cache_entries \
     (entity_type, parent_key, id, payload, updated_at) VALUES (?1, ?2, ?3, ?4, ?5)";

/// One cached record
#[derive(Debug, Clone, PartialEq)]
pub struct CacheRecord {
    pub id: String,
    pub payload: Value,
    /// Milliseconds since the Unix epoch of the last local write
    pub updated_at: i64,
}

/// A collection as published to observers, ordered by id
pub type Collection = Arc<Vec<CacheRecord>>;

/// What a [`LocalCache::replace_all`] call changed
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReplaceSummary {
    pub inserted: usize,
    pub updated: usize,
    pub removed: usize,
    pub unchanged: usize,
}

impl ReplaceSummary {
    pub fn is_noop(&self) -> bool {
        self.inserted + self.updated + self.removed == 0
    }
}

/// Row counts for `campus status`
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub total: usize,
    pub by_type: BTreeMap<String, usize>,
}

type WatchKey = (String, String);

/// Persisted mirror of remote entities
pub struct LocalCache {
    conn: Mutex<Connection>,
    watchers: Mutex<HashMap<WatchKey, watch::Sender<Collection>>>,
}

impl LocalCache {
    /// Open or create the cache at the configured location
    pub fn open(config: &Config) -> CacheResult<Self> {
        Self::open_at(&config.cache_path())
    }

    pub fn open_at(path: &Path) -> CacheResult<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .map_err(|e| CacheError::from_io(e, parent.to_path_buf()))?;
        }

        let conn = Connection::open(path)?;
        if needs_init(&conn) {
            init_schema(&conn)?;
        }
        debug!("Opened cache at {}", path.display());
        Ok(Self::with_connection(conn))
    }

    /// Open an in-memory cache (for testing)
    pub fn open_in_memory() -> CacheResult<Self> {
        let conn = Connection::open_in_memory()?;
        init_schema(&conn)?;
        Ok(Self::with_connection(conn))
    }

    fn with_connection(conn: Connection) -> Self {
        Self {
            conn: Mutex::new(conn),
            watchers: Mutex::new(HashMap::new()),
        }
    }

    // ==================== Mutations ====================

    /// Insert or replace records by id; other cached records stay
    pub fn upsert(
        &self,
        entity_type: &str,
        parent_key: &str,
        records: &[(String, Value)],
    ) -> CacheResult<usize> {
        if records.is_empty() {
            return Ok(0);
        }
        {
            let mut conn = self.conn.lock();
            let tx = conn.transaction()?;
            {
                let now = now_millis();
                let mut stmt = tx.prepare(UPSERT_SQL)?;
                for (id, payload) in records {
                    let text = serde_json::to_string(payload)?;
                    stmt.execute(params![entity_type, parent_key, id, text, now])?;
                }
            }
            tx.commit()?;
        }
        self.notify(entity_type, parent_key)?;
        Ok(records.len())
    }

    /// Make the cached set for `parent_key` exactly `records`
    ///
    /// Records absent from `records` are deleted; records whose payload is
    /// unchanged keep their `updated_at`. Observers are only notified when
    /// something changed.
    pub fn replace_all(
        &self,
        entity_type: &str,
        parent_key: &str,
        records: &[(String, Value)],
    ) -> CacheResult<ReplaceSummary> {
        let mut summary = ReplaceSummary::default();
        {
            let mut conn = self.conn.lock();
            let tx = conn.transaction()?;
            {
                let existing: HashMap<String, String> = {
                    let mut stmt = tx.prepare(
                        "SELECT id, payload FROM cache_entries WHERE entity_type = ?1 AND parent_key = ?2",
                    )?;
                    let rows = stmt.query_map(params![entity_type, parent_key], |row| {
                        Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
                    })?;
                    rows.collect::<Result<_, _>>()?
                };

                let now = now_millis();
                let mut keep: HashSet<&str> = HashSet::new();
                let mut upsert = tx.prepare(UPSERT_SQL)?;
                for (id, payload) in records {
                    let text = serde_json::to_string(payload)?;
                    keep.insert(id.as_str());
                    match existing.get(id) {
                        Some(old) if *old == text => summary.unchanged += 1,
                        Some(_) => {
                            upsert.execute(params![entity_type, parent_key, id, text, now])?;
                            summary.updated += 1;
                        }
                        None => {
                            upsert.execute(params![entity_type, parent_key, id, text, now])?;
                            summary.inserted += 1;
                        }
                    }
                }

                let mut remove = tx.prepare(
                    "DELETE FROM cache_entries WHERE entity_type = ?1 AND parent_key = ?2 AND id = ?3",
                )?;
                for id in existing.keys() {
                    if !keep.contains(id.as_str()) {
                        remove.execute(params![entity_type, parent_key, id])?;
                        summary.removed += 1;
                    }
                }
            }
            tx.commit()?;
        }

        if !summary.is_noop() {
            self.notify(entity_type, parent_key)?;
        }
        Ok(summary)
    }

    /// Returns whether a record was removed
    pub fn delete(&self, entity_type: &str, parent_key: &str, id: &str) -> CacheResult<bool> {
        let removed = self.conn.lock().execute(
            "DELETE FROM cache_entries WHERE entity_type = ?1 AND parent_key = ?2 AND id = ?3",
            params![entity_type, parent_key, id],
        )?;
        if removed > 0 {
            self.notify(entity_type, parent_key)?;
        }
        Ok(removed > 0)
    }

    /// Drop everything cached under `parent_key`
    pub fn clear_parent(&self, entity_type: &str, parent_key: &str) -> CacheResult<usize> {
        let removed = self.conn.lock().execute(
            "DELETE FROM cache_entries WHERE entity_type = ?1 AND parent_key = ?2",
            params![entity_type, parent_key],
        )?;
        if removed > 0 {
            self.notify(entity_type, parent_key)?;
        }
        Ok(removed)
    }

    // ==================== Queries ====================

    /// Observe a collection; the receiver holds the current state already
    pub fn query(
        &self,
        entity_type: &str,
        parent_key: &str,
    ) -> CacheResult<watch::Receiver<Collection>> {
        let key = (entity_type.to_string(), parent_key.to_string());
        let mut watchers = self.watchers.lock();
        if let Some(sender) = watchers.get(&key) {
            return Ok(sender.subscribe());
        }
        let current = self.load(entity_type, parent_key)?;
        let (tx, rx) = watch::channel(current);
        watchers.insert(key, tx);
        Ok(rx)
    }

    /// Current records, without observing
    pub fn list(&self, entity_type: &str, parent_key: &str) -> CacheResult<Collection> {
        self.load(entity_type, parent_key)
    }

    pub fn get(
        &self,
        entity_type: &str,
        parent_key: &str,
        id: &str,
    ) -> CacheResult<Option<CacheRecord>> {
        let conn = self.conn.lock();
        let row = conn
            .query_row(
                "SELECT payload, updated_at FROM cache_entries \
                 WHERE entity_type = ?1 AND parent_key = ?2 AND id = ?3",
                params![entity_type, parent_key, id],
                |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)),
            )
            .optional()?;

        match row {
            Some((payload, updated_at)) => Ok(Some(CacheRecord {
                id: id.to_string(),
                payload: serde_json::from_str(&payload)?,
                updated_at,
            })),
            None => Ok(None),
        }
    }

    pub fn count(&self, entity_type: &str, parent_key: &str) -> CacheResult<usize> {
        let count: i64 = self.conn.lock().query_row(
            "SELECT COUNT(*) FROM cache_entries WHERE entity_type = ?1 AND parent_key = ?2",
            params![entity_type, parent_key],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    pub fn stats(&self) -> CacheResult<CacheStats> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT entity_type, COUNT(*) FROM cache_entries GROUP BY entity_type ORDER BY entity_type",
        )?;
        let rows = stmt.query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))?;

        let mut stats = CacheStats::default();
        for row in rows {
            let (entity_type, count) = row?;
            stats.total += count as usize;
            stats.by_type.insert(entity_type, count as usize);
        }
        Ok(stats)
    }

    // ==================== Internals ====================

    fn load(&self, entity_type: &str, parent_key: &str) -> CacheResult<Collection> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT id, payload, updated_at FROM cache_entries \
             WHERE entity_type = ?1 AND parent_key = ?2 ORDER BY id",
        )?;
        let rows = stmt.query_map(params![entity_type, parent_key], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, i64>(2)?,
            ))
        })?;

        let mut records = Vec::new();
        for row in rows {
            let (id, payload, updated_at) = row?;
            records.push(CacheRecord {
                id,
                payload: serde_json::from_str(&payload)?,
                updated_at,
            });
        }
        Ok(Arc::new(records))
    }

    /// Publish the current collection to observers of this key
    fn notify(&self, entity_type: &str, parent_key: &str) -> CacheResult<()> {
        let key = (entity_type.to_string(), parent_key.to_string());
        let mut watchers = self.watchers.lock();

        let live = match watchers.get(&key) {
            Some(sender) => sender.receiver_count() > 0,
            None => return Ok(()),
        };
        if !live {
            watchers.remove(&key);
            return Ok(());
        }

        let current = self.load(entity_type, parent_key)?;
        if let Some(sender) = watchers.get(&key) {
            sender.send_replace(current);
        }
        Ok(())
    }
}

fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn rec(id: &str, payload: Value) -> (String, Value) {
        (id.to_string(), payload)
    }

    fn ids(collection: &Collection) -> Vec<String> {
        collection.iter().map(|r| r.id.clone()).collect()
    }

    #[test]
    fn test_query_emits_current_state() {
        let cache = LocalCache::open_in_memory().unwrap();
        cache
            .upsert("courses", "Courses", &[rec("c1", json!({"code": "CS101"}))])
            .unwrap();

        let rx = cache.query("courses", "Courses").unwrap();
        assert_eq!(ids(&rx.borrow()), vec!["c1"]);
    }

    #[test]
    fn test_upsert_keeps_other_records() {
        let cache = LocalCache::open_in_memory().unwrap();
        cache
            .upsert("groups", "Groups", &[rec("a", json!(1)), rec("b", json!(2))])
            .unwrap();
        cache.upsert("groups", "Groups", &[rec("b", json!(3))]).unwrap();

        let all = cache.list("groups", "Groups").unwrap();
        assert_eq!(ids(&all), vec!["a", "b"]);
        assert_eq!(all[1].payload, json!(3));
    }

    #[test]
    fn test_replace_all_reconciles() {
        let cache = LocalCache::open_in_memory().unwrap();
        cache
            .upsert("messages", "dm", &[rec("m1", json!("x")), rec("m2", json!("y"))])
            .unwrap();

        let summary = cache
            .replace_all("messages", "dm", &[rec("m2", json!("y")), rec("m3", json!("z"))])
            .unwrap();
        assert_eq!(
            summary,
            ReplaceSummary {
                inserted: 1,
                updated: 0,
                removed: 1,
                unchanged: 1
            }
        );
        assert_eq!(ids(&cache.list("messages", "dm").unwrap()), vec!["m2", "m3"]);
    }

    #[test]
    fn test_replace_all_is_idempotent() {
        let cache = LocalCache::open_in_memory().unwrap();
        let snapshot = vec![rec("a", json!({"t": 1})), rec("b", json!({"t": 2}))];

        cache.replace_all("announcements", "Announcements", &snapshot).unwrap();
        let first = cache.list("announcements", "Announcements").unwrap();

        let mut rx = cache.query("announcements", "Announcements").unwrap();
        let summary = cache
            .replace_all("announcements", "Announcements", &snapshot)
            .unwrap();
        assert!(summary.is_noop());
        assert!(!rx.has_changed().unwrap());
        assert_eq!(**rx.borrow_and_update(), *first);
    }

    #[test]
    fn test_replace_all_empty_clears() {
        let cache = LocalCache::open_in_memory().unwrap();
        cache.upsert("groups", "Groups", &[rec("a", json!(1))]).unwrap();
        cache.replace_all("groups", "Groups", &[]).unwrap();
        assert_eq!(cache.count("groups", "Groups").unwrap(), 0);
    }

    #[test]
    fn test_parent_keys_are_isolated() {
        let cache = LocalCache::open_in_memory().unwrap();
        cache.upsert("messages", "dm/a", &[rec("m1", json!(1))]).unwrap();
        cache.replace_all("messages", "dm/b", &[rec("m2", json!(2))]).unwrap();

        assert_eq!(cache.count("messages", "dm/a").unwrap(), 1);
        assert_eq!(cache.count("messages", "dm/b").unwrap(), 1);
    }

    #[tokio::test]
    async fn test_observer_sees_mutations() {
        let cache = LocalCache::open_in_memory().unwrap();
        let mut rx = cache.query("courses", "Courses").unwrap();
        assert!(rx.borrow().is_empty());

        cache.upsert("courses", "Courses", &[rec("c1", json!(1))]).unwrap();
        rx.changed().await.unwrap();
        assert_eq!(ids(&rx.borrow_and_update()), vec!["c1"]);

        assert!(cache.delete("courses", "Courses", "c1").unwrap());
        rx.changed().await.unwrap();
        assert!(rx.borrow_and_update().is_empty());

        assert!(!cache.delete("courses", "Courses", "c1").unwrap());
        assert!(!rx.has_changed().unwrap());
    }

    #[test]
    fn test_observer_after_all_receivers_dropped() {
        let cache = LocalCache::open_in_memory().unwrap();
        drop(cache.query("courses", "Courses").unwrap());
        cache.upsert("courses", "Courses", &[rec("c1", json!(1))]).unwrap();

        let rx = cache.query("courses", "Courses").unwrap();
        assert_eq!(ids(&rx.borrow()), vec!["c1"]);
    }

    #[test]
    fn test_get_and_stats() {
        let cache = LocalCache::open_in_memory().unwrap();
        cache
            .upsert("courses", "Courses", &[rec("c1", json!({"code": "CS101"}))])
            .unwrap();
        cache.upsert("groups", "Groups", &[rec("g1", json!({}))]).unwrap();
        cache.upsert("groups", "Other", &[rec("g2", json!({}))]).unwrap();

        let record = cache.get("courses", "Courses", "c1").unwrap().unwrap();
        assert_eq!(record.payload["code"], "CS101");
        assert!(cache.get("courses", "Courses", "nope").unwrap().is_none());

        let stats = cache.stats().unwrap();
        assert_eq!(stats.total, 3);
        assert_eq!(stats.by_type.get("groups"), Some(&2));

        assert_eq!(cache.clear_parent("groups", "Groups").unwrap(), 1);
        assert_eq!(cache.stats().unwrap().total, 2);
    }

    #[test]
    fn test_persists_across_reopen() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("nested").join("cache.db");

        {
            let cache = LocalCache::open_at(&path).unwrap();
            cache
                .upsert("users", "Users", &[rec("u1", json!({"name": "Ada"}))])
                .unwrap();
        }

        let cache = LocalCache::open_at(&path).unwrap();
        let record = cache.get("users", "Users", "u1").unwrap().unwrap();
        assert_eq!(record.payload["name"], "Ada");
    }
}
