//! Namespaced key/value persistence.
//!
//! Everything the tracker keeps between runs (raw provider data, the ranking
//! cache, cycle progress) is a JSON document under `(namespace, key)`.
//! [`DuckDbStore`] is the production backend; [`MemoryStore`] backs tests.

pub mod exclusions;
pub mod master;
pub mod ranking;

use chrono::Utc;
use duckdb::{params, Connection};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use thiserror::Error;
use tracing::info;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("database error: {0}")]
    Db(#[from] duckdb::Error),

    #[error("corrupt document {namespace}/{key}: {source}")]
    Corrupt {
        namespace: String,
        key: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("serialization failed: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("could not create storage directory: {0}")]
    Io(#[from] std::io::Error),

    #[error("storage lock poisoned")]
    Poisoned,
}

/// Durable map of `(namespace, key) → value`.
///
/// `put_many` and `update` are atomic: a reader never observes half of a
/// batch, and a concurrent writer cannot interleave with a read-modify-write.
pub trait KeyValueStore: Send + Sync {
    fn get(&self, namespace: &str, key: &str) -> Result<Option<String>, StorageError>;

    fn put(&self, namespace: &str, key: &str, value: &str) -> Result<(), StorageError> {
        self.put_many(namespace, &[(key.to_string(), value.to_string())])
    }

    fn put_many(&self, namespace: &str, entries: &[(String, String)]) -> Result<(), StorageError>;

    /// Replace the value with `f(current)`. Nothing is written if `f` fails.
    fn update(
        &self,
        namespace: &str,
        key: &str,
        f: &mut dyn FnMut(Option<String>) -> Result<String, StorageError>,
    ) -> Result<String, StorageError>;

    /// Returns whether the key existed.
    fn delete(&self, namespace: &str, key: &str) -> Result<bool, StorageError>;

    /// Keys in ascending order.
    fn list_keys(&self, namespace: &str) -> Result<Vec<String>, StorageError>;

    /// `(key, value)` pairs in ascending key order.
    fn entries(&self, namespace: &str) -> Result<Vec<(String, String)>, StorageError>;
}

pub fn get_json<T: DeserializeOwned>(
    store: &dyn KeyValueStore,
    namespace: &str,
    key: &str,
) -> Result<Option<T>, StorageError> {
    store
        .get(namespace, key)?
        .map(|raw| decode(namespace, key, &raw))
        .transpose()
}

pub fn put_json<T: Serialize>(
    store: &dyn KeyValueStore,
    namespace: &str,
    key: &str,
    value: &T,
) -> Result<(), StorageError> {
    store.put(namespace, key, &serde_json::to_string(value)?)
}

pub(crate) fn decode<T: DeserializeOwned>(namespace: &str, key: &str, raw: &str) -> Result<T, StorageError> {
    serde_json::from_str(raw).map_err(|source| StorageError::Corrupt {
        namespace: namespace.to_string(),
        key: key.to_string(),
        source,
    })
}

// ── Schema ────────────────────────────────────────────────────────────────────

const DDL: &str = r#"
CREATE TABLE IF NOT EXISTS kv (
    namespace   VARCHAR   NOT NULL,
    key         VARCHAR   NOT NULL,
    value       VARCHAR   NOT NULL,
    updated_at  TIMESTAMP NOT NULL,
    PRIMARY KEY (namespace, key)
);

CREATE TABLE IF NOT EXISTS schema_version (
    version     INTEGER PRIMARY KEY,
    applied_at  TIMESTAMP NOT NULL
);
"#;

const UPSERT: &str = r#"
    INSERT INTO kv (namespace, key, value, updated_at)
    VALUES (?, ?, ?, ?)
    ON CONFLICT (namespace, key) DO UPDATE SET
        value      = excluded.value,
        updated_at = excluded.updated_at
"#;

// ── DuckDB ────────────────────────────────────────────────────────────────────

pub struct DuckDbStore {
    conn: Mutex<Connection>,
}

impl DuckDbStore {
    pub fn open(path: &Path) -> Result<Self, StorageError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        Ok(Self { conn: Mutex::new(conn) })
    }

    #[cfg(test)]
    pub fn open_in_memory() -> Result<Self, StorageError> {
        let store = Self { conn: Mutex::new(Connection::open_in_memory()?) };
        store.run_migrations()?;
        Ok(store)
    }

    pub fn run_migrations(&self) -> Result<(), StorageError> {
        info!("Running migrations…");
        let conn = self.lock()?;
        conn.execute_batch(DDL)?;
        conn.execute(
            "INSERT OR IGNORE INTO schema_version (version, applied_at) VALUES (1, ?)",
            params![Utc::now().naive_utc()],
        )?;
        info!("Migrations done.");
        Ok(())
    }

    /// Document count per namespace.
    pub fn namespace_counts(&self) -> Result<Vec<(String, i64)>, StorageError> {
        let conn = self.lock()?;
        let mut stmt =
            conn.prepare("SELECT namespace, COUNT(*) FROM kv GROUP BY namespace ORDER BY namespace")?;
        let counts = stmt
            .query_map([], |r| Ok((r.get(0)?, r.get(1)?)))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(counts)
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>, StorageError> {
        self.conn.lock().map_err(|_| StorageError::Poisoned)
    }
}

fn select_value(conn: &Connection, namespace: &str, key: &str) -> Result<Option<String>, StorageError> {
    let mut stmt = conn.prepare("SELECT value FROM kv WHERE namespace = ? AND key = ?")?;
    let mut rows = stmt.query_map(params![namespace, key], |r| r.get::<_, String>(0))?;
    let value = rows.next().transpose()?;
    Ok(value)
}

impl KeyValueStore for DuckDbStore {
    fn get(&self, namespace: &str, key: &str) -> Result<Option<String>, StorageError> {
        let conn = self.lock()?;
        select_value(&conn, namespace, key)
    }

    fn put_many(&self, namespace: &str, entries: &[(String, String)]) -> Result<(), StorageError> {
        if entries.is_empty() {
            return Ok(());
        }
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        let now = Utc::now().naive_utc();
        for (key, value) in entries {
            tx.execute(UPSERT, params![namespace, key, value, now])?;
        }
        tx.commit()?;
        Ok(())
    }

    fn update(
        &self,
        namespace: &str,
        key: &str,
        f: &mut dyn FnMut(Option<String>) -> Result<String, StorageError>,
    ) -> Result<String, StorageError> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        let current = select_value(&tx, namespace, key)?;
        let next = f(current)?;
        tx.execute(UPSERT, params![namespace, key, next, Utc::now().naive_utc()])?;
        tx.commit()?;
        Ok(next)
    }

    fn delete(&self, namespace: &str, key: &str) -> Result<bool, StorageError> {
        let conn = self.lock()?;
        let n = conn.execute(
            "DELETE FROM kv WHERE namespace = ? AND key = ?",
            params![namespace, key],
        )?;
        Ok(n > 0)
    }

    fn list_keys(&self, namespace: &str) -> Result<Vec<String>, StorageError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare("SELECT key FROM kv WHERE namespace = ? ORDER BY key")?;
        let keys = stmt
            .query_map(params![namespace], |r| r.get(0))?
            .collect::<Result<Vec<String>, _>>()?;
        Ok(keys)
    }

    fn entries(&self, namespace: &str) -> Result<Vec<(String, String)>, StorageError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare("SELECT key, value FROM kv WHERE namespace = ? ORDER BY key")?;
        let rows = stmt
            .query_map(params![namespace], |r| Ok((r.get(0)?, r.get(1)?)))?
            .collect::<Result<Vec<(String, String)>, _>>()?;
        Ok(rows)
    }
}

// ── In-memory ─────────────────────────────────────────────────────────────────

#[derive(Default)]
pub struct MemoryStore {
    docs: Mutex<BTreeMap<(String, String), String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, BTreeMap<(String, String), String>>, StorageError> {
        self.docs.lock().map_err(|_| StorageError::Poisoned)
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, namespace: &str, key: &str) -> Result<Option<String>, StorageError> {
        Ok(self.lock()?.get(&(namespace.to_string(), key.to_string())).cloned())
    }

    fn put_many(&self, namespace: &str, entries: &[(String, String)]) -> Result<(), StorageError> {
        let mut docs = self.lock()?;
        for (key, value) in entries {
            docs.insert((namespace.to_string(), key.clone()), value.clone());
        }
        Ok(())
    }

    fn update(
        &self,
        namespace: &str,
        key: &str,
        f: &mut dyn FnMut(Option<String>) -> Result<String, StorageError>,
    ) -> Result<String, StorageError> {
        let mut docs = self.lock()?;
        let id = (namespace.to_string(), key.to_string());
        let next = f(docs.get(&id).cloned())?;
        docs.insert(id, next.clone());
        Ok(next)
    }

    fn delete(&self, namespace: &str, key: &str) -> Result<bool, StorageError> {
        Ok(self.lock()?.remove(&(namespace.to_string(), key.to_string())).is_some())
    }

    fn list_keys(&self, namespace: &str) -> Result<Vec<String>, StorageError> {
        Ok(self.entries(namespace)?.into_iter().map(|(k, _)| k).collect())
    }

    fn entries(&self, namespace: &str) -> Result<Vec<(String, String)>, StorageError> {
        Ok(self
            .lock()?
            .iter()
            .filter(|((ns, _), _)| ns == namespace)
            .map(|((_, key), value)| (key.clone(), value.clone()))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn exercise(store: &dyn KeyValueStore) {
        assert_eq!(store.get("a", "k").unwrap(), None);

        store.put("a", "k", "1").unwrap();
        store.put("b", "k", "other").unwrap();
        store.put("a", "k", "2").unwrap();
        assert_eq!(store.get("a", "k").unwrap().as_deref(), Some("2"));

        store
            .put_many("a", &[("z".into(), "26".into()), ("c".into(), "3".into())])
            .unwrap();
        assert_eq!(store.list_keys("a").unwrap(), ["c", "k", "z"]);
        assert_eq!(store.entries("b").unwrap(), [("k".to_string(), "other".to_string())]);

        let next = store
            .update("a", "k", &mut |cur| Ok(format!("{}+", cur.unwrap_or_default())))
            .unwrap();
        assert_eq!(next, "2+");

        let failed = store.update("a", "k", &mut |_| Err(StorageError::Poisoned));
        assert!(failed.is_err());
        assert_eq!(store.get("a", "k").unwrap().as_deref(), Some("2+"));

        assert!(store.delete("a", "k").unwrap());
        assert!(!store.delete("a", "k").unwrap());
        assert_eq!(store.list_keys("a").unwrap(), ["c", "z"]);
    }

    #[test]
    fn test_memory_store() {
        exercise(&MemoryStore::new());
    }

    #[test]
    fn test_duckdb_store() {
        exercise(&DuckDbStore::open_in_memory().unwrap());
    }

    #[test]
    fn test_duckdb_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("grip.duckdb");

        {
            let store = DuckDbStore::open(&path).unwrap();
            store.run_migrations().unwrap();
            put_json(&store, "state", "cycle", &vec!["AAPL", "MSFT"]).unwrap();
        }

        let store = DuckDbStore::open(&path).unwrap();
        store.run_migrations().unwrap();
        let cycle: Option<Vec<String>> = get_json(&store, "state", "cycle").unwrap();
        assert_eq!(cycle, Some(vec!["AAPL".to_string(), "MSFT".to_string()]));
        assert_eq!(store.namespace_counts().unwrap(), [("state".to_string(), 1)]);
    }

    #[test]
    fn test_corrupt_document_is_reported() {
        let store = MemoryStore::new();
        store.put("state", "cycle", "{not json").unwrap();
        let err = get_json::<Vec<String>>(&store, "state", "cycle").unwrap_err();
        assert!(matches!(err, StorageError::Corrupt { .. }));
    }
}
