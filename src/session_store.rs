use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use rusqlite::{Connection, params};

use crate::error::GuardResult;
use crate::ports::SessionStore;

/// Durable key-value store on sqlite: live session records and versioned
/// backups share one table, TTL enforced on read.
pub struct SqliteSessionStore {
    conn: Mutex<Connection>,
}

impl SqliteSessionStore {
    pub fn open(path: &str) -> anyhow::Result<Self> {
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.run_migrations()?;
        Ok(store)
    }

    pub fn open_in_memory() -> anyhow::Result<Self> {
        let conn = Connection::open_in_memory()?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.run_migrations()?;
        Ok(store)
    }

    fn run_migrations(&self) -> anyhow::Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS kv (
                key        TEXT PRIMARY KEY,
                value      BLOB NOT NULL,
                expires_at INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_kv_expires ON kv(expires_at);
            ",
        )?;
        Ok(())
    }

    fn now_epoch() -> i64 {
        Utc::now().timestamp()
    }
}

#[async_trait]
impl SessionStore for SqliteSessionStore {
    async fn get(&self, key: &str) -> GuardResult<Option<Vec<u8>>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt =
            conn.prepare("SELECT value FROM kv WHERE key = ?1 AND expires_at > ?2")?;
        let mut rows = stmt.query_map(params![key, Self::now_epoch()], |row| row.get(0))?;
        Ok(rows.next().transpose()?)
    }

    async fn set(&self, key: &str, value: Vec<u8>, ttl: Duration) -> GuardResult<()> {
        let expires_at = Self::now_epoch() + ttl.as_secs() as i64;
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO kv (key, value, expires_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(key) DO UPDATE SET value = ?2, expires_at = ?3",
            params![key, value, expires_at],
        )?;
        Ok(())
    }

    async fn keys_by_prefix(&self, prefix: &str) -> GuardResult<Vec<String>> {
        let conn = self.conn.lock().unwrap();
        // Keys are `kind:id[:version]`, no LIKE metacharacters to escape.
        let pattern = format!("{prefix}%");
        let mut stmt = conn
            .prepare("SELECT key FROM kv WHERE key LIKE ?1 AND expires_at > ?2 ORDER BY key")?;
        let rows = stmt
            .query_map(params![pattern, Self::now_epoch()], |row| row.get(0))?
            .collect::<Result<Vec<String>, _>>()?;
        Ok(rows)
    }

    async fn delete(&self, key: &str) -> GuardResult<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute("DELETE FROM kv WHERE key = ?1", params![key])?;
        Ok(())
    }
}

/// In-memory store used by tests: same contract, no durability.
#[cfg(test)]
pub struct MemorySessionStore {
    map: Mutex<std::collections::HashMap<String, (Vec<u8>, i64)>>,
}

#[cfg(test)]
impl MemorySessionStore {
    pub fn new() -> Self {
        Self {
            map: Mutex::new(std::collections::HashMap::new()),
        }
    }

    /// Drop every live key, simulating a store disturbed during cutover.
    /// Backups survive because they live under a different prefix.
    pub fn wipe_prefix(&self, prefix: &str) {
        self.map
            .lock()
            .unwrap()
            .retain(|k, _| !k.starts_with(prefix));
    }
}

#[cfg(test)]
#[async_trait]
impl SessionStore for MemorySessionStore {
    async fn get(&self, key: &str) -> GuardResult<Option<Vec<u8>>> {
        let map = self.map.lock().unwrap();
        Ok(map
            .get(key)
            .filter(|(_, exp)| *exp > Utc::now().timestamp())
            .map(|(v, _)| v.clone()))
    }

    async fn set(&self, key: &str, value: Vec<u8>, ttl: Duration) -> GuardResult<()> {
        let expires_at = Utc::now().timestamp() + ttl.as_secs() as i64;
        self.map
            .lock()
            .unwrap()
            .insert(key.to_string(), (value, expires_at));
        Ok(())
    }

    async fn keys_by_prefix(&self, prefix: &str) -> GuardResult<Vec<String>> {
        let now = Utc::now().timestamp();
        let map = self.map.lock().unwrap();
        let mut keys: Vec<String> = map
            .iter()
            .filter(|(k, (_, exp))| k.starts_with(prefix) && *exp > now)
            .map(|(k, _)| k.clone())
            .collect();
        keys.sort();
        Ok(keys)
    }

    async fn delete(&self, key: &str) -> GuardResult<()> {
        self.map.lock().unwrap().remove(key);
        Ok(())
    }
}
