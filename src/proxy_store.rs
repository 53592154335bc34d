//! SQLite-backed persistence for proxy configurations and their health state.
//!
//! All access goes through one connection guarded by a mutex, so every call
//! (including the read-modify-write in [`ProxyStore::modify`]) is atomic with
//! respect to other callers.

use crate::error::StoreError;
use crate::models::{ProxyConfig, ProxyProtocol, ProxyState, ProxyStateUpdate};
use chrono::Utc;
use parking_lot::Mutex;
use rusqlite::types::Value;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row};
use std::path::Path;

const SELECT_COLUMNS: &str = "id, protocol, host, port, username, password, \
     fail_count, success_count, cooldown_until, last_used_at";

pub type StoreResult<T> = Result<T, StoreError>;

/// Raw row as stored; converted into a [`ProxyState`] after validation.
struct ProxyRow {
    id: i64,
    protocol: String,
    host: String,
    port: i64,
    username: Option<String>,
    password: Option<String>,
    fail_count: i64,
    success_count: i64,
    cooldown_until: Option<i64>,
    last_used_at: Option<i64>,
}

impl ProxyRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            protocol: row.get(1)?,
            host: row.get(2)?,
            port: row.get(3)?,
            username: row.get(4)?,
            password: row.get(5)?,
            fail_count: row.get(6)?,
            success_count: row.get(7)?,
            cooldown_until: row.get(8)?,
            last_used_at: row.get(9)?,
        })
    }

    fn into_state(self) -> StoreResult<ProxyState> {
        let protocol: ProxyProtocol = self
            .protocol
            .parse()
            .map_err(|e: String| StoreError::InvalidRow(format!("id {}: {}", self.id, e)))?;
        let port = u16::try_from(self.port)
            .map_err(|_| StoreError::InvalidRow(format!("id {}: port {}", self.id, self.port)))?;
        let fail_count = u32::try_from(self.fail_count).map_err(|_| {
            StoreError::InvalidRow(format!("id {}: fail_count {}", self.id, self.fail_count))
        })?;
        let success_count = u32::try_from(self.success_count).map_err(|_| {
            StoreError::InvalidRow(format!("id {}: success_count {}", self.id, self.success_count))
        })?;
        Ok(ProxyState {
            id: self.id,
            config: ProxyConfig {
                protocol,
                host: self.host,
                port,
                username: self.username,
                password: self.password,
            },
            fail_count,
            success_count,
            cooldown_until: self.cooldown_until,
            last_used_at: self.last_used_at,
        })
    }
}

pub struct ProxyStore {
    conn: Mutex<Option<Connection>>,
}

impl ProxyStore {
    /// Opens (or creates) the store at `path`. `":memory:"` gives a private
    /// in-memory database.
    pub fn open<P: AsRef<Path>>(path: P) -> StoreResult<Self> {
        let path = path.as_ref();
        let conn = if path == Path::new(":memory:") {
            Connection::open_in_memory()?
        } else {
            Connection::open(path)?
        };
        log::info!("Opened proxy store at {}", path.display());
        Self::with_connection(conn)
    }

    pub fn open_in_memory() -> StoreResult<Self> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> StoreResult<Self> {
        create_tables(&conn)?;
        Ok(Self {
            conn: Mutex::new(Some(conn)),
        })
    }

    fn with_conn<T>(&self, f: impl FnOnce(&Connection) -> StoreResult<T>) -> StoreResult<T> {
        let guard = self.conn.lock();
        match guard.as_ref() {
            Some(conn) => f(conn),
            None => Err(StoreError::Closed),
        }
    }

    /// Inserts `config` unless a proxy with the same `(protocol, host, port)`
    /// exists, in which case the existing record is returned untouched.
    pub fn add(&self, config: &ProxyConfig) -> StoreResult<ProxyState> {
        self.with_conn(|conn| {
            let now = Utc::now().timestamp_millis();
            conn.execute(
                "INSERT OR IGNORE INTO proxies (
                    protocol, host, port, username, password,
                    fail_count, success_count, cooldown_until, last_used_at,
                    created_at, updated_at
                ) VALUES (?1, ?2, ?3, ?4, ?5, 0, 0, NULL, NULL, ?6, ?6)",
                params![
                    config.protocol.as_str(),
                    config.host,
                    config.port,
                    config.username,
                    config.password,
                    now
                ],
            )?;
            let id: i64 = conn.query_row(
                "SELECT id FROM proxies WHERE protocol = ?1 AND host = ?2 AND port = ?3",
                params![config.protocol.as_str(), config.host, config.port],
                |row| row.get(0),
            )?;
            fetch_by_id(conn, id)?
                .ok_or_else(|| StoreError::InvalidRow(format!("id {} vanished after insert", id)))
        })
    }

    pub fn remove(&self, id: i64) -> StoreResult<()> {
        self.with_conn(|conn| {
            conn.execute("DELETE FROM proxies WHERE id = ?1", params![id])?;
            Ok(())
        })
    }

    pub fn list(&self) -> StoreResult<Vec<ProxyState>> {
        self.with_conn(|conn| {
            let mut stmt =
                conn.prepare(&format!("SELECT {} FROM proxies ORDER BY id ASC", SELECT_COLUMNS))?;
            let rows = stmt.query_map([], ProxyRow::from_row)?;
            let mut out = Vec::new();
            for row in rows {
                out.push(row?.into_state()?);
            }
            Ok(out)
        })
    }

    pub fn get_by_id(&self, id: i64) -> StoreResult<Option<ProxyState>> {
        self.with_conn(|conn| fetch_by_id(conn, id))
    }

    /// Merges the supplied fields into the record and returns the result, or
    /// `None` when `id` is unknown.
    pub fn update_state(&self, id: i64, update: &ProxyStateUpdate) -> StoreResult<Option<ProxyState>> {
        self.with_conn(|conn| apply_update(conn, id, update))
    }

    /// Reads the record, derives an update from it and writes it back while
    /// holding the connection, so no other call can interleave.
    pub fn modify<F>(&self, id: i64, f: F) -> StoreResult<Option<ProxyState>>
    where
        F: FnOnce(&ProxyState) -> ProxyStateUpdate,
    {
        self.with_conn(|conn| {
            let Some(current) = fetch_by_id(conn, id)? else {
                return Ok(None);
            };
            let update = f(&current);
            if update.is_empty() {
                return Ok(Some(current));
            }
            apply_update(conn, id, &update)
        })
    }

    /// Closes the underlying connection. Calling it again is a no-op.
    pub fn close(&self) -> StoreResult<()> {
        let taken = self.conn.lock().take();
        if let Some(conn) = taken {
            conn.close().map_err(|(_, e)| StoreError::Sqlite(e))?;
            log::info!("Proxy store closed");
        }
        Ok(())
    }

    pub fn is_closed(&self) -> bool {
        self.conn.lock().is_none()
    }
}

pub fn create_tables(conn: &Connection) -> StoreResult<()> {
    log::debug!("Creating proxy tables if not exists...");
    conn.execute(
        "CREATE TABLE IF NOT EXISTS proxies (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            protocol TEXT NOT NULL,
            host TEXT NOT NULL,
            port INTEGER NOT NULL,
            username TEXT,
            password TEXT,
            fail_count INTEGER NOT NULL DEFAULT 0,
            success_count INTEGER NOT NULL DEFAULT 0,
            cooldown_until INTEGER,
            last_used_at INTEGER,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL
        )",
        [],
    )?;

    // Databases created before credentials were supported
    ensure_column(conn, "proxies", "username", "TEXT")?;
    ensure_column(conn, "proxies", "password", "TEXT")?;

    conn.execute(
        "CREATE UNIQUE INDEX IF NOT EXISTS idx_proxies_unique ON proxies(protocol, host, port)",
        [],
    )?;
    Ok(())
}

fn ensure_column(conn: &Connection, table: &str, column: &str, column_type: &str) -> StoreResult<()> {
    let mut stmt = conn.prepare(&format!("PRAGMA table_info({})", table))?;
    let names = stmt.query_map([], |row| row.get::<_, String>(1))?;
    for name in names {
        if name? == column {
            return Ok(());
        }
    }
    conn.execute(
        &format!("ALTER TABLE {} ADD COLUMN {} {}", table, column, column_type),
        [],
    )?;
    Ok(())
}

fn fetch_by_id(conn: &Connection, id: i64) -> StoreResult<Option<ProxyState>> {
    let row = conn
        .query_row(
            &format!("SELECT {} FROM proxies WHERE id = ?1", SELECT_COLUMNS),
            params![id],
            ProxyRow::from_row,
        )
        .optional()?;
    row.map(ProxyRow::into_state).transpose()
}

fn apply_update(conn: &Connection, id: i64, update: &ProxyStateUpdate) -> StoreResult<Option<ProxyState>> {
    let mut assignments: Vec<&str> = Vec::new();
    let mut values: Vec<Value> = Vec::new();

    if let Some(v) = update.fail_count {
        assignments.push("fail_count = ?");
        values.push(Value::Integer(i64::from(v)));
    }
    if let Some(v) = update.success_count {
        assignments.push("success_count = ?");
        values.push(Value::Integer(i64::from(v)));
    }
    if let Some(v) = update.cooldown_until {
        assignments.push("cooldown_until = ?");
        values.push(nullable(v));
    }
    if let Some(v) = update.last_used_at {
        assignments.push("last_used_at = ?");
        values.push(nullable(v));
    }
    if let Some(ref config) = update.config {
        assignments.extend(["protocol = ?", "host = ?", "port = ?", "username = ?", "password = ?"]);
        values.push(Value::Text(config.protocol.as_str().to_string()));
        values.push(Value::Text(config.host.clone()));
        values.push(Value::Integer(i64::from(config.port)));
        values.push(config.username.clone().map_or(Value::Null, Value::Text));
        values.push(config.password.clone().map_or(Value::Null, Value::Text));
    }

    if assignments.is_empty() {
        return fetch_by_id(conn, id);
    }

    assignments.push("updated_at = ?");
    values.push(Value::Integer(Utc::now().timestamp_millis()));
    values.push(Value::Integer(id));

    let sql = format!("UPDATE proxies SET {} WHERE id = ?", assignments.join(", "));
    conn.execute(&sql, params_from_iter(values))?;
    fetch_by_id(conn, id)
}

fn nullable(v: Option<i64>) -> Value {
    v.map_or(Value::Null, Value::Integer)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn http(host: &str, port: u16) -> ProxyConfig {
        ProxyConfig::new(ProxyProtocol::Http, host, port)
    }

    #[test]
    fn test_add_assigns_fresh_state() {
        let store = ProxyStore::open_in_memory().unwrap();
        let state = store.add(&http("proxy.test", 8080)).unwrap();
        assert!(state.id > 0);
        assert_eq!(state.fail_count, 0);
        assert_eq!(state.success_count, 0);
        assert_eq!(state.cooldown_until, None);
        assert_eq!(state.last_used_at, None);
        assert_eq!(state.config.host, "proxy.test");
    }

    #[test]
    fn test_add_is_idempotent_by_identity() {
        let store = ProxyStore::open_in_memory().unwrap();
        let first = store.add(&http("proxy.test", 8080)).unwrap();
        store
            .update_state(
                first.id,
                &ProxyStateUpdate {
                    fail_count: Some(2),
                    success_count: Some(7),
                    ..Default::default()
                },
            )
            .unwrap();

        let again = store
            .add(&http("proxy.test", 8080).with_credentials("other", Some("creds")))
            .unwrap();
        assert_eq!(again.id, first.id);
        assert_eq!(again.fail_count, 2);
        assert_eq!(again.success_count, 7);
        assert_eq!(again.config.username, None);
        assert_eq!(store.list().unwrap().len(), 1);

        // Different protocol is a different identity
        let socks = store.add(&ProxyConfig::new(ProxyProtocol::Socks5, "proxy.test", 8080)).unwrap();
        assert_ne!(socks.id, first.id);
        assert_eq!(store.list().unwrap().len(), 2);
    }

    #[test]
    fn test_update_state_merges_fields() {
        let store = ProxyStore::open_in_memory().unwrap();
        let state = store.add(&http("a", 1)).unwrap();

        let updated = store
            .update_state(
                state.id,
                &ProxyStateUpdate {
                    cooldown_until: Some(Some(1_000)),
                    last_used_at: Some(Some(500)),
                    ..Default::default()
                },
            )
            .unwrap()
            .unwrap();
        assert_eq!(updated.cooldown_until, Some(1_000));
        assert_eq!(updated.last_used_at, Some(500));
        assert_eq!(updated.fail_count, 0);

        let cleared = store
            .update_state(
                state.id,
                &ProxyStateUpdate {
                    cooldown_until: Some(None),
                    ..Default::default()
                },
            )
            .unwrap()
            .unwrap();
        assert_eq!(cleared.cooldown_until, None);
        assert_eq!(cleared.last_used_at, Some(500));
    }

    #[test]
    fn test_update_state_replaces_config() {
        let store = ProxyStore::open_in_memory().unwrap();
        let state = store.add(&http("a", 1)).unwrap();
        let replacement = http("b", 2).with_credentials("u", Some("p"));
        let updated = store
            .update_state(
                state.id,
                &ProxyStateUpdate {
                    config: Some(replacement.clone()),
                    ..Default::default()
                },
            )
            .unwrap()
            .unwrap();
        assert_eq!(updated.config, replacement);
    }

    #[test]
    fn test_unknown_id_is_absent() {
        let store = ProxyStore::open_in_memory().unwrap();
        assert!(store.get_by_id(42).unwrap().is_none());
        let update = ProxyStateUpdate {
            fail_count: Some(1),
            ..Default::default()
        };
        assert!(store.update_state(42, &update).unwrap().is_none());
        assert!(store.modify(42, |_| update.clone()).unwrap().is_none());
        store.remove(42).unwrap();
    }

    #[test]
    fn test_remove_deletes_record() {
        let store = ProxyStore::open_in_memory().unwrap();
        let a = store.add(&http("a", 1)).unwrap();
        let b = store.add(&http("b", 2)).unwrap();
        store.remove(a.id).unwrap();
        let remaining: Vec<i64> = store.list().unwrap().iter().map(|s| s.id).collect();
        assert_eq!(remaining, vec![b.id]);
    }

    #[test]
    fn test_modify_sees_current_state() {
        let store = ProxyStore::open_in_memory().unwrap();
        let state = store.add(&http("a", 1)).unwrap();
        for _ in 0..3 {
            store
                .modify(state.id, |s| ProxyStateUpdate {
                    fail_count: Some(s.fail_count + 1),
                    ..Default::default()
                })
                .unwrap();
        }
        assert_eq!(store.get_by_id(state.id).unwrap().unwrap().fail_count, 3);
    }

    #[test]
    fn test_close_is_idempotent() {
        let store = ProxyStore::open_in_memory().unwrap();
        store.add(&http("a", 1)).unwrap();
        store.close().unwrap();
        store.close().unwrap();
        assert!(store.is_closed());
        assert!(matches!(store.list(), Err(StoreError::Closed)));
    }

    #[test]
    fn test_ensure_column_is_repeatable() {
        let conn = Connection::open_in_memory().unwrap();
        create_tables(&conn).unwrap();
        create_tables(&conn).unwrap();
        ensure_column(&conn, "proxies", "username", "TEXT").unwrap();
    }
}
