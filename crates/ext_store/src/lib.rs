//! Asynchronous key-value storage capability.
//!
//! SQLite-backed, one database per host. Keys are namespaced with the
//! owning extension's id so extensions cannot read or clobber each
//! other's entries. Values are strings, matching the capability
//! surface extensions see.

use deno_core::{op2, Extension, OpState};
use rusqlite::Connection;
use std::cell::RefCell;
use std::path::PathBuf;
use std::rc::Rc;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::debug;

/// Namespace/key separator. U+001F cannot appear in a manifest id, so
/// a hostile key cannot escape its namespace.
const NS_SEP: char = '\u{1f}';

#[derive(Debug, thiserror::Error, deno_error::JsError)]
pub enum StoreError {
    #[error("Storage error: {0}")]
    #[class(generic)]
    Generic(String),

    #[error("Invalid key: {0}")]
    #[class(generic)]
    InvalidKey(String),

    #[error("Database error: {0}")]
    #[class(generic)]
    Database(String),

    #[error("Connection failed: {0}")]
    #[class(generic)]
    ConnectionFailed(String),
}

impl From<rusqlite::Error> for StoreError {
    fn from(e: rusqlite::Error) -> Self {
        Self::Database(e.to_string())
    }
}

impl From<std::io::Error> for StoreError {
    fn from(e: std::io::Error) -> Self {
        Self::Generic(e.to_string())
    }
}

// ============================================================================
// State Types
// ============================================================================

/// Where the database lives. Installed by the host before any op runs.
pub struct StoreConfig {
    pub db_path: PathBuf,
}

/// Namespace the current runtime's keys are scoped to.
///
/// Starts as `shared` and is rescoped to the manifest id once the
/// loader has validated it.
pub struct StoreNamespace {
    pub namespace: String,
}

/// Live database connection, opened lazily on first use.
pub struct StoreConnection {
    pub connection: Arc<Mutex<Connection>>,
}

// ============================================================================
// Core key-value operations (shared by ops and host code)
// ============================================================================

fn scoped_key(namespace: &str, key: &str) -> String {
    format!("{namespace}{NS_SEP}{key}")
}

pub fn kv_get(conn: &Connection, namespace: &str, key: &str) -> Result<Option<String>, StoreError> {
    let result: Result<String, rusqlite::Error> = conn.query_row(
        "SELECT value FROM kv_store WHERE key = ?",
        [scoped_key(namespace, key)],
        |row| row.get(0),
    );
    match result {
        Ok(value) => Ok(Some(value)),
        Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
        Err(e) => Err(StoreError::from(e)),
    }
}

pub fn kv_set(
    conn: &Connection,
    namespace: &str,
    key: &str,
    value: &str,
) -> Result<(), StoreError> {
    if key.is_empty() {
        return Err(StoreError::InvalidKey("Key cannot be empty".to_string()));
    }
    conn.execute(
        "INSERT INTO kv_store (key, value, updated_at) VALUES (?, ?, strftime('%s', 'now'))
         ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = strftime('%s', 'now')",
        rusqlite::params![scoped_key(namespace, key), value],
    )?;
    Ok(())
}

pub fn kv_remove(conn: &Connection, namespace: &str, key: &str) -> Result<bool, StoreError> {
    let rows = conn.execute(
        "DELETE FROM kv_store WHERE key = ?",
        [scoped_key(namespace, key)],
    )?;
    Ok(rows > 0)
}

/// Open (or create) the key-value table on a connection.
pub fn init_schema(conn: &Connection) -> Result<(), StoreError> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS kv_store (
            key TEXT PRIMARY KEY NOT NULL,
            value TEXT NOT NULL,
            created_at INTEGER DEFAULT (strftime('%s', 'now')),
            updated_at INTEGER DEFAULT (strftime('%s', 'now'))
        )",
        [],
    )?;
    Ok(())
}

// ============================================================================
// Connection management
// ============================================================================

async fn get_connection(
    state: &Rc<RefCell<OpState>>,
) -> Result<Arc<Mutex<Connection>>, StoreError> {
    {
        let s = state.borrow();
        if let Some(conn) = s.try_borrow::<StoreConnection>() {
            return Ok(conn.connection.clone());
        }
    }

    let db_path = {
        let s = state.borrow();
        s.try_borrow::<StoreConfig>()
            .map(|c| c.db_path.clone())
            .ok_or_else(|| StoreError::ConnectionFailed("store not configured".to_string()))?
    };

    if let Some(parent) = db_path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }

    let connection = tokio::task::spawn_blocking(move || -> Result<Connection, StoreError> {
        let conn = Connection::open(&db_path)?;
        init_schema(&conn)?;
        Ok(conn)
    })
    .await
    .map_err(|e| StoreError::ConnectionFailed(e.to_string()))??;

    let connection = Arc::new(Mutex::new(connection));
    state.borrow_mut().put(StoreConnection {
        connection: connection.clone(),
    });
    Ok(connection)
}

fn current_namespace(state: &Rc<RefCell<OpState>>) -> String {
    state
        .borrow()
        .try_borrow::<StoreNamespace>()
        .map(|n| n.namespace.clone())
        .unwrap_or_else(|| "shared".to_string())
}

// ============================================================================
// Operations
// ============================================================================

#[op2(async)]
#[serde]
async fn op_store_get(
    state: Rc<RefCell<OpState>>,
    #[string] key: String,
) -> Result<Option<String>, StoreError> {
    let ns = current_namespace(&state);
    debug!(namespace = %ns, key = %key, "store.get");

    let conn = get_connection(&state).await?;
    let conn = conn.lock().await;
    kv_get(&conn, &ns, &key)
}

#[op2(async)]
async fn op_store_set(
    state: Rc<RefCell<OpState>>,
    #[string] key: String,
    #[string] value: String,
) -> Result<(), StoreError> {
    let ns = current_namespace(&state);
    debug!(namespace = %ns, key = %key, "store.set");

    let conn = get_connection(&state).await?;
    let conn = conn.lock().await;
    kv_set(&conn, &ns, &key, &value)
}

#[op2(async)]
async fn op_store_remove(
    state: Rc<RefCell<OpState>>,
    #[string] key: String,
) -> Result<bool, StoreError> {
    let ns = current_namespace(&state);
    debug!(namespace = %ns, key = %key, "store.remove");

    let conn = get_connection(&state).await?;
    let conn = conn.lock().await;
    kv_remove(&conn, &ns, &key)
}

// ============================================================================
// State Initialization
// ============================================================================

/// Configure the database path and initial namespace for a runtime.
pub fn init_store_state(state: &mut OpState, db_path: PathBuf, namespace: String) {
    state.put(StoreConfig { db_path });
    state.put(StoreNamespace { namespace });
}

/// Rescope the key namespace (called once the manifest id is known).
pub fn set_store_namespace(state: &mut OpState, namespace: String) {
    state.put(StoreNamespace { namespace });
}

deno_core::extension!(
    lhub_store,
    ops = [
        op_store_get,
        op_store_set,
        op_store_remove,
    ]
);

pub fn store_extension() -> Extension {
    lhub_store::ext()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_conn() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        init_schema(&conn).unwrap();
        conn
    }

    #[test]
    fn roundtrip_within_namespace() {
        let conn = test_conn();
        kv_set(&conn, "com.t.x", "track", "42").unwrap();
        assert_eq!(
            kv_get(&conn, "com.t.x", "track").unwrap(),
            Some("42".to_string())
        );
        assert!(kv_remove(&conn, "com.t.x", "track").unwrap());
        assert_eq!(kv_get(&conn, "com.t.x", "track").unwrap(), None);
    }

    #[test]
    fn namespaces_are_isolated() {
        let conn = test_conn();
        kv_set(&conn, "com.a", "k", "from-a").unwrap();
        kv_set(&conn, "com.b", "k", "from-b").unwrap();
        assert_eq!(kv_get(&conn, "com.a", "k").unwrap().unwrap(), "from-a");
        assert_eq!(kv_get(&conn, "com.b", "k").unwrap().unwrap(), "from-b");
        assert_eq!(kv_get(&conn, "com.c", "k").unwrap(), None);
    }

    #[test]
    fn empty_key_is_rejected() {
        let conn = test_conn();
        let err = kv_set(&conn, "ns", "", "v").unwrap_err();
        assert!(matches!(err, StoreError::InvalidKey(_)));
    }

    #[test]
    fn removing_absent_key_is_false_not_error() {
        let conn = test_conn();
        assert!(!kv_remove(&conn, "ns", "missing").unwrap());
    }
}
