//! Durable backing for the extension registry.
//!
//! The whole installed set persists under one key as a single JSON
//! document. `SqliteStore` shares the database file (and schema) the
//! storage capability uses, scoped to a host-reserved namespace so
//! extension keys can never collide with it.

use ext_store::{init_schema, kv_get, kv_set, StoreError};
use rusqlite::Connection;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Mutex;

/// The single durable key holding all persisted extension records.
pub const REGISTRY_KEY: &str = "lighthub.extensions";

const HOST_NAMESPACE: &str = "__host__";

/// Async access to the registry's one durable document.
#[allow(async_fn_in_trait)]
pub trait ExtensionStore {
    async fn read_document(&self) -> Result<Option<String>, StoreError>;
    async fn write_document(&self, document: String) -> Result<(), StoreError>;
}

/// Production store backed by the shared sqlite database.
pub struct SqliteStore {
    connection: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    pub async fn open(db_path: PathBuf) -> Result<Self, StoreError> {
        if let Some(parent) = db_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let connection =
            tokio::task::spawn_blocking(move || -> Result<Connection, StoreError> {
                let conn = Connection::open(&db_path)?;
                init_schema(&conn)?;
                Ok(conn)
            })
            .await
            .map_err(|e| StoreError::ConnectionFailed(e.to_string()))??;

        Ok(Self {
            connection: Arc::new(Mutex::new(connection)),
        })
    }
}

impl ExtensionStore for SqliteStore {
    async fn read_document(&self) -> Result<Option<String>, StoreError> {
        let conn = self.connection.lock().await;
        kv_get(&conn, HOST_NAMESPACE, REGISTRY_KEY)
    }

    async fn write_document(&self, document: String) -> Result<(), StoreError> {
        let conn = self.connection.lock().await;
        kv_set(&conn, HOST_NAMESPACE, REGISTRY_KEY, &document)
    }
}

/// In-memory store for tests. `fail_writes` simulates a durable-write
/// outage.
#[derive(Default)]
pub struct MemoryStore {
    document: Mutex<Option<String>>,
    pub fail_writes: bool,
}

#[allow(dead_code)]
impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing() -> Self {
        Self {
            document: Mutex::new(None),
            fail_writes: true,
        }
    }

    pub async fn document(&self) -> Option<String> {
        self.document.lock().await.clone()
    }

    pub async fn set_document(&self, document: Option<String>) {
        *self.document.lock().await = document;
    }
}

impl ExtensionStore for MemoryStore {
    async fn read_document(&self) -> Result<Option<String>, StoreError> {
        Ok(self.document.lock().await.clone())
    }

    async fn write_document(&self, document: String) -> Result<(), StoreError> {
        if self.fail_writes {
            return Err(StoreError::Generic("simulated write failure".to_string()));
        }
        *self.document.lock().await = Some(document);
        Ok(())
    }
}
