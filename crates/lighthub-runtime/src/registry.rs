//! Extension Registry - the process-wide collection of installed
//! extensions, with write-through persistence and best-effort
//! rehydration at startup.
//!
//! Only source text is durable. Manifests, closures, and isolates are
//! re-derived on every load, so a rehydrated extension is a fresh
//! identity with the same id, never a restored object graph.

use crate::loader::{LoadError, LoadedExtension, Loader};
use crate::store::ExtensionStore;
use chrono::Utc;
use ext_store::StoreError;
use lhub_archive::{icon_data_uri, ArchiveError};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use thiserror::Error;
use tracing::{info, warn};

const SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error(transparent)]
    Archive(#[from] ArchiveError),

    #[error(transparent)]
    Load(#[from] LoadError),

    #[error("Reading bundle {path}: {source}")]
    BundleRead {
        path: String,
        source: std::io::Error,
    },

    #[error(transparent)]
    Storage(#[from] StoreError),
}

/// One installed extension: the live isolate plus the install-time
/// record that backs it.
pub struct InstalledExtension {
    pub extension: LoadedExtension,
    pub icon_uri: Option<String>,
    pub installed_at: i64,
    source_code: String,
}

impl InstalledExtension {
    pub fn source_code(&self) -> &str {
        &self.source_code
    }
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PersistedDoc {
    schema_version: u32,
    records: BTreeMap<String, PersistedRecord>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PersistedRecord {
    source_code: String,
    icon_uri: Option<String>,
    installed_at: i64,
}

/// Exclusive owner of the installed set. Readers get references only;
/// every mutation goes through install/uninstall so the durable store
/// is written through before the operation completes.
pub struct ExtensionRegistry<S: ExtensionStore> {
    loader: Loader,
    store: S,
    installed: BTreeMap<String, InstalledExtension>,
}

impl<S: ExtensionStore> ExtensionRegistry<S> {
    pub fn new(loader: Loader, store: S) -> Self {
        Self {
            loader,
            store,
            installed: BTreeMap::new(),
        }
    }

    /// Unpack, load, and validate a bundle, then upsert it by manifest
    /// id. Any failure before the upsert leaves the collection
    /// untouched and surfaces the error verbatim.
    pub async fn install_bytes(&mut self, bytes: &[u8]) -> Result<String, RegistryError> {
        let bundle = lhub_archive::read(bytes).await?;
        let icon_uri = bundle.icon.as_deref().map(icon_data_uri);
        let extension = self.loader.load(&bundle.module_source)?;
        let id = extension.manifest.id.clone();

        let replaced = self
            .installed
            .insert(
                id.clone(),
                InstalledExtension {
                    extension,
                    icon_uri,
                    installed_at: Utc::now().timestamp(),
                    source_code: bundle.module_source,
                },
            )
            .is_some();
        info!(id = %id, replaced, "extension installed");

        self.persist().await;
        Ok(id)
    }

    pub async fn install_file(&mut self, path: &Path) -> Result<String, RegistryError> {
        let bytes = tokio::fs::read(path)
            .await
            .map_err(|source| RegistryError::BundleRead {
                path: path.display().to_string(),
                source,
            })?;
        self.install_bytes(&bytes).await
    }

    /// Idempotent removal. Returns whether anything was installed
    /// under the id. Persists even when the id was not in memory, so
    /// a durable record whose source no longer loads (and was skipped
    /// at rehydration) can still be purged from the store.
    pub async fn uninstall(&mut self, id: &str) -> bool {
        let removed = self.installed.remove(id).is_some();
        if removed {
            info!(id = %id, "extension uninstalled");
        }
        self.persist().await;
        removed
    }

    /// Reload every persisted record, skipping the ones that fail.
    /// Never fatal: a corrupted record must not block the others or
    /// the host. Returns the number of extensions restored.
    pub async fn rehydrate_all(&mut self) -> usize {
        let document = match self.store.read_document().await {
            Ok(doc) => doc,
            Err(e) => {
                warn!(error = %e, "could not read persisted extensions");
                return 0;
            }
        };
        let Some(document) = document else {
            return 0;
        };
        let doc: PersistedDoc = match serde_json::from_str(&document) {
            Ok(doc) => doc,
            Err(e) => {
                warn!(error = %e, "persisted extension document is malformed");
                return 0;
            }
        };
        if doc.schema_version != SCHEMA_VERSION {
            warn!(
                stored = doc.schema_version,
                supported = SCHEMA_VERSION,
                "unsupported persisted schema version, skipping rehydration"
            );
            return 0;
        }

        let mut restored = 0;
        let mut skipped = 0;
        for (id, record) in doc.records {
            match self.loader.load(&record.source_code) {
                Ok(extension) => {
                    if extension.manifest.id != id {
                        warn!(
                            key = %id,
                            manifest = %extension.manifest.id,
                            "persisted key does not match manifest id"
                        );
                    }
                    self.installed.insert(
                        extension.manifest.id.clone(),
                        InstalledExtension {
                            extension,
                            icon_uri: record.icon_uri,
                            installed_at: record.installed_at,
                            source_code: record.source_code,
                        },
                    );
                    restored += 1;
                }
                Err(e) => {
                    warn!(id = %id, error = %e, "dropping persisted extension that failed to load");
                    skipped += 1;
                }
            }
        }
        if skipped > 0 {
            // Rewrite the document without the dropped records so they
            // are not retried at the next startup.
            self.persist().await;
        }
        restored
    }

    /// Write-through persist of the whole installed set. A failed
    /// durable write is logged, not rolled back; the in-memory state
    /// stays ahead of the store until the next successful write.
    async fn persist(&self) {
        let doc = PersistedDoc {
            schema_version: SCHEMA_VERSION,
            records: self
                .installed
                .iter()
                .map(|(id, installed)| {
                    (
                        id.clone(),
                        PersistedRecord {
                            source_code: installed.source_code.clone(),
                            icon_uri: installed.icon_uri.clone(),
                            installed_at: installed.installed_at,
                        },
                    )
                })
                .collect(),
        };
        let json = match serde_json::to_string(&doc) {
            Ok(json) => json,
            Err(e) => {
                warn!(error = %e, "could not serialize persisted extensions");
                return;
            }
        };
        if let Err(e) = self.store.write_document(json).await {
            warn!(error = %e, "durable write failed, in-memory registry is ahead of the store");
        }
    }

    pub fn get(&self, id: &str) -> Option<&InstalledExtension> {
        self.installed.get(id)
    }

    pub fn get_mut(&mut self, id: &str) -> Option<&mut InstalledExtension> {
        self.installed.get_mut(id)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &InstalledExtension)> {
        self.installed.iter().map(|(id, e)| (id.as_str(), e))
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (&str, &mut InstalledExtension)> {
        self.installed.iter_mut().map(|(id, e)| (id.as_str(), e))
    }

    pub fn len(&self) -> usize {
        self.installed.len()
    }

    pub fn is_empty(&self) -> bool {
        self.installed.is_empty()
    }

    pub fn store(&self) -> &S {
        &self.store
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use std::io::{Cursor, Write};
    use zip::write::SimpleFileOptions;
    use zip::ZipWriter;

    fn make_bundle(source: &str) -> Vec<u8> {
        let mut cursor = Cursor::new(Vec::new());
        let mut writer = ZipWriter::new(&mut cursor);
        let options = SimpleFileOptions::default();
        writer.start_file("main.js", options).unwrap();
        writer.write_all(source.as_bytes()).unwrap();
        writer.finish().unwrap();
        cursor.into_inner()
    }

    fn sample_source(id: &str, name: &str) -> String {
        format!(
            r#"module.exports = {{
                id: "{id}",
                name: "{name}",
                version: "1.0.0",
                tabs: [{{
                    id: "home",
                    label: "Home",
                    icon: "home",
                    component: () => View({{}}, Text({{}}, "{name}")),
                }}],
            }};"#
        )
    }

    fn registry(dir: &tempfile::TempDir) -> ExtensionRegistry<MemoryStore> {
        ExtensionRegistry::new(Loader::new(dir.path().to_path_buf()), MemoryStore::new())
    }

    fn registry_with_store(
        dir: &tempfile::TempDir,
        store: MemoryStore,
    ) -> ExtensionRegistry<MemoryStore> {
        ExtensionRegistry::new(Loader::new(dir.path().to_path_buf()), store)
    }

    #[tokio::test]
    async fn install_then_uninstall_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let mut registry = registry(&dir);

        let id = registry
            .install_bytes(&make_bundle(&sample_source("com.t.x", "X")))
            .await
            .unwrap();
        assert_eq!(id, "com.t.x");
        assert!(registry.get("com.t.x").is_some());
        assert!(registry
            .store()
            .document()
            .await
            .unwrap()
            .contains("com.t.x"));

        assert!(registry.uninstall("com.t.x").await);
        assert!(registry.get("com.t.x").is_none());
        assert!(!registry
            .store()
            .document()
            .await
            .unwrap()
            .contains("com.t.x"));
    }

    #[tokio::test]
    async fn uninstall_of_unknown_id_is_a_noop() {
        let dir = tempfile::tempdir().unwrap();
        let mut registry = registry(&dir);
        assert!(!registry.uninstall("com.t.missing").await);
    }

    #[tokio::test]
    async fn duplicate_id_install_is_an_upsert() {
        let dir = tempfile::tempdir().unwrap();
        let mut registry = registry(&dir);

        registry
            .install_bytes(&make_bundle(&sample_source("com.t.x", "First")))
            .await
            .unwrap();
        registry
            .install_bytes(&make_bundle(&sample_source("com.t.x", "Second")))
            .await
            .unwrap();

        assert_eq!(registry.len(), 1);
        let installed = registry.get("com.t.x").unwrap();
        assert_eq!(installed.extension.manifest.name, "Second");
        assert!(installed.source_code().contains("Second"));
        assert!(registry
            .store()
            .document()
            .await
            .unwrap()
            .contains("Second"));
    }

    #[tokio::test]
    async fn failed_install_leaves_the_collection_unchanged() {
        let dir = tempfile::tempdir().unwrap();
        let mut registry = registry(&dir);
        registry
            .install_bytes(&make_bundle(&sample_source("com.t.x", "X")))
            .await
            .unwrap();

        let err = registry
            .install_bytes(&make_bundle("module.exports = { name: \"NoId\" };"))
            .await
            .unwrap_err();
        assert!(matches!(err, RegistryError::Load(_)));
        assert_eq!(registry.len(), 1);

        let err = registry.install_bytes(b"not a zip at all").await.unwrap_err();
        assert!(matches!(err, RegistryError::Archive(_)));
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn rehydration_skips_the_corrupt_record() {
        let dir = tempfile::tempdir().unwrap();

        // First life: install three extensions.
        let store = {
            let mut registry = registry(&dir);
            for (id, name) in [("com.t.a", "A"), ("com.t.b", "B"), ("com.t.c", "C")] {
                registry
                    .install_bytes(&make_bundle(&sample_source(id, name)))
                    .await
                    .unwrap();
            }
            registry.store().document().await.unwrap()
        };

        // Corrupt the middle record's source in the durable document.
        let mut doc: serde_json::Value = serde_json::from_str(&store).unwrap();
        doc["records"]["com.t.b"]["sourceCode"] = serde_json::json!("module.exports = {");
        let store = MemoryStore::new();
        store.set_document(Some(doc.to_string())).await;

        // Second life: the corrupt record is skipped, the others load.
        let mut registry = registry_with_store(&dir, store);
        assert_eq!(registry.rehydrate_all().await, 2);
        assert!(registry.get("com.t.a").is_some());
        assert!(registry.get("com.t.b").is_none());
        assert!(registry.get("com.t.c").is_some());

        // The dropped record is purged from the document, not retried
        // at the next startup.
        let document = registry.store().document().await.unwrap();
        assert!(!document.contains("com.t.b"));
        assert!(document.contains("com.t.a"));
        assert!(document.contains("com.t.c"));
    }

    #[tokio::test]
    async fn uninstall_purges_a_record_the_registry_never_loaded() {
        let dir = tempfile::tempdir().unwrap();

        let document = {
            let mut registry = registry(&dir);
            registry
                .install_bytes(&make_bundle(&sample_source("com.t.a", "A")))
                .await
                .unwrap();
            registry
                .install_bytes(&make_bundle(&sample_source("com.t.b", "B")))
                .await
                .unwrap();
            registry.store().document().await.unwrap()
        };

        // New life, no rehydration: both records exist only in the
        // store. Uninstalling one still rewrites the document even
        // though nothing was removed from memory.
        let store = MemoryStore::new();
        store.set_document(Some(document)).await;
        let mut registry = registry_with_store(&dir, store);

        assert!(!registry.uninstall("com.t.b").await);
        let document = registry.store().document().await.unwrap();
        assert!(!document.contains("com.t.b"));
    }

    #[tokio::test]
    async fn fresh_lifecycle_survives_a_restart() {
        let dir = tempfile::tempdir().unwrap();

        let document = {
            let mut registry = registry(&dir);
            registry
                .install_bytes(&make_bundle(&sample_source("com.t.x", "X")))
                .await
                .unwrap();
            assert_eq!(registry.len(), 1);
            registry.store().document().await.unwrap()
        };

        let store = MemoryStore::new();
        store.set_document(Some(document)).await;
        let mut registry = registry_with_store(&dir, store);
        assert_eq!(registry.rehydrate_all().await, 1);

        let installed = registry.get_mut("com.t.x").unwrap();
        assert_eq!(installed.extension.manifest.id, "com.t.x");
        // Re-derived, not restored: the isolate renders from scratch.
        let tree = installed.extension.render_tab("home").unwrap();
        assert_eq!(tree["type"], "view");
    }

    #[tokio::test]
    async fn rehydration_of_unknown_schema_version_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let store = MemoryStore::new();
        store
            .set_document(Some(r#"{"schemaVersion":99,"records":{}}"#.to_string()))
            .await;
        let mut registry = registry_with_store(&dir, store);
        assert_eq!(registry.rehydrate_all().await, 0);
    }

    #[tokio::test]
    async fn write_failure_keeps_the_in_memory_change() {
        let dir = tempfile::tempdir().unwrap();
        let mut registry = registry_with_store(&dir, MemoryStore::failing());

        registry
            .install_bytes(&make_bundle(&sample_source("com.t.x", "X")))
            .await
            .unwrap();
        assert_eq!(registry.len(), 1);
        assert!(registry.store().document().await.is_none());
    }

    #[tokio::test]
    async fn missing_entry_point_error_reaches_the_caller() {
        let dir = tempfile::tempdir().unwrap();
        let mut registry = registry(&dir);

        let mut cursor = Cursor::new(Vec::new());
        let mut writer = ZipWriter::new(&mut cursor);
        writer
            .start_file("readme.txt", SimpleFileOptions::default())
            .unwrap();
        writer.write_all(b"hello").unwrap();
        writer.finish().unwrap();

        let err = registry
            .install_bytes(&cursor.into_inner())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("readme.txt"));
        assert!(registry.is_empty());
    }
}
