//! Extension Loader - evaluates untrusted extension source inside a
//! dedicated isolate and validates the exported manifest.
//!
//! Each loaded extension owns its own `JsRuntime`. The capability
//! prelude runs first, then the extension source is evaluated as a
//! function body whose only visible names are the capability table
//! keys plus `module`/`exports`. The export object never crosses the
//! boundary as live values; the prelude projects it to a structural
//! JSON description which is validated here, field by field.

use crate::caps::{CapabilityRegistry, PRELUDE};
use crate::host_ext::{self, HostInfo};
use deno_core::{JsRuntime, PollEventLoopOptions, RuntimeOptions};
use ext_nav::NavRegistry;
use serde::Serialize;
use serde_json::Value;
use std::path::PathBuf;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum LoadError {
    /// The source failed to parse or threw during top-level execution.
    #[error("Extension evaluation failed: {0}")]
    Evaluation(String),

    /// The exported object violates the manifest contract.
    #[error("Invalid manifest: {field} {reason}")]
    ManifestValidation { field: String, reason: String },

    /// The prelude's manifest projection could not be decoded.
    #[error("Manifest projection was not valid JSON: {0}")]
    Projection(String),
}

fn invalid(field: impl Into<String>, reason: impl Into<String>) -> LoadError {
    LoadError::ManifestValidation {
        field: field.into(),
        reason: reason.into(),
    }
}

// ============================================================================
// Manifest
// ============================================================================

/// Validated structural description of an extension: identity plus tabs.
/// Re-derived from source on every load, never persisted directly.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExtensionManifest {
    pub id: String,
    pub name: String,
    pub version: String,
    pub description: Option<String>,
    pub tabs: Vec<TabManifest>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TabManifest {
    pub id: String,
    pub label: String,
    pub icon: String,
    pub icon_active: Option<String>,
    /// Names of the sub-screens reachable via navigation push.
    pub screens: Vec<String>,
}

fn string_field(owner: &Value, key: &str, path: &str) -> Result<String, LoadError> {
    match owner.get(key) {
        None | Some(Value::Null) => Err(invalid(path, "is missing")),
        Some(Value::String(s)) if s.is_empty() => Err(invalid(path, "must not be empty")),
        Some(Value::String(s)) => Ok(s.clone()),
        Some(_) => Err(invalid(path, "must be a string")),
    }
}

fn optional_string_field(owner: &Value, key: &str, path: &str) -> Result<Option<String>, LoadError> {
    match owner.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => Ok(Some(s.clone())),
        Some(_) => Err(invalid(path, "must be a string")),
    }
}

/// Validate the prelude's structural projection of the export object.
/// Fails fast on the first violation, naming the offending field.
fn validate_manifest(projection: &Value) -> Result<ExtensionManifest, LoadError> {
    if projection.get("exported").and_then(Value::as_bool) != Some(true) {
        return Err(invalid("exports", "module did not export an object"));
    }

    let id = string_field(projection, "id", "id")?;
    let name = string_field(projection, "name", "name")?;
    let version = string_field(projection, "version", "version")?;
    let description = optional_string_field(projection, "description", "description")?;

    if projection.get("tabsIsArray").and_then(Value::as_bool) == Some(false) {
        return Err(invalid("tabs", "must be an array"));
    }
    let raw_tabs = match projection.get("tabs").and_then(Value::as_array) {
        Some(tabs) => tabs,
        None => return Err(invalid("tabs", "is missing")),
    };
    if raw_tabs.is_empty() {
        return Err(invalid("tabs", "must not be empty"));
    }

    let mut tabs = Vec::with_capacity(raw_tabs.len());
    for (idx, raw) in raw_tabs.iter().enumerate() {
        let path = format!("tabs[{idx}]");
        if raw.get("object").and_then(Value::as_bool) != Some(true) {
            return Err(invalid(path, "must be an object"));
        }

        let tab_id = string_field(raw, "id", &format!("{path}.id"))?;
        if tabs.iter().any(|t: &TabManifest| t.id == tab_id) {
            return Err(invalid(format!("{path}.id"), "duplicates an earlier tab id"));
        }
        let label = string_field(raw, "label", &format!("{path}.label"))?;
        let icon = string_field(raw, "icon", &format!("{path}.icon"))?;
        let icon_active = optional_string_field(raw, "iconActive", &format!("{path}.iconActive"))?;

        if raw.get("hasComponent").and_then(Value::as_bool) != Some(true) {
            return Err(invalid(format!("{path}.component"), "must be a function"));
        }
        if raw.get("screensIsMapping").and_then(Value::as_bool) == Some(false) {
            return Err(invalid(
                format!("{path}.screens"),
                "must be a mapping of screen names to functions",
            ));
        }
        let screens = raw
            .get("screens")
            .and_then(Value::as_array)
            .map(|names| {
                names
                    .iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();

        tabs.push(TabManifest {
            id: tab_id,
            label,
            icon,
            icon_active,
            screens,
        });
    }

    Ok(ExtensionManifest {
        id,
        name,
        version,
        description,
        tabs,
    })
}

// ============================================================================
// Loader
// ============================================================================

/// Builds one isolate per extension and runs the load protocol.
pub struct Loader {
    data_dir: PathBuf,
}

impl Loader {
    pub fn new(data_dir: PathBuf) -> Self {
        Self { data_dir }
    }

    fn db_path(&self) -> PathBuf {
        self.data_dir.join("store.db")
    }

    /// Evaluate `module_source` in a fresh isolate and validate its
    /// exported manifest. Neither evaluation nor validation failures
    /// touch anything outside the isolate, which is dropped on error.
    pub fn load(&self, module_source: &str) -> Result<LoadedExtension, LoadError> {
        let registry = CapabilityRegistry::new();
        let mut js = JsRuntime::new(RuntimeOptions {
            extensions: registry.build_extensions(),
            ..Default::default()
        });

        {
            let op_state = js.op_state();
            let mut state = op_state.borrow_mut();
            ext_log::init_log_state(&mut state, "unloaded".to_string());
            ext_store::init_store_state(&mut state, self.db_path(), "shared".to_string());
            ext_fetch::init_fetch_state(&mut state, None);
            ext_nav::init_nav_state(&mut state);
            host_ext::init_host_state(&mut state, HostInfo::default());
        }

        js.execute_script("lighthub:prelude", PRELUDE)
            .map_err(|e| LoadError::Evaluation(e.to_string()))?;

        let source_literal = serde_json::to_string(module_source)
            .map_err(|e| LoadError::Evaluation(e.to_string()))?;
        let value = js
            .execute_script("lighthub:load", format!("__lhub_load({source_literal})"))
            .map_err(|e| LoadError::Evaluation(e.to_string()))?;
        let projection = read_script_string(&mut js, value);
        let projection: Value = serde_json::from_str(&projection)
            .map_err(|e| LoadError::Projection(e.to_string()))?;

        let manifest = validate_manifest(&projection)?;
        debug!(id = %manifest.id, tabs = manifest.tabs.len(), "manifest validated");

        // The isolate's log lines and storage keys are scoped to the
        // manifest id from here on.
        {
            let op_state = js.op_state();
            let mut state = op_state.borrow_mut();
            ext_log::set_log_source(&mut state, manifest.id.clone());
            ext_store::set_store_namespace(&mut state, manifest.id.clone());
        }

        Ok(LoadedExtension { js, manifest })
    }
}

fn read_script_string(js: &mut JsRuntime, value: deno_core::v8::Global<deno_core::v8::Value>) -> String {
    let scope = &mut js.handle_scope();
    let local = deno_core::v8::Local::new(scope, value);
    local
        .to_string(scope)
        .map(|s| s.to_rust_string_lossy(scope))
        .unwrap_or_default()
}

// ============================================================================
// Loaded extension
// ============================================================================

/// A validated extension together with the live isolate its tab and
/// screen functions run in.
pub struct LoadedExtension {
    js: JsRuntime,
    pub manifest: ExtensionManifest,
}

impl LoadedExtension {
    /// Render a tab's root component. Returns the render tree as JSON;
    /// a throwing component yields an `error-panel` node instead of
    /// propagating the fault.
    pub fn render_tab(&mut self, tab_id: &str) -> Result<Value, LoadError> {
        self.render(tab_id, None, None)
    }

    /// Render a named sub-screen. `params` of `None` means "use the
    /// navigation stack's current top-of-stack params". Unknown screen
    /// names yield a `screen-missing` placeholder node.
    pub fn render_screen(
        &mut self,
        tab_id: &str,
        screen: &str,
        params: Option<&Value>,
    ) -> Result<Value, LoadError> {
        self.render(tab_id, Some(screen), params)
    }

    fn render(
        &mut self,
        tab_id: &str,
        screen: Option<&str>,
        params: Option<&Value>,
    ) -> Result<Value, LoadError> {
        let tab_literal = serde_json::to_string(tab_id)
            .map_err(|e| LoadError::Evaluation(e.to_string()))?;
        let screen_literal = match screen {
            Some(name) => serde_json::to_string(name)
                .map_err(|e| LoadError::Evaluation(e.to_string()))?,
            None => "null".to_string(),
        };
        let params_literal = match params {
            Some(value) => value.to_string(),
            None => "null".to_string(),
        };

        let value = self
            .js
            .execute_script(
                "lighthub:render",
                format!("__lhub_render({tab_literal}, {screen_literal}, {params_literal})"),
            )
            .map_err(|e| LoadError::Evaluation(e.to_string()))?;
        let tree = read_script_string(&mut self.js, value);
        serde_json::from_str(&tree).map_err(|e| LoadError::Projection(e.to_string()))
    }

    /// Relay a platform media button press into the isolate's
    /// registered handler. Returns whether a handler actually ran, so
    /// the host can try the next isolate when this one has none. Seek
    /// carries the target position as the handler argument.
    pub fn dispatch_media_handler(
        &mut self,
        handler: &str,
        arg: Option<f64>,
    ) -> Result<bool, LoadError> {
        let literal = serde_json::to_string(handler)
            .map_err(|e| LoadError::Evaluation(e.to_string()))?;
        let arg = match arg {
            Some(value) if value.is_finite() => value.to_string(),
            Some(_) => "0".to_string(),
            None => "undefined".to_string(),
        };
        let handled = self
            .js
            .execute_script(
                "lighthub:media",
                format!("__lhub_media_dispatch({literal}, {arg})"),
            )
            .map_err(|e| LoadError::Evaluation(e.to_string()))?;
        Ok(read_script_string(&mut self.js, handled) == "true")
    }

    /// Run against this isolate's navigation registry.
    pub fn with_navigation<R>(&mut self, f: impl FnOnce(&mut NavRegistry) -> R) -> R {
        let op_state = self.js.op_state();
        let mut state = op_state.borrow_mut();
        if state.try_borrow::<NavRegistry>().is_none() {
            state.put(NavRegistry::default());
        }
        f(state.borrow_mut::<NavRegistry>())
    }

    /// Drive every in-flight or queued navigation transition to rest.
    pub fn settle_navigation(&mut self) {
        self.with_navigation(|registry| {
            for stack in registry.stacks.values_mut() {
                stack.settle();
            }
        });
    }

    /// Resolve pending async ops (storage writes, fetches) started by
    /// extension code.
    pub async fn pump(&mut self) -> Result<(), LoadError> {
        self.js
            .run_event_loop(PollEventLoopOptions {
                wait_for_inspector: false,
                pump_v8_message_loop: true,
            })
            .await
            .map_err(|e| LoadError::Evaluation(e.to_string()))
    }
}
