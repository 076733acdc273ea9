//! LightHub Runtime - host for sandboxed `.lhub` extensions.
//!
//! Loads untrusted extension bundles into per-extension V8 isolates
//! with a fixed capability surface, persists them across restarts, and
//! drives their tab/screen render functions headlessly.
//!
//! # Startup flow
//!
//! 1. Initialize tracing (`LIGHTHUB_LOG`, default "info")
//! 2. Open the sqlite-backed extension store under `--data-dir`
//! 3. Rehydrate persisted extensions (best effort, per record)
//! 4. Apply `--install` / `--uninstall` actions
//! 5. Mount the media bridge, smoke-render every installed tab, and
//!    relay queued media events back into their isolates
//!
//! # Environment Variables
//!
//! - `LIGHTHUB_LOG` - Log level filter (default: "info")

use anyhow::{Context, Result};
use std::env;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

mod caps;
mod host_ext;
mod loader;
mod registry;
mod store;

use loader::Loader;
use registry::ExtensionRegistry;
use store::SqliteStore;

/// Serializes tests that mount the process-wide media bridge slot.
#[cfg(test)]
pub(crate) mod test_support {
    use std::sync::{Mutex, MutexGuard};

    static MEDIA_BRIDGE_SLOT: Mutex<()> = Mutex::new(());

    pub(crate) fn media_bridge_guard() -> MutexGuard<'static, ()> {
        MEDIA_BRIDGE_SLOT
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn main() -> Result<()> {
    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .expect("Failed to create tokio runtime");

    let _guard = rt.enter();

    sync_main(rt)
}

fn sync_main(rt: tokio::runtime::Runtime) -> Result<()> {
    use tracing_subscriber::EnvFilter;
    let filter =
        EnvFilter::try_from_env("LIGHTHUB_LOG").unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .init();

    // Parse args: --data-dir <dir> [--dev] [--install <bundle.lhub>]
    //             [--uninstall <id>] [--list]
    let mut args = env::args().skip(1);
    let mut data_dir: Option<PathBuf> = None;
    let mut dev_mode = false;
    let mut installs: Vec<PathBuf> = Vec::new();
    let mut uninstalls: Vec<String> = Vec::new();
    let mut list = false;
    while let Some(a) = args.next() {
        match a.as_str() {
            "--data-dir" => {
                data_dir = Some(PathBuf::from(
                    args.next().context("--data-dir requires a path")?,
                ));
            }
            "--dev" => {
                dev_mode = true;
            }
            "--install" => {
                installs.push(PathBuf::from(
                    args.next().context("--install requires a bundle path")?,
                ));
            }
            "--uninstall" => {
                uninstalls.push(args.next().context("--uninstall requires an extension id")?);
            }
            "--list" => {
                list = true;
            }
            _ => {}
        }
    }

    let data_dir = match data_dir {
        Some(dir) => dir,
        None => dirs::data_dir()
            .map(|d| d.join("lighthub"))
            .context("no platform data directory; pass --data-dir <path>")?,
    };

    if dev_mode {
        tracing::info!("Running in dev mode - rendering every declared screen");
    }

    rt.block_on(run(data_dir, dev_mode, installs, uninstalls, list))
}

async fn run(
    data_dir: PathBuf,
    dev_mode: bool,
    installs: Vec<PathBuf>,
    uninstalls: Vec<String>,
    list: bool,
) -> Result<()> {
    tracing::info!("Data directory: {}", data_dir.display());

    let store = SqliteStore::open(data_dir.join("store.db"))
        .await
        .context("opening extension store")?;
    let mut registry = ExtensionRegistry::new(Loader::new(data_dir), store);

    let restored = registry.rehydrate_all().await;
    tracing::info!("Restored {} persisted extension(s)", restored);

    for path in installs {
        match registry.install_file(&path).await {
            Ok(id) => tracing::info!(id = %id, path = %path.display(), "installed"),
            Err(e) => tracing::error!(path = %path.display(), error = %e, "install failed"),
        }
    }

    for id in uninstalls {
        if !registry.uninstall(&id).await {
            tracing::info!(id = %id, "nothing installed under that id");
        }
    }

    if list {
        for (id, installed) in registry.iter() {
            let manifest = &installed.extension.manifest;
            println!(
                "{}  {} v{}  ({} tab{})",
                id,
                manifest.name,
                manifest.version,
                manifest.tabs.len(),
                if manifest.tabs.len() == 1 { "" } else { "s" },
            );
        }
        return Ok(());
    }

    // The headless bridge keeps mediaPlayer/videoPlayer ops answerable
    // during the smoke render; a real playback surface would mount its
    // own bridge here instead.
    let bridge = Arc::new(ext_media::MediaBridge::detached());
    ext_media::set_active_bridge(Some(bridge.clone()));

    smoke_render(&mut registry, dev_mode).await;
    relay_media_events(&mut registry, &bridge);

    ext_media::set_active_bridge(None);
    Ok(())
}

/// Drain bridge events queued during the render pass and relay remote
/// commands into the isolate that registered a matching handler. The
/// bridge already dropped commands with no registered handler, so a
/// drained command finds its isolate unless that extension was
/// uninstalled in between.
fn relay_media_events<S: store::ExtensionStore>(
    registry: &mut ExtensionRegistry<S>,
    bridge: &ext_media::MediaBridge,
) {
    for event in bridge.drain_events() {
        let ext_media::MediaEvent::Remote(cmd) = event else {
            tracing::debug!(?event, "video lifecycle event");
            continue;
        };
        let handler = cmd.handler_name();
        let arg = match cmd {
            ext_media::RemoteCommand::Seek(position) => Some(position),
            _ => None,
        };
        let mut handled = false;
        for (id, installed) in registry.iter_mut() {
            match installed.extension.dispatch_media_handler(handler, arg) {
                Ok(true) => {
                    tracing::debug!(id = %id, handler, "remote command dispatched");
                    handled = true;
                    break;
                }
                Ok(false) => {}
                Err(e) => {
                    tracing::warn!(id = %id, handler, error = %e, "remote dispatch failed")
                }
            }
        }
        if !handled {
            tracing::debug!(handler, "remote command had no registered handler");
        }
    }
}

/// Render every installed tab once so load-time faults surface in the
/// logs instead of on first user interaction. Dev mode also renders
/// every declared sub-screen.
async fn smoke_render<S: store::ExtensionStore>(
    registry: &mut ExtensionRegistry<S>,
    dev_mode: bool,
) {
    for (id, installed) in registry.iter_mut() {
        let ext = &mut installed.extension;
        let tabs = ext.manifest.tabs.clone();
        for tab in &tabs {
            match ext.render_tab(&tab.id) {
                Ok(tree) => tracing::debug!(
                    id = %id,
                    tab = %tab.id,
                    root = %tree["type"].as_str().unwrap_or("null"),
                    "rendered tab"
                ),
                Err(e) => tracing::warn!(id = %id, tab = %tab.id, error = %e, "tab render failed"),
            }
            if dev_mode {
                for screen in &tab.screens {
                    match ext.render_screen(&tab.id, screen, None) {
                        Ok(tree) => tracing::debug!(
                            id = %id,
                            tab = %tab.id,
                            screen = %screen,
                            root = %tree["type"].as_str().unwrap_or("null"),
                            "rendered screen"
                        ),
                        Err(e) => tracing::warn!(
                            id = %id,
                            tab = %tab.id,
                            screen = %screen,
                            error = %e,
                            "screen render failed"
                        ),
                    }
                }
            }
        }

        // Resolve async ops the renders kicked off, then settle any
        // navigation the components requested.
        match tokio::time::timeout(Duration::from_millis(250), ext.pump()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::warn!(id = %id, error = %e, "extension event loop error"),
            Err(_) => tracing::debug!(id = %id, "extension still has pending work"),
        }
        ext.settle_navigation();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use std::io::{Cursor, Write};
    use zip::write::SimpleFileOptions;
    use zip::ZipWriter;

    fn bundle(source: &str) -> Vec<u8> {
        let mut cursor = Cursor::new(Vec::new());
        let mut writer = ZipWriter::new(&mut cursor);
        writer
            .start_file("main.js", SimpleFileOptions::default())
            .unwrap();
        writer.write_all(source.as_bytes()).unwrap();
        writer.finish().unwrap();
        cursor.into_inner()
    }

    #[tokio::test]
    async fn remote_commands_reach_the_registered_isolate() {
        let _slot = test_support::media_bridge_guard();
        let bridge = Arc::new(ext_media::MediaBridge::detached());
        ext_media::set_active_bridge(Some(bridge.clone()));

        let dir = tempfile::tempdir().unwrap();
        let mut registry =
            ExtensionRegistry::new(Loader::new(dir.path().to_path_buf()), MemoryStore::new());
        let source = r#"
            let pauses = 0;
            let seekTo = -1;
            module.exports = {
                id: "com.t.remote",
                name: "R",
                version: "1.0.0",
                tabs: [{
                    id: "home",
                    label: "Home",
                    icon: "home",
                    component: () => Text({}, pauses + ":" + seekTo),
                }],
            };
            musicPlayer.setHandlers({
                onPause: () => { pauses += 1; },
                onSeek: (pos) => { seekTo = pos; },
            });
        "#;
        registry.install_bytes(&bundle(source)).await.unwrap();

        bridge.handle_remote(ext_media::RemoteCommand::Pause);
        bridge.handle_remote(ext_media::RemoteCommand::Seek(42.5));
        // Next has no registered handler, so the bridge drops it.
        bridge.handle_remote(ext_media::RemoteCommand::Next);
        relay_media_events(&mut registry, &bridge);

        let installed = registry.get_mut("com.t.remote").unwrap();
        let tree = installed.extension.render_tab("home").unwrap();
        assert_eq!(tree["children"][0], serde_json::json!("1:42.5"));

        ext_media::set_active_bridge(None);
    }
}
