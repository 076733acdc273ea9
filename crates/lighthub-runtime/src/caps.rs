//! Capability Registry - the fixed set of host capabilities injected
//! into every extension isolate.
//!
//! The registry is rebuilt for every loader invocation; each build
//! returns freshly-bound `Extension` values because `deno_core`
//! extensions are consumed by the runtime they are handed to. The
//! media ops resolve the active bridge through the process-wide slot
//! on every call, so a bridge mounted after a runtime was built is
//! still picked up.

use crate::host_ext;
use deno_core::Extension;

/// The JS side of the capability surface, executed before any
/// extension source. Defines the capability table and the
/// `__lhub_load` / `__lhub_render` entry points.
pub const PRELUDE: &str = include_str!("prelude.js");

/// Metadata describing one capability extension.
pub struct CapabilityDescriptor {
    /// Capability name as extensions see it (documentation only).
    pub name: &'static str,
    /// Factory function to create the Extension.
    pub extension_fn: fn() -> Extension,
}

/// The closed enumeration of capability extensions. Every extension
/// isolate receives the identical set; there is no per-extension
/// capability restriction.
pub struct CapabilityRegistry {
    descriptors: Vec<CapabilityDescriptor>,
}

impl CapabilityRegistry {
    pub fn new() -> Self {
        Self {
            descriptors: vec![
                CapabilityDescriptor {
                    name: "log",
                    extension_fn: ext_log::log_extension,
                },
                CapabilityDescriptor {
                    name: "storage",
                    extension_fn: ext_store::store_extension,
                },
                CapabilityDescriptor {
                    name: "fetch",
                    extension_fn: ext_fetch::fetch_extension,
                },
                CapabilityDescriptor {
                    name: "navigation",
                    extension_fn: ext_nav::nav_extension,
                },
                CapabilityDescriptor {
                    name: "media",
                    extension_fn: ext_media::media_extension,
                },
                CapabilityDescriptor {
                    name: "host",
                    extension_fn: host_ext::host_extension,
                },
            ],
        }
    }

    pub fn count(&self) -> usize {
        self.descriptors.len()
    }

    /// Build a fresh extensions vector for one `JsRuntime`.
    pub fn build_extensions(&self) -> Vec<Extension> {
        self.descriptors
            .iter()
            .map(|d| (d.extension_fn)())
            .collect()
    }
}

impl Default for CapabilityRegistry {
    fn default() -> Self {
        Self::new()
    }
}
