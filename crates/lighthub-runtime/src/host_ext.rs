//! Host capability ops: platform queries, link opening, and dialogs.
//!
//! These back the non-media, non-storage entries of the capability
//! table. The host runs headless, so dialogs and link opens are logged
//! and answered from [`HostInfo`] rather than shown.

use deno_core::{op2, Extension, OpState};
use serde::Serialize;
use tracing::info;

/// Answers the host gives to platform queries and confirm dialogs.
pub struct HostInfo {
    pub platform: String,
    pub color_scheme: String,
    pub width: u32,
    pub height: u32,
    pub confirm_response: bool,
}

impl Default for HostInfo {
    fn default() -> Self {
        let platform = if cfg!(target_os = "macos") {
            "macos"
        } else if cfg!(target_os = "windows") {
            "windows"
        } else {
            "linux"
        };
        Self {
            platform: platform.to_string(),
            color_scheme: "light".to_string(),
            width: 390,
            height: 844,
            confirm_response: true,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct Dimensions {
    pub width: u32,
    pub height: u32,
}

fn host(state: &mut OpState) -> &mut HostInfo {
    if state.try_borrow::<HostInfo>().is_none() {
        state.put(HostInfo::default());
    }
    state.borrow_mut::<HostInfo>()
}

#[op2]
#[string]
fn op_host_platform(state: &mut OpState) -> String {
    host(state).platform.clone()
}

#[op2]
#[string]
fn op_host_color_scheme(state: &mut OpState) -> String {
    host(state).color_scheme.clone()
}

#[op2]
#[serde]
fn op_host_dimensions(state: &mut OpState) -> Dimensions {
    let info = host(state);
    Dimensions {
        width: info.width,
        height: info.height,
    }
}

#[op2(fast)]
fn op_host_open_link(#[string] url: &str) {
    info!(url = %url, "extension requested link open");
}

#[op2(fast)]
fn op_host_alert(#[string] title: &str, #[string] message: &str) {
    info!(title = %title, message = %message, "extension alert");
}

#[op2(fast)]
fn op_host_confirm(state: &mut OpState, #[string] title: &str, #[string] message: &str) -> bool {
    let info = host(state);
    info!(title = %title, message = %message, answer = info.confirm_response, "extension confirm");
    info.confirm_response
}

/// Install the host answers for a runtime.
pub fn init_host_state(state: &mut OpState, info: HostInfo) {
    state.put(info);
}

deno_core::extension!(
    lhub_host,
    ops = [
        op_host_platform,
        op_host_color_scheme,
        op_host_dimensions,
        op_host_open_link,
        op_host_alert,
        op_host_confirm,
    ]
);

pub fn host_extension() -> Extension {
    lhub_host::ext()
}
