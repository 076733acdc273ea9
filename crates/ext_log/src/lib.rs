//! Logging capability bridging extension code to host tracing.
//!
//! Every log line is tagged with the id of the extension whose runtime
//! emitted it, so interleaved extension output stays attributable.

use deno_core::{op2, Extension, OpState};
use deno_error::JsError;
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, error, info, trace, warn, Level};

#[derive(Debug, Error, JsError)]
pub enum LogError {
    #[error("Invalid log level: {0}")]
    #[class(generic)]
    InvalidLevel(String),
}

/// Identity of the extension runtime this op state belongs to.
///
/// Installed by the loader; before a manifest is validated the id is a
/// provisional placeholder.
pub struct LogSource {
    pub extension_id: String,
}

fn source_id(state: &OpState) -> String {
    state
        .try_borrow::<LogSource>()
        .map(|s| s.extension_id.clone())
        .unwrap_or_else(|| "unknown".to_string())
}

#[op2]
fn op_log_emit(
    state: &mut OpState,
    #[string] level: String,
    #[string] message: String,
    #[serde] fields: Option<Value>,
) -> Result<(), LogError> {
    let lvl = parse_level(&level)?;
    let ext = source_id(state);

    match lvl {
        Level::TRACE => trace!(extension = %ext, fields = ?fields, "{message}"),
        Level::DEBUG => debug!(extension = %ext, fields = ?fields, "{message}"),
        Level::INFO => info!(extension = %ext, fields = ?fields, "{message}"),
        Level::WARN => warn!(extension = %ext, fields = ?fields, "{message}"),
        Level::ERROR => error!(extension = %ext, fields = ?fields, "{message}"),
    }

    Ok(())
}

fn parse_level(level: &str) -> Result<Level, LogError> {
    match level.to_ascii_lowercase().as_str() {
        "trace" => Ok(Level::TRACE),
        "debug" => Ok(Level::DEBUG),
        "info" | "log" => Ok(Level::INFO),
        "warn" | "warning" => Ok(Level::WARN),
        "error" => Ok(Level::ERROR),
        other => Err(LogError::InvalidLevel(other.to_string())),
    }
}

/// Install the log source identity into op state.
pub fn init_log_state(state: &mut OpState, extension_id: String) {
    state.put(LogSource { extension_id });
}

/// Rescope the log source after the manifest id is known.
pub fn set_log_source(state: &mut OpState, extension_id: String) {
    state.put(LogSource { extension_id });
}

deno_core::extension!(
    lhub_log,
    ops = [op_log_emit]
);

pub fn log_extension() -> Extension {
    lhub_log::ext()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_levels_parse() {
        for l in ["trace", "debug", "info", "log", "warn", "warning", "error"] {
            assert!(parse_level(l).is_ok(), "level {l} should parse");
        }
        assert_eq!(parse_level("INFO").unwrap(), Level::INFO);
    }

    #[test]
    fn unknown_level_is_rejected() {
        let err = parse_level("shout").unwrap_err();
        assert!(err.to_string().contains("shout"));
    }
}
