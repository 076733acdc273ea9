//! Network fetch capability.
//!
//! Extensions get one HTTP surface: `fetch(url, opts)`. Every
//! extension receives the identical capability (all-or-nothing trust
//! model); the checker trait keeps an enforcement seam for hosts that
//! want one.

use deno_core::{op2, Extension, OpState};
use serde::{Deserialize, Serialize};
use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;
use std::sync::Arc;
use tracing::debug;
use url::Url;

#[derive(Debug, thiserror::Error, deno_error::JsError)]
pub enum FetchError {
    #[error("Permission denied: {0}")]
    #[class(generic)]
    PermissionDenied(String),

    #[error("Invalid URL: {0}")]
    #[class(generic)]
    InvalidUrl(String),

    #[error("Request failed: {0}")]
    #[class(generic)]
    RequestFailed(String),

    #[error("Request build error: {0}")]
    #[class(generic)]
    RequestBuildError(String),
}

impl From<url::ParseError> for FetchError {
    fn from(e: url::ParseError) -> Self {
        Self::InvalidUrl(e.to_string())
    }
}

impl From<reqwest::Error> for FetchError {
    fn from(e: reqwest::Error) -> Self {
        Self::RequestFailed(e.to_string())
    }
}

// ============================================================================
// Request/Response Types
// ============================================================================

#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct FetchOpts {
    pub method: Option<String>,
    pub headers: Option<HashMap<String, String>>,
    pub body: Option<String>,
    pub timeout_ms: Option<u64>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FetchResponse {
    pub status: u16,
    pub status_text: String,
    pub headers: HashMap<String, String>,
    pub body: String,
    pub url: String,
    pub ok: bool,
}

// ============================================================================
// Capability Checker
// ============================================================================

pub trait FetchCapabilityChecker: Send + Sync {
    fn check_connect(&self, host: &str) -> Result<(), String>;
}

/// Default permissive checker; the capability table is closed but not
/// per-host restricted.
pub struct PermissiveFetchChecker;

impl FetchCapabilityChecker for PermissiveFetchChecker {
    fn check_connect(&self, _host: &str) -> Result<(), String> {
        Ok(())
    }
}

pub struct FetchCapabilities {
    pub checker: Arc<dyn FetchCapabilityChecker>,
}

impl Default for FetchCapabilities {
    fn default() -> Self {
        Self {
            checker: Arc::new(PermissiveFetchChecker),
        }
    }
}

/// Shared HTTP client, reused for connection pooling.
pub struct FetchHttpClient {
    pub client: reqwest::Client,
}

impl Default for FetchHttpClient {
    fn default() -> Self {
        Self {
            client: reqwest::Client::builder()
                .user_agent("LightHub/0.1")
                .build()
                .expect("Failed to build HTTP client"),
        }
    }
}

// ============================================================================
// Helper Functions
// ============================================================================

/// Extract host (with non-default port) from a URL for capability checks.
fn extract_host(url: &str) -> Result<String, FetchError> {
    let parsed = Url::parse(url)?;
    let host = parsed
        .host_str()
        .ok_or_else(|| FetchError::InvalidUrl("URL has no host".to_string()))?;

    let default_port = match parsed.scheme() {
        "http" => Some(80),
        "https" => Some(443),
        _ => None,
    };
    if let Some(p) = parsed.port() {
        if Some(p) != default_port {
            return Ok(format!("{}:{}", host, p));
        }
    }
    Ok(host.to_string())
}

fn check_connect(state: &OpState, host: &str) -> Result<(), FetchError> {
    if let Some(caps) = state.try_borrow::<FetchCapabilities>() {
        caps.checker
            .check_connect(host)
            .map_err(FetchError::PermissionDenied)
    } else {
        Ok(())
    }
}

fn get_http_client(state: &mut OpState) -> reqwest::Client {
    if let Some(client_state) = state.try_borrow::<FetchHttpClient>() {
        client_state.client.clone()
    } else {
        let client_state = FetchHttpClient::default();
        let client = client_state.client.clone();
        state.put(client_state);
        client
    }
}

// ============================================================================
// Operations
// ============================================================================

#[op2(async)]
#[serde]
async fn op_fetch(
    state: Rc<RefCell<OpState>>,
    #[string] url: String,
    #[serde] opts: Option<FetchOpts>,
) -> Result<FetchResponse, FetchError> {
    let opts = opts.unwrap_or_default();

    let host = extract_host(&url)?;
    {
        let s = state.borrow();
        check_connect(&s, &host)?;
    }

    debug!(url = %url, method = ?opts.method, "fetch");

    let client = {
        let mut s = state.borrow_mut();
        get_http_client(&mut s)
    };

    let method = opts.method.as_deref().unwrap_or("GET").to_uppercase();
    let mut request_builder = match method.as_str() {
        "GET" => client.get(&url),
        "POST" => client.post(&url),
        "PUT" => client.put(&url),
        "DELETE" => client.delete(&url),
        "PATCH" => client.patch(&url),
        "HEAD" => client.head(&url),
        _ => {
            return Err(FetchError::RequestBuildError(format!(
                "Unsupported method: {}",
                method
            )));
        }
    };

    if let Some(headers) = opts.headers {
        for (key, value) in headers {
            request_builder = request_builder.header(&key, &value);
        }
    }
    if let Some(body) = opts.body {
        request_builder = request_builder.body(body);
    }
    if let Some(timeout_ms) = opts.timeout_ms {
        request_builder = request_builder.timeout(std::time::Duration::from_millis(timeout_ms));
    }

    let response = request_builder.send().await?;

    let status = response.status().as_u16();
    let status_text = response
        .status()
        .canonical_reason()
        .unwrap_or("")
        .to_string();
    let ok = response.status().is_success();
    let final_url = response.url().to_string();

    let mut headers = HashMap::new();
    for (key, value) in response.headers() {
        if let Ok(v) = value.to_str() {
            headers.insert(key.to_string(), v.to_string());
        }
    }

    let body = response.text().await?;

    debug!(status = status, body_len = body.len(), "fetch complete");

    Ok(FetchResponse {
        status,
        status_text,
        headers,
        body,
        url: final_url,
        ok,
    })
}

// ============================================================================
// State Initialization
// ============================================================================

pub fn init_fetch_state(state: &mut OpState, checker: Option<Arc<dyn FetchCapabilityChecker>>) {
    if let Some(checker) = checker {
        state.put(FetchCapabilities { checker });
    }
}

deno_core::extension!(
    lhub_fetch,
    ops = [op_fetch]
);

pub fn fetch_extension() -> Extension {
    lhub_fetch::ext()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn host_extraction_strips_default_ports() {
        assert_eq!(extract_host("https://api.example.com/v1").unwrap(), "api.example.com");
        assert_eq!(extract_host("http://example.com:80/").unwrap(), "example.com");
        assert_eq!(
            extract_host("https://example.com:8443/").unwrap(),
            "example.com:8443"
        );
    }

    #[test]
    fn hostless_url_is_rejected() {
        assert!(matches!(
            extract_host("data:text/plain,hi"),
            Err(FetchError::InvalidUrl(_))
        ));
    }

    #[test]
    fn permissive_checker_allows_all() {
        let checker = PermissiveFetchChecker;
        assert!(checker.check_connect("anywhere.example").is_ok());
    }
}
