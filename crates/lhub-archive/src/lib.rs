//! `.lhub` bundle reader.
//!
//! A bundle is a zip container with two logical members: `main.js`
//! (required, UTF-8 module source) and `icon.png` (optional raster
//! image). Reading is a pure transform over the bytes given; no
//! filesystem or network access.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use std::io::{Cursor, Read};
use tokio::sync::OnceCell;
use tracing::debug;
use zip::result::ZipError;
use zip::ZipArchive;

/// Required code-module member name.
pub const ENTRY_POINT: &str = "main.js";
/// Optional icon member name.
pub const ICON_ENTRY: &str = "icon.png";

/// Errors produced while unpacking a bundle.
#[derive(Debug, thiserror::Error)]
pub enum ArchiveError {
    /// The byte stream is not a well-formed zip container.
    #[error("Invalid bundle archive: {0}")]
    InvalidArchive(String),

    /// No `main.js` member present. Lists the member names that were
    /// actually found so a bad bundle is diagnosable from the message.
    #[error("Bundle has no entry point `{ENTRY_POINT}` (members found: {})", .found.join(", "))]
    MissingEntryPoint { found: Vec<String> },
}

/// The two logical members of a bundle.
#[derive(Debug, Clone)]
pub struct BundleContents {
    /// UTF-8 source text of the extension module.
    pub module_source: String,
    /// Raw icon bytes, if the bundle carries an icon member.
    pub icon: Option<Vec<u8>>,
}

/// Container engine handle, acquired at most once per process.
///
/// The original runtime fetched its archive parser lazily on first use
/// and cached it thereafter; that at-most-once acquisition is kept as a
/// required compatibility behavior, so `read` is async and goes through
/// this cell.
struct ContainerEngine;

impl ContainerEngine {
    fn open(&self, bytes: &[u8]) -> Result<ZipArchive<Cursor<Vec<u8>>>, ArchiveError> {
        ZipArchive::new(Cursor::new(bytes.to_vec()))
            .map_err(|e| ArchiveError::InvalidArchive(e.to_string()))
    }
}

static ENGINE: OnceCell<ContainerEngine> = OnceCell::const_new();

async fn engine() -> &'static ContainerEngine {
    ENGINE
        .get_or_init(|| async {
            debug!("acquiring bundle container engine");
            ContainerEngine
        })
        .await
}

/// Unpack a bundle into its module source and optional icon.
pub async fn read(bytes: &[u8]) -> Result<BundleContents, ArchiveError> {
    let mut archive = engine().await.open(bytes)?;

    let names: Vec<String> = archive.file_names().map(|n| n.to_string()).collect();
    debug!(members = ?names, "bundle opened");

    let module_source = match archive.by_name(ENTRY_POINT) {
        Ok(mut entry) => {
            let mut buf = String::new();
            entry
                .read_to_string(&mut buf)
                .map_err(|e| ArchiveError::InvalidArchive(format!("{ENTRY_POINT}: {e}")))?;
            buf
        }
        // Only a genuinely absent member is "missing". A present entry
        // that cannot be opened (encryption, unsupported compression)
        // is a malformed bundle.
        Err(ZipError::FileNotFound) => {
            return Err(ArchiveError::MissingEntryPoint { found: names })
        }
        Err(e) => return Err(ArchiveError::InvalidArchive(format!("{ENTRY_POINT}: {e}"))),
    };

    // Icon is optional; absence is not an error.
    let icon = match archive.by_name(ICON_ENTRY) {
        Ok(mut entry) => {
            let mut buf = Vec::new();
            entry
                .read_to_end(&mut buf)
                .map_err(|e| ArchiveError::InvalidArchive(format!("{ICON_ENTRY}: {e}")))?;
            Some(buf)
        }
        Err(ZipError::FileNotFound) => None,
        Err(e) => return Err(ArchiveError::InvalidArchive(format!("{ICON_ENTRY}: {e}"))),
    };

    Ok(BundleContents {
        module_source,
        icon,
    })
}

/// Encode icon bytes as a self-contained `data:` URI so an installed
/// extension has no loose-file dependency.
pub fn icon_data_uri(bytes: &[u8]) -> String {
    format!("data:image/png;base64,{}", BASE64.encode(bytes))
}
