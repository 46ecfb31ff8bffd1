//! Persistence of the consumer's pairing with one holder.
//!
//! After a successful pair the consumer keeps everything it needs to come
//! back later without a new code: where the holder lives, which certificate
//! to pin, and the bearer token.  The record is a small TOML file:
//!
//! ```toml
//! host = "192.168.1.20"
//! port = 50432
//! fingerprint = "9f86d081884c7d65..."
//! device_id = "3b1f0c2e-..."
//! token = "c0ffee..."
//! ```
//!
//! The token grants access to the holder's data, so on Unix the file is
//! created with mode `0600`.

use std::path::{Path, PathBuf};

use lansync_core::Fingerprint;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Default file name inside the consumer's config directory.
pub const PAIRING_FILE: &str = "pairing.toml";

/// Error type for pairing record persistence.
#[derive(Debug, Error)]
pub enum RecordError {
    /// A file system I/O error occurred.
    #[error("I/O error accessing pairing record at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The TOML content could not be parsed.
    #[error("failed to parse pairing record: {0}")]
    Parse(#[from] toml::de::Error),

    /// The record could not be serialized to TOML.
    #[error("failed to serialize pairing record: {0}")]
    Serialize(#[from] toml::ser::Error),
}

/// A completed pairing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PairingRecord {
    pub host: String,
    pub port: u16,
    pub fingerprint: Fingerprint,
    pub device_id: String,
    pub token: String,
}

/// Loads the record at `path`; `None` when it does not exist.
///
/// # Errors
///
/// Returns [`RecordError::Io`] for file-system errors other than "not found",
/// and [`RecordError::Parse`] for malformed content.
pub fn load_record(path: &Path) -> Result<Option<PairingRecord>, RecordError> {
    match std::fs::read_to_string(path) {
        Ok(content) => Ok(Some(toml::from_str(&content)?)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(RecordError::Io {
            path: path.to_path_buf(),
            source: e,
        }),
    }
}

/// Writes `record` to `path`, creating the directory if needed.
///
/// # Errors
///
/// Returns [`RecordError::Io`] for file-system failures.
pub fn save_record(path: &Path, record: &PairingRecord) -> Result<(), RecordError> {
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir).map_err(|source| RecordError::Io {
            path: dir.to_path_buf(),
            source,
        })?;
    }
    let content = toml::to_string_pretty(record)?;
    write_private(path, content.as_bytes()).map_err(|source| RecordError::Io {
        path: path.to_path_buf(),
        source,
    })
}

/// Removes the record.  Missing files are not an error.
///
/// # Errors
///
/// Returns [`RecordError::Io`] if the file exists but cannot be removed.
pub fn forget_record(path: &Path) -> Result<(), RecordError> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(RecordError::Io {
            path: path.to_path_buf(),
            source: e,
        }),
    }
}

/// Default location of the record:
/// - Windows:  `%APPDATA%\LanSync\pairing.toml`
/// - Linux:    `~/.config/lansync/pairing.toml`
/// - macOS:    `~/Library/Application Support/LanSync/pairing.toml`
pub fn default_record_path() -> Option<PathBuf> {
    platform_config_dir().map(|dir| dir.join(PAIRING_FILE))
}

fn platform_config_dir() -> Option<PathBuf> {
    #[cfg(target_os = "windows")]
    {
        std::env::var_os("APPDATA").map(|p| PathBuf::from(p).join("LanSync"))
    }

    #[cfg(target_os = "linux")]
    {
        let base = std::env::var_os("XDG_CONFIG_HOME")
            .map(PathBuf::from)
            .or_else(|| std::env::var_os("HOME").map(|h| PathBuf::from(h).join(".config")))?;
        Some(base.join("lansync"))
    }

    #[cfg(target_os = "macos")]
    {
        std::env::var_os("HOME").map(|h| {
            PathBuf::from(h)
                .join("Library")
                .join("Application Support")
                .join("LanSync")
        })
    }

    #[cfg(not(any(target_os = "windows", target_os = "linux", target_os = "macos")))]
    {
        None
    }
}

#[cfg(unix)]
fn write_private(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    use std::io::Write;
    use std::os::unix::fs::OpenOptionsExt;

    let mut file = std::fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o600)
        .open(path)?;
    file.write_all(bytes)
}

#[cfg(not(unix))]
fn write_private(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    std::fs::write(path, bytes)
}

// ── Tests ─────────────────────────────────────────────────────────────────────
