//! TOML-based configuration persistence for the holder.
//!
//! Reads and writes `HolderConfig` to the platform-appropriate config file:
//! - Windows:  `%APPDATA%\LanSync\holder.toml`
//! - Linux:    `~/.config/lansync/holder.toml`
//! - macOS:    `~/Library/Application Support/LanSync/holder.toml`
//!
//! Example file:
//!
//! ```toml
//! [holder]
//! display_name = "Kitchen iPad"
//! log_level = "info"
//!
//! [network]
//! bind_address = "0.0.0.0"
//! port = 0
//! discovery_port = 53317
//! advertise = true
//!
//! [pairing]
//! code_ttl_secs = 300
//! max_failed_attempts = 5
//!
//! [security]
//! require_unlock = true
//!
//! [transfer]
//! default_page_limit = 500
//! max_page_limit = 1000
//! ```
//!
//! # Serde default values
//!
//! Every field carries `#[serde(default = "...")]`, and every section is
//! itself optional, so an empty file (or no file at all) yields the defaults
//! and files written by older versions keep loading after new fields appear.

use std::net::IpAddr;
use std::path::{Path, PathBuf};

use lansync_core::api::{PageLimits, DEFAULT_PAGE_LIMIT, MAX_PAGE_LIMIT};
use lansync_core::discovery::DEFAULT_DISCOVERY_PORT;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::application::credentials::{
    IssuerSettings, DEFAULT_CODE_TTL_SECS, DEFAULT_MAX_FAILED_ATTEMPTS, MAX_CODE_TTL_SECS,
};

/// Error type for configuration file operations.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The platform config directory could not be determined.
    #[error("could not determine platform config directory")]
    NoPlatformConfigDir,

    /// A file system I/O error occurred.
    #[error("I/O error accessing config at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The TOML content could not be parsed.
    #[error("failed to parse config TOML: {0}")]
    Parse(#[from] toml::de::Error),

    /// The config could not be serialized to TOML.
    #[error("failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),

    /// A value is out of range.
    #[error("invalid config value for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

// ── Config schema types ───────────────────────────────────────────────────────

/// Top-level holder configuration stored on disk.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct HolderConfig {
    #[serde(default)]
    pub holder: HolderSection,
    #[serde(default)]
    pub network: NetworkSection,
    #[serde(default)]
    pub pairing: PairingSection,
    #[serde(default)]
    pub security: SecuritySection,
    #[serde(default)]
    pub transfer: TransferSection,
}

/// General holder settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HolderSection {
    /// Name shown to consumers in discovery and `/status`.
    #[serde(default = "default_display_name")]
    pub display_name: String,
    /// `tracing` log level: `"error"`, `"warn"`, `"info"`, `"debug"`, `"trace"`.
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Where the identity and device registry live.  Defaults to the config
    /// directory.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_dir: Option<PathBuf>,
}

/// Listener and discovery settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NetworkSection {
    /// IP address to bind the TLS listener to.  `"0.0.0.0"` binds all
    /// interfaces.
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    /// TLS port.  `0` lets the OS choose.
    #[serde(default)]
    pub port: u16,
    /// UDP port answering discovery queries.
    #[serde(default = "default_discovery_port")]
    pub discovery_port: u16,
    /// Whether to answer discovery queries at all.
    #[serde(default = "default_true")]
    pub advertise: bool,
    /// Host written into the credential bundle.  Detected when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub advertise_host: Option<String>,
}

/// Pairing code policy.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PairingSection {
    #[serde(default = "default_code_ttl_secs")]
    pub code_ttl_secs: u64,
    #[serde(default = "default_max_failed_attempts")]
    pub max_failed_attempts: u32,
}

/// Access policy.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SecuritySection {
    /// Refuse data requests while the device is locked.
    #[serde(default = "default_true")]
    pub require_unlock: bool,
}

/// Paging policy for `/health/data`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TransferSection {
    #[serde(default = "default_page_limit")]
    pub default_page_limit: usize,
    #[serde(default = "default_max_page_limit")]
    pub max_page_limit: usize,
}

// ── Default helpers ───────────────────────────────────────────────────────────

fn default_display_name() -> String {
    "LanSync Holder".to_string()
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}
fn default_discovery_port() -> u16 {
    DEFAULT_DISCOVERY_PORT
}
fn default_true() -> bool {
    true
}
fn default_code_ttl_secs() -> u64 {
    DEFAULT_CODE_TTL_SECS as u64
}
fn default_max_failed_attempts() -> u32 {
    DEFAULT_MAX_FAILED_ATTEMPTS
}
fn default_page_limit() -> usize {
    DEFAULT_PAGE_LIMIT
}
fn default_max_page_limit() -> usize {
    MAX_PAGE_LIMIT
}

impl Default for HolderSection {
    fn default() -> Self {
        Self {
            display_name: default_display_name(),
            log_level: default_log_level(),
            data_dir: None,
        }
    }
}

impl Default for NetworkSection {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            port: 0,
            discovery_port: default_discovery_port(),
            advertise: default_true(),
            advertise_host: None,
        }
    }
}

impl Default for PairingSection {
    fn default() -> Self {
        Self {
            code_ttl_secs: default_code_ttl_secs(),
            max_failed_attempts: default_max_failed_attempts(),
        }
    }
}

impl Default for SecuritySection {
    fn default() -> Self {
        Self {
            require_unlock: default_true(),
        }
    }
}

impl Default for TransferSection {
    fn default() -> Self {
        Self {
            default_page_limit: default_page_limit(),
            max_page_limit: default_max_page_limit(),
        }
    }
}

// ── Derived settings ──────────────────────────────────────────────────────────

impl HolderConfig {
    /// Checks ranges that serde cannot express.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] naming the first offending field.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.bind_ip()?;
        if self.holder.display_name.trim().is_empty() {
            return Err(invalid("holder.display_name", "must not be empty"));
        }
        if self.pairing.code_ttl_secs == 0 || self.pairing.code_ttl_secs > MAX_CODE_TTL_SECS as u64 {
            return Err(invalid(
                "pairing.code_ttl_secs",
                &format!("must be between 1 and {MAX_CODE_TTL_SECS}"),
            ));
        }
        if self.pairing.max_failed_attempts == 0 {
            return Err(invalid("pairing.max_failed_attempts", "must be positive"));
        }
        if self.transfer.max_page_limit == 0 {
            return Err(invalid("transfer.max_page_limit", "must be positive"));
        }
        if self.transfer.default_page_limit == 0
            || self.transfer.default_page_limit > self.transfer.max_page_limit
        {
            return Err(invalid(
                "transfer.default_page_limit",
                "must be between 1 and max_page_limit",
            ));
        }
        Ok(())
    }

    /// Parsed `network.bind_address`.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] if the address does not parse.
    pub fn bind_ip(&self) -> Result<IpAddr, ConfigError> {
        self.network
            .bind_address
            .parse()
            .map_err(|e| invalid("network.bind_address", &format!("{e}")))
    }

    pub fn issuer_settings(&self) -> IssuerSettings {
        let ttl = i64::try_from(self.pairing.code_ttl_secs)
            .unwrap_or(DEFAULT_CODE_TTL_SECS)
            .min(MAX_CODE_TTL_SECS);
        IssuerSettings {
            code_ttl: chrono::Duration::seconds(ttl),
            max_failed_attempts: self.pairing.max_failed_attempts,
        }
    }

    pub fn page_limits(&self) -> PageLimits {
        PageLimits {
            default: self.transfer.default_page_limit,
            max: self.transfer.max_page_limit,
        }
    }

    /// Data directory, falling back to `fallback` when not configured.
    pub fn data_dir_or(&self, fallback: &Path) -> PathBuf {
        self.holder
            .data_dir
            .clone()
            .unwrap_or_else(|| fallback.to_path_buf())
    }
}

fn invalid(field: &'static str, reason: &str) -> ConfigError {
    ConfigError::Invalid {
        field,
        reason: reason.to_string(),
    }
}

// ── Config repository ─────────────────────────────────────────────────────────

/// Determines the platform-appropriate directory for the config file.
///
/// # Errors
///
/// Returns [`ConfigError::NoPlatformConfigDir`] when the platform config base
/// directory cannot be determined from the environment.
pub fn config_dir() -> Result<PathBuf, ConfigError> {
    platform_config_dir().ok_or(ConfigError::NoPlatformConfigDir)
}

/// Resolves the full path to the default config file.
///
/// # Errors
///
/// Returns [`ConfigError::NoPlatformConfigDir`] if the base directory cannot
/// be determined.
pub fn config_file_path() -> Result<PathBuf, ConfigError> {
    Ok(config_dir()?.join("holder.toml"))
}

/// Loads `HolderConfig` from `path`, returning the defaults if the file does
/// not exist yet.
///
/// # Errors
///
/// Returns [`ConfigError::Io`] for file-system errors other than "not found",
/// and [`ConfigError::Parse`] if the TOML is malformed.
pub fn load_config(path: &Path) -> Result<HolderConfig, ConfigError> {
    match std::fs::read_to_string(path) {
        Ok(content) => Ok(toml::from_str(&content)?),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(HolderConfig::default()),
        Err(e) => Err(ConfigError::Io {
            path: path.to_path_buf(),
            source: e,
        }),
    }
}

/// Persists `config` to `path`, creating the directory if needed.
///
/// # Errors
///
/// Returns [`ConfigError::Io`] for file-system failures or
/// [`ConfigError::Serialize`] if serialization fails.
pub fn save_config(path: &Path, config: &HolderConfig) -> Result<(), ConfigError> {
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir).map_err(|source| ConfigError::Io {
            path: dir.to_path_buf(),
            source,
        })?;
    }

    let content = toml::to_string_pretty(config)?;
    std::fs::write(path, content).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })
}

/// Resolves the platform config base directory including the `LanSync`
/// subdirectory.
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

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    // ── Defaults ──────────────────────────────────────────────────────────────

    #[test]
    fn test_default_config_has_expected_network_values() {
        // Arrange / Act
        let cfg = HolderConfig::default();

        // Assert
        assert_eq!(cfg.network.port, 0);
        assert_eq!(cfg.network.discovery_port, 53317);
        assert_eq!(cfg.network.bind_address, "0.0.0.0");
        assert!(cfg.network.advertise);
    }

    #[test]
    fn test_default_config_policies() {
        let cfg = HolderConfig::default();
        assert_eq!(cfg.pairing.code_ttl_secs, 300);
        assert_eq!(cfg.pairing.max_failed_attempts, 5);
        assert!(cfg.security.require_unlock);
        assert_eq!(cfg.page_limits(), PageLimits::default());
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_empty_toml_yields_defaults() {
        let cfg: HolderConfig = toml::from_str("").unwrap();
        assert_eq!(cfg, HolderConfig::default());
    }

    #[test]
    fn test_partial_section_fills_missing_fields() {
        let cfg: HolderConfig = toml::from_str("[network]\nport = 8443\n").unwrap();
        assert_eq!(cfg.network.port, 8443);
        assert_eq!(cfg.network.discovery_port, 53317);
        assert_eq!(cfg.holder.display_name, "LanSync Holder");
    }

    // ── TOML round-trip ───────────────────────────────────────────────────────

    #[test]
    fn test_config_serializes_and_deserializes_round_trip() {
        // Arrange
        let mut cfg = HolderConfig::default();
        cfg.holder.display_name = "Kitchen iPad".to_string();
        cfg.holder.data_dir = Some(PathBuf::from("/var/lib/lansync"));
        cfg.network.advertise_host = Some("192.168.1.20".to_string());
        cfg.transfer.max_page_limit = 200;

        // Act
        let text = toml::to_string_pretty(&cfg).expect("serialize");
        let restored: HolderConfig = toml::from_str(&text).expect("deserialize");

        // Assert
        assert_eq!(cfg, restored);
    }

    // ── Validation ────────────────────────────────────────────────────────────

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut cfg = HolderConfig::default();
        cfg.transfer.default_page_limit = 2000;
        assert!(matches!(
            cfg.validate(),
            Err(ConfigError::Invalid { field: "transfer.default_page_limit", .. })
        ));

        let mut cfg = HolderConfig::default();
        cfg.network.bind_address = "not-an-ip".to_string();
        assert!(matches!(
            cfg.validate(),
            Err(ConfigError::Invalid { field: "network.bind_address", .. })
        ));

        let mut cfg = HolderConfig::default();
        cfg.pairing.code_ttl_secs = 0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_huge_code_ttl() {
        // Arrange
        let mut cfg = HolderConfig::default();
        cfg.pairing.code_ttl_secs = u64::MAX / 2;

        // Act + Assert
        assert!(matches!(
            cfg.validate(),
            Err(ConfigError::Invalid { field: "pairing.code_ttl_secs", .. })
        ));
        // Even unvalidated, the derived TTL stays within range.
        assert_eq!(
            cfg.issuer_settings().code_ttl,
            chrono::Duration::seconds(MAX_CODE_TTL_SECS)
        );

        cfg.pairing.code_ttl_secs = MAX_CODE_TTL_SECS as u64;
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_issuer_settings_follow_pairing_section() {
        let mut cfg = HolderConfig::default();
        cfg.pairing.code_ttl_secs = 120;
        cfg.pairing.max_failed_attempts = 3;

        let settings = cfg.issuer_settings();

        assert_eq!(settings.code_ttl, chrono::Duration::seconds(120));
        assert_eq!(settings.max_failed_attempts, 3);
    }

    // ── File persistence ──────────────────────────────────────────────────────

    #[test]
    fn test_load_config_missing_file_returns_default() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = load_config(&dir.path().join("holder.toml")).unwrap();
        assert_eq!(cfg, HolderConfig::default());
    }

    #[test]
    fn test_save_then_load_config() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sub").join("holder.toml");
        let mut cfg = HolderConfig::default();
        cfg.security.require_unlock = false;

        save_config(&path, &cfg).unwrap();

        assert_eq!(load_config(&path).unwrap(), cfg);
    }

    #[test]
    fn test_load_config_rejects_malformed_toml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("holder.toml");
        std::fs::write(&path, "[network\nport = ").unwrap();

        assert!(matches!(load_config(&path), Err(ConfigError::Parse(_))));
    }
}
