//! TOML-backed device registry.
//!
//! File layout (`<data_dir>/devices.toml`):
//!
//! ```toml
//! [[devices]]
//! device_id = "3b1f0c2e-..."
//! device_name = "Office laptop"
//! token = "9f86d0..."
//! authorized = true
//! registered_at = "2026-10-16T09:12:44Z"
//! ```
//!
//! Writes go to a temporary file in the same directory which is then renamed
//! over the real one, so a crash mid-write leaves either the old or the new
//! registry on disk, never a truncated one.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::application::credentials::{DeviceRegistration, DeviceStore, StoreError};

/// File name of the registry inside the holder data directory.
pub const DEVICES_FILE: &str = "devices.toml";

#[derive(Debug, Default, Serialize, Deserialize)]
struct DevicesFile {
    #[serde(default)]
    devices: Vec<DeviceRegistration>,
}

/// Stores registrations in a TOML file.
#[derive(Debug, Clone)]
pub struct TomlDeviceStore {
    path: PathBuf,
}

impl TomlDeviceStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Store at `<dir>/devices.toml`.
    pub fn in_dir(dir: &Path) -> Self {
        Self::new(dir.join(DEVICES_FILE))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn io_error(&self, path: &Path, source: std::io::Error) -> StoreError {
        StoreError::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

impl DeviceStore for TomlDeviceStore {
    fn load(&self) -> Result<Vec<DeviceRegistration>, StoreError> {
        match std::fs::read_to_string(&self.path) {
            Ok(content) => {
                let file: DevicesFile =
                    toml::from_str(&content).map_err(|e| StoreError::Format(e.to_string()))?;
                Ok(file.devices)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(self.io_error(&self.path, e)),
        }
    }

    fn save(&self, devices: &[DeviceRegistration]) -> Result<(), StoreError> {
        if let Some(dir) = self.path.parent() {
            std::fs::create_dir_all(dir).map_err(|e| self.io_error(dir, e))?;
        }

        let content = toml::to_string_pretty(&DevicesFile {
            devices: devices.to_vec(),
        })
        .map_err(|e| StoreError::Format(e.to_string()))?;

        let tmp = self.path.with_extension("toml.tmp");
        std::fs::write(&tmp, content).map_err(|e| self.io_error(&tmp, e))?;
        std::fs::rename(&tmp, &self.path).map_err(|e| self.io_error(&self.path, e))?;
        Ok(())
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::DateTime;

    fn registration(id: &str, authorized: bool) -> DeviceRegistration {
        let at = DateTime::from_timestamp(1_700_000_000, 0).unwrap();
        DeviceRegistration {
            device_id: id.to_string(),
            device_name: Some(format!("{id} name")),
            token: format!("{id}-token"),
            authorized,
            registered_at: at,
            revoked_at: (!authorized).then_some(at),
        }
    }

    #[test]
    fn test_load_missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = TomlDeviceStore::in_dir(dir.path());
        assert!(store.load().unwrap().is_empty());
    }

    #[test]
    fn test_save_then_load_preserves_registrations() {
        // Arrange
        let dir = tempfile::tempdir().unwrap();
        let store = TomlDeviceStore::in_dir(&dir.path().join("nested"));
        let devices = vec![registration("a", true), registration("b", false)];

        // Act
        store.save(&devices).unwrap();
        let loaded = store.load().unwrap();

        // Assert
        assert_eq!(loaded, devices);
        assert!(!store.path().with_extension("toml.tmp").exists());
    }

    #[test]
    fn test_save_overwrites_previous_contents() {
        let dir = tempfile::tempdir().unwrap();
        let store = TomlDeviceStore::in_dir(dir.path());
        store.save(&[registration("a", true)]).unwrap();

        store.save(&[registration("b", true)]).unwrap();

        let ids: Vec<String> = store.load().unwrap().into_iter().map(|d| d.device_id).collect();
        assert_eq!(ids, vec!["b".to_string()]);
    }

    #[test]
    fn test_load_rejects_malformed_file() {
        let dir = tempfile::tempdir().unwrap();
        let store = TomlDeviceStore::in_dir(dir.path());
        std::fs::write(store.path(), "devices = 7").unwrap();

        assert!(matches!(store.load(), Err(StoreError::Format(_))));
    }
}
