//! Storage infrastructure: configuration and the device registry on disk.
//!
//! - **`config`** – Reads and writes `HolderConfig` as TOML in the
//!   platform-appropriate config directory, with defaults for every field so
//!   first runs and older files both load.
//!
//! - **`devices`** – A [`DeviceStore`](crate::application::credentials::DeviceStore)
//!   that keeps paired devices in a TOML file, so pairings survive restarts.

pub mod config;
pub mod devices;
