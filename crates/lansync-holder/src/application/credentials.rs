//! CredentialIssuer: pairing codes, session tokens, and the device registry.
//!
//! # Lifecycle (for beginners)
//!
//! 1. The operator taps "share".  [`CredentialIssuer::issue_code`] creates a
//!    random 6-digit code that is valid for a few minutes.  Only one code is
//!    active at a time; issuing a new one replaces the old one.
//! 2. The consumer sends the code to `POST /api/v1/pair`.
//!    [`CredentialIssuer::validate_code`] checks it and, on success, marks it
//!    consumed and mints a 256-bit session token.  The check and the mark
//!    happen under one lock, so two concurrent requests with the same code
//!    cannot both succeed.
//! 3. The router records the new device with
//!    [`CredentialIssuer::register_device`].  Every later request carries the
//!    token as `Authorization: Bearer <token>` and is checked with
//!    [`CredentialIssuer::validate_token`].
//! 4. The operator can revoke one device or all of them at any time.
//!    Registrations are never deleted; revocation only flips `authorized`.
//!
//! Wrong codes are counted against the active credential.  After
//! `max_failed_attempts` misses the code is burned and even the correct code
//! is refused, so a six-digit space cannot be brute-forced within the code's
//! lifetime.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Duration, Utc};
use lansync_core::Clock;
use rand::rngs::OsRng;
use rand::{Rng, RngCore};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

/// Default lifetime of a pairing code.
pub const DEFAULT_CODE_TTL_SECS: i64 = 300;

/// Longest accepted pairing code lifetime (one day).
pub const MAX_CODE_TTL_SECS: i64 = 24 * 60 * 60;

/// Default number of wrong codes tolerated before the active code is burned.
pub const DEFAULT_MAX_FAILED_ATTEMPTS: u32 = 5;

const TOKEN_BYTES: usize = 32;

// ── Errors ────────────────────────────────────────────────────────────────────

/// Error type for device store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// A file system I/O error occurred.
    #[error("I/O error accessing device store at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The stored data could not be parsed or serialized.
    #[error("device store format error: {0}")]
    Format(String),
}

/// Error type for issuer operations that touch the device registry.
#[derive(Debug, Error)]
pub enum IssuerError {
    /// A registration with this device ID already exists.
    #[error("device {0} is already registered")]
    DeviceExists(String),

    /// The registry could not be persisted.
    #[error(transparent)]
    Store(#[from] StoreError),
}

// ── Data types ────────────────────────────────────────────────────────────────

/// A short-lived pairing code.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PairingCredential {
    pub code: String,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub consumed: bool,
    pub failed_attempts: u32,
}

impl PairingCredential {
    /// Expiry is exclusive: the code is no longer valid at `expires_at`.
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

/// An opaque bearer token handed to a paired consumer.
///
/// `Debug` never prints the token itself.
#[derive(Clone, PartialEq, Eq)]
pub struct SessionToken(String);

impl SessionToken {
    /// Mints a fresh token from the OS random number generator.
    pub fn generate() -> Self {
        let mut bytes = [0u8; TOKEN_BYTES];
        OsRng.fill_bytes(&mut bytes);
        Self(hex::encode(bytes))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

impl fmt::Debug for SessionToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SessionToken(..)")
    }
}

/// A paired consumer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceRegistration {
    pub device_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_name: Option<String>,
    pub token: String,
    pub authorized: bool,
    pub registered_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revoked_at: Option<DateTime<Utc>>,
}

/// Tunables for [`CredentialIssuer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IssuerSettings {
    pub code_ttl: Duration,
    pub max_failed_attempts: u32,
}

impl Default for IssuerSettings {
    fn default() -> Self {
        Self {
            code_ttl: Duration::seconds(DEFAULT_CODE_TTL_SECS),
            max_failed_attempts: DEFAULT_MAX_FAILED_ATTEMPTS,
        }
    }
}

// ── Device store ──────────────────────────────────────────────────────────────

/// Persistence for device registrations.
pub trait DeviceStore: Send + Sync {
    /// Loads every stored registration.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the backing storage cannot be read.
    fn load(&self) -> Result<Vec<DeviceRegistration>, StoreError>;

    /// Replaces the stored registrations with `devices`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the backing storage cannot be written.
    fn save(&self, devices: &[DeviceRegistration]) -> Result<(), StoreError>;
}

/// Keeps registrations in memory only.
#[derive(Debug, Default)]
pub struct MemoryDeviceStore {
    devices: Mutex<Vec<DeviceRegistration>>,
}

impl MemoryDeviceStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl DeviceStore for MemoryDeviceStore {
    fn load(&self) -> Result<Vec<DeviceRegistration>, StoreError> {
        Ok(self
            .devices
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone())
    }

    fn save(&self, devices: &[DeviceRegistration]) -> Result<(), StoreError> {
        *self.devices.lock().unwrap_or_else(|e| e.into_inner()) = devices.to_vec();
        Ok(())
    }
}

// ── Issuer ────────────────────────────────────────────────────────────────────

#[derive(Debug, Default)]
struct IssuerState {
    active: Option<PairingCredential>,
    devices: BTreeMap<String, DeviceRegistration>,
}

/// Issues pairing codes and tokens and owns the device registry.
pub struct CredentialIssuer {
    clock: Arc<dyn Clock>,
    store: Arc<dyn DeviceStore>,
    settings: IssuerSettings,
    state: Mutex<IssuerState>,
}

impl CredentialIssuer {
    /// Creates an issuer and loads existing registrations from `store`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the store cannot be read.
    pub fn new(
        clock: Arc<dyn Clock>,
        store: Arc<dyn DeviceStore>,
        settings: IssuerSettings,
    ) -> Result<Self, StoreError> {
        let devices = store
            .load()?
            .into_iter()
            .map(|d| (d.device_id.clone(), d))
            .collect();
        Ok(Self {
            clock,
            store,
            settings,
            state: Mutex::new(IssuerState {
                active: None,
                devices,
            }),
        })
    }

    pub fn settings(&self) -> IssuerSettings {
        self.settings
    }

    /// Issues a new code, replacing any previous one.
    pub fn issue_code(&self) -> PairingCredential {
        let now = self.clock.now();
        let credential = PairingCredential {
            code: generate_code(),
            issued_at: now,
            expires_at: now
                .checked_add_signed(self.settings.code_ttl)
                .unwrap_or(DateTime::<Utc>::MAX_UTC),
            consumed: false,
            failed_attempts: 0,
        };
        let mut state = self.lock();
        if state.active.is_some() {
            info!("replacing active pairing code");
        }
        state.active = Some(credential.clone());
        info!("pairing code issued, expires at {}", credential.expires_at);
        credential
    }

    /// Withdraws the active code, if any.
    pub fn clear_code(&self) {
        if self.lock().active.take().is_some() {
            info!("pairing code cleared");
        }
    }

    /// Returns the active credential if it can still be redeemed.
    pub fn active_code(&self) -> Option<PairingCredential> {
        let now = self.clock.now();
        let state = self.lock();
        state
            .active
            .as_ref()
            .filter(|c| self.is_redeemable(c, now))
            .cloned()
    }

    /// Redeems `code`.  Succeeds at most once per issued code.
    ///
    /// Every failure returns `None` without saying why.
    pub fn validate_code(&self, code: &str) -> Option<SessionToken> {
        let now = self.clock.now();
        let mut state = self.lock();
        let credential = state.active.as_mut()?;
        if !self.is_redeemable(credential, now) {
            return None;
        }
        if !constant_time_eq(credential.code.as_bytes(), code.as_bytes()) {
            credential.failed_attempts += 1;
            if credential.failed_attempts >= self.settings.max_failed_attempts {
                warn!(
                    "pairing code burned after {} failed attempts",
                    credential.failed_attempts
                );
            }
            return None;
        }
        credential.consumed = true;
        Some(SessionToken::generate())
    }

    /// Records a newly paired device and persists the registry.
    ///
    /// # Errors
    ///
    /// Returns [`IssuerError::DeviceExists`] if `device_id` is taken, or
    /// [`IssuerError::Store`] if the registry cannot be saved.  On a store
    /// failure the registration is not kept.
    pub fn register_device(
        &self,
        device_id: &str,
        device_name: Option<String>,
        token: &SessionToken,
    ) -> Result<DeviceRegistration, IssuerError> {
        let registration = DeviceRegistration {
            device_id: device_id.to_string(),
            device_name,
            token: token.as_str().to_string(),
            authorized: true,
            registered_at: self.clock.now(),
            revoked_at: None,
        };

        let mut state = self.lock();
        if state.devices.contains_key(device_id) {
            return Err(IssuerError::DeviceExists(device_id.to_string()));
        }
        state
            .devices
            .insert(device_id.to_string(), registration.clone());
        if let Err(e) = self.persist(&mut state) {
            state.devices.remove(device_id);
            return Err(e.into());
        }
        info!("device {device_id} registered");
        Ok(registration)
    }

    /// Returns `true` if a device ID is already in the registry.
    pub fn is_registered(&self, device_id: &str) -> bool {
        self.lock().devices.contains_key(device_id)
    }

    /// Returns `true` only for the token of an authorized registration.
    ///
    /// Revocations written to the store by another process are picked up
    /// before the check.
    pub fn validate_token(&self, token: &str) -> bool {
        let mut state = self.lock();
        if let Err(e) = self.merge_stored(&mut state) {
            warn!("device registry not re-read, using cached registrations: {e}");
        }
        // Visit every registration so the time taken does not depend on
        // which one matched.
        state.devices.values().fold(false, |found, d| {
            let matches = constant_time_eq(d.token.as_bytes(), token.as_bytes());
            found | (matches & d.authorized)
        })
    }

    /// Revokes one device.  Returns `false` if it is unknown or already
    /// revoked.
    pub fn revoke(&self, device_id: &str) -> bool {
        let now = self.clock.now();
        let mut state = self.lock();
        let Some(device) = state.devices.get_mut(device_id) else {
            return false;
        };
        if !device.authorized {
            return false;
        }
        device.authorized = false;
        device.revoked_at = Some(now);
        info!("device {device_id} revoked");
        if let Err(e) = self.persist(&mut state) {
            warn!("revocation of {device_id} not persisted: {e}");
        }
        true
    }

    /// Revokes every authorized device.  Returns how many were revoked.
    pub fn revoke_all(&self) -> usize {
        let now = self.clock.now();
        let mut state = self.lock();
        let mut revoked = 0;
        for device in state.devices.values_mut().filter(|d| d.authorized) {
            device.authorized = false;
            device.revoked_at = Some(now);
            revoked += 1;
        }
        if revoked > 0 {
            info!("revoked {revoked} device(s)");
            if let Err(e) = self.persist(&mut state) {
                warn!("revocation of all devices not persisted: {e}");
            }
        }
        revoked
    }

    /// Snapshot of every registration, revoked ones included.
    pub fn devices(&self) -> Vec<DeviceRegistration> {
        let mut state = self.lock();
        if let Err(e) = self.merge_stored(&mut state) {
            warn!("device registry not re-read: {e}");
        }
        state.devices.values().cloned().collect()
    }

    fn is_redeemable(&self, credential: &PairingCredential, now: DateTime<Utc>) -> bool {
        !credential.consumed
            && !credential.is_expired_at(now)
            && credential.failed_attempts < self.settings.max_failed_attempts
    }

    /// Saves the registry after folding in what the store already holds, so
    /// a revocation made elsewhere is never overwritten.
    fn persist(&self, state: &mut IssuerState) -> Result<(), StoreError> {
        self.merge_stored(state)?;
        let devices: Vec<DeviceRegistration> = state.devices.values().cloned().collect();
        self.store.save(&devices)
    }

    /// Folds stored registrations into `state`.  A revocation on either side
    /// wins; registrations only known to the store are adopted.
    fn merge_stored(&self, state: &mut IssuerState) -> Result<(), StoreError> {
        for stored in self.store.load()? {
            match state.devices.get_mut(&stored.device_id) {
                Some(local) => {
                    if local.token == stored.token && local.authorized && !stored.authorized {
                        info!("device {} was revoked outside this process", stored.device_id);
                        local.authorized = false;
                        local.revoked_at = stored.revoked_at;
                    }
                }
                None => {
                    state.devices.insert(stored.device_id.clone(), stored);
                }
            }
        }
        Ok(())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, IssuerState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Generates a uniformly random 6-digit code with leading zeros.
fn generate_code() -> String {
    let n: u32 = OsRng.gen_range(0..1_000_000);
    format!("{n:06}")
}

/// Compares two byte strings without short-circuiting on the first
/// difference.  Lengths are not secret.
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

// ── Tests ─────────────────────────────────────────────────────────────────────
