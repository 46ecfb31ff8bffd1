//! Out-of-band credential bundle and its displayable string encoding.
//!
//! The holder shows the bundle (as text or a QR code) and the consumer reads
//! it back.  Encoding format:
//!
//! ```text
//! lansync1.<base64url(json)>
//! ```
//!
//! The JSON object always has its keys in sorted order (`code`, `expiresAt`,
//! `fingerprint`, `host`, `port`) and carries the expiry as whole Unix
//! seconds, so the same bundle always encodes to the same string.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::fingerprint::Fingerprint;

/// Prefix identifying the encoding version.
pub const BUNDLE_PREFIX: &str = "lansync1.";

/// Number of digits in a pairing code.
pub const CODE_DIGITS: usize = 6;

/// Errors produced while decoding or validating a bundle.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum BundleError {
    #[error("bundle does not start with \"lansync1.\"")]
    MissingPrefix,
    #[error("bundle payload is not valid base64url: {0}")]
    InvalidBase64(String),
    #[error("bundle payload is not valid JSON: {0}")]
    InvalidJson(String),
    #[error("pairing code must be 6 ASCII digits")]
    InvalidCode,
    #[error("port must be non-zero")]
    InvalidPort,
    #[error("host must not be empty")]
    EmptyHost,
    #[error("expiry timestamp {0} is out of range")]
    InvalidExpiry(i64),
}

/// Everything a consumer needs to reach and pair with a holder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CredentialBundle {
    pub host: String,
    pub port: u16,
    pub fingerprint: Fingerprint,
    pub code: String,
    expires_at: DateTime<Utc>,
}

/// JSON shape of the bundle.  Field order is alphabetical so the object is
/// serialized with sorted keys.
#[derive(Serialize, Deserialize)]
struct BundleWire {
    code: String,
    #[serde(rename = "expiresAt")]
    expires_at: i64,
    fingerprint: Fingerprint,
    host: String,
    port: u16,
}

impl CredentialBundle {
    /// Builds and validates a bundle.  `expires_at` is truncated to whole
    /// seconds, the precision of the encoded form.
    ///
    /// # Errors
    ///
    /// Returns [`BundleError`] if the code, host, or port is invalid.
    pub fn new(
        host: impl Into<String>,
        port: u16,
        fingerprint: Fingerprint,
        code: impl Into<String>,
        expires_at: DateTime<Utc>,
    ) -> Result<Self, BundleError> {
        let seconds = expires_at.timestamp();
        let bundle = Self {
            host: host.into(),
            port,
            fingerprint,
            code: code.into(),
            expires_at: DateTime::from_timestamp(seconds, 0)
                .ok_or(BundleError::InvalidExpiry(seconds))?,
        };
        bundle.validate()?;
        Ok(bundle)
    }

    pub fn expires_at(&self) -> DateTime<Utc> {
        self.expires_at
    }

    /// Expiry is exclusive: a bundle is already expired at `expires_at`.
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Utc::now())
    }

    /// `host:port` suitable for `TcpStream::connect`.
    pub fn address(&self) -> String {
        if self.host.contains(':') && !self.host.starts_with('[') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }

    /// Encodes the bundle as a single displayable string.
    pub fn encode(&self) -> String {
        let wire = BundleWire {
            code: self.code.clone(),
            expires_at: self.expires_at.timestamp(),
            fingerprint: self.fingerprint,
            host: self.host.clone(),
            port: self.port,
        };
        // Serializing a plain struct of strings and integers cannot fail.
        let json = serde_json::to_vec(&wire).unwrap_or_default();
        format!("{BUNDLE_PREFIX}{}", URL_SAFE_NO_PAD.encode(json))
    }

    /// Decodes and validates a bundle string.
    ///
    /// Surrounding whitespace is ignored so values pasted from a terminal or
    /// read from a scanner decode cleanly.
    ///
    /// # Errors
    ///
    /// Returns [`BundleError`] describing the first problem found.
    pub fn decode(encoded: &str) -> Result<Self, BundleError> {
        let payload = encoded
            .trim()
            .strip_prefix(BUNDLE_PREFIX)
            .ok_or(BundleError::MissingPrefix)?;
        let json = URL_SAFE_NO_PAD
            .decode(payload)
            .map_err(|e| BundleError::InvalidBase64(e.to_string()))?;
        let wire: BundleWire =
            serde_json::from_slice(&json).map_err(|e| BundleError::InvalidJson(e.to_string()))?;
        let expires_at = DateTime::from_timestamp(wire.expires_at, 0)
            .ok_or(BundleError::InvalidExpiry(wire.expires_at))?;
        Self::new(wire.host, wire.port, wire.fingerprint, wire.code, expires_at)
    }

    fn validate(&self) -> Result<(), BundleError> {
        if !is_valid_code(&self.code) {
            return Err(BundleError::InvalidCode);
        }
        if self.port == 0 {
            return Err(BundleError::InvalidPort);
        }
        if self.host.trim().is_empty() {
            return Err(BundleError::EmptyHost);
        }
        Ok(())
    }
}

/// Returns `true` if `code` is exactly [`CODE_DIGITS`] ASCII digits.
pub fn is_valid_code(code: &str) -> bool {
    code.len() == CODE_DIGITS && code.bytes().all(|b| b.is_ascii_digit())
}

// ── Tests ─────────────────────────────────────────────────────────────────────
