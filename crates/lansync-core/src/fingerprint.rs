//! SHA-256 certificate fingerprints used as the pinned trust anchor.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

/// Number of bytes in a SHA-256 digest.
pub const FINGERPRINT_LEN: usize = 32;

/// Error returned when a fingerprint string cannot be parsed.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum FingerprintError {
    #[error("fingerprint is not valid hex: {0}")]
    InvalidHex(String),
    #[error("fingerprint must be 32 bytes, got {0}")]
    WrongLength(usize),
}

/// SHA-256 digest of a DER-encoded certificate.
///
/// Displayed and serialized as 64 lowercase hex characters.  Parsing also
/// accepts uppercase and colon-separated forms (`AA:BB:...`) since that is
/// how most certificate viewers print fingerprints.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Fingerprint([u8; FINGERPRINT_LEN]);

impl Fingerprint {
    /// Hashes a DER-encoded certificate.
    pub fn of_der(der: &[u8]) -> Self {
        let digest = Sha256::digest(der);
        let mut bytes = [0u8; FINGERPRINT_LEN];
        bytes.copy_from_slice(&digest);
        Self(bytes)
    }

    pub fn from_bytes(bytes: [u8; FINGERPRINT_LEN]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; FINGERPRINT_LEN] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Returns `true` if `der` hashes to this fingerprint.
    ///
    /// The comparison runs over every byte regardless of where the first
    /// difference is.
    pub fn matches_der(&self, der: &[u8]) -> bool {
        let other = Self::of_der(der);
        self.0
            .iter()
            .zip(other.0.iter())
            .fold(0u8, |acc, (a, b)| acc | (a ^ b))
            == 0
    }
}

impl FromStr for Fingerprint {
    type Err = FingerprintError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let cleaned: String = s.trim().chars().filter(|c| *c != ':').collect();
        let raw = hex::decode(&cleaned).map_err(|e| FingerprintError::InvalidHex(e.to_string()))?;
        let bytes: [u8; FINGERPRINT_LEN] = raw
            .as_slice()
            .try_into()
            .map_err(|_| FingerprintError::WrongLength(raw.len()))?;
        Ok(Self(bytes))
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Fingerprint({})", self.to_hex())
    }
}

impl Serialize for Fingerprint {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for Fingerprint {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}
