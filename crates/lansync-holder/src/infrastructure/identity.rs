//! TLS identity of the holder: a self-signed certificate and its key.
//!
//! The consumer does not trust the certificate through any CA.  It trusts
//! exactly one certificate, identified by the SHA-256 [`Fingerprint`] carried
//! in the credential bundle.  The identity therefore has to stay the same
//! across restarts, otherwise every paired consumer would see a mismatch.
//! [`FileIdentityProvider`] persists it as two DER files in the holder's
//! data directory:
//!
//! ```text
//! <data_dir>/identity.cert.der
//! <data_dir>/identity.key.der   (PKCS#8)
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;

use lansync_core::Fingerprint;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use thiserror::Error;
use tracing::info;

const CERT_FILE: &str = "identity.cert.der";
const KEY_FILE: &str = "identity.key.der";

/// Error type for identity operations.
#[derive(Debug, Error)]
pub enum IdentityError {
    /// Certificate generation failed.
    #[error("failed to generate certificate: {0}")]
    Generate(String),

    /// A file system I/O error occurred.
    #[error("I/O error accessing identity at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Certificate and private key used by the transport server.
#[derive(Clone)]
pub struct TlsIdentity {
    cert_der: Arc<Vec<u8>>,
    key_der: Arc<Vec<u8>>,
    fingerprint: Fingerprint,
}

impl TlsIdentity {
    /// Wraps an existing DER certificate and PKCS#8 key.
    pub fn from_der(cert_der: Vec<u8>, key_der: Vec<u8>) -> Self {
        let fingerprint = Fingerprint::of_der(&cert_der);
        Self {
            cert_der: Arc::new(cert_der),
            key_der: Arc::new(key_der),
            fingerprint,
        }
    }

    /// Generates a self-signed certificate for `subject_names`.
    ///
    /// # Errors
    ///
    /// Returns [`IdentityError::Generate`] if key or certificate generation
    /// fails.
    pub fn generate(subject_names: &[String]) -> Result<Self, IdentityError> {
        use rcgen::{generate_simple_self_signed, CertifiedKey};

        let CertifiedKey { cert, key_pair } = generate_simple_self_signed(subject_names.to_vec())
            .map_err(|e| IdentityError::Generate(e.to_string()))?;
        Ok(Self::from_der(cert.der().to_vec(), key_pair.serialize_der()))
    }

    pub fn certificate(&self) -> CertificateDer<'static> {
        CertificateDer::from(self.cert_der.as_ref().clone())
    }

    pub fn private_key(&self) -> PrivateKeyDer<'static> {
        PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(self.key_der.as_ref().clone()))
    }

    pub fn fingerprint(&self) -> Fingerprint {
        self.fingerprint
    }
}

impl std::fmt::Debug for TlsIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsIdentity")
            .field("fingerprint", &self.fingerprint)
            .finish_non_exhaustive()
    }
}

/// Supplies the identity the server presents.
pub trait IdentityProvider: Send + Sync {
    /// # Errors
    ///
    /// Returns [`IdentityError`] if the identity cannot be loaded or created.
    fn identity(&self) -> Result<TlsIdentity, IdentityError>;
}

/// Loads the identity from disk, generating and saving it on first use.
#[derive(Debug, Clone)]
pub struct FileIdentityProvider {
    dir: PathBuf,
    subject_names: Vec<String>,
}

impl FileIdentityProvider {
    pub fn new(dir: impl Into<PathBuf>, subject_names: Vec<String>) -> Self {
        Self {
            dir: dir.into(),
            subject_names,
        }
    }

    pub fn cert_path(&self) -> PathBuf {
        self.dir.join(CERT_FILE)
    }

    pub fn key_path(&self) -> PathBuf {
        self.dir.join(KEY_FILE)
    }
}

impl IdentityProvider for FileIdentityProvider {
    fn identity(&self) -> Result<TlsIdentity, IdentityError> {
        let (cert_path, key_path) = (self.cert_path(), self.key_path());
        if cert_path.exists() && key_path.exists() {
            let identity = TlsIdentity::from_der(read(&cert_path)?, read(&key_path)?);
            info!("loaded identity {}", identity.fingerprint());
            return Ok(identity);
        }

        let identity = TlsIdentity::generate(&self.subject_names)?;
        std::fs::create_dir_all(&self.dir).map_err(|source| IdentityError::Io {
            path: self.dir.clone(),
            source,
        })?;
        write(&key_path, &identity.key_der)?;
        write(&cert_path, &identity.cert_der)?;
        info!("generated identity {}", identity.fingerprint());
        Ok(identity)
    }
}

/// Holds one identity in memory for the lifetime of the process.
#[derive(Debug, Clone)]
pub struct EphemeralIdentityProvider {
    identity: TlsIdentity,
}

impl EphemeralIdentityProvider {
    /// # Errors
    ///
    /// Returns [`IdentityError::Generate`] if generation fails.
    pub fn generate(subject_names: &[String]) -> Result<Self, IdentityError> {
        Ok(Self {
            identity: TlsIdentity::generate(subject_names)?,
        })
    }

    pub fn from_identity(identity: TlsIdentity) -> Self {
        Self { identity }
    }
}

impl IdentityProvider for EphemeralIdentityProvider {
    fn identity(&self) -> Result<TlsIdentity, IdentityError> {
        Ok(self.identity.clone())
    }
}

fn read(path: &Path) -> Result<Vec<u8>, IdentityError> {
    std::fs::read(path).map_err(|source| IdentityError::Io {
        path: path.to_path_buf(),
        source,
    })
}

fn write(path: &Path, bytes: &[u8]) -> Result<(), IdentityError> {
    std::fs::write(path, bytes).map_err(|source| IdentityError::Io {
        path: path.to_path_buf(),
        source,
    })
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn names() -> Vec<String> {
        vec!["localhost".to_string()]
    }

    #[test]
    fn test_generate_fingerprint_matches_certificate() {
        let identity = TlsIdentity::generate(&names()).unwrap();
        assert!(identity.fingerprint().matches_der(identity.certificate().as_ref()));
    }

    #[test]
    fn test_file_provider_persists_identity_across_instances() {
        // Arrange
        let dir = tempfile::tempdir().unwrap();
        let first = FileIdentityProvider::new(dir.path(), names());

        // Act
        let a = first.identity().unwrap();
        let b = FileIdentityProvider::new(dir.path(), names()).identity().unwrap();

        // Assert
        assert_eq!(a.fingerprint(), b.fingerprint());
        assert!(first.cert_path().exists());
        assert!(first.key_path().exists());
    }

    #[test]
    fn test_file_provider_creates_missing_directory() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("a").join("b");

        let identity = FileIdentityProvider::new(&nested, names()).identity();

        assert!(identity.is_ok());
        assert!(nested.join(CERT_FILE).exists());
    }

    #[test]
    fn test_ephemeral_provider_returns_same_identity() {
        let provider = EphemeralIdentityProvider::generate(&names()).unwrap();
        assert_eq!(
            provider.identity().unwrap().fingerprint(),
            provider.identity().unwrap().fingerprint()
        );
    }
}
