//! Building the credential bundle the operator shows to the consumer.

use lansync_core::{BundleError, CredentialBundle, Fingerprint};

use crate::application::credentials::CredentialIssuer;

/// Issues a fresh pairing code and packages it with everything the consumer
/// needs to reach this holder.
///
/// Any previously displayed bundle stops working, because issuing a code
/// replaces the active one.
///
/// # Errors
///
/// Returns [`BundleError`] if `host` is empty or `port` is zero.
pub fn share(
    issuer: &CredentialIssuer,
    host: &str,
    port: u16,
    fingerprint: Fingerprint,
) -> Result<CredentialBundle, BundleError> {
    let credential = issuer.issue_code();
    CredentialBundle::new(host, port, fingerprint, credential.code, credential.expires_at)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chrono::DateTime;
    use lansync_core::ManualClock;

    use super::*;
    use crate::application::credentials::{IssuerSettings, MemoryDeviceStore};

    fn make_issuer() -> CredentialIssuer {
        let clock = ManualClock::new(DateTime::from_timestamp(1_700_000_000, 0).unwrap());
        CredentialIssuer::new(
            Arc::new(clock),
            Arc::new(MemoryDeviceStore::new()),
            IssuerSettings::default(),
        )
        .unwrap()
    }

    #[test]
    fn test_share_bundles_active_code() {
        // Arrange
        let issuer = make_issuer();
        let fp = Fingerprint::of_der(b"cert");

        // Act
        let bundle = share(&issuer, "192.168.1.20", 53318, fp).unwrap();

        // Assert
        let active = issuer.active_code().unwrap();
        assert_eq!(bundle.code, active.code);
        assert_eq!(bundle.expires_at(), active.expires_at);
        assert_eq!(bundle.fingerprint, fp);
        assert_eq!(bundle.address(), "192.168.1.20:53318");
    }

    #[test]
    fn test_share_rejects_zero_port() {
        let issuer = make_issuer();
        let result = share(&issuer, "10.0.0.2", 0, Fingerprint::of_der(b"cert"));
        assert_eq!(result, Err(BundleError::InvalidPort));
    }
}
