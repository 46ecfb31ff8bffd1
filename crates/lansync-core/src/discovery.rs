//! LAN discovery datagrams.
//!
//! The holder listens on the discovery UDP port.  Consumers broadcast a
//! [`DiscoveryMessage::Query`] and every holder advertising the same service
//! type answers with a unicast [`DiscoveryMessage::Advertisement`].  When the
//! holder stops sharing it sends [`DiscoveryMessage::Goodbye`] to the
//! consumers that recently queried it, so their browsers can drop the entry
//! without waiting for it to go stale.
//!
//! Datagrams are small JSON objects tagged by `kind`:
//!
//! ```text
//! {"kind":"query","serviceType":"_lansync._tcp"}
//! {"kind":"advertisement","serviceType":"_lansync._tcp","name":"Kitchen iPad","port":53318}
//! {"kind":"goodbye","serviceType":"_lansync._tcp","name":"Kitchen iPad"}
//! ```

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Service type shared by both ends.
pub const SERVICE_TYPE: &str = "_lansync._tcp";

/// Default UDP port for discovery traffic.
pub const DEFAULT_DISCOVERY_PORT: u16 = 53317;

/// Largest datagram either side will send or accept.
pub const MAX_DATAGRAM_SIZE: usize = 1024;

/// Errors produced while decoding a discovery datagram.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("datagram of {0} bytes exceeds the 1024-byte limit")]
    TooLarge(usize),
    #[error("malformed discovery datagram: {0}")]
    Malformed(String),
}

/// One discovery datagram.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum DiscoveryMessage {
    /// Sent by a browsing consumer.
    #[serde(rename_all = "camelCase")]
    Query { service_type: String },
    /// Sent by a holder in answer to a matching query.
    #[serde(rename_all = "camelCase")]
    Advertisement {
        service_type: String,
        /// Human-readable holder name, also the discovery key.
        name: String,
        /// TLS port of the transport server.
        port: u16,
    },
    /// Sent by a holder that withdraws its advertisement.
    #[serde(rename_all = "camelCase")]
    Goodbye { service_type: String, name: String },
}

impl DiscoveryMessage {
    pub fn query() -> Self {
        DiscoveryMessage::Query {
            service_type: SERVICE_TYPE.to_string(),
        }
    }

    pub fn service_type(&self) -> &str {
        match self {
            DiscoveryMessage::Query { service_type }
            | DiscoveryMessage::Advertisement { service_type, .. }
            | DiscoveryMessage::Goodbye { service_type, .. } => service_type,
        }
    }

    /// Encodes the datagram.
    pub fn encode(&self) -> Vec<u8> {
        // Enum of strings and integers; serialization cannot fail.
        serde_json::to_vec(self).unwrap_or_default()
    }

    /// Decodes one datagram.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError`] for oversized or malformed datagrams.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        if bytes.len() > MAX_DATAGRAM_SIZE {
            return Err(ProtocolError::TooLarge(bytes.len()));
        }
        serde_json::from_slice(bytes).map_err(|e| ProtocolError::Malformed(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_query_uses_shared_service_type() {
        assert_eq!(DiscoveryMessage::query().service_type(), SERVICE_TYPE);
    }

    #[test]
    fn test_advertisement_json_shape() {
        // Arrange
        let msg = DiscoveryMessage::Advertisement {
            service_type: SERVICE_TYPE.to_string(),
            name: "Kitchen iPad".to_string(),
            port: 53318,
        };

        // Act
        let json: serde_json::Value = serde_json::from_slice(&msg.encode()).unwrap();

        // Assert
        assert_eq!(json["kind"], "advertisement");
        assert_eq!(json["serviceType"], SERVICE_TYPE);
        assert_eq!(json["port"], 53318);
        assert_eq!(DiscoveryMessage::decode(&msg.encode()).unwrap(), msg);
    }

    #[test]
    fn test_decode_rejects_unknown_kind() {
        let result = DiscoveryMessage::decode(br#"{"kind":"hello"}"#);
        assert!(matches!(result, Err(ProtocolError::Malformed(_))));
    }

    #[test]
    fn test_decode_rejects_oversized_datagram() {
        let big = vec![b' '; MAX_DATAGRAM_SIZE + 1];
        assert_eq!(
            DiscoveryMessage::decode(&big),
            Err(ProtocolError::TooLarge(MAX_DATAGRAM_SIZE + 1))
        );
    }
}
