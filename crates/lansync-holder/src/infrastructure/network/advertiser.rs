//! UDP service advertisement.
//!
//! The holder binds a UDP socket on the discovery port (default 53317) and
//! answers every `Query` datagram for the LanSync service type with a unicast
//! `Advertisement` carrying its display name and TLS port.  Consumers learn
//! the holder's IP address from the source address of that reply.
//!
//! # Why answer queries instead of broadcasting? (for beginners)
//!
//! A holder that broadcasts on a timer generates traffic even when nobody is
//! looking.  Answering queries means the network is quiet until a consumer
//! opens its browse screen, and the consumer controls how often it refreshes.
//!
//! When sharing stops, [`UdpAdvertiser::withdraw`] sends a `Goodbye` to every
//! consumer that queried recently so their lists drop the holder right away
//! instead of waiting for the entry to go stale.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use lansync_core::discovery::{DiscoveryMessage, MAX_DATAGRAM_SIZE, SERVICE_TYPE};
use thiserror::Error;
use tokio::net::UdpSocket;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// How long a querier is remembered for `Goodbye` delivery.
pub const DEFAULT_QUERIER_TTL: Duration = Duration::from_secs(60);

/// Error type for advertisement operations.
#[derive(Debug, Error)]
pub enum AdvertiseError {
    /// The UDP socket could not be bound.
    #[error("failed to bind discovery socket on {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },
}

/// What the holder announces.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceAdvertisement {
    /// Display name; consumers key their service list on it.
    pub name: String,
    /// TLS port of the transport server.
    pub port: u16,
}

/// Publishes and withdraws the holder's presence on the LAN.
#[async_trait]
pub trait ServiceAdvertiser: Send + Sync {
    /// Starts answering queries, replacing any current advertisement.
    ///
    /// # Errors
    ///
    /// Returns [`AdvertiseError`] if the advertisement cannot be published.
    async fn publish(&self, ad: ServiceAdvertisement) -> Result<(), AdvertiseError>;

    /// Stops answering queries.  A no-op when nothing is published.
    async fn withdraw(&self);
}

type Queriers = Arc<std::sync::Mutex<HashMap<SocketAddr, Instant>>>;

struct Published {
    socket: Arc<UdpSocket>,
    task: JoinHandle<()>,
    name: String,
    queriers: Queriers,
}

/// Answers discovery queries over UDP.
pub struct UdpAdvertiser {
    bind_addr: SocketAddr,
    querier_ttl: Duration,
    published: Mutex<Option<Published>>,
}

impl UdpAdvertiser {
    pub fn new(bind_addr: SocketAddr) -> Self {
        Self {
            bind_addr,
            querier_ttl: DEFAULT_QUERIER_TTL,
            published: Mutex::new(None),
        }
    }

    pub fn with_querier_ttl(mut self, ttl: Duration) -> Self {
        self.querier_ttl = ttl;
        self
    }

    /// Address the socket is bound to while published.
    pub async fn local_addr(&self) -> Option<SocketAddr> {
        let published = self.published.lock().await;
        published.as_ref()?.socket.local_addr().ok()
    }
}

#[async_trait]
impl ServiceAdvertiser for UdpAdvertiser {
    async fn publish(&self, ad: ServiceAdvertisement) -> Result<(), AdvertiseError> {
        let mut published = self.published.lock().await;

        // Re-publishing keeps the socket (and therefore the port) and the
        // list of recent queriers.
        let (socket, queriers) = match published.take() {
            Some(old) => {
                old.task.abort();
                (old.socket, old.queriers)
            }
            None => {
                let socket = UdpSocket::bind(self.bind_addr)
                    .await
                    .map_err(|source| AdvertiseError::Bind {
                        addr: self.bind_addr,
                        source,
                    })?;
                (Arc::new(socket), Queriers::default())
            }
        };

        let reply = DiscoveryMessage::Advertisement {
            service_type: SERVICE_TYPE.to_string(),
            name: ad.name.clone(),
            port: ad.port,
        }
        .encode();
        let task = tokio::spawn(respond_loop(
            Arc::clone(&socket),
            reply,
            Arc::clone(&queriers),
        ));

        info!(
            "advertising {:?} on port {} via UDP {}",
            ad.name,
            ad.port,
            socket.local_addr().unwrap_or(self.bind_addr)
        );
        *published = Some(Published {
            socket,
            task,
            name: ad.name,
            queriers,
        });
        Ok(())
    }

    async fn withdraw(&self) {
        let Some(published) = self.published.lock().await.take() else {
            return;
        };
        published.task.abort();

        let goodbye = DiscoveryMessage::Goodbye {
            service_type: SERVICE_TYPE.to_string(),
            name: published.name.clone(),
        }
        .encode();
        let recipients = recent_queriers(&published.queriers, self.querier_ttl);
        for dest in &recipients {
            if let Err(e) = published.socket.send_to(&goodbye, *dest).await {
                debug!("failed to send goodbye to {dest}: {e}");
            }
        }
        info!(
            "advertisement of {:?} withdrawn, notified {} querier(s)",
            published.name,
            recipients.len()
        );
    }
}

impl Drop for UdpAdvertiser {
    fn drop(&mut self) {
        if let Ok(mut published) = self.published.try_lock() {
            if let Some(p) = published.take() {
                p.task.abort();
            }
        }
    }
}

/// Receive loop: answer matching queries until aborted.
async fn respond_loop(socket: Arc<UdpSocket>, reply: Vec<u8>, queriers: Queriers) {
    // One byte of headroom so oversized datagrams are detected, not truncated.
    let mut buf = vec![0u8; MAX_DATAGRAM_SIZE + 1];
    loop {
        let (len, src) = match socket.recv_from(&mut buf).await {
            Ok(pair) => pair,
            Err(e) => {
                // ICMP port-unreachable from an earlier send surfaces here on
                // some platforms; it does not affect the socket.
                warn!("discovery recv error: {e}");
                tokio::time::sleep(Duration::from_millis(100)).await;
                continue;
            }
        };

        match DiscoveryMessage::decode(&buf[..len]) {
            Ok(DiscoveryMessage::Query { service_type }) if service_type == SERVICE_TYPE => {
                debug!("query from {src}");
                queriers
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .insert(src, Instant::now());
                if let Err(e) = socket.send_to(&reply, src).await {
                    warn!("failed to answer query from {src}: {e}");
                }
            }
            Ok(other) => debug!("ignoring {other:?} from {src}"),
            Err(e) => debug!("failed to decode discovery datagram from {src}: {e}"),
        }
    }
}

fn recent_queriers(queriers: &Queriers, ttl: Duration) -> Vec<SocketAddr> {
    let now = Instant::now();
    queriers
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .iter()
        .filter(|(_, seen)| now.duration_since(**seen) <= ttl)
        .map(|(addr, _)| *addr)
        .collect()
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::timeout;

    const WAIT: Duration = Duration::from_secs(2);

    async fn published_advertiser(name: &str, port: u16) -> (UdpAdvertiser, SocketAddr) {
        let advertiser = UdpAdvertiser::new("127.0.0.1:0".parse().unwrap());
        advertiser
            .publish(ServiceAdvertisement {
                name: name.to_string(),
                port,
            })
            .await
            .unwrap();
        let addr = advertiser.local_addr().await.unwrap();
        (advertiser, addr)
    }

    async fn recv(socket: &UdpSocket) -> DiscoveryMessage {
        let mut buf = [0u8; 2048];
        let (len, _) = timeout(WAIT, socket.recv_from(&mut buf))
            .await
            .expect("datagram within timeout")
            .unwrap();
        DiscoveryMessage::decode(&buf[..len]).unwrap()
    }

    #[tokio::test]
    async fn test_query_is_answered_with_advertisement() {
        // Arrange
        let (_advertiser, addr) = published_advertiser("Kitchen iPad", 53318).await;
        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();

        // Act
        client
            .send_to(&DiscoveryMessage::query().encode(), addr)
            .await
            .unwrap();

        // Assert
        assert_eq!(
            recv(&client).await,
            DiscoveryMessage::Advertisement {
                service_type: SERVICE_TYPE.to_string(),
                name: "Kitchen iPad".to_string(),
                port: 53318,
            }
        );
    }

    #[tokio::test]
    async fn test_query_for_other_service_is_ignored() {
        let (_advertiser, addr) = published_advertiser("Holder", 1).await;
        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let query = DiscoveryMessage::Query {
            service_type: "_other._tcp".to_string(),
        };

        client.send_to(&query.encode(), addr).await.unwrap();

        let mut buf = [0u8; 64];
        let result = timeout(Duration::from_millis(300), client.recv_from(&mut buf)).await;
        assert!(result.is_err(), "no reply expected");
    }

    #[tokio::test]
    async fn test_withdraw_sends_goodbye_to_recent_querier() {
        // Arrange
        let (advertiser, addr) = published_advertiser("Holder", 4000).await;
        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        client
            .send_to(&DiscoveryMessage::query().encode(), addr)
            .await
            .unwrap();
        recv(&client).await;

        // Act
        advertiser.withdraw().await;

        // Assert
        assert_eq!(
            recv(&client).await,
            DiscoveryMessage::Goodbye {
                service_type: SERVICE_TYPE.to_string(),
                name: "Holder".to_string(),
            }
        );
        assert!(advertiser.local_addr().await.is_none());
    }

    #[tokio::test]
    async fn test_republish_keeps_port_and_updates_reply() {
        let (advertiser, addr) = published_advertiser("Holder", 4000).await;

        advertiser
            .publish(ServiceAdvertisement {
                name: "Holder".to_string(),
                port: 4001,
            })
            .await
            .unwrap();

        assert_eq!(advertiser.local_addr().await, Some(addr));
        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        client
            .send_to(&DiscoveryMessage::query().encode(), addr)
            .await
            .unwrap();
        assert!(matches!(
            recv(&client).await,
            DiscoveryMessage::Advertisement { port: 4001, .. }
        ));
    }

    #[tokio::test]
    async fn test_withdraw_without_publish_is_noop() {
        let advertiser = UdpAdvertiser::new("127.0.0.1:0".parse().unwrap());
        advertiser.withdraw().await;
        assert!(advertiser.local_addr().await.is_none());
    }

    #[test]
    fn test_recent_queriers_drops_expired_entries() {
        let queriers = Queriers::default();
        let addr: SocketAddr = "10.0.0.9:5000".parse().unwrap();
        queriers.lock().unwrap().insert(addr, Instant::now());

        assert_eq!(recent_queriers(&queriers, Duration::from_secs(60)), vec![addr]);
        std::thread::sleep(Duration::from_millis(5));
        assert!(recent_queriers(&queriers, Duration::from_millis(1)).is_empty());
    }
}
