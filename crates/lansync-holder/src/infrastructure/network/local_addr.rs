//! Picks the LAN address to put into the credential bundle.

use std::net::{IpAddr, UdpSocket};

/// Returns the address of the interface the OS would use to reach the wider
/// network.
///
/// Connecting a UDP socket sends nothing; it only makes the OS select a
/// route, whose source address is then read back.  Returns `None` on hosts
/// with no route (e.g. an isolated test container).
pub fn primary_lan_address() -> Option<IpAddr> {
    let socket = UdpSocket::bind("0.0.0.0:0").ok()?;
    socket.connect("192.0.2.1:9").ok()?;
    let ip = socket.local_addr().ok()?.ip();
    (!ip.is_unspecified()).then_some(ip)
}
