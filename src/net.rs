//! Local address detection and subnet checks
//!
//! The UPnP controller needs the site-local IPv4 address the gateway should
//! forward to, and may only proceed when that address falls inside one of the
//! configured CIDR subnets.

use std::net::{IpAddr, Ipv4Addr, SocketAddr, UdpSocket};
use tracing::debug;

/// Bind address for the routing lookup socket
const UDP_BIND_ADDRESS: &str = "0.0.0.0:0";

/// Parse an IPv4 CIDR string (`a.b.c.d/prefix`)
///
/// Returns `None` for malformed input or a prefix above 32.
pub fn parse_cidr(cidr: &str) -> Option<(Ipv4Addr, u8)> {
    let (addr, prefix) = cidr.trim().split_once('/')?;
    let addr = addr.trim().parse::<Ipv4Addr>().ok()?;
    let prefix = prefix.trim().parse::<u8>().ok()?;
    if prefix > 32 {
        return None;
    }
    Some((addr, prefix))
}

/// Network mask for a prefix length (0 matches everything)
fn prefix_mask(prefix: u8) -> u32 {
    if prefix == 0 {
        0
    } else {
        u32::MAX << (32 - u32::from(prefix))
    }
}

/// Check whether `ip` falls inside `cidr`
///
/// The top `prefix` bits of `ip` must equal those of the network address.
/// A malformed CIDR never matches.
///
/// # Example
///
/// ```
/// use portbridge::net::cidr_matches;
///
/// let ip = "192.168.1.20".parse().unwrap();
/// assert!(cidr_matches(ip, "192.168.0.0/16"));
/// assert!(!cidr_matches(ip, "10.0.0.0/8"));
/// assert!(cidr_matches(ip, "0.0.0.0/0"));
/// ```
pub fn cidr_matches(ip: Ipv4Addr, cidr: &str) -> bool {
    match parse_cidr(cidr) {
        Some((network, prefix)) => {
            let mask = prefix_mask(prefix);
            (u32::from(ip) & mask) == (u32::from(network) & mask)
        }
        None => {
            debug!("Ignoring malformed CIDR {}", cidr);
            false
        }
    }
}

/// Check `ip` against an allow-list of CIDR subnets
///
/// An empty (or all-blank) list allows every address.
pub fn ip_in_allowed_subnets(ip: Ipv4Addr, allowed: &[String]) -> bool {
    let mut subnets = allowed.iter().map(|s| s.trim()).filter(|s| !s.is_empty()).peekable();
    if subnets.peek().is_none() {
        return true;
    }
    subnets.any(|cidr| cidr_matches(ip, cidr))
}

/// Check if an IPv4 address is site-local (RFC 1918)
pub fn is_site_local(ip: Ipv4Addr) -> bool {
    ip.is_private()
}

/// Find the local site-local IPv4 address used to reach `target`
///
/// Uses a connected UDP socket to let the OS pick the outgoing interface.
/// No packets are sent. Loopback and non-private results are rejected.
pub fn local_ipv4_toward(target: IpAddr) -> Option<Ipv4Addr> {
    let socket = UdpSocket::bind(UDP_BIND_ADDRESS).ok()?;
    socket.connect(SocketAddr::new(target, 1900)).ok()?;

    match socket.local_addr().ok()?.ip() {
        IpAddr::V4(ip) if !ip.is_loopback() && is_site_local(ip) => {
            debug!("Local address toward {} is {}", target, ip);
            Some(ip)
        }
        other => {
            debug!("Route toward {} uses non site-local address {}", target, other);
            None
        }
    }
}
