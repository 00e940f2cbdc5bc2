//! UPnP IGD (Internet Gateway Device) client
//!
//! Discovers a gateway with SSDP, then drives it with SOAP actions:
//! - AddPortMapping / DeletePortMapping
//! - GetSpecificPortMappingEntry (existence probe)
//! - GetExternalIPAddress
//!
//! Only IPv4 TCP mappings are supported.

pub mod client;
pub mod soap;
pub mod ssdp;
pub mod types;

pub use client::GatewayClient;
pub use types::{Expiry, GatewayHandle, IpProtocol, PortMapping, RENEWAL_FLOOR};

/// Compile a fixed pattern; a bad pattern disables its matcher instead of panicking
pub(crate) fn pattern(source: &str) -> Option<regex::Regex> {
    regex::Regex::new(source)
        .map_err(|e| tracing::error!("Invalid pattern {:?}: {}", source, e))
        .ok()
}
