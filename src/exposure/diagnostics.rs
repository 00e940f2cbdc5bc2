//! Diagnostics report
//!
//! Serializable for hosts that want JSON; `Display` renders the plain-text
//! status block.

use super::ExposureMethod;
use super::upnp::UpnpPhase;
use crate::config::TunnelMode;
use serde::Serialize;
use std::fmt;
use std::net::Ipv4Addr;

/// Tunnel connection status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TunnelStatus {
    /// No tunnel and none scheduled
    Disconnected,
    /// Registered with the relay
    Connected,
    /// Waiting for the next attempt
    Reconnecting,
}

impl fmt::Display for TunnelStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TunnelStatus::Disconnected => "DISCONNECTED",
            TunnelStatus::Connected => "CONNECTED",
            TunnelStatus::Reconnecting => "RECONNECTING",
        };
        f.write_str(name)
    }
}

/// One mapped gateway port
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MappedPort {
    /// Entry name
    pub name: String,
    /// Gateway port
    pub external_port: u16,
    /// Local port
    pub internal_port: u16,
    /// Seconds until the lease ends; `None` for indefinite leases
    pub expires_in_secs: Option<u64>,
}

/// UPnP controller detail
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UpnpDiagnostics {
    /// Attempt phase
    pub phase: UpnpPhase,
    /// Controller reports active
    pub active: bool,
    /// WAN service type URN
    pub service_type: Option<String>,
    /// SOAP control URL
    pub control_url: Option<String>,
    /// Device description URL
    pub location: Option<String>,
    /// LAN address mappings point at
    pub local_ip: Option<Ipv4Addr>,
    /// Public address of the gateway
    pub wan_ip: Option<Ipv4Addr>,
    /// Tracked mappings
    pub mapped_ports: Vec<MappedPort>,
    /// Most recent failure
    pub last_error: Option<String>,
}

/// Tunnel controller detail
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TunnelDiagnostics {
    /// Connection status
    pub status: TunnelStatus,
    /// Relay `host:port`
    pub relay: String,
    /// Current attempt's session
    pub session_id: Option<String>,
    /// Relay-assigned endpoint
    pub public_address: Option<String>,
    /// Age of the last frame from the relay
    pub latency_ms: Option<u64>,
    /// Bytes forwarded in both directions
    pub bytes_transferred: u64,
    /// Consecutive failed attempts
    pub reconnect_attempts: u32,
    /// Age of the connected session
    pub uptime_secs: Option<u64>,
    /// Why the last connection ended
    pub last_disconnect_reason: Option<String>,
    /// Most recent failure
    pub last_error: Option<String>,
}

/// Detail for the method being reported
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum MethodDetail {
    /// UPnP controller
    Upnp(UpnpDiagnostics),
    /// Tunnel controller
    Tunnel(TunnelDiagnostics),
}

/// Orchestrator status snapshot
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Diagnostics {
    /// The service is reachable from the internet
    pub exposed: bool,
    /// Authoritative method, if any
    pub method: Option<ExposureMethod>,
    /// Configured tunnel mode
    pub mode: TunnelMode,
    /// Public `host:port`
    pub public_address: Option<String>,
    /// Most recent failure
    pub last_error: Option<String>,
    /// Method-specific detail
    pub detail: Option<MethodDetail>,
}

impl Diagnostics {
    /// Pretty-printed JSON
    pub fn to_json(&self) -> crate::Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

fn or_none<T: fmt::Display>(value: &Option<T>) -> String {
    match value {
        Some(v) => v.to_string(),
        None => "none".to_string(),
    }
}

impl fmt::Display for Diagnostics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "=== PortBridge Exposure Status ===")?;
        writeln!(f, "Exposed: {}", if self.exposed { "yes" } else { "no" })?;
        writeln!(
            f,
            "Method: {}",
            self.method.map(|m| m.as_str()).unwrap_or("NONE")
        )?;
        writeln!(f, "Mode: {}", self.mode)?;
        writeln!(f, "Public address: {}", or_none(&self.public_address))?;
        writeln!(f, "Last error: {}", or_none(&self.last_error))?;

        match &self.detail {
            Some(MethodDetail::Upnp(upnp)) => {
                writeln!(f, "--- UPnP ---")?;
                writeln!(f, "Phase: {}", upnp.phase)?;
                writeln!(f, "Service type: {}", or_none(&upnp.service_type))?;
                writeln!(f, "Control URL: {}", or_none(&upnp.control_url))?;
                writeln!(f, "Location: {}", or_none(&upnp.location))?;
                writeln!(f, "Local IP: {}", or_none(&upnp.local_ip))?;
                writeln!(f, "WAN IP: {}", or_none(&upnp.wan_ip))?;
                if upnp.mapped_ports.is_empty() {
                    writeln!(f, "Mapped ports: none")?;
                } else {
                    writeln!(f, "Mapped ports:")?;
                    for port in &upnp.mapped_ports {
                        let expiry = match port.expires_in_secs {
                            Some(secs) => format!("expires in {}s", secs),
                            None => "no expiry".to_string(),
                        };
                        writeln!(
                            f,
                            "  {} {} -> {} ({})",
                            port.name, port.external_port, port.internal_port, expiry
                        )?;
                    }
                }
            }
            Some(MethodDetail::Tunnel(tunnel)) => {
                writeln!(f, "--- Tunnel ---")?;
                writeln!(f, "Status: {}", tunnel.status)?;
                writeln!(f, "Relay: {}", tunnel.relay)?;
                writeln!(f, "Session: {}", or_none(&tunnel.session_id))?;
                match tunnel.latency_ms {
                    Some(ms) => writeln!(f, "Latency: {} ms", ms)?,
                    None => writeln!(f, "Latency: n/a")?,
                }
                writeln!(f, "Bytes transferred: {}", tunnel.bytes_transferred)?;
                writeln!(f, "Reconnect attempts: {}", tunnel.reconnect_attempts)?;
                match tunnel.uptime_secs {
                    Some(secs) => writeln!(f, "Uptime: {}s", secs)?,
                    None => writeln!(f, "Uptime: n/a")?,
                }
                writeln!(
                    f,
                    "Last disconnect: {}",
                    or_none(&tunnel.last_disconnect_reason)
                )?;
            }
            None => {}
        }

        Ok(())
    }
}
