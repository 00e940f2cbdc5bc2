//! Exposure settings and configuration

use crate::net::parse_cidr;
use crate::upnp::IpProtocol;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::{Ipv4Addr, SocketAddr};
use std::str::FromStr;
use std::time::Duration;
use tracing::warn;

/// How the orchestrator chooses between UPnP and the relay tunnel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TunnelMode {
    /// UPnP first, tunnel as a timed fallback (when the tunnel is enabled)
    Auto,
    /// Always use the tunnel
    Force,
}

impl FromStr for TunnelMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "AUTO" => Ok(TunnelMode::Auto),
            "FORCE" => Ok(TunnelMode::Force),
            other => Err(Error::Config(format!("Unknown tunnel mode: {}", other))),
        }
    }
}

impl fmt::Display for TunnelMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TunnelMode::Auto => write!(f, "AUTO"),
            TunnelMode::Force => write!(f, "FORCE"),
        }
    }
}

/// An extra port to map alongside the primary one
///
/// Written in settings as `name:internalPort:externalPort:protocol:enabled`,
/// e.g. `rcon:25575:25576:TCP:true`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdditionalPort {
    /// Human-readable name, used in the mapping description
    pub name: String,
    /// Port of the local service
    pub internal_port: u16,
    /// Port to open on the gateway
    pub external_port: u16,
    /// Transport protocol
    pub protocol: IpProtocol,
    /// Disabled entries are parsed but never mapped
    pub enabled: bool,
}

impl FromStr for AdditionalPort {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let parts: Vec<&str> = s.trim().split(':').map(str::trim).collect();
        if parts.len() < 5 {
            return Err(Error::Config(format!(
                "Invalid additional port entry '{}': expected name:internal:external:protocol:enabled",
                s
            )));
        }

        let port = |value: &str| -> Result<u16> {
            match value.parse::<u16>() {
                Ok(p) if p > 0 => Ok(p),
                _ => Err(Error::Config(format!("Invalid port '{}' in entry '{}'", value, s))),
            }
        };

        let protocol = match parts[3].to_ascii_uppercase().as_str() {
            "TCP" => IpProtocol::TCP,
            "UDP" => IpProtocol::UDP,
            other => {
                return Err(Error::Config(format!(
                    "Invalid protocol '{}' in entry '{}'",
                    other, s
                )));
            }
        };

        Ok(Self {
            name: parts[0].to_string(),
            internal_port: port(parts[1])?,
            external_port: port(parts[2])?,
            protocol,
            enabled: parts[4].eq_ignore_ascii_case("true"),
        })
    }
}

/// Relay tunnel settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TunnelSettings {
    /// Enable tunnel-based exposure (fallback or primary)
    pub enabled: bool,
    /// AUTO (UPnP with tunnel fallback) or FORCE (tunnel only)
    pub mode: TunnelMode,
    /// Relay server hostname
    pub relay_host: String,
    /// Relay server port
    pub relay_port: u16,
    /// Base delay for reconnect backoff in seconds
    pub reconnect_base_delay_secs: u64,
    /// Upper bound for reconnect backoff in seconds
    pub reconnect_max_delay_secs: u64,
    /// Seconds between KEEPALIVE frames
    pub keepalive_interval_secs: u64,
    /// Identity announced to the relay; a random UUID per attempt when unset
    pub server_identity: Option<String>,
    /// Label announced to the relay
    pub label: String,
}

impl Default for TunnelSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            mode: TunnelMode::Auto,
            relay_host: "relay.portbridge.net".to_string(),
            relay_port: 7000,
            reconnect_base_delay_secs: 5,
            reconnect_max_delay_secs: 120,
            keepalive_interval_secs: 20,
            server_identity: None,
            label: "world".to_string(),
        }
    }
}

/// Timings and addresses that are normally fixed
///
/// Defaults match the protocol constants; embedders and tests may shorten them.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AdvancedSettings {
    /// Where SSDP M-SEARCH datagrams are sent
    pub ssdp_address: SocketAddr,
    /// How long to wait for an SSDP reply
    pub discovery_timeout_ms: u64,
    /// Connect/read timeout for device description and SOAP requests
    pub soap_timeout_ms: u64,
    /// AUTO mode: how long UPnP gets before the tunnel takes over
    pub fallback_grace_ms: u64,
    /// Relay connect timeout
    pub relay_connect_timeout_ms: u64,
    /// Relay read timeout
    pub relay_read_timeout_ms: u64,
    /// How often the keepalive loop wakes up
    pub keepalive_check_ms: u64,
    /// How often the tunnel controller checks the client is still connected
    pub liveness_check_ms: u64,
    /// Shortest renewal period, and the remaining lease below which a mapping is re-added
    pub renewal_floor_ms: u64,
}

impl Default for AdvancedSettings {
    fn default() -> Self {
        Self {
            ssdp_address: SocketAddr::from(([239, 255, 255, 250], 1900)),
            discovery_timeout_ms: 3_000,
            soap_timeout_ms: 5_000,
            fallback_grace_ms: 10_000,
            relay_connect_timeout_ms: 5_000,
            relay_read_timeout_ms: 10_000,
            keepalive_check_ms: 5_000,
            liveness_check_ms: 10_000,
            renewal_floor_ms: 60_000,
        }
    }
}

impl AdvancedSettings {
    /// SSDP reply wait
    pub fn discovery_timeout(&self) -> Duration {
        Duration::from_millis(self.discovery_timeout_ms)
    }

    /// HTTP timeout for gateway requests
    pub fn soap_timeout(&self) -> Duration {
        Duration::from_millis(self.soap_timeout_ms)
    }

    /// AUTO-mode grace period
    pub fn fallback_grace(&self) -> Duration {
        Duration::from_millis(self.fallback_grace_ms)
    }

    /// Relay connect timeout
    pub fn relay_connect_timeout(&self) -> Duration {
        Duration::from_millis(self.relay_connect_timeout_ms)
    }

    /// Relay read timeout
    pub fn relay_read_timeout(&self) -> Duration {
        Duration::from_millis(self.relay_read_timeout_ms)
    }

    /// Keepalive loop wake-up period
    pub fn keepalive_check(&self) -> Duration {
        Duration::from_millis(self.keepalive_check_ms)
    }

    /// Tunnel liveness check period
    pub fn liveness_check(&self) -> Duration {
        Duration::from_millis(self.liveness_check_ms)
    }

    /// Mapping renewal floor
    pub fn renewal_floor(&self) -> Duration {
        Duration::from_millis(self.renewal_floor_ms)
    }
}

/// Exposure settings
///
/// A snapshot of these settings is handed to every component at construction.
/// Settings are stored in JSON format and can be loaded/saved from disk.
///
/// # Example
/// ```rust,no_run
/// use portbridge::config::Settings;
///
/// let settings = Settings::load("portbridge.json").expect("Failed to load");
/// settings.validate().expect("Invalid settings");
/// println!("Exposing port {}", settings.internal_port);
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Settings {
    /// Port the local service listens on
    pub internal_port: u16,
    /// Port to open on the gateway
    pub external_port: u16,
    /// Mapping lease in seconds (0 = indefinite)
    pub lease_duration_secs: u32,
    /// Seconds between lease renewal checks (at least 60)
    pub refresh_interval_secs: u64,
    /// Retries for discovery and mapping (0-10)
    pub retry_count: u32,
    /// Delay in seconds between retries (1-60)
    pub retry_delay_secs: u64,
    /// CIDR subnets the local address must fall in; empty allows any
    pub allowed_subnets: Vec<String>,
    /// Extra mappings as `name:internal:external:protocol:enabled`
    pub additional_ports: Vec<String>,
    /// Simulate UPnP without touching the gateway
    pub dry_run: bool,
    /// Enable debug logging
    pub debug_logging: bool,
    /// Query an HTTP service when the gateway cannot report the WAN address
    pub enable_public_ip_fallback: bool,
    /// Service returning the caller's public IPv4 address as plain text
    pub public_ip_fallback_url: String,
    /// Local address announced as the mapping target; detected when unset
    pub local_address: Option<Ipv4Addr>,
    /// Relay tunnel settings
    pub tunnel: TunnelSettings,
    /// Normally fixed timings
    pub advanced: AdvancedSettings,
}

impl Settings {
    /// Load settings from a JSON file
    ///
    /// Returns default settings if the file doesn't exist or is empty.
    pub fn load<P: AsRef<std::path::Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            return Ok(Self::default());
        }

        let data = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("Failed to read settings: {}", e)))?;

        if data.trim().is_empty() {
            return Ok(Self::default());
        }

        let settings: Self = serde_json::from_str(&data)
            .map_err(|e| Error::Config(format!("Failed to parse settings: {}", e)))?;

        Ok(settings)
    }

    /// Save settings to a JSON file
    pub fn save<P: AsRef<std::path::Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| Error::Config(format!("Failed to create settings directory: {}", e)))?;
        }

        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)
            .map_err(|e| Error::Config(format!("Failed to write settings: {}", e)))?;

        Ok(())
    }

    /// Check every value against its allowed range
    pub fn validate(&self) -> Result<()> {
        fn check(ok: bool, msg: impl FnOnce() -> String) -> Result<()> {
            if ok { Ok(()) } else { Err(Error::Config(msg())) }
        }

        check(self.internal_port > 0, || "internal_port must be 1-65535".into())?;
        check(self.external_port > 0, || "external_port must be 1-65535".into())?;
        check(self.refresh_interval_secs >= 60, || {
            format!("refresh_interval_secs must be >= 60, got {}", self.refresh_interval_secs)
        })?;
        check(self.retry_count <= 10, || {
            format!("retry_count must be 0-10, got {}", self.retry_count)
        })?;
        check((1..=60).contains(&self.retry_delay_secs), || {
            format!("retry_delay_secs must be 1-60, got {}", self.retry_delay_secs)
        })?;

        for cidr in &self.allowed_subnets {
            if parse_cidr(cidr).is_none() {
                return Err(Error::Config(format!("Invalid CIDR in allowed_subnets: {}", cidr)));
            }
        }
        for entry in &self.additional_ports {
            entry.parse::<AdditionalPort>()?;
        }

        let t = &self.tunnel;
        check(t.relay_port > 0, || "tunnel.relay_port must be 1-65535".into())?;
        check((1..=60).contains(&t.reconnect_base_delay_secs), || {
            format!(
                "tunnel.reconnect_base_delay_secs must be 1-60, got {}",
                t.reconnect_base_delay_secs
            )
        })?;
        check((10..=3600).contains(&t.reconnect_max_delay_secs), || {
            format!(
                "tunnel.reconnect_max_delay_secs must be 10-3600, got {}",
                t.reconnect_max_delay_secs
            )
        })?;
        check(t.reconnect_max_delay_secs >= t.reconnect_base_delay_secs, || {
            "tunnel.reconnect_max_delay_secs must not be below the base delay".into()
        })?;
        check((5..=120).contains(&t.keepalive_interval_secs), || {
            format!(
                "tunnel.keepalive_interval_secs must be 5-120, got {}",
                t.keepalive_interval_secs
            )
        })?;
        check(!t.relay_host.trim().is_empty(), || "tunnel.relay_host must be set".into())?;
        check(self.advanced.renewal_floor_ms > 0, || {
            "advanced.renewal_floor_ms must be positive".into()
        })?;

        Ok(())
    }

    /// Parsed additional port entries; malformed entries are logged and skipped
    pub fn parsed_additional_ports(&self) -> Vec<AdditionalPort> {
        self.additional_ports
            .iter()
            .filter(|e| !e.trim().is_empty())
            .filter_map(|entry| match entry.parse::<AdditionalPort>() {
                Ok(port) => Some(port),
                Err(e) => {
                    warn!("Invalid additional port entry {}: {}", entry, e);
                    None
                }
            })
            .collect()
    }

    /// External port, defaulting to the internal port when unset
    pub fn effective_external_port(&self) -> u16 {
        if self.external_port == 0 {
            self.internal_port
        } else {
            self.external_port
        }
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            internal_port: 25565,
            external_port: 25565,
            lease_duration_secs: 3600,
            refresh_interval_secs: 1800,
            retry_count: 3,
            retry_delay_secs: 5,
            allowed_subnets: vec!["192.168.0.0/16".to_string(), "10.0.0.0/8".to_string()],
            additional_ports: Vec::new(),
            dry_run: false,
            debug_logging: false,
            enable_public_ip_fallback: false,
            public_ip_fallback_url: "https://api.ipify.org".to_string(),
            local_address: None,
            tunnel: TunnelSettings::default(),
            advanced: AdvancedSettings::default(),
        }
    }
}
