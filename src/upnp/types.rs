//! Common types for the UPnP gateway client

use serde::Serialize;
use std::fmt;
use std::time::{Duration, Instant};

/// Default renewal floor: mappings with less remaining lease are always renewed
pub const RENEWAL_FLOOR: Duration = Duration::from_secs(60);

/// IP protocol numbers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[repr(u8)]
pub enum IpProtocol {
    /// TCP protocol
    TCP = 6,
    /// UDP protocol
    UDP = 17,
}

impl fmt::Display for IpProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IpProtocol::TCP => write!(f, "TCP"),
            IpProtocol::UDP => write!(f, "UDP"),
        }
    }
}

/// A discovered Internet Gateway Device service
///
/// Resolved once per discovery and cached by the controller for its lifetime.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GatewayHandle {
    /// Absolute URL SOAP actions are POSTed to
    pub control_url: String,
    /// Full service type URN, e.g. `urn:schemas-upnp-org:service:WANIPConnection:1`
    pub service_type: String,
    /// LOCATION the device description was fetched from
    pub location: String,
}

/// When a mapping lease runs out
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Expiry {
    /// Lease of 0: the mapping lives until removed
    Never,
    /// Lease ends at this instant
    At(Instant),
}

/// A port mapping created on the gateway
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortMapping {
    /// Entry name from settings ("primary" for the main port)
    pub name: String,
    /// Port opened on the gateway
    pub external_port: u16,
    /// Port of the local service
    pub internal_port: u16,
    /// Protocol requested in settings (the SOAP call always uses TCP)
    pub protocol: IpProtocol,
    /// Description sent with AddPortMapping
    pub description: String,
    /// Requested lease in seconds (0 = indefinite)
    pub lease_secs: u32,
    /// Lease end
    pub expires_at: Expiry,
}

impl PortMapping {
    /// Record a mapping the gateway accepted at `now`
    pub fn new(
        name: impl Into<String>,
        external_port: u16,
        internal_port: u16,
        protocol: IpProtocol,
        description: impl Into<String>,
        lease_secs: u32,
        now: Instant,
    ) -> Self {
        Self {
            name: name.into(),
            external_port,
            internal_port,
            protocol,
            description: description.into(),
            lease_secs,
            expires_at: expiry_from(lease_secs, now),
        }
    }

    /// Total lease length, `None` when indefinite
    pub fn lease(&self) -> Option<Duration> {
        if self.lease_secs == 0 {
            None
        } else {
            Some(Duration::from_secs(u64::from(self.lease_secs)))
        }
    }

    /// Lease left at `now`, `None` when indefinite
    pub fn remaining(&self, now: Instant) -> Option<Duration> {
        match self.expires_at {
            Expiry::Never => None,
            Expiry::At(at) => Some(at.saturating_duration_since(now)),
        }
    }

    /// Whether a renewal is due: less than a quarter of the lease or less
    /// than [`RENEWAL_FLOOR`] is left. Indefinite mappings are never renewed.
    pub fn needs_renewal(&self, now: Instant) -> bool {
        self.needs_renewal_within(now, RENEWAL_FLOOR)
    }

    /// Same as [`needs_renewal`](Self::needs_renewal) with a custom floor
    pub fn needs_renewal_within(&self, now: Instant, floor: Duration) -> bool {
        match (self.remaining(now), self.lease()) {
            (Some(left), Some(lease)) => left < lease / 4 || left < floor,
            _ => false,
        }
    }

    /// Push the expiry out by a full lease from `now`
    pub fn renew(&mut self, now: Instant) {
        self.expires_at = expiry_from(self.lease_secs, now);
    }
}

fn expiry_from(lease_secs: u32, now: Instant) -> Expiry {
    if lease_secs == 0 {
        Expiry::Never
    } else {
        Expiry::At(now + Duration::from_secs(u64::from(lease_secs)))
    }
}
