//! Exposure error taxonomy
//!
//! Every variant is caught at the attempt boundary of the controller that hit
//! it and turned into a `last_error` string. None of them is fatal.

use thiserror::Error;

/// Errors that can occur while exposing the service
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ExposureError {
    /// No gateway found or the gateway did not respond
    #[error("UPnP discovery failed: {0}")]
    Discovery(String),

    /// A SOAP mapping call returned non-200 or failed
    #[error("Port mapping failed: {0}")]
    Mapping(String),

    /// The local address is outside the configured subnets
    #[error("Local IP {ip} is not within allowed subnets: {allowed}")]
    SubnetRejected {
        /// Detected local address
        ip: String,
        /// Configured allow-list
        allowed: String,
    },

    /// No usable site-local IPv4 address
    #[error("Could not determine local IP address")]
    NoLocalAddress,

    /// The relay rejected or garbled the registration handshake
    #[error("Relay registration failed: {0}")]
    Registration(String),

    /// Socket-level failure talking to the relay
    #[error("Relay connection failed: {0}")]
    Connection(String),

    /// I/O failure on one forwarded connection
    #[error("Forwarding failed for connection {id}: {reason}")]
    Forwarding {
        /// Relay-assigned connection id
        id: String,
        /// What went wrong
        reason: String,
    },

    /// The tunnel was requested but is switched off in settings
    #[error("Tunnel is disabled in configuration")]
    TunnelDisabled,
}
