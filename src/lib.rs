//! PortBridge - expose a local TCP service to the public internet
//!
//! This library exposes a service running behind NAT using one of two strategies:
//! a UPnP IGD port mapping negotiated with the local gateway, or an outbound
//! tunnel to a relay server that forwards public traffic back to us.
//! [`exposure::ExposureOrchestrator`] picks and supervises a strategy and reports
//! a single public endpoint.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod error;
pub mod exposure;
pub mod net;
pub mod public_ip;
pub mod tunnel;
pub mod upnp;

#[cfg(test)]
mod tests;

pub use config::Settings;
pub use error::ExposureError;
pub use exposure::{ExposureMethod, ExposureOrchestrator};

/// Result type alias for PortBridge operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for PortBridge operations
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Invalid or unreadable configuration
    #[error("Config error: {0}")]
    Config(String),

    /// General I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization error
    #[error("JSON serialization error: {0}")]
    JsonSerialization(#[from] serde_json::Error),
}

/// Initialize logging for PortBridge
///
/// Installs a `tracing` fmt subscriber at INFO level, or DEBUG when `debug` is set
/// (the `debug_logging` setting). Calling it twice is harmless.
pub fn init(debug: bool) {
    let level = if debug {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };
    let _ = tracing_subscriber::fmt().with_max_level(level).try_init();
}
