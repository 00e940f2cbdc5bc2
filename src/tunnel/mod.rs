//! Relay tunnel
//!
//! An outbound TCP control connection to a relay server, which assigns us a
//! public endpoint and asks us to open a data channel per public client.

pub mod backoff;
pub mod client;
pub mod forwarder;
pub mod protocol;
pub mod session;

pub use backoff::ReconnectBackoff;
pub use client::{RelayClientConfig, TunnelRelayClient};
pub use forwarder::{ForwarderHandle, TunnelConnectionForwarder, FORWARD_BUFFER_SIZE};
pub use protocol::{FrameError, RelayMessage};
pub use session::TunnelSession;
