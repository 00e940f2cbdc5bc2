//! Exposure controllers and orchestration
//!
//! Two controllers implement [`ExposureController`]:
//! - [`UpnpExposure`] - port mappings on the LAN gateway, renewed on a timer
//! - [`TunnelExposure`] - relay tunnel with reconnect backoff
//!
//! [`ExposureOrchestrator`] picks one according to [`crate::config::TunnelMode`]
//! and reports whichever is authoritative.

pub mod diagnostics;
pub mod orchestrator;
pub mod state;
pub mod tunnel;
pub mod upnp;
pub mod worker;

pub use diagnostics::{Diagnostics, MappedPort, MethodDetail, TunnelDiagnostics, TunnelStatus, UpnpDiagnostics};
pub use orchestrator::ExposureOrchestrator;
pub use state::{ExposureState, SnapshotCell};
pub use tunnel::TunnelExposure;
pub use upnp::{UpnpExposure, UpnpPhase};
pub use worker::{TimerHandle, Worker};

use serde::Serialize;
use std::fmt;

/// How the service is exposed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ExposureMethod {
    /// Gateway port mapping
    #[serde(rename = "UPnP")]
    Upnp,
    /// Relay tunnel
    #[serde(rename = "TUNNEL")]
    Tunnel,
}

impl ExposureMethod {
    /// Display name (`UPnP` / `TUNNEL`)
    pub fn as_str(&self) -> &'static str {
        match self {
            ExposureMethod::Upnp => "UPnP",
            ExposureMethod::Tunnel => "TUNNEL",
        }
    }
}

impl fmt::Display for ExposureMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Common surface of the exposure controllers
///
/// `start` and `stop` only enqueue work on the controller's worker and return
/// immediately; results show up in [`ExposureController::state`].
pub trait ExposureController: Send + Sync {
    /// Which method this controller implements
    fn method(&self) -> ExposureMethod;

    /// Begin exposing `internal_port`
    fn start(&self, internal_port: u16, external_port: u16);

    /// Stop exposing and release what the last attempt acquired
    fn stop(&self);

    /// Consistent snapshot of the controller's state
    fn state(&self) -> ExposureState;

    /// Currently exposing
    fn is_active(&self) -> bool {
        self.state().active
    }

    /// Public `host:port`, once known
    fn public_address(&self) -> Option<String> {
        self.state().public_address
    }

    /// Most recent failure
    fn last_error(&self) -> Option<String> {
        self.state().last_error
    }
}
