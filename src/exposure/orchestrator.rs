//! Exposure orchestrator - strategy selection and the unified status surface
//!
//! | Mode  | Tunnel enabled | Behaviour                                        |
//! |-------|----------------|--------------------------------------------------|
//! | FORCE | yes            | tunnel only                                      |
//! | FORCE | no             | nothing starts, `last_error` says why            |
//! | AUTO  | yes            | UPnP now, tunnel if UPnP is not up after grace   |
//! | AUTO  | no             | UPnP only                                        |

use super::diagnostics::{Diagnostics, MethodDetail};
use super::state::SnapshotCell;
use super::tunnel::TunnelExposure;
use super::upnp::UpnpExposure;
use super::{ExposureController, ExposureMethod};
use crate::config::{Settings, TunnelMode};
use crate::error::ExposureError;
use crate::public_ip::{PublicIpResolver, resolver_from_settings};
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{Instrument, Span, info, info_span, warn};

const NONE: u8 = 0;
const UPNP: u8 = 1;
const TUNNEL: u8 = 2;

struct Shared {
    settings: Settings,
    upnp: UpnpExposure,
    tunnel: TunnelExposure,
    /// Authoritative controller; the only cross-worker pointer
    authoritative: AtomicU8,
    /// Errors the orchestrator raises itself, e.g. a disabled tunnel
    own_error: SnapshotCell<Option<String>>,
    span: Span,
}

impl Shared {
    fn authoritative(&self) -> Option<&dyn ExposureController> {
        match self.authoritative.load(Ordering::SeqCst) {
            UPNP => Some(&self.upnp),
            TUNNEL => Some(&self.tunnel),
            _ => None,
        }
    }

    fn start_tunnel(&self, internal_port: u16) {
        if !self.settings.tunnel.enabled {
            let error = ExposureError::TunnelDisabled;
            warn!("{}", error);
            self.own_error.set(Some(error.to_string()));
            return;
        }
        self.tunnel.start(internal_port, 0);
        self.authoritative.store(TUNNEL, Ordering::SeqCst);
    }
}

/// Chooses and supervises an exposure method
pub struct ExposureOrchestrator {
    shared: Arc<Shared>,
    fallback: Mutex<Option<JoinHandle<()>>>,
    shut_down: AtomicBool,
}

impl ExposureOrchestrator {
    /// Create an orchestrator with the resolver the settings describe
    ///
    /// Must be called inside a tokio runtime.
    pub fn new(settings: Settings) -> Self {
        let resolver = resolver_from_settings(&settings);
        Self::with_resolver(settings, resolver)
    }

    /// Create an orchestrator with an injected public IP resolver
    pub fn with_resolver(settings: Settings, resolver: Arc<dyn PublicIpResolver>) -> Self {
        let upnp = UpnpExposure::new(settings.clone(), resolver);
        let tunnel = TunnelExposure::new(settings.clone());

        Self {
            shared: Arc::new(Shared {
                settings,
                upnp,
                tunnel,
                authoritative: AtomicU8::new(NONE),
                own_error: SnapshotCell::default(),
                span: info_span!("orchestrator"),
            }),
            fallback: Mutex::new(None),
            shut_down: AtomicBool::new(false),
        }
    }

    /// Begin exposing according to the configured mode
    pub fn start(&self, internal_port: u16, external_port: u16) {
        let shared = &self.shared;
        let _enter = shared.span.enter();

        if self.shut_down.load(Ordering::SeqCst) {
            warn!("Orchestrator has been shut down; ignoring start");
            return;
        }

        shared.own_error.set(None);
        let mode = shared.settings.tunnel.mode;
        let tunnel_enabled = shared.settings.tunnel.enabled;
        info!(
            "Starting exposure for port {} (mode {}, tunnel {})",
            internal_port,
            mode,
            if tunnel_enabled { "enabled" } else { "disabled" }
        );

        match mode {
            TunnelMode::Force => shared.start_tunnel(internal_port),
            TunnelMode::Auto if tunnel_enabled => {
                shared.upnp.start(internal_port, external_port);
                self.spawn_fallback(internal_port);
            }
            TunnelMode::Auto => {
                shared.upnp.start(internal_port, external_port);
                shared.authoritative.store(UPNP, Ordering::SeqCst);
            }
        }
    }

    fn spawn_fallback(&self, internal_port: u16) {
        let shared = self.shared.clone();
        let grace = shared.settings.advanced.fallback_grace();
        let span = shared.span.clone();

        let task = tokio::spawn(
            async move {
                sleep(grace).await;
                if shared.upnp.is_active() {
                    info!("UPnP is active; keeping it authoritative");
                    shared.authoritative.store(UPNP, Ordering::SeqCst);
                } else {
                    info!(
                        "UPnP not active after {}ms; falling back to tunnel",
                        grace.as_millis()
                    );
                    shared.start_tunnel(internal_port);
                }
            }
            .instrument(span),
        );

        let previous = self
            .fallback
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(task);
        if let Some(previous) = previous {
            previous.abort();
        }
    }

    /// Stop both controllers and clear the authoritative method
    pub fn stop(&self) {
        let _enter = self.shared.span.enter();

        if let Some(task) = self
            .fallback
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            task.abort();
        }

        self.shared.upnp.stop();
        self.shared.tunnel.stop();
        self.shared.authoritative.store(NONE, Ordering::SeqCst);
        info!("Exposure stopped");
    }

    /// `stop` followed by `start`
    pub fn retry(&self, internal_port: u16, external_port: u16) {
        info!(parent: &self.shared.span, "Retrying exposure");
        self.stop();
        self.start(internal_port, external_port);
    }

    /// Stop and release both controllers; the orchestrator cannot be restarted
    pub async fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }
        self.stop();
        self.shared.upnp.shutdown().await;
        self.shared.tunnel.shutdown().await;
        info!(parent: &self.shared.span, "Orchestrator shut down");
    }

    /// Authoritative controller reports active
    pub fn is_exposed(&self) -> bool {
        self.shared.authoritative().is_some_and(|c| c.is_active())
    }

    /// Authoritative controller's public address
    pub fn public_address(&self) -> Option<String> {
        self.shared.authoritative().and_then(|c| c.public_address())
    }

    /// Authoritative method
    pub fn method(&self) -> Option<ExposureMethod> {
        self.shared.authoritative().map(|c| c.method())
    }

    /// Authoritative method name, `NONE` when there is none
    pub fn method_name(&self) -> &'static str {
        self.method().map(|m| m.as_str()).unwrap_or("NONE")
    }

    /// Orchestrator error, else the authoritative controller's last error
    pub fn last_error(&self) -> Option<String> {
        self.shared
            .own_error
            .snapshot()
            .or_else(|| self.shared.authoritative().and_then(|c| c.last_error()))
    }

    /// UPnP controller
    pub fn upnp(&self) -> &UpnpExposure {
        &self.shared.upnp
    }

    /// Tunnel controller
    pub fn tunnel(&self) -> &TunnelExposure {
        &self.shared.tunnel
    }

    /// Status snapshot with detail for the reported method
    ///
    /// Before a method is authoritative, the controller that is running is
    /// reported: the tunnel in FORCE mode, UPnP otherwise.
    pub async fn diagnostics(&self) -> Diagnostics {
        let mode = self.shared.settings.tunnel.mode;
        let reported = self.method().unwrap_or(match mode {
            TunnelMode::Force => ExposureMethod::Tunnel,
            TunnelMode::Auto => ExposureMethod::Upnp,
        });

        let detail = match reported {
            ExposureMethod::Upnp => MethodDetail::Upnp(self.shared.upnp.diagnostics()),
            ExposureMethod::Tunnel => MethodDetail::Tunnel(self.shared.tunnel.diagnostics().await),
        };

        Diagnostics {
            exposed: self.is_exposed(),
            method: self.method(),
            mode,
            public_address: self.public_address(),
            last_error: self.last_error(),
            detail: Some(detail),
        }
    }
}

impl Drop for ExposureOrchestrator {
    fn drop(&mut self) {
        if let Some(task) = self.fallback.get_mut().unwrap_or_else(PoisonError::into_inner).take() {
            task.abort();
        }
    }
}
