//! UPnP exposure controller
//!
//! One attempt runs `Idle → Discovering → Mapping → Active`, or ends in
//! `Failed` with `last_error` set. Failed attempts are not retried here; in
//! AUTO mode the orchestrator falls back to the tunnel instead.

use super::diagnostics::{MappedPort, UpnpDiagnostics};
use super::state::{ExposureState, SnapshotCell};
use super::worker::{TimerHandle, Worker};
use super::{ExposureController, ExposureMethod};
use crate::config::Settings;
use crate::error::ExposureError;
use crate::net::{ip_in_allowed_subnets, local_ipv4_toward};
use crate::public_ip::PublicIpResolver;
use crate::upnp::{GatewayClient, GatewayHandle, IpProtocol, PortMapping};
use serde::Serialize;
use std::fmt;
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::{Duration, Instant};
use tokio::sync::oneshot;
use tracing::{debug, info, info_span, warn};

/// Name of the main port's mapping
pub const PRIMARY_MAPPING: &str = "primary";

/// Where the current attempt is
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum UpnpPhase {
    /// Nothing started, or stopped
    #[default]
    Idle,
    /// Looking for the gateway
    Discovering,
    /// Creating or renewing mappings
    Mapping,
    /// At least one mapping exists
    Active,
    /// The last attempt gave up
    Failed,
}

impl fmt::Display for UpnpPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            UpnpPhase::Idle => "IDLE",
            UpnpPhase::Discovering => "DISCOVERING",
            UpnpPhase::Mapping => "MAPPING",
            UpnpPhase::Active => "ACTIVE",
            UpnpPhase::Failed => "FAILED",
        };
        f.write_str(name)
    }
}

/// One entry of the mapping set
#[derive(Debug, Clone, PartialEq, Eq)]
struct MappingRequest {
    name: String,
    internal_port: u16,
    external_port: u16,
    protocol: IpProtocol,
}

impl MappingRequest {
    fn description(&self) -> String {
        format!("PortBridge-{}", self.name)
    }
}

#[derive(Debug, Clone, Default)]
struct UpnpDetails {
    phase: UpnpPhase,
    gateway: Option<GatewayHandle>,
    local_ip: Option<Ipv4Addr>,
    wan_ip: Option<Ipv4Addr>,
    mappings: Vec<PortMapping>,
}

/// Exposes the service through gateway port mappings
pub struct UpnpExposure {
    inner: Arc<UpnpInner>,
}

struct UpnpInner {
    settings: Settings,
    gateway: GatewayClient,
    resolver: Arc<dyn PublicIpResolver>,
    worker: Worker,
    state: SnapshotCell<ExposureState>,
    details: SnapshotCell<UpnpDetails>,
    /// Bumped by every stop; jobs from an older epoch must not activate
    epoch: AtomicU64,
    renewal: Mutex<Option<TimerHandle>>,
}

impl UpnpExposure {
    /// Create the controller; must be called inside a tokio runtime
    pub fn new(settings: Settings, resolver: Arc<dyn PublicIpResolver>) -> Self {
        let gateway = GatewayClient::from_settings(&settings);
        let worker = Worker::new("upnp", info_span!("upnp"));

        Self {
            inner: Arc::new(UpnpInner {
                settings,
                gateway,
                resolver,
                worker,
                state: SnapshotCell::default(),
                details: SnapshotCell::default(),
                epoch: AtomicU64::new(0),
                renewal: Mutex::new(None),
            }),
        }
    }

    /// Current phase
    pub fn phase(&self) -> UpnpPhase {
        self.inner.details.snapshot().phase
    }

    /// Gateway found by the last discovery
    pub fn gateway(&self) -> Option<GatewayHandle> {
        self.inner.details.snapshot().gateway
    }

    /// Mappings currently tracked
    pub fn mappings(&self) -> Vec<PortMapping> {
        self.inner.details.snapshot().mappings
    }

    /// Ask the gateway whether `external_port` is mapped
    ///
    /// Runs on the controller's worker so it never overlaps other SOAP calls.
    pub async fn is_mapped(&self, external_port: u16) -> bool {
        let (tx, rx) = oneshot::channel();
        let inner = self.inner.clone();
        let submitted = self.inner.worker.submit(async move {
            let mapped = match inner.details.snapshot().gateway {
                Some(gateway) => inner.gateway.query_mapping(&gateway, external_port).await,
                None => false,
            };
            let _ = tx.send(mapped);
        });
        submitted && rx.await.unwrap_or(false)
    }

    /// Stop, wait for the mapping removal, and release the worker
    pub async fn shutdown(&self) {
        self.stop();

        if !self.inner.worker.drain(self.inner.drain_limit()).await {
            warn!("Timed out waiting for UPnP mapping removal");
        }
        self.inner.worker.shutdown();
    }

    /// Diagnostic snapshot
    pub fn diagnostics(&self) -> UpnpDiagnostics {
        let details = self.inner.details.snapshot();
        let state = self.inner.state.snapshot();
        let now = Instant::now();

        UpnpDiagnostics {
            phase: details.phase,
            active: state.active,
            service_type: details.gateway.as_ref().map(|g| g.service_type.clone()),
            control_url: details.gateway.as_ref().map(|g| g.control_url.clone()),
            location: details.gateway.as_ref().map(|g| g.location.clone()),
            local_ip: details.local_ip,
            wan_ip: details.wan_ip,
            mapped_ports: details
                .mappings
                .iter()
                .map(|m| MappedPort {
                    name: m.name.clone(),
                    external_port: m.external_port,
                    internal_port: m.internal_port,
                    expires_in_secs: m.remaining(now).map(|d| d.as_secs()),
                })
                .collect(),
            last_error: state.last_error,
        }
    }
}

impl ExposureController for UpnpExposure {
    fn method(&self) -> ExposureMethod {
        ExposureMethod::Upnp
    }

    fn start(&self, internal_port: u16, external_port: u16) {
        let epoch = self.inner.epoch.load(Ordering::SeqCst);
        let inner = self.inner.clone();
        self.inner
            .worker
            .submit(async move { inner.attempt(epoch, internal_port, external_port).await });
    }

    fn stop(&self) {
        self.inner.cancel_renewal();
        self.inner.state.deactivate();

        let inner = self.inner.clone();
        self.inner.worker.submit(async move { inner.remove_all().await });
    }

    fn state(&self) -> ExposureState {
        self.inner.state.snapshot()
    }
}

impl UpnpInner {
    fn superseded(&self, epoch: u64) -> bool {
        self.epoch.load(Ordering::SeqCst) != epoch
    }

    fn fail(&self, error: ExposureError) {
        warn!("UPnP exposure failed: {}", error);
        self.details.update(|d| d.phase = UpnpPhase::Failed);
        self.state.fail(error);
    }

    /// Worst case for the queue to empty after a stop
    ///
    /// Covers an in-flight attempt with every planned mapping, one renewal
    /// pass and the removal queued by stop.
    fn drain_limit(&self) -> Duration {
        let planned = self.mapping_plan(0, 0).len() as u32;
        let advanced = &self.settings.advanced;
        advanced.discovery_timeout() + advanced.soap_timeout() * (3 * planned + 3)
    }

    /// Primary port plus enabled additional entries
    fn mapping_plan(&self, internal_port: u16, external_port: u16) -> Vec<MappingRequest> {
        let mut plan = vec![MappingRequest {
            name: PRIMARY_MAPPING.to_string(),
            internal_port,
            external_port: if external_port == 0 { internal_port } else { external_port },
            protocol: IpProtocol::TCP,
        }];

        for entry in self.settings.parsed_additional_ports() {
            if !entry.enabled {
                debug!("Additional port {} is disabled", entry.name);
                continue;
            }
            plan.push(MappingRequest {
                name: entry.name,
                internal_port: entry.internal_port,
                external_port: entry.external_port,
                protocol: entry.protocol,
            });
        }

        plan
    }

    async fn attempt(self: Arc<Self>, epoch: u64, internal_port: u16, external_port: u16) {
        if self.superseded(epoch) {
            debug!("Skipping UPnP attempt cancelled by stop");
            return;
        }

        self.state.set(ExposureState::default());
        self.details.update(|d| {
            d.phase = UpnpPhase::Discovering;
            d.wan_ip = None;
        });

        let plan = self.mapping_plan(internal_port, external_port);

        if self.settings.dry_run {
            self.simulate(epoch, &plan).await;
            return;
        }

        let gateway = match self.gateway.discover().await {
            Ok(gateway) => gateway,
            Err(e) => return self.fail(e),
        };
        self.details.update(|d| d.gateway = Some(gateway.clone()));

        let Some(local_ip) = self.local_ip_for(&gateway).await else {
            return self.fail(ExposureError::NoLocalAddress);
        };

        if !ip_in_allowed_subnets(local_ip, &self.settings.allowed_subnets) {
            return self.fail(ExposureError::SubnetRejected {
                ip: local_ip.to_string(),
                allowed: self.settings.allowed_subnets.join(","),
            });
        }

        self.details.update(|d| {
            d.local_ip = Some(local_ip);
            d.phase = UpnpPhase::Mapping;
        });

        let lease = self.settings.lease_duration_secs;
        let mut created = Vec::new();
        for request in &plan {
            if request.protocol != IpProtocol::TCP {
                warn!(
                    "Skipping {} mapping {}: only TCP mappings are supported",
                    request.protocol, request.name
                );
                continue;
            }

            let description = request.description();
            let ok = self
                .gateway
                .add_mapping(
                    &gateway,
                    request.external_port,
                    request.internal_port,
                    local_ip,
                    &description,
                    lease,
                )
                .await;

            if ok {
                info!(
                    "Mapped {} external port {} -> {}:{}",
                    request.name, request.external_port, local_ip, request.internal_port
                );
                created.push(PortMapping::new(
                    request.name.clone(),
                    request.external_port,
                    request.internal_port,
                    request.protocol,
                    description,
                    lease,
                    Instant::now(),
                ));
            } else {
                warn!(
                    "Failed to map {} external port {}",
                    request.name, request.external_port
                );
            }
        }

        let Some(first_port) = created.first().map(|m| m.external_port) else {
            return self.fail(ExposureError::Mapping(
                "Failed to create any UPnP port mappings".to_string(),
            ));
        };

        // Tracked even when superseded so the queued stop removes them
        self.details.update(|d| d.mappings = created);

        if self.superseded(epoch) {
            debug!("UPnP attempt finished after stop; mappings left for removal");
            return;
        }

        self.details.update(|d| d.phase = UpnpPhase::Active);
        self.state.activate(None);
        info!("UPnP exposure active on external port {}", first_port);

        self.schedule_renewal(epoch);

        let public_ip = match self.gateway.external_ip(&gateway).await {
            Some(ip) => Some(ip),
            None => {
                debug!("Gateway did not report its WAN address, trying resolver");
                self.resolver.resolve().await
            }
        };

        match public_ip {
            Some(ip) if !self.superseded(epoch) => {
                let address = format!("{}:{}", ip, first_port);
                info!("Public address: {}", address);
                self.details.update(|d| d.wan_ip = Some(ip));
                self.state.update(|s| {
                    if s.active {
                        s.public_address = Some(address);
                    }
                });
            }
            Some(_) => {}
            None => warn!("Could not determine public IP address"),
        }
    }

    /// Dry-run path: no discovery and no SOAP
    async fn simulate(&self, epoch: u64, plan: &[MappingRequest]) {
        for request in plan {
            info!(
                "DRY-RUN: would map {} {} external port {} -> internal port {}",
                request.protocol, request.name, request.external_port, request.internal_port
            );
        }

        let port = plan
            .iter()
            .find(|r| r.protocol == IpProtocol::TCP)
            .map(|r| r.external_port)
            .unwrap_or_default();
        let ip = self.resolver.resolve().await.unwrap_or(Ipv4Addr::UNSPECIFIED);

        if self.superseded(epoch) {
            return;
        }

        self.details.update(|d| {
            d.phase = UpnpPhase::Active;
            d.wan_ip = Some(ip);
        });
        let address = format!("{}:{}", ip, port);
        info!("DRY-RUN: simulated public address {}", address);
        self.state.activate(Some(address));
    }

    /// Configured address, or the interface routing toward the gateway
    async fn local_ip_for(&self, gateway: &GatewayHandle) -> Option<Ipv4Addr> {
        if let Some(ip) = self.settings.local_address {
            return Some(ip);
        }

        let url = reqwest::Url::parse(&gateway.control_url).ok()?;
        let host = url.host_str()?.to_string();
        let port = url.port_or_known_default().unwrap_or(80);
        let target = tokio::net::lookup_host((host.as_str(), port))
            .await
            .ok()?
            .find(|addr| addr.is_ipv4())?;

        local_ipv4_toward(target.ip())
    }

    fn schedule_renewal(self: &Arc<Self>, epoch: u64) {
        let floor = self.settings.advanced.renewal_floor().max(Duration::from_millis(1));
        let period = Duration::from_secs(self.settings.refresh_interval_secs).max(floor);

        let mut renewal = self.renewal.lock().unwrap_or_else(PoisonError::into_inner);
        if self.superseded(epoch) {
            return;
        }
        if let Some(previous) = renewal.take() {
            previous.cancel();
        }

        let weak: Weak<Self> = Arc::downgrade(self);
        *renewal = Some(self.worker.schedule_every(period, move || {
            let weak = weak.clone();
            async move {
                if let Some(inner) = weak.upgrade() {
                    inner.renew(epoch).await;
                }
            }
        }));
        debug!("Mapping renewal scheduled every {:?}", period);
    }

    /// Bump the epoch and cancel renewal in one step
    fn cancel_renewal(&self) {
        let mut renewal = self.renewal.lock().unwrap_or_else(PoisonError::into_inner);
        self.epoch.fetch_add(1, Ordering::SeqCst);
        if let Some(timer) = renewal.take() {
            timer.cancel();
        }
        self.worker.cancel_scheduled();
    }

    async fn renew(&self, epoch: u64) {
        if self.superseded(epoch) || !self.state.snapshot().active {
            return;
        }

        let details = self.details.snapshot();
        let (Some(gateway), Some(local_ip)) = (details.gateway, details.local_ip) else {
            return;
        };

        let now = Instant::now();
        let floor = self.settings.advanced.renewal_floor();
        let due: Vec<PortMapping> = details
            .mappings
            .into_iter()
            .filter(|m| m.needs_renewal_within(now, floor))
            .collect();
        if due.is_empty() {
            debug!("No mappings due for renewal");
            return;
        }

        self.details.update(|d| d.phase = UpnpPhase::Mapping);

        for mapping in due {
            let ok = self
                .gateway
                .add_mapping(
                    &gateway,
                    mapping.external_port,
                    mapping.internal_port,
                    local_ip,
                    &mapping.description,
                    mapping.lease_secs,
                )
                .await;

            if ok {
                let renewed_at = Instant::now();
                self.details.update(|d| {
                    if let Some(m) = d
                        .mappings
                        .iter_mut()
                        .find(|m| m.external_port == mapping.external_port)
                    {
                        m.renew(renewed_at);
                    }
                });
                info!("Renewed mapping for external port {}", mapping.external_port);
            } else {
                warn!(
                    "Failed to renew mapping for external port {}; will retry next cycle",
                    mapping.external_port
                );
            }
        }

        if !self.superseded(epoch) {
            self.details.update(|d| d.phase = UpnpPhase::Active);
        }
    }

    async fn remove_all(&self) {
        let details = self.details.snapshot();
        self.details.update(|d| {
            d.mappings.clear();
            d.phase = UpnpPhase::Idle;
            d.wan_ip = None;
        });

        let Some(gateway) = details.gateway else {
            return;
        };

        for mapping in details.mappings {
            if self.gateway.remove_mapping(&gateway, mapping.external_port).await {
                info!("Removed mapping for external port {}", mapping.external_port);
            } else {
                warn!(
                    "Failed to remove mapping for external port {}",
                    mapping.external_port
                );
            }
        }
    }
}
