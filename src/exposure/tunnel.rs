//! Relay tunnel exposure controller
//!
//! Each attempt gets a fresh session and client. A connected tunnel is checked
//! periodically; a failed attempt or a dropped tunnel schedules the next
//! attempt on the backoff schedule. Retries never give up on their own.

use super::diagnostics::{TunnelDiagnostics, TunnelStatus};
use super::state::{ExposureState, SnapshotCell};
use super::worker::{TimerHandle, Worker};
use super::{ExposureController, ExposureMethod};
use crate::config::Settings;
use crate::tunnel::{ReconnectBackoff, RelayClientConfig, TunnelRelayClient, TunnelSession};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::Duration;
use tracing::{debug, info, info_span, warn};
use uuid::Uuid;

/// Close reason used by `stop`
pub const SHUTDOWN_REASON: &str = "shutdown requested";

#[derive(Default)]
struct Timers {
    liveness: Option<TimerHandle>,
    reconnect: Option<TimerHandle>,
}

impl Timers {
    fn cancel_all(&mut self) {
        if let Some(timer) = self.liveness.take() {
            timer.cancel();
        }
        if let Some(timer) = self.reconnect.take() {
            timer.cancel();
        }
    }
}

/// Exposes the service through a relay tunnel
pub struct TunnelExposure {
    inner: Arc<TunnelInner>,
}

struct TunnelInner {
    settings: Settings,
    config: RelayClientConfig,
    worker: Worker,
    state: SnapshotCell<ExposureState>,
    client: Mutex<Option<TunnelRelayClient>>,
    backoff: Mutex<ReconnectBackoff>,
    reconnect_pending: AtomicBool,
    /// Bumped by every stop; work from an older epoch is dropped
    epoch: AtomicU64,
    timers: Mutex<Timers>,
}

impl TunnelExposure {
    /// Create the controller; must be called inside a tokio runtime
    pub fn new(settings: Settings) -> Self {
        let config = RelayClientConfig::from_settings(&settings);
        let backoff = ReconnectBackoff::new(
            Duration::from_secs(settings.tunnel.reconnect_base_delay_secs),
            Duration::from_secs(settings.tunnel.reconnect_max_delay_secs),
        );

        Self {
            inner: Arc::new(TunnelInner {
                settings,
                config,
                worker: Worker::new("tunnel", info_span!("tunnel")),
                state: SnapshotCell::default(),
                client: Mutex::new(None),
                backoff: Mutex::new(backoff),
                reconnect_pending: AtomicBool::new(false),
                epoch: AtomicU64::new(0),
                timers: Mutex::new(Timers::default()),
            }),
        }
    }

    /// Connection status as shown in diagnostics
    pub fn status(&self) -> TunnelStatus {
        let connected = self
            .inner
            .current_client()
            .is_some_and(|client| client.is_connected());

        let active = self.inner.state.snapshot().active;
        if active && connected {
            TunnelStatus::Connected
        } else if active || self.inner.reconnect_pending.load(Ordering::SeqCst) {
            // Still active but the client dropped: the liveness check has not run yet
            TunnelStatus::Reconnecting
        } else {
            TunnelStatus::Disconnected
        }
    }

    /// Session id of the current attempt
    pub fn session_id(&self) -> Option<String> {
        self.inner
            .current_client()
            .map(|client| client.session_id().to_string())
    }

    /// Bytes forwarded by the current attempt
    pub fn bytes_transferred(&self) -> u64 {
        self.inner
            .current_client()
            .map(|client| client.bytes_transferred())
            .unwrap_or(0)
    }

    /// Consecutive failed or dropped attempts
    pub fn reconnect_attempts(&self) -> u32 {
        self.inner.lock_backoff().attempts()
    }

    /// Stop, wait for the close to run, and release the worker
    pub async fn shutdown(&self) {
        self.stop();

        let limit = self.inner.config.connect_timeout + self.inner.config.read_timeout;
        if !self.inner.worker.drain(limit).await {
            warn!("Timed out waiting for tunnel close");
        }
        self.inner.worker.shutdown();
    }

    /// Diagnostic snapshot
    pub async fn diagnostics(&self) -> TunnelDiagnostics {
        let client = self.inner.current_client();
        let status = self.status();

        let (latency_ms, uptime_secs, last_disconnect_reason) = match &client {
            Some(client) => {
                let connected = client.is_connected();
                (
                    connected.then_some(client.latency().await.as_millis() as u64),
                    connected.then_some(client.uptime().await.as_secs()),
                    client.last_disconnect_reason().await,
                )
            }
            None => (None, None, None),
        };

        let state = self.inner.state.snapshot();
        TunnelDiagnostics {
            status,
            relay: format!("{}:{}", self.inner.config.relay_host, self.inner.config.relay_port),
            session_id: client.as_ref().map(|c| c.session_id().to_string()),
            public_address: state.public_address,
            latency_ms,
            bytes_transferred: client.as_ref().map(|c| c.bytes_transferred()).unwrap_or(0),
            reconnect_attempts: self.reconnect_attempts(),
            uptime_secs,
            last_disconnect_reason,
            last_error: state.last_error,
        }
    }
}

impl ExposureController for TunnelExposure {
    fn method(&self) -> ExposureMethod {
        ExposureMethod::Tunnel
    }

    fn start(&self, internal_port: u16, _external_port: u16) {
        let epoch = self.inner.epoch.load(Ordering::SeqCst);
        let inner = self.inner.clone();
        self.inner
            .worker
            .submit(async move { inner.attempt(epoch, internal_port).await });
    }

    fn stop(&self) {
        {
            let mut timers = self.inner.lock_timers();
            self.inner.epoch.fetch_add(1, Ordering::SeqCst);
            timers.cancel_all();
        }
        self.inner.worker.cancel_scheduled();
        self.inner.reconnect_pending.store(false, Ordering::SeqCst);
        self.inner.state.deactivate();

        let inner = self.inner.clone();
        self.inner.worker.submit(async move {
            if let Some(client) = inner.current_client() {
                client.close(SHUTDOWN_REASON).await;
            }
        });
    }

    fn state(&self) -> ExposureState {
        self.inner.state.snapshot()
    }
}

impl TunnelInner {
    fn superseded(&self, epoch: u64) -> bool {
        self.epoch.load(Ordering::SeqCst) != epoch
    }

    fn current_client(&self) -> Option<TunnelRelayClient> {
        self.client
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn lock_timers(&self) -> std::sync::MutexGuard<'_, Timers> {
        self.timers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_backoff(&self) -> std::sync::MutexGuard<'_, ReconnectBackoff> {
        self.backoff.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn server_identity(&self) -> String {
        self.settings
            .tunnel
            .server_identity
            .clone()
            .filter(|id| !id.trim().is_empty())
            .unwrap_or_else(|| Uuid::new_v4().to_string())
    }

    async fn attempt(self: Arc<Self>, epoch: u64, local_port: u16) {
        if self.superseded(epoch) {
            debug!("Skipping tunnel attempt cancelled by stop");
            return;
        }
        self.reconnect_pending.store(false, Ordering::SeqCst);

        let previous = self
            .client
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(previous) = previous {
            previous.close("replaced by new attempt").await;
        }

        let session = TunnelSession::new(
            self.server_identity(),
            local_port,
            self.settings.tunnel.label.clone(),
        );
        let client = TunnelRelayClient::new(self.config.clone(), session);
        *self.client.lock().unwrap_or_else(PoisonError::into_inner) = Some(client.clone());

        info!(
            "Starting tunnel attempt (session {}, local port {})",
            client.session_id(),
            local_port
        );

        match client.connect().await {
            Ok(()) => {
                if self.superseded(epoch) {
                    client.close(SHUTDOWN_REASON).await;
                    return;
                }

                self.lock_backoff().reset();
                let address = client.public_address().await;
                info!(
                    "Tunnel active at {}",
                    address.as_deref().unwrap_or("<unknown>")
                );
                self.state.activate(address);
                self.schedule_liveness(epoch, local_port);
            }
            Err(e) => {
                warn!("Tunnel attempt failed: {}", e);
                self.state.fail(e);
                self.schedule_reconnect(epoch, local_port);
            }
        }
    }

    fn schedule_liveness(self: &Arc<Self>, epoch: u64, local_port: u16) {
        let mut timers = self.lock_timers();
        if self.superseded(epoch) {
            return;
        }
        if let Some(previous) = timers.liveness.take() {
            previous.cancel();
        }

        let weak: Weak<Self> = Arc::downgrade(self);
        timers.liveness = Some(self.worker.schedule_every(
            self.settings.advanced.liveness_check(),
            move || {
                let weak = weak.clone();
                async move {
                    if let Some(inner) = weak.upgrade() {
                        inner.check_liveness(epoch, local_port).await;
                    }
                }
            },
        ));
    }

    async fn check_liveness(self: &Arc<Self>, epoch: u64, local_port: u16) {
        if self.superseded(epoch) || !self.state.snapshot().active {
            return;
        }
        let Some(client) = self.current_client() else {
            return;
        };
        if client.is_connected() {
            return;
        }

        let reason = client
            .last_disconnect_reason()
            .await
            .unwrap_or_else(|| "unknown".to_string());
        warn!("Tunnel disconnected: {}", reason);
        self.state.fail(format!("Tunnel disconnected: {}", reason));

        if let Some(timer) = self.lock_timers().liveness.take() {
            timer.cancel();
        }
        self.schedule_reconnect(epoch, local_port);
    }

    fn schedule_reconnect(self: &Arc<Self>, epoch: u64, local_port: u16) {
        let mut timers = self.lock_timers();
        if self.superseded(epoch) {
            return;
        }

        let (delay, attempt) = {
            let mut backoff = self.lock_backoff();
            let delay = backoff.record_failure();
            (delay, backoff.attempts())
        };
        self.reconnect_pending.store(true, Ordering::SeqCst);
        info!(
            "Reconnecting tunnel in {}s (attempt {})",
            delay.as_secs(),
            attempt
        );

        let weak: Weak<Self> = Arc::downgrade(self);
        timers.reconnect = Some(self.worker.schedule_once(delay, move || async move {
            if let Some(inner) = weak.upgrade() {
                inner.attempt(epoch, local_port).await;
            }
        }));
    }
}
