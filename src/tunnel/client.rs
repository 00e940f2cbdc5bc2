//! Relay tunnel client
//!
//! One client per connection attempt. After the REGISTER/REGISTERED handshake
//! two background tasks run until [`TunnelRelayClient::close`]:
//! - the message loop, which answers HEARTBEAT and spawns a forwarder per CONNECTION
//! - the keepalive loop, which sends KEEPALIVE when the interval has elapsed

use super::forwarder::TunnelConnectionForwarder;
use super::protocol::RelayMessage;
use super::session::TunnelSession;
use crate::config::Settings;
use crate::error::ExposureError;
use socket2::{SockRef, TcpKeepalive};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::Mutex;
use tokio::time::{MissedTickBehavior, interval, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// OS-level keepalive probe idle time on the control socket
const TCP_KEEPALIVE_TIME: Duration = Duration::from_secs(30);

/// Connection parameters for the relay
#[derive(Debug, Clone)]
pub struct RelayClientConfig {
    /// Relay hostname
    pub relay_host: String,
    /// Relay control port
    pub relay_port: u16,
    /// TCP connect timeout
    pub connect_timeout: Duration,
    /// Per-read timeout on the control channel
    pub read_timeout: Duration,
    /// Minimum time between KEEPALIVE frames
    pub keepalive_interval: Duration,
    /// How often the keepalive loop checks whether one is due
    pub keepalive_check: Duration,
}

impl RelayClientConfig {
    /// Build from settings
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            relay_host: settings.tunnel.relay_host.clone(),
            relay_port: settings.tunnel.relay_port,
            connect_timeout: settings.advanced.relay_connect_timeout(),
            read_timeout: settings.advanced.relay_read_timeout(),
            keepalive_interval: Duration::from_secs(settings.tunnel.keepalive_interval_secs),
            keepalive_check: settings.advanced.keepalive_check(),
        }
    }

    fn relay_addr(&self) -> String {
        format!("{}:{}", self.relay_host, self.relay_port)
    }
}

/// Client for one relay tunnel attempt
///
/// Cloning shares the same connection.
#[derive(Clone)]
pub struct TunnelRelayClient {
    inner: Arc<ClientInner>,
}

struct ClientInner {
    config: RelayClientConfig,
    session_id: String,
    session: Mutex<TunnelSession>,
    writer: Mutex<Option<OwnedWriteHalf>>,
    connected: AtomicBool,
    closed: AtomicBool,
    bytes_transferred: Arc<AtomicU64>,
    last_keepalive: Mutex<Instant>,
    last_disconnect_reason: Mutex<Option<String>>,
    cancel: CancellationToken,
}

impl TunnelRelayClient {
    /// Create a client for `session`; nothing is connected yet
    pub fn new(config: RelayClientConfig, session: TunnelSession) -> Self {
        Self {
            inner: Arc::new(ClientInner {
                config,
                session_id: session.session_id().to_string(),
                session: Mutex::new(session),
                writer: Mutex::new(None),
                connected: AtomicBool::new(false),
                closed: AtomicBool::new(false),
                bytes_transferred: Arc::new(AtomicU64::new(0)),
                last_keepalive: Mutex::new(Instant::now()),
                last_disconnect_reason: Mutex::new(None),
                cancel: CancellationToken::new(),
            }),
        }
    }

    /// Connect, register, and start the background loops
    ///
    /// On failure the client is closed and the reason recorded.
    pub async fn connect(&self) -> Result<(), ExposureError> {
        let inner = &self.inner;
        if inner.closed.load(Ordering::SeqCst) {
            return Err(ExposureError::Connection("Client already closed".to_string()));
        }

        let addr = inner.config.relay_addr();
        info!("Connecting to tunnel relay {}", addr);

        let stream = match connect_with_timeout(&addr, inner.config.connect_timeout).await {
            Ok(stream) => stream,
            Err(e) => {
                inner.close(&e.to_string()).await;
                return Err(e);
            }
        };
        configure_keepalive(&stream);

        let (read_half, write_half) = stream.into_split();
        let mut reader = BufReader::new(read_half);
        *inner.writer.lock().await = Some(write_half);

        if let Err(e) = inner.register(&mut reader).await {
            inner.close(&e.to_string()).await;
            return Err(e);
        }

        if inner.closed.load(Ordering::SeqCst) {
            if let Some(mut writer) = inner.writer.lock().await.take() {
                let _ = writer.shutdown().await;
            }
            return Err(ExposureError::Connection(
                "Closed during registration".to_string(),
            ));
        }

        inner.connected.store(true, Ordering::SeqCst);
        *inner.last_keepalive.lock().await = Instant::now();

        tokio::spawn(message_loop(inner.clone(), reader));
        tokio::spawn(keepalive_loop(inner.clone()));

        Ok(())
    }

    /// Close the connection; later calls are no-ops
    pub async fn close(&self, reason: &str) {
        self.inner.close(reason).await;
    }

    /// Registered and not yet closed
    pub fn is_connected(&self) -> bool {
        self.inner.connected.load(Ordering::SeqCst) && !self.inner.closed.load(Ordering::SeqCst)
    }

    /// Total bytes moved by all forwarders of this client
    pub fn bytes_transferred(&self) -> u64 {
        self.inner.bytes_transferred.load(Ordering::Relaxed)
    }

    /// Session id of this attempt
    pub fn session_id(&self) -> &str {
        &self.inner.session_id
    }

    /// Relay-assigned public address
    pub async fn public_address(&self) -> Option<String> {
        self.inner.session.lock().await.public_address()
    }

    /// Time since the relay was last heard from
    pub async fn latency(&self) -> Duration {
        self.inner.session.lock().await.heartbeat_age()
    }

    /// Time since this attempt's session was created
    pub async fn uptime(&self) -> Duration {
        self.inner.session.lock().await.uptime()
    }

    /// Snapshot of the session
    pub async fn session(&self) -> TunnelSession {
        self.inner.session.lock().await.clone()
    }

    /// Why the connection ended, once it has
    pub async fn last_disconnect_reason(&self) -> Option<String> {
        self.inner.last_disconnect_reason.lock().await.clone()
    }
}

impl std::fmt::Debug for TunnelRelayClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TunnelRelayClient")
            .field("session_id", &self.inner.session_id)
            .field("relay", &self.inner.config.relay_addr())
            .field("connected", &self.is_connected())
            .finish()
    }
}

impl ClientInner {
    /// REGISTER and wait for REGISTERED
    async fn register(&self, reader: &mut BufReader<OwnedReadHalf>) -> Result<(), ExposureError> {
        let register = {
            let session = self.session.lock().await;
            RelayMessage::Register {
                server_identity: session.server_identity().to_string(),
                local_port: session.local_port(),
                label: session.label().to_string(),
            }
        };

        if !self.send(&register).await {
            return Err(ExposureError::Connection(
                "Failed to send REGISTER".to_string(),
            ));
        }

        let mut line = String::new();
        let read = timeout(self.config.read_timeout, reader.read_line(&mut line))
            .await
            .map_err(|_| ExposureError::Registration("Timed out waiting for REGISTERED".to_string()))?
            .map_err(|e| ExposureError::Connection(format!("Read failed: {}", e)))?;
        if read == 0 {
            return Err(ExposureError::Registration(
                "Relay closed the connection during registration".to_string(),
            ));
        }

        match RelayMessage::parse(&line) {
            Ok(RelayMessage::Registered {
                public_host,
                public_port,
            }) => {
                let mut session = self.session.lock().await;
                session.update_from_registration(public_host, public_port);
                session.set_active(true);
                info!(
                    "Tunnel registered: {} (session {})",
                    session.public_address().unwrap_or_default(),
                    session.session_id()
                );
                Ok(())
            }
            Ok(other) => Err(ExposureError::Registration(format!(
                "Unexpected response: {}",
                other
            ))),
            Err(e) => Err(ExposureError::Registration(e.to_string())),
        }
    }

    /// Write one frame; on failure the client is closed and `false` returned
    async fn send(&self, message: &RelayMessage) -> bool {
        let line = message.to_line();
        let result = {
            let mut guard = self.writer.lock().await;
            match guard.as_mut() {
                Some(writer) => {
                    async {
                        writer.write_all(line.as_bytes()).await?;
                        writer.flush().await
                    }
                    .await
                }
                None => return false,
            }
        };

        match result {
            Ok(()) => true,
            Err(e) => {
                self.close(&format!("Send error: {}", e)).await;
                false
            }
        }
    }

    async fn close(&self, reason: &str) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        self.connected.store(false, Ordering::SeqCst);
        self.cancel.cancel();
        *self.last_disconnect_reason.lock().await = Some(reason.to_string());

        if let Some(mut writer) = self.writer.lock().await.take() {
            let _ = writer.shutdown().await;
        }
        self.session.lock().await.set_active(false);

        info!("Tunnel {} closed: {}", self.session_id, reason);
    }

    async fn handle_message(self: &Arc<Self>, line: &str) {
        self.session.lock().await.record_heartbeat();

        match RelayMessage::parse(line) {
            Ok(RelayMessage::Heartbeat) => {
                self.send(&RelayMessage::HeartbeatAck).await;
            }
            Ok(RelayMessage::Connection { id }) => {
                tokio::spawn(forward_connection(self.clone(), id));
            }
            Ok(other) => debug!("Ignoring {} frame from relay", other.kind()),
            Err(e) => debug!("Ignoring frame from relay: {}", e),
        }
    }
}

async fn message_loop(inner: Arc<ClientInner>, mut reader: BufReader<OwnedReadHalf>) {
    let mut line = String::new();

    loop {
        line.clear();
        let read = tokio::select! {
            _ = inner.cancel.cancelled() => return,
            read = timeout(inner.config.read_timeout, reader.read_line(&mut line)) => read,
        };

        let reason = match read {
            Ok(Ok(0)) => "Connection closed by relay".to_string(),
            Ok(Ok(_)) => {
                inner.handle_message(&line).await;
                continue;
            }
            Ok(Err(e)) => format!("I/O error in message loop: {}", e),
            Err(_) => format!(
                "No data from relay for {}ms",
                inner.config.read_timeout.as_millis()
            ),
        };

        warn!("Tunnel message loop ended: {}", reason);
        inner.close(&reason).await;
        return;
    }
}

async fn keepalive_loop(inner: Arc<ClientInner>) {
    let mut ticker = interval(inner.config.keepalive_check);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = inner.cancel.cancelled() => return,
            _ = ticker.tick() => {}
        }

        let due = inner.last_keepalive.lock().await.elapsed() > inner.config.keepalive_interval;
        if due && inner.send(&RelayMessage::Keepalive).await {
            *inner.last_keepalive.lock().await = Instant::now();
            debug!("Sent KEEPALIVE");
        }
    }
}

/// Open the local service and a relay data channel, then splice them
async fn forward_connection(inner: Arc<ClientInner>, id: String) {
    let local_port = inner.session.lock().await.local_port();

    let local = match TcpStream::connect(("127.0.0.1", local_port)).await {
        Ok(stream) => stream,
        Err(e) => {
            warn!(
                "Connection {}: local service on port {} unreachable: {}",
                id, local_port, e
            );
            return;
        }
    };

    let mut relay = match connect_with_timeout(&inner.config.relay_addr(), inner.config.connect_timeout).await {
        Ok(stream) => stream,
        Err(e) => {
            warn!("Connection {}: data channel failed: {}", id, e);
            return;
        }
    };

    let hello = RelayMessage::Connection { id: id.clone() }.to_line();
    if let Err(e) = relay.write_all(hello.as_bytes()).await {
        warn!("Connection {}: data channel handshake failed: {}", id, e);
        return;
    }

    debug!("Connection {}: forwarding to 127.0.0.1:{}", id, local_port);
    TunnelConnectionForwarder::new(id, inner.bytes_transferred.clone()).spawn(relay, local);
}

async fn connect_with_timeout(addr: &str, limit: Duration) -> Result<TcpStream, ExposureError> {
    timeout(limit, TcpStream::connect(addr))
        .await
        .map_err(|_| {
            ExposureError::Connection(format!(
                "Connect to {} timed out after {}ms",
                addr,
                limit.as_millis()
            ))
        })?
        .map_err(|e| ExposureError::Connection(format!("Connect to {} failed: {}", addr, e)))
}

fn configure_keepalive(stream: &TcpStream) {
    let keepalive = TcpKeepalive::new().with_time(TCP_KEEPALIVE_TIME);
    if let Err(e) = SockRef::from(stream).set_tcp_keepalive(&keepalive) {
        debug!("Failed to enable TCP keepalive: {}", e);
    }
}
