//! State of one relay tunnel attempt

use chrono::{DateTime, Utc};
use rand::Rng;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

/// Identity and runtime state of one tunnel attempt
///
/// A new session is created for every connection attempt; sessions are never
/// reused across reconnects.
#[derive(Debug, Clone)]
pub struct TunnelSession {
    session_id: String,
    server_identity: String,
    local_port: u16,
    label: String,
    public_host: Option<String>,
    public_port: Option<u16>,
    created_at: DateTime<Utc>,
    started: Instant,
    last_heartbeat: Instant,
    active: bool,
}

impl TunnelSession {
    /// Start a session for `local_port`
    pub fn new(server_identity: impl Into<String>, local_port: u16, label: impl Into<String>) -> Self {
        let now = Instant::now();
        Self {
            session_id: generate_session_id(),
            server_identity: server_identity.into(),
            local_port,
            label: label.into(),
            public_host: None,
            public_port: None,
            created_at: Utc::now(),
            started: now,
            last_heartbeat: now,
            active: false,
        }
    }

    /// Store the public endpoint the relay assigned
    pub fn update_from_registration(&mut self, host: impl Into<String>, port: u16) {
        self.public_host = Some(host.into());
        self.public_port = Some(port);
        self.last_heartbeat = Instant::now();
    }

    /// Note that the relay just sent us something
    pub fn record_heartbeat(&mut self) {
        self.last_heartbeat = Instant::now();
    }

    /// `host:port` once registered
    pub fn public_address(&self) -> Option<String> {
        match (&self.public_host, self.public_port) {
            (Some(host), Some(port)) if !host.is_empty() && port > 0 => {
                Some(format!("{}:{}", host, port))
            }
            _ => None,
        }
    }

    /// Time since the relay was last heard from
    pub fn heartbeat_age(&self) -> Duration {
        self.last_heartbeat.elapsed()
    }

    /// Time since the session was created
    pub fn uptime(&self) -> Duration {
        self.started.elapsed()
    }

    /// Session id (`pb-<nanos>-<random>`)
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Identity announced to the relay
    pub fn server_identity(&self) -> &str {
        &self.server_identity
    }

    /// Port of the local service
    pub fn local_port(&self) -> u16 {
        self.local_port
    }

    /// Label announced to the relay
    pub fn label(&self) -> &str {
        &self.label
    }

    /// Assigned public host
    pub fn public_host(&self) -> Option<&str> {
        self.public_host.as_deref()
    }

    /// Assigned public port
    pub fn public_port(&self) -> Option<u16> {
        self.public_port
    }

    /// Wall-clock creation time
    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Whether the tunnel for this session is up
    pub fn is_active(&self) -> bool {
        self.active
    }

    /// Mark the tunnel up or down
    pub fn set_active(&mut self, active: bool) {
        self.active = active;
    }
}

fn generate_session_id() -> String {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    let suffix: u32 = rand::thread_rng().gen_range(0..10_000);
    format!("pb-{}-{}", nanos, suffix)
}
