//! Public IP resolution
//!
//! The UPnP controller asks the gateway for its WAN address first. When that
//! is unavailable it falls back to a [`PublicIpResolver`], which hosts inject.
//! [`HttpIpResolver`] queries a plain-text "what is my IP" service.

use crate::config::Settings;
use std::future::Future;
use std::net::Ipv4Addr;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Boxed future returned by resolvers
pub type ResolveFuture<'a> = Pin<Box<dyn Future<Output = Option<Ipv4Addr>> + Send + 'a>>;

/// Capability to look up this host's public IPv4 address
pub trait PublicIpResolver: Send + Sync {
    /// Resolve the public address, or `None` when it cannot be determined
    fn resolve(&self) -> ResolveFuture<'_>;
}

/// Resolver that never knows the answer
#[derive(Debug, Default, Clone, Copy)]
pub struct NoPublicIp;

impl PublicIpResolver for NoPublicIp {
    fn resolve(&self) -> ResolveFuture<'_> {
        Box::pin(async { None })
    }
}

/// Resolver returning a fixed answer
#[derive(Debug, Clone, Copy)]
pub struct StaticIpResolver(pub Option<Ipv4Addr>);

impl PublicIpResolver for StaticIpResolver {
    fn resolve(&self) -> ResolveFuture<'_> {
        let ip = self.0;
        Box::pin(async move { ip })
    }
}

/// HTTP-based public IP lookup
#[derive(Debug, Clone)]
pub struct HttpIpResolver {
    url: String,
    timeout: Duration,
}

impl HttpIpResolver {
    /// Create a resolver for a service answering with the bare IP in its body
    pub fn new(url: impl Into<String>, timeout: Duration) -> Self {
        Self {
            url: url.into(),
            timeout,
        }
    }

    async fn query(&self) -> Option<Ipv4Addr> {
        debug!("Querying public IP service: {}", self.url);

        let client = match reqwest::Client::builder().timeout(self.timeout).build() {
            Ok(c) => c,
            Err(e) => {
                warn!("Failed to create HTTP client: {}", e);
                return None;
            }
        };

        let response = match client.get(&self.url).send().await {
            Ok(r) => r,
            Err(e) => {
                debug!("Failed to query {}: {}", self.url, e);
                return None;
            }
        };

        let text = match response.text().await {
            Ok(t) => t,
            Err(e) => {
                debug!("Failed to read response from {}: {}", self.url, e);
                return None;
            }
        };

        let first_line = text.lines().next().unwrap_or("").trim();
        match parse_public_ip(first_line) {
            Some(ip) => {
                info!("Public IP detected via HTTP: {} (from {})", ip, self.url);
                Some(ip)
            }
            None => {
                debug!("Invalid IP response from {}: {}", self.url, first_line);
                None
            }
        }
    }
}

impl PublicIpResolver for HttpIpResolver {
    fn resolve(&self) -> ResolveFuture<'_> {
        Box::pin(self.query())
    }
}

/// Accept only a dotted-quad IPv4 answer
pub fn parse_public_ip(text: &str) -> Option<Ipv4Addr> {
    text.trim().parse::<Ipv4Addr>().ok()
}

/// Build the resolver the settings ask for
pub fn resolver_from_settings(settings: &Settings) -> Arc<dyn PublicIpResolver> {
    if settings.enable_public_ip_fallback {
        Arc::new(HttpIpResolver::new(
            settings.public_ip_fallback_url.clone(),
            settings.advanced.soap_timeout(),
        ))
    } else {
        Arc::new(NoPublicIp)
    }
}
