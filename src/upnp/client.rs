//! UPnP IGD gateway client
//!
//! Discovery is a best-effort single-shot probe; callers decide whether to
//! retry. All SOAP operations fail closed: any network, HTTP or parsing error
//! yields `false` / `None` and a debug log line.

use super::soap::{self, ADD_PORT_MAPPING, DELETE_PORT_MAPPING, GET_EXTERNAL_IP_ADDRESS,
    GET_SPECIFIC_PORT_MAPPING_ENTRY};
use super::ssdp::{build_search_request, find_wan_service, parse_location};
use super::types::GatewayHandle;
use crate::config::Settings;
use crate::error::ExposureError;
use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::time::timeout;
use tracing::{debug, info, warn};

/// Largest SSDP reply we read
const SSDP_BUFFER_SIZE: usize = 2048;

/// Client for one LAN's Internet Gateway Device
#[derive(Debug, Clone)]
pub struct GatewayClient {
    http: reqwest::Client,
    ssdp_addr: SocketAddr,
    discovery_timeout: Duration,
}

impl GatewayClient {
    /// Create a client with explicit SSDP target and timeouts
    pub fn new(ssdp_addr: SocketAddr, discovery_timeout: Duration, http_timeout: Duration) -> Self {
        let http = reqwest::Client::builder()
            .connect_timeout(http_timeout)
            .timeout(http_timeout)
            .build()
            .unwrap_or_else(|e| {
                warn!("Failed to build HTTP client with timeouts ({}), using defaults", e);
                reqwest::Client::new()
            });

        Self {
            http,
            ssdp_addr,
            discovery_timeout,
        }
    }

    /// Create a client from the advanced settings
    pub fn from_settings(settings: &Settings) -> Self {
        Self::new(
            settings.advanced.ssdp_address,
            settings.advanced.discovery_timeout(),
            settings.advanced.soap_timeout(),
        )
    }

    /// Locate an IGD with a WAN connection service
    ///
    /// Sends one M-SEARCH, waits for one reply, fetches the LOCATION description
    /// and picks the first WANIPConnection/WANPPPConnection service.
    pub async fn discover(&self) -> Result<GatewayHandle, ExposureError> {
        debug!("Searching for UPnP IGD gateway via {}", self.ssdp_addr);

        let socket = UdpSocket::bind("0.0.0.0:0")
            .await
            .map_err(|e| ExposureError::Discovery(format!("Failed to create socket: {}", e)))?;

        socket
            .send_to(build_search_request().as_bytes(), self.ssdp_addr)
            .await
            .map_err(|e| ExposureError::Discovery(format!("Failed to send M-SEARCH: {}", e)))?;

        let mut buf = [0u8; SSDP_BUFFER_SIZE];
        let (len, from) = timeout(self.discovery_timeout, socket.recv_from(&mut buf))
            .await
            .map_err(|_| {
                ExposureError::Discovery(format!(
                    "No SSDP reply within {}ms",
                    self.discovery_timeout.as_millis()
                ))
            })?
            .map_err(|e| ExposureError::Discovery(format!("SSDP receive failed: {}", e)))?;

        let response = String::from_utf8_lossy(&buf[..len]);
        debug!("SSDP reply from {} ({} bytes)", from, len);

        let location = parse_location(&response).ok_or_else(|| {
            ExposureError::Discovery("SSDP reply has no LOCATION header".to_string())
        })?;

        let xml = self
            .http
            .get(&location)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| ExposureError::Discovery(format!("Failed to fetch {}: {}", location, e)))?
            .text()
            .await
            .map_err(|e| ExposureError::Discovery(format!("Failed to read {}: {}", location, e)))?;

        let (service_type, control_url) = find_wan_service(&xml, &location).ok_or_else(|| {
            ExposureError::Discovery(format!(
                "No WANIPConnection or WANPPPConnection service at {}",
                location
            ))
        })?;

        info!("Found UPnP gateway service {} at {}", service_type, control_url);

        Ok(GatewayHandle {
            control_url,
            service_type,
            location,
        })
    }

    /// AddPortMapping for TCP; true only on HTTP 200
    pub async fn add_mapping(
        &self,
        gateway: &GatewayHandle,
        external_port: u16,
        internal_port: u16,
        local_ip: Ipv4Addr,
        description: &str,
        lease_secs: u32,
    ) -> bool {
        let args =
            soap::add_port_mapping_args(external_port, internal_port, local_ip, description, lease_secs);
        self.invoke(gateway, ADD_PORT_MAPPING, &args).await.is_some()
    }

    /// DeletePortMapping for a TCP external port
    pub async fn remove_mapping(&self, gateway: &GatewayHandle, external_port: u16) -> bool {
        let args = soap::mapping_key_args(external_port);
        self.invoke(gateway, DELETE_PORT_MAPPING, &args).await.is_some()
    }

    /// GetSpecificPortMappingEntry as an existence probe (HTTP 200 means it exists)
    pub async fn query_mapping(&self, gateway: &GatewayHandle, external_port: u16) -> bool {
        let args = soap::mapping_key_args(external_port);
        self.invoke(gateway, GET_SPECIFIC_PORT_MAPPING_ENTRY, &args)
            .await
            .is_some()
    }

    /// GetExternalIPAddress
    pub async fn external_ip(&self, gateway: &GatewayHandle) -> Option<Ipv4Addr> {
        let body = self.invoke(gateway, GET_EXTERNAL_IP_ADDRESS, &[]).await?;
        let ip = soap::extract_external_ip(&body);
        if ip.is_none() {
            debug!("GetExternalIPAddress response had no usable address");
        }
        ip
    }

    /// POST one action; returns the body on HTTP 200
    async fn invoke(
        &self,
        gateway: &GatewayHandle,
        action: &str,
        args: &[(&str, String)],
    ) -> Option<String> {
        let body = soap::build_envelope(&gateway.service_type, action, args);

        let response = self
            .http
            .post(&gateway.control_url)
            .header("Content-Type", "text/xml")
            .header("SOAPAction", soap::soap_action_header(&gateway.service_type, action))
            .body(body)
            .send()
            .await;

        let response = match response {
            Ok(r) => r,
            Err(e) => {
                debug!("SOAP {} request failed: {}", action, e);
                return None;
            }
        };

        let status = response.status();
        if status != reqwest::StatusCode::OK {
            debug!("SOAP {} returned HTTP {}", action, status);
            return None;
        }

        match response.text().await {
            Ok(text) => Some(text),
            Err(e) => {
                debug!("SOAP {} response unreadable: {}", action, e);
                None
            }
        }
    }
}
