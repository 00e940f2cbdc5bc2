// Shared test fixtures: an in-process IGD (SSDP responder + HTTP/SOAP server)
// and a TCP relay that speaks the tunnel protocol.

use crate::config::Settings;
use crate::upnp::ssdp::SEARCH_TARGET;
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use std::collections::BTreeSet;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

pub const SERVICE_TYPE: &str = "urn:schemas-upnp-org:service:WANIPConnection:1";
pub const CONTROL_PATH: &str = "/ctl/IPConn";

const DEVICE_XML: &str = r#"<?xml version="1.0"?>
<root xmlns="urn:schemas-upnp-org:device-1-0">
  <device>
    <deviceType>urn:schemas-upnp-org:device:InternetGatewayDevice:1</deviceType>
    <serviceList>
      <service>
        <serviceType>urn:schemas-upnp-org:service:Layer3Forwarding:1</serviceType>
        <controlURL>/ctl/L3F</controlURL>
      </service>
    </serviceList>
    <deviceList>
      <device>
        <deviceType>urn:schemas-upnp-org:device:WANConnectionDevice:1</deviceType>
        <serviceList>
          <service>
            <serviceType>urn:schemas-upnp-org:service:WANIPConnection:1</serviceType>
            <controlURL>/ctl/IPConn</controlURL>
          </service>
        </serviceList>
      </device>
    </deviceList>
  </device>
</root>"#;

/// Settings with short timings and a fixed LAN address
pub fn fast_settings() -> Settings {
    let mut settings = Settings::default();
    settings.local_address = Some(Ipv4Addr::new(192, 168, 1, 50));
    settings.advanced.discovery_timeout_ms = 500;
    settings.advanced.soap_timeout_ms = 1000;
    settings.advanced.fallback_grace_ms = 300;
    settings.advanced.relay_connect_timeout_ms = 1000;
    settings.advanced.relay_read_timeout_ms = 2000;
    settings.advanced.keepalive_check_ms = 100;
    settings.advanced.liveness_check_ms = 100;
    settings
}

/// Poll `condition` every 20ms until it holds or `limit` passes
pub async fn wait_for<F: Fn() -> bool>(limit: Duration, condition: F) -> bool {
    let deadline = tokio::time::Instant::now() + limit;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    condition()
}

/// An address nothing answers on
pub async fn unused_udp_addr() -> SocketAddr {
    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    socket.local_addr().unwrap()
}

/// A TCP port nothing listens on
pub async fn closed_tcp_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

#[derive(Debug, Default)]
pub struct GatewayState {
    pub external_ip: Option<String>,
    pub rejected_ports: BTreeSet<u16>,
    pub mapped: BTreeSet<u16>,
    pub calls: Vec<(String, String)>,
    /// Added before every SOAP answer
    pub soap_delay: Duration,
}

/// In-process Internet Gateway Device
pub struct MockGateway {
    pub ssdp_addr: SocketAddr,
    pub http_addr: SocketAddr,
    pub state: Arc<Mutex<GatewayState>>,
    tasks: Vec<JoinHandle<()>>,
}

impl MockGateway {
    pub async fn start(external_ip: Option<&str>) -> Self {
        let state = Arc::new(Mutex::new(GatewayState {
            external_ip: external_ip.map(str::to_string),
            ..Default::default()
        }));

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let http_addr = listener.local_addr().unwrap();
        let http_state = state.clone();
        let http_task = tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    break;
                };
                let io = TokioIo::new(stream);
                let state = http_state.clone();
                tokio::spawn(async move {
                    let service = service_fn(move |req| handle_gateway_request(req, state.clone()));
                    let _ = http1::Builder::new().serve_connection(io, service).await;
                });
            }
        });

        let udp = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let ssdp_addr = udp.local_addr().unwrap();
        let location = format!("http://{}/rootDesc.xml", http_addr);
        let ssdp_task = tokio::spawn(async move {
            let mut buf = [0u8; 2048];
            loop {
                let Ok((n, from)) = udp.recv_from(&mut buf).await else {
                    break;
                };
                let request = String::from_utf8_lossy(&buf[..n]);
                if !request.starts_with("M-SEARCH") {
                    continue;
                }
                let reply = format!(
                    "HTTP/1.1 200 OK\r\nCACHE-CONTROL: max-age=120\r\nST: {}\r\nUSN: uuid:mock-igd::{}\r\nLocation: {}\r\n\r\n",
                    SEARCH_TARGET, SEARCH_TARGET, location
                );
                let _ = udp.send_to(reply.as_bytes(), from).await;
            }
        });

        Self {
            ssdp_addr,
            http_addr,
            state,
            tasks: vec![http_task, ssdp_task],
        }
    }

    pub fn location(&self) -> String {
        format!("http://{}/rootDesc.xml", self.http_addr)
    }

    pub fn control_url(&self) -> String {
        format!("http://{}{}", self.http_addr, CONTROL_PATH)
    }

    /// Settings pointing discovery at this gateway
    pub fn settings(&self) -> Settings {
        let mut settings = fast_settings();
        settings.advanced.ssdp_address = self.ssdp_addr;
        settings
    }

    pub fn set_soap_delay(&self, delay: Duration) {
        self.state.lock().unwrap().soap_delay = delay;
    }

    pub fn reject_port(&self, port: u16) {
        self.state.lock().unwrap().rejected_ports.insert(port);
    }

    pub fn mapped_ports(&self) -> Vec<u16> {
        self.state.lock().unwrap().mapped.iter().copied().collect()
    }

    pub fn count(&self, action: &str) -> usize {
        self.state
            .lock()
            .unwrap()
            .calls
            .iter()
            .filter(|(a, _)| a == action)
            .count()
    }

    pub fn bodies(&self, action: &str) -> Vec<String> {
        self.state
            .lock()
            .unwrap()
            .calls
            .iter()
            .filter(|(a, _)| a == action)
            .map(|(_, body)| body.clone())
            .collect()
    }
}

impl Drop for MockGateway {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

fn xml_field(body: &str, name: &str) -> Option<String> {
    let open = format!("<{}>", name);
    let close = format!("</{}>", name);
    let start = body.find(&open)? + open.len();
    let end = body[start..].find(&close)? + start;
    Some(body[start..end].to_string())
}

fn respond(status: StatusCode, body: String) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::from(body)));
    *response.status_mut() = status;
    response
}

async fn handle_gateway_request(
    req: Request<Incoming>,
    state: Arc<Mutex<GatewayState>>,
) -> std::result::Result<Response<Full<Bytes>>, hyper::Error> {
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    match (method, path.as_str()) {
        (Method::GET, "/rootDesc.xml") => Ok(respond(StatusCode::OK, DEVICE_XML.to_string())),
        (Method::POST, CONTROL_PATH) => {
            let action = req
                .headers()
                .get("SOAPAction")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.trim_matches('"').rsplit('#').next())
                .unwrap_or_default()
                .to_string();
            let body = req.collect().await?.to_bytes();
            let body = String::from_utf8_lossy(&body).to_string();
            let port = xml_field(&body, "NewExternalPort").and_then(|p| p.parse::<u16>().ok());

            let delay = state.lock().unwrap().soap_delay;
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }

            let mut state = state.lock().unwrap();
            state.calls.push((action.clone(), body));

            let ok = match action.as_str() {
                "AddPortMapping" => match port {
                    Some(p) if !state.rejected_ports.contains(&p) => {
                        state.mapped.insert(p);
                        true
                    }
                    _ => false,
                },
                "DeletePortMapping" => port.is_some_and(|p| state.mapped.remove(&p)),
                "GetSpecificPortMappingEntry" => port.is_some_and(|p| state.mapped.contains(&p)),
                "GetExternalIPAddress" => {
                    if let Some(ip) = &state.external_ip {
                        return Ok(respond(
                            StatusCode::OK,
                            format!(
                                "<s:Envelope><s:Body><u:GetExternalIPAddressResponse>\
                                 <NewExternalIPAddress>{}</NewExternalIPAddress>\
                                 </u:GetExternalIPAddressResponse></s:Body></s:Envelope>",
                                ip
                            ),
                        ));
                    }
                    false
                }
                _ => false,
            };

            if ok {
                Ok(respond(StatusCode::OK, format!("<u:{}Response/>", action)))
            } else {
                Ok(respond(StatusCode::INTERNAL_SERVER_ERROR, "<UPnPError/>".to_string()))
            }
        }
        _ => Ok(respond(StatusCode::NOT_FOUND, String::new())),
    }
}

/// In-process relay server
///
/// Answers every REGISTER with `reply`; records everything the client sends on
/// the control channel; hands data channels (first line `CONNECTION|<id>`) to
/// the test through `data_channels`.
pub struct MockRelay {
    pub addr: SocketAddr,
    pub received: Arc<Mutex<Vec<String>>>,
    pub data_channels: mpsc::UnboundedReceiver<(String, BufReader<TcpStream>)>,
    control: Arc<tokio::sync::Mutex<Option<OwnedWriteHalf>>>,
    registrations: Arc<Mutex<usize>>,
    task: JoinHandle<()>,
}

impl MockRelay {
    pub async fn start(reply: &str) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let received = Arc::new(Mutex::new(Vec::new()));
        let control = Arc::new(tokio::sync::Mutex::new(None));
        let registrations = Arc::new(Mutex::new(0));
        let (data_tx, data_channels) = mpsc::unbounded_channel();
        let reply = reply.to_string();

        let task = {
            let received = received.clone();
            let control = control.clone();
            let registrations = registrations.clone();
            tokio::spawn(async move {
                loop {
                    let Ok((stream, _)) = listener.accept().await else {
                        break;
                    };
                    let mut reader = BufReader::new(stream);
                    let mut first = String::new();
                    if reader.read_line(&mut first).await.unwrap_or(0) == 0 {
                        continue;
                    }
                    let first = first.trim_end().to_string();

                    if let Some(id) = first.strip_prefix("CONNECTION|") {
                        let _ = data_tx.send((id.to_string(), reader));
                        continue;
                    }

                    received.lock().unwrap().push(first);
                    *registrations.lock().unwrap() += 1;

                    let (read_half, mut write_half) = reader.into_inner().into_split();
                    if write_half.write_all(reply.as_bytes()).await.is_err() {
                        continue;
                    }
                    *control.lock().await = Some(write_half);

                    let received = received.clone();
                    tokio::spawn(async move {
                        let mut lines = BufReader::new(read_half).lines();
                        while let Ok(Some(line)) = lines.next_line().await {
                            received.lock().unwrap().push(line);
                        }
                    });
                }
            })
        };

        Self {
            addr,
            received,
            data_channels,
            control,
            registrations,
            task,
        }
    }

    /// Settings pointing the tunnel at this relay
    pub fn apply(&self, settings: &mut Settings) {
        settings.tunnel.relay_host = "127.0.0.1".to_string();
        settings.tunnel.relay_port = self.addr.port();
    }

    pub fn registrations(&self) -> usize {
        *self.registrations.lock().unwrap()
    }

    pub fn received(&self) -> Vec<String> {
        self.received.lock().unwrap().clone()
    }

    /// Write a raw line to the latest control connection
    pub async fn send(&self, line: &str) {
        if let Some(writer) = self.control.lock().await.as_mut() {
            writer.write_all(line.as_bytes()).await.unwrap();
            writer.flush().await.unwrap();
        }
    }

    /// Close the latest control connection from the relay side
    pub async fn drop_control(&self) {
        if let Some(mut writer) = self.control.lock().await.take() {
            let _ = writer.shutdown().await;
        }
    }
}

impl Drop for MockRelay {
    fn drop(&mut self) {
        self.task.abort();
    }
}
