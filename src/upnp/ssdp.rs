//! SSDP discovery of an Internet Gateway Device
//!
//! A single M-SEARCH datagram goes to the SSDP multicast group. The first reply's
//! `LOCATION` header points at the device description, which is scanned for a
//! WANIPConnection or WANPPPConnection service.

use super::pattern;
use regex::Regex;
use reqwest::Url;
use std::sync::LazyLock;

/// SSDP multicast group and port
pub const SSDP_MULTICAST_ADDR: &str = "239.255.255.250:1900";

/// Device type searched for
pub const SEARCH_TARGET: &str = "urn:schemas-upnp-org:device:InternetGatewayDevice:1";

/// Service types that can map ports
const WAN_SERVICES: [&str; 2] = ["WANIPConnection", "WANPPPConnection"];

static LOCATION_RE: LazyLock<Option<Regex>> =
    LazyLock::new(|| pattern(r"(?im)^LOCATION:[ \t]*(\S+)"));
static SERVICE_RE: LazyLock<Option<Regex>> = LazyLock::new(|| pattern(r"(?s)<service>(.*?)</service>"));
static SERVICE_TYPE_RE: LazyLock<Option<Regex>> =
    LazyLock::new(|| pattern(r"(?s)<serviceType>\s*(.*?)\s*</serviceType>"));
static CONTROL_URL_RE: LazyLock<Option<Regex>> =
    LazyLock::new(|| pattern(r"(?s)<controlURL>\s*(.*?)\s*</controlURL>"));
static URL_BASE_RE: LazyLock<Option<Regex>> =
    LazyLock::new(|| pattern(r"(?s)<URLBase>\s*(.*?)\s*</URLBase>"));

/// Build the M-SEARCH request datagram
pub fn build_search_request() -> String {
    format!(
        "M-SEARCH * HTTP/1.1\r\n\
         HOST: {}\r\n\
         ST: {}\r\n\
         MAN: \"ssdp:discover\"\r\n\
         MX: 2\r\n\
         \r\n",
        SSDP_MULTICAST_ADDR, SEARCH_TARGET
    )
}

/// Extract the `LOCATION` header (case-insensitive) from an SSDP reply
pub fn parse_location(response: &str) -> Option<String> {
    LOCATION_RE
        .as_ref()?
        .captures(response)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().trim().to_string())
        .filter(|s| !s.is_empty())
}

/// Find the first WAN connection service in a device description
///
/// Returns `(serviceType, absolute controlURL)`. Relative control URLs are
/// resolved against `<URLBase>` when present, otherwise against `location`.
pub fn find_wan_service(xml: &str, location: &str) -> Option<(String, String)> {
    let base = URL_BASE_RE
        .as_ref()
        .and_then(|re| re.captures(xml))
        .and_then(|c| c.get(1))
        .and_then(|m| Url::parse(m.as_str()).ok())
        .or_else(|| Url::parse(location).ok());

    SERVICE_RE
        .as_ref()?
        .captures_iter(xml)
        .filter_map(|c| c.get(1).map(|m| m.as_str()))
        .find_map(|service| {
            let service_type = SERVICE_TYPE_RE.as_ref()?.captures(service)?.get(1)?.as_str();
            if !WAN_SERVICES.iter().any(|wan| service_type.contains(wan)) {
                return None;
            }
            let control = CONTROL_URL_RE.as_ref()?.captures(service)?.get(1)?.as_str();
            let control_url = resolve_url(base.as_ref(), control)?;
            Some((service_type.to_string(), control_url))
        })
}

fn resolve_url(base: Option<&Url>, path: &str) -> Option<String> {
    if let Ok(url) = Url::parse(path) {
        return Some(url.to_string());
    }
    base?.join(path).ok().map(|u| u.to_string())
}
