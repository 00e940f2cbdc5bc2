//! SOAP 1.1 envelopes for IGD actions
//!
//! Envelopes are literal strings. Responses are never parsed as XML: success is
//! HTTP 200 and the one value we read is pulled out by substring match.

use super::pattern;
use regex::Regex;
use std::net::Ipv4Addr;
use std::sync::LazyLock;

/// Add or refresh a mapping
pub const ADD_PORT_MAPPING: &str = "AddPortMapping";
/// Remove a mapping
pub const DELETE_PORT_MAPPING: &str = "DeletePortMapping";
/// Probe whether a mapping exists
pub const GET_SPECIFIC_PORT_MAPPING_ENTRY: &str = "GetSpecificPortMappingEntry";
/// Read the gateway's WAN address
pub const GET_EXTERNAL_IP_ADDRESS: &str = "GetExternalIPAddress";

static EXTERNAL_IP_RE: LazyLock<Option<Regex>> =
    LazyLock::new(|| pattern(r"<NewExternalIPAddress>(.*?)</NewExternalIPAddress>"));

/// Value of the `SOAPAction` header
pub fn soap_action_header(service_type: &str, action: &str) -> String {
    format!("\"{}#{}\"", service_type, action)
}

/// Build a SOAP envelope for `action` with `args` in order
pub fn build_envelope(service_type: &str, action: &str, args: &[(&str, String)]) -> String {
    let mut fields = String::new();
    for (name, value) in args {
        fields.push_str(&format!("<{name}>{}</{name}>", xml_escape(value)));
    }

    format!(
        "<?xml version=\"1.0\"?>\
         <s:Envelope xmlns:s=\"http://schemas.xmlsoap.org/soap/envelope/\" \
         s:encodingStyle=\"http://schemas.xmlsoap.org/soap/encoding/\">\
         <s:Body><u:{action} xmlns:u=\"{service_type}\">{fields}</u:{action}></s:Body>\
         </s:Envelope>"
    )
}

/// Arguments for AddPortMapping (protocol is always TCP)
pub fn add_port_mapping_args(
    external_port: u16,
    internal_port: u16,
    internal_client: Ipv4Addr,
    description: &str,
    lease_secs: u32,
) -> Vec<(&'static str, String)> {
    vec![
        ("NewRemoteHost", String::new()),
        ("NewExternalPort", external_port.to_string()),
        ("NewProtocol", "TCP".to_string()),
        ("NewInternalPort", internal_port.to_string()),
        ("NewInternalClient", internal_client.to_string()),
        ("NewEnabled", "1".to_string()),
        ("NewPortMappingDescription", description.to_string()),
        ("NewLeaseDuration", lease_secs.to_string()),
    ]
}

/// Arguments identifying one TCP mapping (DeletePortMapping, GetSpecificPortMappingEntry)
pub fn mapping_key_args(external_port: u16) -> Vec<(&'static str, String)> {
    vec![
        ("NewRemoteHost", String::new()),
        ("NewExternalPort", external_port.to_string()),
        ("NewProtocol", "TCP".to_string()),
    ]
}

/// Pull `<NewExternalIPAddress>` out of a GetExternalIPAddress response
pub fn extract_external_ip(body: &str) -> Option<Ipv4Addr> {
    EXTERNAL_IP_RE
        .as_ref()?
        .captures(body)
        .and_then(|c| c.get(1))
        .and_then(|m| m.as_str().trim().parse().ok())
}

fn xml_escape(value: &str) -> String {
    value
        .replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}
