use crate::config::*;
use crate::upnp::IpProtocol;
use crate::Error;
use std::time::Duration;
use tempfile::NamedTempFile;

#[test]
fn test_settings_default() {
    let settings = Settings::default();

    assert_eq!(settings.internal_port, 25565);
    assert_eq!(settings.external_port, 25565);
    assert_eq!(settings.lease_duration_secs, 3600);
    assert_eq!(settings.refresh_interval_secs, 1800);
    assert_eq!(settings.retry_count, 3);
    assert_eq!(settings.retry_delay_secs, 5);
    assert_eq!(settings.allowed_subnets, vec!["192.168.0.0/16", "10.0.0.0/8"]);
    assert!(settings.additional_ports.is_empty());
    assert!(!settings.dry_run);
    assert!(!settings.debug_logging);
    assert!(!settings.enable_public_ip_fallback);
    assert_eq!(settings.public_ip_fallback_url, "https://api.ipify.org");
    assert!(settings.local_address.is_none());
}

#[test]
fn test_tunnel_settings_default() {
    let tunnel = TunnelSettings::default();

    assert!(tunnel.enabled);
    assert_eq!(tunnel.mode, TunnelMode::Auto);
    assert_eq!(tunnel.relay_host, "relay.portbridge.net");
    assert_eq!(tunnel.relay_port, 7000);
    assert_eq!(tunnel.reconnect_base_delay_secs, 5);
    assert_eq!(tunnel.reconnect_max_delay_secs, 120);
    assert_eq!(tunnel.keepalive_interval_secs, 20);
    assert!(tunnel.server_identity.is_none());
    assert_eq!(tunnel.label, "world");
}

#[test]
fn test_advanced_settings_match_protocol_constants() {
    let advanced = AdvancedSettings::default();

    assert_eq!(advanced.ssdp_address.to_string(), "239.255.255.250:1900");
    assert_eq!(advanced.discovery_timeout(), Duration::from_secs(3));
    assert_eq!(advanced.soap_timeout(), Duration::from_secs(5));
    assert_eq!(advanced.fallback_grace(), Duration::from_secs(10));
    assert_eq!(advanced.relay_connect_timeout(), Duration::from_secs(5));
    assert_eq!(advanced.relay_read_timeout(), Duration::from_secs(10));
    assert_eq!(advanced.keepalive_check(), Duration::from_secs(5));
    assert_eq!(advanced.liveness_check(), Duration::from_secs(10));
    assert_eq!(advanced.renewal_floor(), Duration::from_secs(60));
}

#[test]
fn test_default_settings_validate() {
    tokio_test::assert_ok!(Settings::default().validate());
}

#[test]
fn test_settings_save_and_load() {
    let temp_file = NamedTempFile::new().expect("Failed to create temp file");
    let path = temp_file.path();

    let mut settings = Settings::default();
    settings.internal_port = 8080;
    settings.tunnel.mode = TunnelMode::Force;
    settings.additional_ports = vec!["rcon:25575:25576:TCP:true".to_string()];

    settings.save(path).expect("Failed to save settings");
    let loaded = Settings::load(path).expect("Failed to load settings");

    assert_eq!(loaded, settings);
}

#[test]
fn test_settings_load_missing_file_gives_defaults() {
    let dir = tempfile::tempdir().expect("Failed to create temp dir");
    let path = dir.path().join("missing.json");

    let loaded = Settings::load(&path).expect("Missing file should load defaults");
    assert_eq!(loaded, Settings::default());
}

#[test]
fn test_settings_load_empty_file_gives_defaults() {
    let temp_file = NamedTempFile::new().expect("Failed to create temp file");
    std::fs::write(temp_file.path(), "  \n").unwrap();

    let loaded = Settings::load(temp_file.path()).expect("Empty file should load defaults");
    assert_eq!(loaded, Settings::default());
}

#[test]
fn test_settings_load_partial_json_fills_defaults() {
    let temp_file = NamedTempFile::new().expect("Failed to create temp file");
    std::fs::write(
        temp_file.path(),
        r#"{"internal_port": 9000, "tunnel": {"mode": "FORCE"}}"#,
    )
    .unwrap();

    let loaded = Settings::load(temp_file.path()).expect("Failed to load");
    assert_eq!(loaded.internal_port, 9000);
    assert_eq!(loaded.tunnel.mode, TunnelMode::Force);
    assert_eq!(loaded.tunnel.relay_port, 7000);
    assert_eq!(loaded.lease_duration_secs, 3600);
}

#[test]
fn test_settings_load_invalid_json_is_config_error() {
    let temp_file = NamedTempFile::new().expect("Failed to create temp file");
    std::fs::write(temp_file.path(), "{not json").unwrap();

    let result = Settings::load(temp_file.path());
    assert!(matches!(result, Err(Error::Config(_))));
}

#[test]
fn test_tunnel_mode_serializes_uppercase() {
    let json = serde_json::to_string(&TunnelMode::Auto).unwrap();
    assert_eq!(json, "\"AUTO\"");

    let mode: TunnelMode = serde_json::from_str("\"FORCE\"").unwrap();
    assert_eq!(mode, TunnelMode::Force);
}

#[test]
fn test_tunnel_mode_from_str() {
    assert_eq!("auto".parse::<TunnelMode>().unwrap(), TunnelMode::Auto);
    assert_eq!(" FORCE ".parse::<TunnelMode>().unwrap(), TunnelMode::Force);
    assert!("sometimes".parse::<TunnelMode>().is_err());
    assert_eq!(TunnelMode::Force.to_string(), "FORCE");
}

#[test]
fn test_validate_rejects_short_refresh_interval() {
    let mut settings = Settings::default();
    settings.refresh_interval_secs = 59;
    tokio_test::assert_err!(settings.validate());
    assert!(matches!(settings.validate(), Err(Error::Config(_))));

    settings.refresh_interval_secs = 60;
    assert!(settings.validate().is_ok());
}

#[test]
fn test_validate_rejects_zero_renewal_floor() {
    let mut settings = Settings::default();
    settings.advanced.renewal_floor_ms = 0;
    tokio_test::assert_err!(settings.validate());

    settings.advanced.renewal_floor_ms = 250;
    tokio_test::assert_ok!(settings.validate());
}

#[test]
fn test_validate_retry_ranges() {
    let mut settings = Settings::default();
    settings.retry_count = 11;
    assert!(settings.validate().is_err());

    let mut settings = Settings::default();
    settings.retry_count = 0;
    assert!(settings.validate().is_ok());

    let mut settings = Settings::default();
    settings.retry_delay_secs = 0;
    assert!(settings.validate().is_err());

    let mut settings = Settings::default();
    settings.retry_delay_secs = 61;
    assert!(settings.validate().is_err());
}

#[test]
fn test_validate_rejects_zero_ports() {
    let mut settings = Settings::default();
    settings.internal_port = 0;
    assert!(settings.validate().is_err());

    let mut settings = Settings::default();
    settings.tunnel.relay_port = 0;
    assert!(settings.validate().is_err());
}

#[test]
fn test_validate_reconnect_delays() {
    let mut settings = Settings::default();
    settings.tunnel.reconnect_base_delay_secs = 0;
    assert!(settings.validate().is_err());

    let mut settings = Settings::default();
    settings.tunnel.reconnect_max_delay_secs = 5;
    assert!(settings.validate().is_err());

    let mut settings = Settings::default();
    settings.tunnel.reconnect_base_delay_secs = 60;
    settings.tunnel.reconnect_max_delay_secs = 30;
    assert!(settings.validate().is_err(), "max below base must be rejected");
}

#[test]
fn test_validate_keepalive_interval() {
    let mut settings = Settings::default();
    settings.tunnel.keepalive_interval_secs = 4;
    assert!(settings.validate().is_err());

    settings.tunnel.keepalive_interval_secs = 121;
    assert!(settings.validate().is_err());

    settings.tunnel.keepalive_interval_secs = 5;
    assert!(settings.validate().is_ok());
}

#[test]
fn test_validate_rejects_bad_cidr() {
    let mut settings = Settings::default();
    settings.allowed_subnets = vec!["192.168.0.0/33".to_string()];
    assert!(settings.validate().is_err());

    settings.allowed_subnets = vec!["not-a-subnet".to_string()];
    assert!(settings.validate().is_err());

    settings.allowed_subnets = Vec::new();
    assert!(settings.validate().is_ok());
}

#[test]
fn test_validate_rejects_bad_additional_port() {
    let mut settings = Settings::default();
    settings.additional_ports = vec!["rcon:25575:0:TCP:true".to_string()];
    assert!(settings.validate().is_err());
}

#[test]
fn test_additional_port_parse() {
    let port: AdditionalPort = "rcon:25575:25576:TCP:true".parse().unwrap();

    assert_eq!(port.name, "rcon");
    assert_eq!(port.internal_port, 25575);
    assert_eq!(port.external_port, 25576);
    assert_eq!(port.protocol, IpProtocol::TCP);
    assert!(port.enabled);
}

#[test]
fn test_additional_port_parse_udp_disabled() {
    let port: AdditionalPort = "voice:9987:9987:udp:false".parse().unwrap();

    assert_eq!(port.protocol, IpProtocol::UDP);
    assert!(!port.enabled);
}

#[test]
fn test_additional_port_parse_errors() {
    assert!("rcon:25575:25576:TCP".parse::<AdditionalPort>().is_err());
    assert!("rcon:abc:25576:TCP:true".parse::<AdditionalPort>().is_err());
    assert!("rcon:25575:70000:TCP:true".parse::<AdditionalPort>().is_err());
    assert!("rcon:25575:25576:SCTP:true".parse::<AdditionalPort>().is_err());
}

#[test]
fn test_parsed_additional_ports_skips_invalid() {
    let mut settings = Settings::default();
    settings.additional_ports = vec![
        "rcon:25575:25576:TCP:true".to_string(),
        "garbage".to_string(),
        "".to_string(),
        "query:25565:25565:UDP:true".to_string(),
    ];

    let parsed = settings.parsed_additional_ports();
    assert_eq!(parsed.len(), 2);
    assert_eq!(parsed[0].name, "rcon");
    assert_eq!(parsed[1].name, "query");
}

#[test]
fn test_effective_external_port() {
    let mut settings = Settings::default();
    settings.internal_port = 8080;
    settings.external_port = 9090;
    assert_eq!(settings.effective_external_port(), 9090);

    settings.external_port = 0;
    assert_eq!(settings.effective_external_port(), 8080);
}
