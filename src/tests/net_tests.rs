use crate::net::*;
use std::net::Ipv4Addr;

fn subnets(list: &[&str]) -> Vec<String> {
    list.iter().map(|s| s.to_string()).collect()
}

#[test]
fn test_parse_cidr() {
    assert_eq!(
        parse_cidr("192.168.0.0/16"),
        Some((Ipv4Addr::new(192, 168, 0, 0), 16))
    );
    assert_eq!(parse_cidr(" 10.0.0.0 / 8 "), Some((Ipv4Addr::new(10, 0, 0, 0), 8)));
    assert_eq!(parse_cidr("0.0.0.0/0"), Some((Ipv4Addr::UNSPECIFIED, 0)));
}

#[test]
fn test_parse_cidr_rejects_malformed() {
    assert!(parse_cidr("192.168.0.0").is_none());
    assert!(parse_cidr("192.168.0.0/33").is_none());
    assert!(parse_cidr("192.168.0/16").is_none());
    assert!(parse_cidr("fe80::/10").is_none());
    assert!(parse_cidr("").is_none());
}

#[test]
fn test_cidr_matches_prefix_bits() {
    let ip = Ipv4Addr::new(192, 168, 1, 20);

    assert!(cidr_matches(ip, "192.168.0.0/16"));
    assert!(cidr_matches(ip, "192.168.1.0/24"));
    assert!(cidr_matches(ip, "192.168.1.20/32"));
    assert!(!cidr_matches(ip, "192.168.2.0/24"));
    assert!(!cidr_matches(ip, "192.168.1.21/32"));
    assert!(!cidr_matches(ip, "10.0.0.0/8"));
}

#[test]
fn test_cidr_matches_ignores_host_bits_in_network() {
    // Host bits in the network address are masked away
    assert!(cidr_matches(Ipv4Addr::new(10, 1, 2, 3), "10.9.9.9/8"));
}

#[test]
fn test_cidr_zero_prefix_matches_everything() {
    assert!(cidr_matches(Ipv4Addr::new(8, 8, 8, 8), "0.0.0.0/0"));
    assert!(cidr_matches(Ipv4Addr::new(255, 255, 255, 255), "1.2.3.4/0"));
}

#[test]
fn test_cidr_matches_is_prefix_comparison() {
    // Flipping the last bit inside the prefix breaks the match; flipping the
    // first bit after it does not.
    let ip = Ipv4Addr::new(172, 16, 200, 77);
    for prefix in 1u8..=32 {
        let cidr = format!("{}/{}", ip, prefix);
        assert!(cidr_matches(ip, &cidr), "{} should contain itself", cidr);

        let inside = Ipv4Addr::from(u32::from(ip) ^ (1u32 << (32 - u32::from(prefix))));
        assert!(!cidr_matches(inside, &cidr), "{} should not contain {}", cidr, inside);

        if prefix < 32 {
            let outside = Ipv4Addr::from(u32::from(ip) ^ (1u32 << (31 - u32::from(prefix))));
            assert!(cidr_matches(outside, &cidr), "{} should contain {}", cidr, outside);
        }
    }
}

#[test]
fn test_malformed_cidr_never_matches() {
    assert!(!cidr_matches(Ipv4Addr::new(192, 168, 1, 1), "garbage"));
}

#[test]
fn test_allowed_subnets_empty_allows_all() {
    assert!(ip_in_allowed_subnets(Ipv4Addr::new(1, 2, 3, 4), &[]));
    assert!(ip_in_allowed_subnets(
        Ipv4Addr::new(1, 2, 3, 4),
        &subnets(&["", "  "])
    ));
}

#[test]
fn test_allowed_subnets_any_match() {
    let allowed = subnets(&["192.168.0.0/16", "10.0.0.0/8"]);

    assert!(ip_in_allowed_subnets(Ipv4Addr::new(10, 20, 30, 40), &allowed));
    assert!(ip_in_allowed_subnets(Ipv4Addr::new(192, 168, 1, 50), &allowed));
    assert!(!ip_in_allowed_subnets(Ipv4Addr::new(172, 16, 0, 1), &allowed));
}

#[test]
fn test_is_site_local() {
    assert!(is_site_local(Ipv4Addr::new(10, 0, 0, 1)));
    assert!(is_site_local(Ipv4Addr::new(172, 16, 0, 1)));
    assert!(is_site_local(Ipv4Addr::new(192, 168, 1, 1)));
    assert!(!is_site_local(Ipv4Addr::new(8, 8, 8, 8)));
    assert!(!is_site_local(Ipv4Addr::new(127, 0, 0, 1)));
}

#[test]
fn test_local_ipv4_toward_loopback_is_rejected() {
    // The route to loopback uses a loopback source address
    assert!(local_ipv4_toward("127.0.0.1".parse().unwrap()).is_none());
}
