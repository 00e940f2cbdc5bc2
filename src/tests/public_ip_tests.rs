use crate::config::Settings;
use crate::public_ip::*;
use bytes::Bytes;
use http_body_util::Full;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::Response;
use hyper_util::rt::TokioIo;
use std::convert::Infallible;
use std::net::Ipv4Addr;
use std::time::Duration;
use tokio::net::TcpListener;

/// Serve `body` to every request; returns the base URL
async fn serve_text(body: &'static str) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                let service = service_fn(move |_req| async move {
                    Ok::<_, Infallible>(Response::new(Full::new(Bytes::from(body))))
                });
                let _ = http1::Builder::new()
                    .serve_connection(TokioIo::new(stream), service)
                    .await;
            });
        }
    });

    format!("http://{}/", addr)
}

#[test]
fn test_parse_public_ip() {
    assert_eq!(parse_public_ip("203.0.113.5"), Some(Ipv4Addr::new(203, 0, 113, 5)));
    assert_eq!(parse_public_ip("  203.0.113.5 \n"), Some(Ipv4Addr::new(203, 0, 113, 5)));
    assert!(parse_public_ip("<html>").is_none());
    assert!(parse_public_ip("2001:db8::1").is_none());
    assert!(parse_public_ip("").is_none());
}

#[tokio::test]
async fn test_static_and_no_resolver() {
    let fixed = StaticIpResolver(Some(Ipv4Addr::new(198, 51, 100, 1)));
    assert_eq!(fixed.resolve().await, Some(Ipv4Addr::new(198, 51, 100, 1)));

    assert_eq!(NoPublicIp.resolve().await, None);
}

#[tokio::test]
async fn test_http_resolver_reads_first_line() {
    let url = serve_text("198.51.100.23\nextra\n").await;
    let resolver = HttpIpResolver::new(url, Duration::from_secs(2));

    assert_eq!(resolver.resolve().await, Some(Ipv4Addr::new(198, 51, 100, 23)));
}

#[tokio::test]
async fn test_http_resolver_rejects_non_ip_body() {
    let url = serve_text("<html>rate limited</html>").await;
    let resolver = HttpIpResolver::new(url, Duration::from_secs(2));

    assert_eq!(resolver.resolve().await, None);
}

#[tokio::test]
async fn test_http_resolver_unreachable() {
    let port = crate::tests::support::closed_tcp_port().await;
    let resolver = HttpIpResolver::new(format!("http://127.0.0.1:{}/", port), Duration::from_secs(1));

    assert_eq!(resolver.resolve().await, None);
}

#[tokio::test]
async fn test_resolver_from_settings_disabled() {
    let settings = Settings::default();
    let resolver = resolver_from_settings(&settings);

    assert_eq!(resolver.resolve().await, None);
}

#[tokio::test]
async fn test_resolver_from_settings_enabled() {
    let mut settings = Settings::default();
    settings.enable_public_ip_fallback = true;
    settings.public_ip_fallback_url = serve_text("192.0.2.44").await;

    let resolver = resolver_from_settings(&settings);
    assert_eq!(resolver.resolve().await, Some(Ipv4Addr::new(192, 0, 2, 44)));
}
