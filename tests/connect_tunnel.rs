//! CONNECT tunnels: policy, opaque relay and TLS interception.

use std::sync::atomic::Ordering;
use std::time::Duration;

use intercepting_proxy::config::{RequestTransformConfig, ResponseTransformConfig};
use intercepting_proxy::observability::{DialOutcome, ProxyEvent, RelayEnd};
use tempfile::TempDir;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;

mod common;

use common::{
    raw_connect, read_head, start_keepalive_tls_backend, start_proxy, start_tcp_echo,
    start_tls_backend, transport_trusting, MockResponse, ProxyOptions, TestCert,
};

#[tokio::test]
async fn unlisted_target_is_denied() {
    let mut config = common::local_config();
    config.tunnel.allow_hosts = vec!["*.allowed.test".into()];
    let proxy = start_proxy(config, ProxyOptions::default()).await;

    let (_stream, head) = raw_connect(proxy.addr, "blocked.test:443").await;
    assert!(head.starts_with("HTTP/1.1 403"), "{head}");

    let denied = proxy
        .wait_for_event(|e| matches!(e, ProxyEvent::ConnectDenied { .. }))
        .await;
    assert!(matches!(
        denied,
        Some(ProxyEvent::ConnectDenied { status: 403, ref target, .. }) if target == "blocked.test:443"
    ));
    assert!(proxy
        .sink
        .events()
        .iter()
        .all(|e| !matches!(e, ProxyEvent::Dial { .. } | ProxyEvent::ExchangeFailed { .. })));
}

#[tokio::test]
async fn opaque_tunnel_relays_bytes() {
    let echo = start_tcp_echo().await;
    let proxy = start_proxy(common::local_config(), ProxyOptions::default()).await;

    let (mut stream, head) = raw_connect(proxy.addr, &echo.to_string()).await;
    assert!(head.starts_with("HTTP/1.1 200 Connection Established"), "{head}");

    stream.write_all(b"hello through the tunnel").await.unwrap();
    let mut buf = [0u8; 24];
    stream.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"hello through the tunnel");

    drop(stream);
    let closed = proxy
        .wait_for_event(|e| matches!(e, ProxyEvent::TunnelClosed { .. }))
        .await;
    match closed {
        Some(ProxyEvent::TunnelClosed {
            end,
            bytes_up,
            bytes_down,
            ..
        }) => {
            assert_eq!(end, RelayEnd::ClientClosed);
            assert_eq!(bytes_up, 24);
            assert_eq!(bytes_down, 24);
        }
        other => panic!("expected tunnel close, got {other:?}"),
    }
}

#[tokio::test]
async fn client_disconnect_closes_upstream() {
    let upstream = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let upstream_addr = upstream.local_addr().unwrap();
    let (eof_tx, eof_rx) = oneshot::channel();
    tokio::spawn(async move {
        let (mut socket, _) = upstream.accept().await.unwrap();
        let mut sink = Vec::new();
        let _ = socket.read_to_end(&mut sink).await;
        let _ = eof_tx.send(());
    });

    let proxy = start_proxy(common::local_config(), ProxyOptions::default()).await;
    let (stream, head) = raw_connect(proxy.addr, &upstream_addr.to_string()).await;
    assert!(head.starts_with("HTTP/1.1 200"), "{head}");

    drop(stream);
    tokio::time::timeout(Duration::from_secs(5), eof_rx)
        .await
        .expect("upstream was left open")
        .unwrap();
}

#[tokio::test]
async fn open_tunnel_holds_its_connection_slot() {
    let echo = start_tcp_echo().await;
    let mut config = common::local_config();
    config.listener.max_connections = 1;
    let proxy = start_proxy(config, ProxyOptions::default()).await;

    let (first, head) = raw_connect(proxy.addr, &echo.to_string()).await;
    assert!(head.starts_with("HTTP/1.1 200"), "{head}");

    let mut second = TcpStream::connect(proxy.addr).await.unwrap();
    let request = format!("CONNECT {echo} HTTP/1.1\r\nHost: {echo}\r\n\r\n");
    second.write_all(request.as_bytes()).await.unwrap();
    let waiting = tokio::time::timeout(Duration::from_millis(300), read_head(&mut second)).await;
    assert!(waiting.is_err(), "second tunnel admitted while the first was open");

    drop(first);
    let head = tokio::time::timeout(Duration::from_secs(5), read_head(&mut second))
        .await
        .expect("second tunnel never admitted")
        .unwrap_or_default();
    assert!(head.starts_with("HTTP/1.1 200"), "{head}");

    // the first connection is reported closed only once its tunnel is gone
    let events = proxy.sink.events();
    let tunnel_closed = events
        .iter()
        .position(|e| matches!(e, ProxyEvent::TunnelClosed { .. }))
        .expect("first tunnel never closed");
    let connection = events[tunnel_closed].connection();
    let closed = events
        .iter()
        .position(|e| matches!(e, ProxyEvent::Closed { connection: c } if *c == connection))
        .expect("first connection never reported closed");
    assert!(closed > tunnel_closed, "{events:?}");
}

#[tokio::test]
async fn unreachable_tunnel_target_is_bad_gateway() {
    let closed = common::closed_port().await;
    let proxy = start_proxy(common::local_config(), ProxyOptions::default()).await;

    let (_stream, head) = raw_connect(proxy.addr, &closed.to_string()).await;
    assert!(head.starts_with("HTTP/1.1 502"), "{head}");
    assert!(proxy
        .wait_for_event(|e| matches!(
            e,
            ProxyEvent::Dial {
                outcome: DialOutcome::Failed { .. },
                ..
            }
        ))
        .await
        .is_some());
}

#[tokio::test]
async fn malformed_connect_target_is_bad_request() {
    let proxy = start_proxy(common::local_config(), ProxyOptions::default()).await;
    let (_stream, head) = raw_connect(proxy.addr, "no-port-here").await;
    assert!(head.starts_with("HTTP/1.1 400"), "{head}");
}

struct Intercepting {
    proxy: common::TestProxy,
    proxy_cert: TestCert,
    _dir: TempDir,
}

async fn intercepting_proxy(upstream_cert: &TestCert) -> Intercepting {
    let proxy_cert = TestCert::localhost();
    let dir = TempDir::new().unwrap();

    let mut config = common::local_config();
    config.tls = Some(proxy_cert.write_to(&dir));
    config.upstream.handshake_timeout_secs = 2;
    config.pipeline.request.push(RequestTransformConfig::InjectCookie {
        name: "session".into(),
        cookie: "JSESSIONID".into(),
        value: Some("abc".into()),
        value_env: None,
    });
    config.pipeline.response.extend([
        ResponseTransformConfig::LogCookies { name: "cookie-log".into() },
        ResponseTransformConfig::StripCookie {
            name: "no-tracking".into(),
            cookie: "tracker".into(),
        },
        ResponseTransformConfig::SetHeader {
            name: "tag".into(),
            header: "x-intercepted-by".into(),
            value: "intercepting-proxy".into(),
        },
    ]);

    let transport = transport_trusting(upstream_cert, &config.upstream);
    let proxy = start_proxy(
        config,
        ProxyOptions {
            transport: Some(transport),
            ..ProxyOptions::default()
        },
    )
    .await;

    Intercepting {
        proxy,
        proxy_cert,
        _dir: dir,
    }
}

fn tunnel_client(setup: &Intercepting) -> reqwest::Client {
    reqwest::Client::builder()
        .proxy(reqwest::Proxy::all(setup.proxy.url()).unwrap())
        .add_root_certificate(reqwest::Certificate::from_pem(setup.proxy_cert.cert_pem.as_bytes()).unwrap())
        .build()
        .unwrap()
}

#[tokio::test]
async fn intercepted_tunnel_runs_pipeline() {
    let upstream_cert = TestCert::localhost();
    let backend = start_tls_backend(&upstream_cert, |req| {
        let cookie = req.header("cookie").unwrap_or("").to_string();
        MockResponse::ok(format!("{} {}", req.target, cookie))
            .with_header("Set-Cookie", "upstream=1; Secure")
            .with_header("Set-Cookie", "tracker=xyz; Path=/")
    })
    .await;
    let setup = intercepting_proxy(&upstream_cert).await;
    let client = tunnel_client(&setup);

    let url = format!("https://localhost:{}/secure?x=1", backend.port());
    let res = client.get(&url).send().await.expect("proxy unreachable");
    assert_eq!(res.status(), 200);
    let set_cookies: Vec<_> = res.headers().get_all("set-cookie").iter().collect();
    assert_eq!(set_cookies, vec!["upstream=1; Secure"]);
    assert_eq!(res.headers()["x-intercepted-by"], "intercepting-proxy");
    assert_eq!(res.text().await.unwrap(), "/secure?x=1 JSESSIONID=abc");

    // the upstream closed after one response; the next exchange redials
    let res = client.get(&url).send().await.unwrap();
    assert_eq!(res.status(), 200);
    assert_eq!(res.headers()["x-intercepted-by"], "intercepting-proxy");

    let events = setup.proxy.sink.events();
    let tunneled: Vec<_> = events
        .iter()
        .filter(|e| matches!(e, ProxyEvent::Exchange { tunneled: true, .. }))
        .collect();
    assert_eq!(tunneled.len(), 2, "{events:?}");
    assert!(events
        .iter()
        .any(|e| matches!(e, ProxyEvent::ConnectApproved { intercept: true, .. })));

    // cookies are reported before the strip transform removes one
    let reported = events
        .iter()
        .find_map(|e| match e {
            ProxyEvent::ResponseCookies { host, cookies, .. } => Some((host.clone(), cookies.clone())),
            _ => None,
        })
        .expect("cookie report");
    assert_eq!(reported.0, "localhost");
    assert_eq!(reported.1.len(), 2, "{:?}", reported.1);
}

#[tokio::test]
async fn intercepted_tunnel_reuses_upstream_connection() {
    let upstream_cert = TestCert::localhost();
    let (backend, accepted) = start_keepalive_tls_backend(&upstream_cert, |req| {
        MockResponse::ok(req.target.clone())
    })
    .await;
    let setup = intercepting_proxy(&upstream_cert).await;
    let client = tunnel_client(&setup);

    for i in 0..3 {
        let url = format!("https://localhost:{}/item/{i}", backend.port());
        let res = client.get(&url).send().await.expect("proxy unreachable");
        assert_eq!(res.status(), 200);
        assert_eq!(res.text().await.unwrap(), format!("/item/{i}"));
    }

    let events = setup.proxy.sink.events();
    let tunnels = events
        .iter()
        .filter(|e| matches!(e, ProxyEvent::ConnectApproved { .. }))
        .count();
    let exchanges = events
        .iter()
        .filter(|e| matches!(e, ProxyEvent::Exchange { tunneled: true, .. }))
        .count();
    assert_eq!(tunnels, 1, "{events:?}");
    assert_eq!(exchanges, 3, "{events:?}");
    assert_eq!(accepted.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn untrusted_upstream_certificate_is_bad_gateway() {
    let upstream_cert = TestCert::localhost();
    let backend = start_tls_backend(&upstream_cert, |_| MockResponse::ok("unused")).await;
    // the proxy trusts a different certificate than the one the upstream presents
    let setup = intercepting_proxy(&TestCert::localhost()).await;

    let (_stream, head) = raw_connect(setup.proxy.addr, &format!("localhost:{}", backend.port())).await;
    assert!(head.starts_with("HTTP/1.1 502"), "{head}");
    assert!(setup
        .proxy
        .wait_for_event(|e| matches!(e, ProxyEvent::HandshakeFailed { .. }))
        .await
        .is_some());
}

#[tokio::test]
async fn client_handshake_failure_closes_tunnel() {
    let upstream_cert = TestCert::localhost();
    let backend = start_tls_backend(&upstream_cert, |_| MockResponse::ok("unused")).await;
    let setup = intercepting_proxy(&upstream_cert).await;

    let (mut stream, head) =
        raw_connect(setup.proxy.addr, &format!("localhost:{}", backend.port())).await;
    assert!(head.starts_with("HTTP/1.1 200"), "{head}");

    stream.write_all(b"this is not a TLS client hello\r\n\r\n").await.unwrap();

    let failed = setup
        .proxy
        .wait_for_event(|e| matches!(e, ProxyEvent::HandshakeFailed { .. }))
        .await;
    assert!(failed.is_some(), "{:?}", setup.proxy.sink.events());

    // the proxy drops the connection
    let mut rest = Vec::new();
    let read = tokio::time::timeout(Duration::from_secs(5), stream.read_to_end(&mut rest)).await;
    assert!(read.is_ok());
}
