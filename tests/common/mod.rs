//! Shared utilities for integration tests.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use intercepting_proxy::config::{ProxyConfig, TlsConfig, UpstreamConfig};
use intercepting_proxy::net::tls::{crypto_provider, ALPN_HTTP11};
use intercepting_proxy::net::Transport;
use intercepting_proxy::observability::{ProxyEvent, RecordingSink};
use intercepting_proxy::{Pipeline, ProxyBuilder, Shutdown};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use rustls::{ClientConfig, RootCertStore, ServerConfig};
use tempfile::TempDir;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_rustls::TlsAcceptor;

/// Request head as seen by a mock backend.
#[derive(Debug, Clone)]
pub struct SeenRequest {
    pub method: String,
    pub target: String,
    pub headers: Vec<(String, String)>,
}

impl SeenRequest {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// Response a mock backend writes.
#[derive(Debug, Clone)]
pub struct MockResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: String,
}

impl MockResponse {
    pub fn ok(body: impl Into<String>) -> Self {
        Self {
            status: 200,
            headers: Vec::new(),
            body: body.into(),
        }
    }

    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        self.headers.push((name.to_string(), value.to_string()));
        self
    }

    fn to_wire(&self, keep_alive: bool) -> String {
        let mut out = format!("HTTP/1.1 {} Mock\r\n", self.status);
        for (name, value) in &self.headers {
            out.push_str(&format!("{name}: {value}\r\n"));
        }
        let connection = if keep_alive { "keep-alive" } else { "close" };
        out.push_str(&format!(
            "Content-Length: {}\r\nConnection: {connection}\r\n\r\n{}",
            self.body.len(),
            self.body
        ));
        out
    }
}

/// Read one request head (and any Content-Length body) from `stream`.
pub async fn read_request<S: AsyncRead + Unpin>(stream: &mut S) -> Option<SeenRequest> {
    let head = read_head(stream).await?;
    let mut lines = head.split("\r\n");
    let mut request_line = lines.next()?.split_whitespace();
    let method = request_line.next()?.to_string();
    let target = request_line.next()?.to_string();
    let headers: Vec<(String, String)> = lines
        .filter_map(|line| line.split_once(':'))
        .map(|(n, v)| (n.trim().to_string(), v.trim().to_string()))
        .collect();

    let length = headers
        .iter()
        .find(|(n, _)| n.eq_ignore_ascii_case("content-length"))
        .and_then(|(_, v)| v.parse::<usize>().ok())
        .unwrap_or(0);
    let mut body = vec![0u8; length];
    stream.read_exact(&mut body).await.ok()?;

    Some(SeenRequest {
        method,
        target,
        headers,
    })
}

/// Read bytes until the blank line that ends an HTTP head.
pub async fn read_head<S: AsyncRead + Unpin>(stream: &mut S) -> Option<String> {
    let mut buf = Vec::new();
    let mut byte = [0u8; 1];
    while !buf.ends_with(b"\r\n\r\n") {
        match stream.read(&mut byte).await {
            Ok(0) | Err(_) => return None,
            Ok(_) => buf.push(byte[0]),
        }
    }
    String::from_utf8(buf).ok()
}

async fn serve_one<S, F>(mut stream: S, f: Arc<F>)
where
    S: AsyncRead + AsyncWrite + Unpin,
    F: Fn(SeenRequest) -> MockResponse,
{
    if let Some(request) = read_request(&mut stream).await {
        let response = f(request);
        let _ = stream.write_all(response.to_wire(false).as_bytes()).await;
        let _ = stream.shutdown().await;
    }
}

async fn serve_persistent<S, F>(mut stream: S, f: Arc<F>)
where
    S: AsyncRead + AsyncWrite + Unpin,
    F: Fn(SeenRequest) -> MockResponse,
{
    while let Some(request) = read_request(&mut stream).await {
        let response = f(request);
        if stream.write_all(response.to_wire(true).as_bytes()).await.is_err() {
            return;
        }
    }
}

/// Start a plain HTTP backend that answers every request with `f`.
pub async fn start_programmable_backend<F>(f: F) -> SocketAddr
where
    F: Fn(SeenRequest) -> MockResponse + Send + Sync + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let f = Arc::new(f);

    tokio::spawn(async move {
        while let Ok((socket, _)) = listener.accept().await {
            tokio::spawn(serve_one(socket, f.clone()));
        }
    });
    addr
}

/// Start an HTTPS backend presenting `cert` that answers every request with `f`.
pub async fn start_tls_backend<F>(cert: &TestCert, f: F) -> SocketAddr
where
    F: Fn(SeenRequest) -> MockResponse + Send + Sync + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let acceptor = cert.acceptor();
    let f = Arc::new(f);

    tokio::spawn(async move {
        while let Ok((socket, _)) = listener.accept().await {
            let acceptor = acceptor.clone();
            let f = f.clone();
            tokio::spawn(async move {
                if let Ok(tls) = acceptor.accept(socket).await {
                    serve_one(tls, f).await;
                }
            });
        }
    });
    addr
}

/// Start an HTTPS backend that keeps each connection open across requests.
/// The returned counter tracks accepted connections.
pub async fn start_keepalive_tls_backend<F>(cert: &TestCert, f: F) -> (SocketAddr, Arc<AtomicUsize>)
where
    F: Fn(SeenRequest) -> MockResponse + Send + Sync + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let acceptor = cert.acceptor();
    let f = Arc::new(f);
    let accepted = Arc::new(AtomicUsize::new(0));
    let counter = accepted.clone();

    tokio::spawn(async move {
        while let Ok((socket, _)) = listener.accept().await {
            counter.fetch_add(1, Ordering::SeqCst);
            let acceptor = acceptor.clone();
            let f = f.clone();
            tokio::spawn(async move {
                if let Ok(tls) = acceptor.accept(socket).await {
                    serve_persistent(tls, f).await;
                }
            });
        }
    });
    (addr, accepted)
}

/// Start a raw TCP echo server.
pub async fn start_tcp_echo() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            tokio::spawn(async move {
                let (mut rd, mut wr) = socket.split();
                let _ = tokio::io::copy(&mut rd, &mut wr).await;
            });
        }
    });
    addr
}

/// A port nothing listens on.
pub async fn closed_port() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap()
}

/// Self-signed certificate for `localhost` and `127.0.0.1`.
pub struct TestCert {
    pub cert_pem: String,
    pub key_pem: String,
    pub der: CertificateDer<'static>,
    key_der: Vec<u8>,
}

impl TestCert {
    pub fn localhost() -> Self {
        let certified =
            rcgen::generate_simple_self_signed(vec!["localhost".into(), "127.0.0.1".into()])
                .unwrap();
        Self {
            cert_pem: certified.cert.pem(),
            key_pem: certified.key_pair.serialize_pem(),
            der: certified.cert.der().clone(),
            key_der: certified.key_pair.serialize_der(),
        }
    }

    pub fn acceptor(&self) -> TlsAcceptor {
        let key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(self.key_der.clone()));
        let mut config = ServerConfig::builder_with_provider(crypto_provider())
            .with_safe_default_protocol_versions()
            .unwrap()
            .with_no_client_auth()
            .with_single_cert(vec![self.der.clone()], key)
            .unwrap();
        config.alpn_protocols = vec![ALPN_HTTP11.to_vec()];
        TlsAcceptor::from(Arc::new(config))
    }

    /// Write the pair to disk and return the matching `[tls]` section.
    pub fn write_to(&self, dir: &TempDir) -> TlsConfig {
        let cert_path = dir.path().join("certificate.crt");
        let key_path = dir.path().join("private.key");
        std::fs::write(&cert_path, &self.cert_pem).unwrap();
        std::fs::write(&key_path, &self.key_pem).unwrap();
        TlsConfig {
            cert_path: cert_path.to_string_lossy().into_owned(),
            key_path: key_path.to_string_lossy().into_owned(),
        }
    }
}

/// Transport that trusts only `cert`.
pub fn transport_trusting(cert: &TestCert, upstream: &UpstreamConfig) -> Transport {
    let mut roots = RootCertStore::empty();
    roots.add(cert.der.clone()).unwrap();
    let mut client = ClientConfig::builder_with_provider(crypto_provider())
        .with_safe_default_protocol_versions()
        .unwrap()
        .with_root_certificates(roots)
        .with_no_client_auth();
    client.alpn_protocols = vec![ALPN_HTTP11.to_vec()];
    Transport::with_client_config(upstream, client)
}

/// Configuration bound to an ephemeral local port.
pub fn local_config() -> ProxyConfig {
    let mut config = ProxyConfig::default();
    config.listener.bind_address = "127.0.0.1:0".into();
    config.upstream.connect_timeout_secs = 5;
    config.upstream.exchange_timeout_secs = 10;
    config
}

/// A running proxy.
pub struct TestProxy {
    pub addr: SocketAddr,
    pub sink: Arc<RecordingSink>,
    pub shutdown: Shutdown,
    pub handle: JoinHandle<()>,
}

impl TestProxy {
    pub fn url(&self) -> String {
        format!("http://{}", self.addr)
    }

    /// reqwest client that sends everything through this proxy.
    pub fn client(&self) -> reqwest::Client {
        reqwest::Client::builder()
            .proxy(reqwest::Proxy::all(self.url()).unwrap())
            .pool_max_idle_per_host(0)
            .build()
            .unwrap()
    }

    /// Poll the recorded events until `pred` matches one, or give up after five seconds.
    pub async fn wait_for_event<P>(&self, pred: P) -> Option<ProxyEvent>
    where
        P: Fn(&ProxyEvent) -> bool,
    {
        for _ in 0..100 {
            if let Some(event) = self.sink.events().into_iter().find(|e| pred(e)) {
                return Some(event);
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        None
    }
}

/// Options for [`start_proxy`].
#[derive(Default)]
pub struct ProxyOptions {
    pub pipeline: Option<Pipeline>,
    pub transport: Option<Transport>,
}

/// Bind and run a proxy on an ephemeral port.
pub async fn start_proxy(config: ProxyConfig, options: ProxyOptions) -> TestProxy {
    let sink = RecordingSink::new();
    let mut builder = ProxyBuilder::new(config).sink(sink.clone());
    if let Some(pipeline) = options.pipeline {
        builder = builder.pipeline(pipeline);
    }
    if let Some(transport) = options.transport {
        builder = builder.transport(transport);
    }

    let server = builder.bind().await.unwrap();
    let addr = server.local_addr().unwrap();
    let shutdown = server.shutdown_handle();
    let handle = tokio::spawn(async move {
        server.run().await.unwrap();
    });

    TestProxy {
        addr,
        sink,
        shutdown,
        handle,
    }
}

/// Open a raw client connection and send `CONNECT authority`, returning the
/// stream and the response head.
pub async fn raw_connect(proxy: SocketAddr, authority: &str) -> (TcpStream, String) {
    let mut stream = TcpStream::connect(proxy).await.unwrap();
    let request = format!("CONNECT {authority} HTTP/1.1\r\nHost: {authority}\r\n\r\n");
    stream.write_all(request.as_bytes()).await.unwrap();
    let head = read_head(&mut stream).await.unwrap_or_default();
    (stream, head)
}
