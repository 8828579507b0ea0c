//! Upstream transport: the dial and TLS client policy shared by every handler.
//!
//! A [`Transport`] is immutable after construction and cheap to clone. Each
//! call makes exactly one dial attempt bounded by the connect timeout; retry
//! policy lives in `resilience::retries` and wraps these calls from outside.

use std::fmt;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use http::uri::Authority;
use http::Uri;
use hyper_util::client::legacy::connect::HttpConnector;
use rustls::pki_types::ServerName;
use rustls::{ClientConfig, RootCertStore};
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;
use tower::ServiceExt;

use crate::config::UpstreamConfig;
use crate::error::ProxyError;
use crate::net::tls::{crypto_provider, load_certs, load_private_key, TlsMaterialError, ALPN_HTTP11};

/// A `host:port` pair naming an upstream peer.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Target {
    host: String,
    port: u16,
}

impl Target {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        let host = host.into();
        let host = host
            .strip_prefix('[')
            .and_then(|h| h.strip_suffix(']'))
            .map(str::to_string)
            .unwrap_or(host);
        Self { host, port }
    }

    /// Build a target from a URI authority, falling back to `default_port`.
    pub fn from_authority(authority: &Authority, default_port: u16) -> Self {
        Self::new(authority.host(), authority.port_u16().unwrap_or(default_port))
    }

    /// Parse a CONNECT request target. The port is mandatory.
    pub fn parse_connect(target: &str) -> Option<Self> {
        let authority: Authority = target.parse().ok()?;
        let port = authority.port_u16()?;
        if authority.host().is_empty() || authority.as_str().contains('@') {
            return None;
        }
        Some(Self::new(authority.host(), port))
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Value for a `Host` header, omitting the port when it is the scheme default.
    pub fn host_header(&self, default_port: u16) -> String {
        let host = if self.host.contains(':') {
            format!("[{}]", self.host)
        } else {
            self.host.clone()
        };
        if self.port == default_port {
            host
        } else {
            format!("{}:{}", host, self.port)
        }
    }

    fn dial_uri(&self) -> Result<Uri, ProxyError> {
        format!("http://{}", self)
            .parse()
            .map_err(|e: http::uri::InvalidUri| ProxyError::DialFailed {
                target: self.to_string(),
                reason: e.to_string(),
            })
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

/// Immutable dial/TLS policy.
#[derive(Clone)]
pub struct Transport {
    connector: HttpConnector,
    tls: TlsConnector,
    connect_timeout: Duration,
    handshake_timeout: Duration,
}

impl Transport {
    /// Build the transport, loading any configured client TLS material.
    pub fn from_config(config: &UpstreamConfig) -> Result<Self, TlsMaterialError> {
        let mut roots = RootCertStore::empty();
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        if let Some(ca_path) = &config.ca_cert_path {
            for cert in load_certs(Path::new(ca_path))? {
                roots.add(cert)?;
            }
        }

        let builder = ClientConfig::builder_with_provider(crypto_provider())
            .with_safe_default_protocol_versions()?
            .with_root_certificates(roots);
        let mut client = match (&config.client_cert_path, &config.client_key_path) {
            (Some(cert_path), Some(key_path)) => builder.with_client_auth_cert(
                load_certs(Path::new(cert_path))?,
                load_private_key(Path::new(key_path))?,
            )?,
            _ => builder.with_no_client_auth(),
        };
        client.alpn_protocols = vec![ALPN_HTTP11.to_vec()];

        Ok(Self::with_client_config(config, client))
    }

    /// Build the transport around an existing rustls client configuration.
    pub fn with_client_config(config: &UpstreamConfig, client: ClientConfig) -> Self {
        let mut connector = HttpConnector::new();
        connector.set_keepalive(Some(config.keepalive()));
        connector.set_nodelay(true);

        Self {
            connector,
            tls: TlsConnector::from(Arc::new(client)),
            connect_timeout: config.connect_timeout(),
            handshake_timeout: config.handshake_timeout(),
        }
    }

    pub fn connect_timeout(&self) -> Duration {
        self.connect_timeout
    }

    pub fn handshake_timeout(&self) -> Duration {
        self.handshake_timeout
    }

    /// Open a TCP connection with keep-alive probes enabled.
    pub async fn dial(&self, target: &Target) -> Result<TcpStream, ProxyError> {
        let uri = target.dial_uri()?;
        match tokio::time::timeout(self.connect_timeout, self.connector.clone().oneshot(uri)).await {
            Ok(Ok(io)) => Ok(io.into_inner()),
            Ok(Err(e)) => Err(ProxyError::DialFailed {
                target: target.to_string(),
                reason: error_chain(&e),
            }),
            Err(_) => Err(ProxyError::DialTimeout {
                target: target.to_string(),
                timeout: self.connect_timeout,
            }),
        }
    }

    /// Dial and complete a TLS handshake, verifying the peer as `target.host()`.
    pub async fn dial_tls(&self, target: &Target) -> Result<TlsStream<TcpStream>, ProxyError> {
        let tcp = self.dial(target).await?;
        self.secure(target, tcp).await
    }

    /// Run the client side of a TLS handshake over an established connection.
    pub async fn secure(
        &self,
        target: &Target,
        tcp: TcpStream,
    ) -> Result<TlsStream<TcpStream>, ProxyError> {
        let handshake_failed = |reason: String| ProxyError::HandshakeFailed {
            peer: target.to_string(),
            reason,
        };
        let server_name = ServerName::try_from(target.host().to_string())
            .map_err(|e| handshake_failed(e.to_string()))?;

        match tokio::time::timeout(self.handshake_timeout, self.tls.connect(server_name, tcp)).await {
            Ok(Ok(stream)) => Ok(stream),
            Ok(Err(e)) => Err(handshake_failed(e.to_string())),
            Err(_) => Err(handshake_failed(format!(
                "timed out after {:?}",
                self.handshake_timeout
            ))),
        }
    }
}

/// Flatten an error and its sources into one line.
pub(crate) fn error_chain(err: &(dyn std::error::Error + 'static)) -> String {
    let mut out = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        out.push_str(": ");
        out.push_str(&cause.to_string());
        source = cause.source();
    }
    out
}
