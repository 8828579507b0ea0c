//! Configuration schema definitions.
//!
//! This module defines the complete configuration structure for the proxy.
//! All types derive Serde traits for deserialization from config files.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Root configuration for the intercepting proxy.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct ProxyConfig {
    /// Listener configuration (bind address, connection limit).
    pub listener: ListenerConfig,

    /// Certificate/key pair used to terminate CONNECT tunnels.
    /// When absent, tunnels are relayed without decryption.
    pub tls: Option<TlsConfig>,

    /// Upstream dial policy.
    pub upstream: UpstreamConfig,

    /// CONNECT tunnel policy.
    pub tunnel: TunnelConfig,

    /// Ordered request/response transforms.
    pub pipeline: PipelineConfig,

    /// Buffering limits.
    pub limits: LimitsConfig,

    /// Observability settings.
    pub observability: ObservabilityConfig,
}

impl ProxyConfig {
    /// Whether CONNECT tunnels are decrypted and run through the pipeline.
    pub fn intercepts_tls(&self) -> bool {
        self.tls.is_some()
    }
}

/// Listener configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ListenerConfig {
    /// Bind address (e.g., "0.0.0.0:8080").
    pub bind_address: String,

    /// Maximum concurrent connections (backpressure).
    pub max_connections: usize,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:8080".to_string(),
            max_connections: 10_000,
        }
    }
}

/// Certificate and key presented to clients inside intercepted tunnels.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TlsConfig {
    /// Path to certificate chain file (PEM).
    pub cert_path: String,

    /// Path to private key file (PEM).
    pub key_path: String,
}

/// Upstream dial configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct UpstreamConfig {
    /// Connection establishment timeout in seconds.
    pub connect_timeout_secs: u64,

    /// TCP keep-alive probe interval in seconds.
    pub keepalive_secs: u64,

    /// Deadline for one full exchange (transforms, dial, upstream round trip).
    pub exchange_timeout_secs: u64,

    /// TLS handshake timeout (client side and upstream side) in seconds.
    pub handshake_timeout_secs: u64,

    /// Extra PEM roots trusted for upstream TLS, on top of the bundled roots.
    pub ca_cert_path: Option<String>,

    /// Client certificate chain presented to TLS upstreams (PEM).
    pub client_cert_path: Option<String>,

    /// Private key for `client_cert_path` (PEM).
    pub client_key_path: Option<String>,

    /// Optional retry decorator around the dial step.
    pub retry: RetryConfig,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            connect_timeout_secs: 30,
            keepalive_secs: 30,
            exchange_timeout_secs: 60,
            handshake_timeout_secs: 10,
            ca_cert_path: None,
            client_cert_path: None,
            client_key_path: None,
            retry: RetryConfig::default(),
        }
    }
}

impl UpstreamConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn keepalive(&self) -> Duration {
        Duration::from_secs(self.keepalive_secs)
    }

    pub fn exchange_timeout(&self) -> Duration {
        Duration::from_secs(self.exchange_timeout_secs)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_secs)
    }
}

/// Retry configuration for upstream dials.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Enable retries. Off by default: the core makes one attempt per dial.
    pub enabled: bool,

    /// Maximum number of attempts, including the first.
    pub max_attempts: u32,

    /// Base delay for exponential backoff in milliseconds.
    pub base_delay_ms: u64,

    /// Maximum delay for exponential backoff in milliseconds.
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            max_attempts: 3,
            base_delay_ms: 100,
            max_delay_ms: 2000,
        }
    }
}

/// CONNECT tunnel configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TunnelConfig {
    /// Host patterns approved for CONNECT: `*`, `*.example.com` or an exact host.
    pub allow_hosts: Vec<String>,

    /// Status returned when a CONNECT target is not approved.
    pub deny_status: u16,

    /// Opaque relays close after this many seconds without traffic.
    pub idle_timeout_secs: u64,
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            allow_hosts: vec!["*".to_string()],
            deny_status: 403,
            idle_timeout_secs: 300,
        }
    }
}

impl TunnelConfig {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }
}

/// Transform pipeline configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Per-stage time budget in milliseconds. 0 runs stages inline, unbounded.
    ///
    /// A stage that overruns fails its exchange, but its blocking-pool thread
    /// keeps running until the transform returns. Transforms that overrun
    /// repeatedly will fill the pool, after which every budgeted stage times out.
    pub stage_budget_ms: u64,

    /// Request transforms, applied in order.
    pub request: Vec<RequestTransformConfig>,

    /// Response transforms, applied in order.
    pub response: Vec<ResponseTransformConfig>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            stage_budget_ms: 5_000,
            request: Vec::new(),
            response: Vec::new(),
        }
    }
}

impl PipelineConfig {
    pub fn stage_budget(&self) -> Option<Duration> {
        (self.stage_budget_ms > 0).then(|| Duration::from_millis(self.stage_budget_ms))
    }
}

/// A named request transform.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RequestTransformConfig {
    /// Add a cookie to the outgoing `Cookie` header.
    InjectCookie {
        name: String,
        cookie: String,
        /// Inline value.
        #[serde(default)]
        value: Option<String>,
        /// Environment variable holding the value.
        #[serde(default)]
        value_env: Option<String>,
    },
    /// Replace a request header.
    SetHeader {
        name: String,
        header: String,
        value: String,
    },
    /// Answer requests for matching hosts without contacting the upstream.
    BlockHosts {
        name: String,
        hosts: Vec<String>,
        #[serde(default = "default_block_status")]
        status: u16,
    },
}

impl RequestTransformConfig {
    pub fn name(&self) -> &str {
        match self {
            RequestTransformConfig::InjectCookie { name, .. }
            | RequestTransformConfig::SetHeader { name, .. }
            | RequestTransformConfig::BlockHosts { name, .. } => name,
        }
    }
}

fn default_block_status() -> u16 {
    403
}

/// A named response transform.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ResponseTransformConfig {
    /// Log the status line and every `Set-Cookie` received.
    LogCookies { name: String },
    /// Drop `Set-Cookie` headers for one cookie name.
    StripCookie { name: String, cookie: String },
    /// Replace a response header.
    SetHeader {
        name: String,
        header: String,
        value: String,
    },
}

impl ResponseTransformConfig {
    pub fn name(&self) -> &str {
        match self {
            ResponseTransformConfig::LogCookies { name }
            | ResponseTransformConfig::StripCookie { name, .. }
            | ResponseTransformConfig::SetHeader { name, .. } => name,
        }
    }
}

/// Buffering limits.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LimitsConfig {
    /// Maximum buffered body size in bytes, per message.
    pub max_body_bytes: usize,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_body_bytes: 10 * 1024 * 1024, // 10MB
        }
    }
}

/// Log output format.
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

/// Observability configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Log line format.
    pub log_format: LogFormat,

    /// Enable metrics endpoint.
    pub metrics_enabled: bool,

    /// Metrics endpoint bind address.
    pub metrics_address: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_format: LogFormat::Pretty,
            metrics_enabled: false,
            metrics_address: "127.0.0.1:9090".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_document_uses_defaults() {
        let config: ProxyConfig = toml::from_str("").unwrap();
        assert_eq!(config.listener.bind_address, "0.0.0.0:8080");
        assert_eq!(config.upstream.connect_timeout(), Duration::from_secs(30));
        assert_eq!(config.upstream.keepalive(), Duration::from_secs(30));
        assert_eq!(config.tunnel.allow_hosts, vec!["*"]);
        assert!(!config.intercepts_tls());
        assert!(!config.upstream.retry.enabled);
        assert_eq!(config.pipeline.stage_budget(), Some(Duration::from_secs(5)));
    }

    #[test]
    fn parses_transform_lists_in_order() {
        let config: ProxyConfig = toml::from_str(
            r#"
            [tls]
            cert_path = "certificate.crt"
            key_path = "private.key"

            [pipeline]
            stage_budget_ms = 0

            [[pipeline.request]]
            kind = "inject_cookie"
            name = "session"
            cookie = "JSESSIONID"
            value_env = "PROXY_SESSION"

            [[pipeline.request]]
            kind = "set_header"
            name = "tag"
            header = "x-proxied-by"
            value = "intercepting-proxy"

            [[pipeline.response]]
            kind = "log_cookies"
            name = "cookie-log"
            "#,
        )
        .unwrap();

        assert!(config.intercepts_tls());
        assert_eq!(config.pipeline.stage_budget(), None);
        let names: Vec<&str> = config.pipeline.request.iter().map(|t| t.name()).collect();
        assert_eq!(names, vec!["session", "tag"]);
        assert_eq!(config.pipeline.response[0].name(), "cookie-log");
    }
}
